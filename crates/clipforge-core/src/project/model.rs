//! Project item model: the live registry of bin clips and folders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{BinClip, ClipKind};
use crate::{ClipId, FolderId, ROOT_FOLDER};

/// Bin folder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub parent: FolderId,
}

/// The live project item model.
///
/// Tasks resolve clips through this model at run time; a `None` result
/// means the clip was deleted while the task was queued or running,
/// which is a clean silent abort, never an error.
pub struct ProjectModel {
    clips: RwLock<HashMap<ClipId, Arc<BinClip>>>,
    folders: RwLock<HashMap<FolderId, Folder>>,
    next_id: AtomicI64,
}

impl ProjectModel {
    pub fn new() -> Self {
        Self {
            clips: RwLock::new(HashMap::new()),
            folders: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // =========================================================================
    // Clips
    // =========================================================================

    /// Creates a clip and inserts it into the model
    pub fn add_clip(&self, url: impl Into<PathBuf>, kind: ClipKind, folder: FolderId) -> Arc<BinClip> {
        let id = self.allocate_id();
        let clip = Arc::new(BinClip::new(id, url.into(), kind, folder));
        self.clips.write().unwrap().insert(id, Arc::clone(&clip));
        debug!("Added clip {} to folder {}", id, folder);
        clip
    }

    /// Allocates a clip without inserting it.
    ///
    /// Commit closures build the clip once and then insert/remove the
    /// same object, so replaying operation → reverse → operation lands
    /// on identical state.
    pub fn create_clip(
        &self,
        url: impl Into<PathBuf>,
        kind: ClipKind,
        folder: FolderId,
    ) -> Arc<BinClip> {
        let id = self.allocate_id();
        Arc::new(BinClip::new(id, url.into(), kind, folder))
    }

    /// Inserts a detached or previously removed clip under its own id
    pub fn restore_clip(&self, clip: Arc<BinClip>) {
        self.clips.write().unwrap().insert(clip.id(), clip);
    }

    /// Live handle for a clip, or `None` when it was deleted
    pub fn clip(&self, id: ClipId) -> Option<Arc<BinClip>> {
        self.clips.read().unwrap().get(&id).cloned()
    }

    /// Removes a clip, returning the handle so it can be restored
    pub fn remove_clip(&self, id: ClipId) -> Option<Arc<BinClip>> {
        self.clips.write().unwrap().remove(&id)
    }

    /// Clip ids whose source url matches the given path
    pub fn clips_by_url(&self, url: &Path) -> Vec<ClipId> {
        self.clips
            .read()
            .unwrap()
            .values()
            .filter(|c| c.url() == url)
            .map(|c| c.id())
            .collect()
    }

    pub fn clip_count(&self) -> usize {
        self.clips.read().unwrap().len()
    }

    // =========================================================================
    // Folders
    // =========================================================================

    pub fn create_folder(&self, name: &str, parent: FolderId) -> FolderId {
        let id = self.allocate_id();
        self.folders.write().unwrap().insert(
            id,
            Folder {
                id,
                name: name.to_string(),
                parent,
            },
        );
        id
    }

    pub fn folder(&self, id: FolderId) -> Option<Folder> {
        self.folders.read().unwrap().get(&id).cloned()
    }

    pub fn remove_folder(&self, id: FolderId) -> Option<Folder> {
        self.folders.write().unwrap().remove(&id)
    }

    /// Finds a folder by name under the given parent
    pub fn find_folder(&self, name: &str, parent: FolderId) -> Option<FolderId> {
        self.folders
            .read()
            .unwrap()
            .values()
            .find(|f| f.parent == parent && f.name == name)
            .map(|f| f.id)
    }

    /// Folder with the given name under `parent`, created if missing.
    /// Returns the folder id and whether it was created by this call.
    pub fn find_or_create_folder(&self, name: &str, parent: FolderId) -> (FolderId, bool) {
        if let Some(id) = self.find_folder(name, parent) {
            return (id, false);
        }
        (self.create_folder(name, parent), true)
    }
}

impl Default for ProjectModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProjectModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectModel")
            .field("clips", &self.clip_count())
            .finish()
    }
}

/// Shared project model handle
pub type SharedProject = Arc<ProjectModel>;
