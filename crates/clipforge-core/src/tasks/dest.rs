//! Output destinations.
//!
//! Two concurrently running jobs can compute the same auto-generated
//! output filename before either has written a byte. The destination
//! registry tracks "requested but not yet committed" paths process-wide
//! so colliding requests get distinct, non-overlapping destinations.
//! Cache paths for derived artifacts are deterministic functions of the
//! clip's content hash plus a stream or frame index.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{Frame, TaskResult};

/// Process-scoped registry of claimed output paths.
pub struct DestinationRegistry {
    claimed: Mutex<HashSet<PathBuf>>,
}

impl DestinationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            claimed: Mutex::new(HashSet::new()),
        })
    }

    /// Claims a destination, adjusting the name until it collides with
    /// neither an already-claimed path nor an existing file. The claim
    /// is released when the returned lease drops.
    pub fn claim(self: &Arc<Self>, desired: PathBuf) -> DestinationLease {
        let mut claimed = self.claimed.lock().unwrap();
        let path = if !claimed.contains(&desired) && !desired.exists() {
            desired
        } else {
            let stem = desired
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let ext = desired.extension().map(|e| e.to_string_lossy().to_string());
            let parent = desired.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
            let mut count = 1;
            loop {
                let name = match &ext {
                    Some(ext) => format!("{}-{:04}.{}", stem, count, ext),
                    None => format!("{}-{:04}", stem, count),
                };
                let candidate = parent.join(name);
                if !claimed.contains(&candidate) && !candidate.exists() {
                    break candidate;
                }
                count += 1;
            }
        };
        claimed.insert(path.clone());
        DestinationLease {
            registry: Arc::clone(self),
            path,
        }
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        self.claimed.lock().unwrap().contains(path)
    }

    fn release(&self, path: &Path) {
        self.claimed.lock().unwrap().remove(path);
    }
}

impl std::fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("claimed", &self.claimed.lock().unwrap().len())
            .finish()
    }
}

/// Holds a claim on an output path until dropped.
pub struct DestinationLease {
    registry: Arc<DestinationRegistry>,
    path: PathBuf,
}

impl DestinationLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DestinationLease {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

impl std::fmt::Debug for DestinationLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DestinationLease").field(&self.path).finish()
    }
}

// =============================================================================
// Cache layout
// =============================================================================

/// Locations of derived artifacts under the cache root.
#[derive(Clone, Debug)]
pub struct CacheDirs {
    root: PathBuf,
}

impl CacheDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the cache directory tree
    pub fn ensure(&self) -> TaskResult<()> {
        for dir in [
            self.root.join("thumbs"),
            self.root.join("audiolevels"),
            self.root.join("proxies"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Poster/frame thumbnail for a clip
    pub fn thumbnail_path(&self, content_hash: &str, frame: Frame) -> PathBuf {
        self.root
            .join("thumbs")
            .join(format!("{}#{}.jpg", content_hash, frame))
    }

    /// Audio level data for one stream of a clip
    pub fn audio_levels_path(&self, content_hash: &str, stream_index: usize) -> PathBuf {
        self.root
            .join("audiolevels")
            .join(format!("{}_{}.dat", content_hash, stream_index))
    }

    /// Proxy file for a clip
    pub fn proxy_path(&self, content_hash: &str, extension: &str) -> PathBuf {
        self.root
            .join("proxies")
            .join(format!("{}.{}", content_hash, extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_without_collision_keeps_name() {
        let dir = TempDir::new().unwrap();
        let registry = DestinationRegistry::new();
        let desired = dir.path().join("cut.mp4");
        let lease = registry.claim(desired.clone());
        assert_eq!(lease.path(), desired);
    }

    #[test]
    fn test_concurrent_claims_get_distinct_paths() {
        let dir = TempDir::new().unwrap();
        let registry = DestinationRegistry::new();
        let desired = dir.path().join("cut.mp4");

        let first = registry.claim(desired.clone());
        let second = registry.claim(desired.clone());
        assert_ne!(first.path(), second.path());
        assert_eq!(second.path(), dir.path().join("cut-0001.mp4"));
    }

    #[test]
    fn test_existing_file_forces_new_name() {
        let dir = TempDir::new().unwrap();
        let registry = DestinationRegistry::new();
        let desired = dir.path().join("cut.mp4");
        std::fs::write(&desired, b"previous run").unwrap();

        let lease = registry.claim(desired.clone());
        assert_ne!(lease.path(), desired);
    }

    #[test]
    fn test_release_on_drop() {
        let dir = TempDir::new().unwrap();
        let registry = DestinationRegistry::new();
        let desired = dir.path().join("cut.mp4");
        {
            let lease = registry.claim(desired.clone());
            assert!(registry.is_claimed(lease.path()));
        }
        assert!(!registry.is_claimed(&desired));
        let lease = registry.claim(desired.clone());
        assert_eq!(lease.path(), desired);
    }

    #[test]
    fn test_cache_paths_are_deterministic() {
        let cache = CacheDirs::new("/cache/clipforge");
        assert_eq!(
            cache.thumbnail_path("abcd", 10),
            PathBuf::from("/cache/clipforge/thumbs/abcd#10.jpg")
        );
        assert_eq!(
            cache.audio_levels_path("abcd", 1),
            PathBuf::from("/cache/clipforge/audiolevels/abcd_1.dat")
        );
        assert_eq!(
            cache.proxy_path("abcd", "mp4"),
            PathBuf::from("/cache/clipforge/proxies/abcd.mp4")
        );
    }

    #[test]
    fn test_cache_ensure_creates_tree() {
        let dir = TempDir::new().unwrap();
        let cache = CacheDirs::new(dir.path().join("cache"));
        cache.ensure().unwrap();
        assert!(dir.path().join("cache/thumbs").is_dir());
        assert!(dir.path().join("cache/proxies").is_dir());
    }
}
