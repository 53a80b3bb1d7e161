//! Bin clip: a project media item.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{ClipId, FolderId, Frame, TimeSec, ROOT_FOLDER};

/// Well-known clip property keys
pub mod props {
    /// Path of the clip's proxy file; [`PROXY_NONE`] means disabled
    pub const PROXY: &str = "proxy";
    /// Sentinel proxy value meaning "no usable proxy"
    pub const PROXY_NONE: &str = "-";
    /// Force re-creating the proxy even if the file exists
    pub const PROXY_OVERWRITE: &str = "_overwriteproxy";
    /// Frame used for the clip's poster thumbnail
    pub const DEFAULT_FRAME: &str = "thumbnailFrame";
    /// Path of the produced poster thumbnail
    pub const THUMBNAIL: &str = "thumbnail";
    /// Set once audio level data has been generated
    pub const AUDIO_LEVELS_CREATED: &str = "audioLevelsCreated";
    /// Prefix for per-stream audio level cache paths
    pub const AUDIO_LEVELS_PREFIX: &str = "audioLevels:";
    /// Stabilization data sidecar produced for this clip
    pub const STABILIZATION_DATA: &str = "stabilizationData";
}

/// Broad media category of a clip; some job kinds only apply to a subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClipKind {
    AudioVideo,
    Video,
    Audio,
    Image,
    Playlist,
    Unknown,
}

impl ClipKind {
    /// Kinds that carry encodeable audio/video streams
    pub fn is_av(self) -> bool {
        matches!(self, ClipKind::AudioVideo | ClipKind::Video | ClipKind::Audio)
    }
}

/// Audio stream description exposed by the producer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStream {
    pub index: usize,
    pub channels: u32,
    pub sample_rate: u32,
}

/// Opaque playback-producer handle.
///
/// Stands in for the host media engine's producer object; the job engine
/// only reads length, fps and stream layout from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerHandle {
    /// Length in frames
    pub length: Frame,
    /// Frames per second
    pub fps: f64,
    /// Audio streams, empty for silent clips
    pub audio_streams: Vec<AudioStream>,
    /// Video codec name, if any
    pub video_codec: Option<String>,
    /// Audio codec name, if any
    pub audio_codec: Option<String>,
}

impl ProducerHandle {
    pub fn duration_seconds(&self) -> TimeSec {
        if self.fps <= 0.0 {
            return 0.0;
        }
        self.length as f64 / self.fps
    }
}

/// Marker placed on a clip (used by scene detection)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub frame: Frame,
    pub comment: String,
    pub category: i32,
}

/// Named sub-range of a clip
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubClip {
    pub name: String,
    pub zone_in: Frame,
    pub zone_out: Frame,
}

/// A project media item.
///
/// Mutable fields are guarded by locks scoped to the clip itself; tasks
/// take them only while reading or writing and never across a blocking
/// sub-call.
pub struct BinClip {
    id: ClipId,
    content_hash: String,
    kind: Mutex<ClipKind>,
    url: Mutex<PathBuf>,
    folder: AtomicI64,
    properties: Mutex<HashMap<String, String>>,
    producer: Mutex<Option<ProducerHandle>>,
    markers: Mutex<Vec<Marker>>,
    subclips: Mutex<Vec<SubClip>>,
}

impl std::fmt::Debug for BinClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinClip")
            .field("id", &self.id)
            .field("url", &self.url.lock().unwrap())
            .field("kind", &*self.kind.lock().unwrap())
            .finish()
    }
}

impl BinClip {
    pub(crate) fn new(id: ClipId, url: PathBuf, kind: ClipKind, folder: FolderId) -> Self {
        let content_hash = compute_content_hash(&url);
        Self {
            id,
            content_hash,
            kind: Mutex::new(kind),
            url: Mutex::new(url),
            folder: AtomicI64::new(folder),
            properties: Mutex::new(HashMap::new()),
            producer: Mutex::new(None),
            markers: Mutex::new(Vec::new()),
            subclips: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    /// Stable hash of the clip's source content; cache paths derive
    /// from it.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn kind(&self) -> ClipKind {
        *self.kind.lock().unwrap()
    }

    pub fn set_kind(&self, kind: ClipKind) {
        *self.kind.lock().unwrap() = kind;
    }

    pub fn url(&self) -> PathBuf {
        self.url.lock().unwrap().clone()
    }

    /// Replaces the clip's underlying resource (e.g. after transcoding
    /// in place)
    pub fn set_url(&self, url: PathBuf) {
        *self.url.lock().unwrap() = url;
    }

    pub fn parent_folder(&self) -> FolderId {
        self.folder.load(Ordering::Relaxed)
    }

    pub fn set_parent_folder(&self, folder: FolderId) {
        self.folder.store(folder, Ordering::Relaxed);
    }

    // =========================================================================
    // Property bag
    // =========================================================================

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    pub fn int_property(&self, key: &str) -> Option<i64> {
        self.property(key).and_then(|v| v.parse().ok())
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.lock().unwrap().contains_key(key)
    }

    pub fn set_property(&self, key: &str, value: impl Into<String>) {
        self.properties
            .lock()
            .unwrap()
            .insert(key.to_string(), value.into());
    }

    pub fn remove_property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().remove(key)
    }

    // =========================================================================
    // Producer
    // =========================================================================

    /// Current live producer handle, absent until a load task ran
    pub fn producer(&self) -> Option<ProducerHandle> {
        self.producer.lock().unwrap().clone()
    }

    pub fn set_producer(&self, producer: ProducerHandle) {
        *self.producer.lock().unwrap() = Some(producer);
    }

    /// Length in frames, 0 when no producer is attached
    pub fn duration_frames(&self) -> Frame {
        self.producer().map(|p| p.length).unwrap_or(0)
    }

    /// Duration in seconds, 0 when no producer is attached
    pub fn duration_seconds(&self) -> TimeSec {
        self.producer().map(|p| p.duration_seconds()).unwrap_or(0.0)
    }

    pub fn audio_streams(&self) -> Vec<AudioStream> {
        self.producer().map(|p| p.audio_streams).unwrap_or_default()
    }

    // =========================================================================
    // Markers and subclips
    // =========================================================================

    pub fn markers(&self) -> Vec<Marker> {
        self.markers.lock().unwrap().clone()
    }

    pub fn add_markers(&self, new: Vec<Marker>) {
        self.markers.lock().unwrap().extend(new);
    }

    /// Removes markers matching the given category; returns the removed
    /// set so the caller can restore it on undo.
    pub fn remove_markers_in_category(&self, category: i32) -> Vec<Marker> {
        let mut markers = self.markers.lock().unwrap();
        let (removed, kept): (Vec<_>, Vec<_>) =
            markers.drain(..).partition(|m| m.category == category);
        *markers = kept;
        removed
    }

    /// Removes the first marker equal to the given one
    pub fn remove_marker(&self, marker: &Marker) -> bool {
        let mut markers = self.markers.lock().unwrap();
        if let Some(pos) = markers.iter().position(|m| m == marker) {
            markers.remove(pos);
            return true;
        }
        false
    }

    pub fn subclips(&self) -> Vec<SubClip> {
        self.subclips.lock().unwrap().clone()
    }

    pub fn add_subclips(&self, new: Vec<SubClip>) {
        self.subclips.lock().unwrap().extend(new);
    }

    /// Removes the first subclip equal to the given one
    pub fn remove_subclip(&self, subclip: &SubClip) -> bool {
        let mut subclips = self.subclips.lock().unwrap();
        if let Some(pos) = subclips.iter().position(|s| s == subclip) {
            subclips.remove(pos);
            return true;
        }
        false
    }
}

fn compute_content_hash(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    if let Ok(meta) = std::fs::metadata(path) {
        hasher.update(meta.len().to_le_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(16)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl Default for ProducerHandle {
    fn default() -> Self {
        Self {
            length: 0,
            fps: 25.0,
            audio_streams: Vec::new(),
            video_codec: None,
            audio_codec: None,
        }
    }
}
