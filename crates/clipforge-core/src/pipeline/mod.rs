//! Pipeline Execution Capability
//!
//! Tasks treat media processing as a black box: "build a
//! producer/consumer pipeline from a source and named parameters, run
//! it, report progress via a textual stream". The capability is
//! reachable two ways — an in-process engine call, or spawning an
//! external encoder/renderer process and parsing its output — both
//! behind the [`PipelineEngine`] trait so schedulers and tests never
//! depend on real binaries.

mod external;
mod progress;

pub use external::*;
pub use progress::*;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{Frame, TaskResult, TimeSec};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation flag shared between a task and the pipeline
/// executing on its behalf.
///
/// Cancellation latches exactly once; a running external process is
/// killed and the poll loop observes the flag between work increments.
/// There is no instantaneous stop, only bounded-time unwind.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag; returns false if it was already set.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is canceled (immediately if it already is)
    pub async fn cancelled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

// =============================================================================
// Probe output
// =============================================================================

/// Video stream information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub pixel_format: String,
}

/// Audio stream information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamInfo {
    pub index: usize,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec: String,
}

/// Media information extracted by the probe tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Duration in seconds
    pub duration_sec: TimeSec,
    /// First video stream, if present
    pub video: Option<VideoStreamInfo>,
    /// All audio streams
    pub audio_streams: Vec<AudioStreamInfo>,
    /// Container format name
    pub format: String,
    /// File size in bytes
    pub size_bytes: u64,
}

impl SourceInfo {
    /// Frames at the source frame rate (25 fps assumed without video)
    pub fn duration_frames(&self) -> Frame {
        let fps = self.video.as_ref().map(|v| v.fps).unwrap_or(25.0);
        (self.duration_sec * fps).round() as Frame
    }
}

// =============================================================================
// Pipeline requests
// =============================================================================

/// One encode run through the ffmpeg-family tool.
///
/// Progress arrives on stderr using the `Duration:` / `time=HH:MM:SS`
/// convention.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Arguments between the global flags and the destination, in
    /// ffmpeg order. `-i <source>` is included by the caller so inputs
    /// can be preceded by pre-input flags.
    pub args: Vec<String>,
    /// Known source duration, seconds; when absent it is recovered from
    /// the tool's own `Duration:` banner
    pub duration_hint: Option<TimeSec>,
}

/// One render run through the host engine's command-line renderer.
///
/// Progress arrives using the `percentage: N` convention.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Producer spec, e.g. `timewarp:0.5:/path/clip.mp4`
    pub producer: String,
    /// Producer parameters (`in=`, `out=`, key=value)
    pub producer_args: Vec<String>,
    /// Filter to attach with its parameters, if any
    pub filter: Option<(String, Vec<String>)>,
    /// Consumer spec, e.g. `xml:/path/out.mlt`
    pub consumer: String,
    /// Consumer parameters
    pub consumer_args: Vec<String>,
}

/// Progress callback: integer percentage 0-100
pub type ProgressFn<'a> = &'a (dyn Fn(i32) + Send + Sync);

// =============================================================================
// Engine trait
// =============================================================================

/// The media-processing capability tasks run against.
///
/// Implementations must honor the cancel token promptly (kill any
/// subprocess, return [`crate::TaskError::Canceled`]) and report
/// progress monotonically through the callback.
#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Probe a source file
    async fn probe(&self, source: &Path) -> TaskResult<SourceInfo>;

    /// Extract a single frame as an image file
    async fn extract_frame(&self, source: &Path, time_sec: TimeSec, output: &Path)
        -> TaskResult<()>;

    /// Decode one audio stream into per-sample peak bytes (0-255)
    async fn audio_levels(&self, source: &Path, stream_index: usize) -> TaskResult<Vec<u8>>;

    /// Run an encode through the external encoder
    async fn run_encode(
        &self,
        request: &EncodeRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()>;

    /// Run an arbitrary external tool that follows the encoder's
    /// `time=` progress convention. `output` names the artifact the
    /// tool is expected to produce, when known.
    async fn run_tool(
        &self,
        binary: &Path,
        args: &[String],
        output: Option<&Path>,
        duration_hint: Option<TimeSec>,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()>;

    /// Run a render through the host engine's renderer
    async fn run_render(
        &self,
        request: &RenderRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()>;

    /// Detect scene changes; returns cut points in frames
    async fn detect_scenes(
        &self,
        source: &Path,
        threshold: f64,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<Vec<Frame>>;
}
