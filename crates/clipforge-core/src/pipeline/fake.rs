//! Scripted in-process engine for tests.
//!
//! Stands in for the external tools so scheduler and task tests run
//! deterministically without ffmpeg installed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CancelToken, EncodeRequest, PipelineEngine, ProgressFn, RenderRequest, SourceInfo,
    VideoStreamInfo,
};
use crate::{Frame, TaskError, TaskResult};

/// How a scripted encode/render run behaves
#[derive(Clone, Debug)]
pub enum RunBehavior {
    /// Write the given bytes to the destination and report staged
    /// progress. Empty bytes produce a zero-byte artifact.
    Succeed { output: Vec<u8> },
    /// Simulate an abnormal subprocess exit
    Crash,
    /// Sleep in small increments until the cancel token fires
    BlockUntilCanceled,
}

pub struct FakeEngine {
    pub source: Mutex<SourceInfo>,
    pub behavior: Mutex<RunBehavior>,
    pub levels: Mutex<Vec<u8>>,
    pub scenes: Mutex<Vec<Frame>>,
    pub extract_calls: Mutex<Vec<(PathBuf, f64, PathBuf)>>,
    pub encode_calls: Mutex<Vec<EncodeRequest>>,
    pub render_calls: Mutex<Vec<RenderRequest>>,
    /// Delay inserted between progress steps on success
    pub step_delay: Duration,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            source: Mutex::new(default_source()),
            behavior: Mutex::new(RunBehavior::Succeed {
                output: b"encoded".to_vec(),
            }),
            levels: Mutex::new(vec![0, 64, 128, 255]),
            scenes: Mutex::new(vec![]),
            extract_calls: Mutex::new(vec![]),
            encode_calls: Mutex::new(vec![]),
            render_calls: Mutex::new(vec![]),
            step_delay: Duration::from_millis(1),
        }
    }

    pub fn with_behavior(self, behavior: RunBehavior) -> Self {
        *self.behavior.lock().unwrap() = behavior;
        self
    }

    async fn run_scripted(
        &self,
        destination: Option<&Path>,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            RunBehavior::Succeed { output } => {
                for step in [20, 40, 60, 80, 100] {
                    if cancel.is_canceled() {
                        return Err(TaskError::Canceled);
                    }
                    tokio::time::sleep(self.step_delay).await;
                    progress(step);
                }
                if let Some(dest) = destination {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(dest, &output)?;
                }
                Ok(())
            }
            RunBehavior::Crash => {
                // A crashed process may leave a partial file behind
                if let Some(dest) = destination {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(dest, b"partial")?;
                }
                Err(TaskError::ExternalToolCrashed {
                    message: "tool was terminated by a signal".into(),
                    log: "fake crash log".into(),
                })
            }
            RunBehavior::BlockUntilCanceled => {
                cancel.cancelled().await;
                Err(TaskError::Canceled)
            }
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_source() -> SourceInfo {
    SourceInfo {
        duration_sec: 4.0,
        video: Some(VideoStreamInfo {
            width: 1920,
            height: 1080,
            fps: 25.0,
            codec: "h264".into(),
            pixel_format: "yuv420p".into(),
        }),
        audio_streams: vec![super::AudioStreamInfo {
            index: 0,
            sample_rate: 48000,
            channels: 2,
            codec: "aac".into(),
        }],
        format: "mp4".into(),
        size_bytes: 1_000_000,
    }
}

#[async_trait]
impl PipelineEngine for FakeEngine {
    async fn probe(&self, _source: &Path) -> TaskResult<SourceInfo> {
        Ok(self.source.lock().unwrap().clone())
    }

    async fn extract_frame(
        &self,
        source: &Path,
        time_sec: f64,
        output: &Path,
    ) -> TaskResult<()> {
        self.extract_calls
            .lock()
            .unwrap()
            .push((source.to_path_buf(), time_sec, output.to_path_buf()));
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output, b"image")?;
        Ok(())
    }

    async fn audio_levels(&self, _source: &Path, _stream_index: usize) -> TaskResult<Vec<u8>> {
        Ok(self.levels.lock().unwrap().clone())
    }

    async fn run_encode(
        &self,
        request: &EncodeRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        self.encode_calls.lock().unwrap().push(request.clone());
        self.run_scripted(Some(&request.destination), cancel, progress)
            .await
    }

    async fn run_tool(
        &self,
        _binary: &Path,
        _args: &[String],
        output: Option<&Path>,
        _duration_hint: Option<f64>,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        self.run_scripted(output, cancel, progress).await
    }

    async fn run_render(
        &self,
        request: &RenderRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        self.render_calls.lock().unwrap().push(request.clone());
        let destination = request
            .consumer
            .split_once(':')
            .map(|(_, path)| PathBuf::from(path));
        self.run_scripted(destination.as_deref(), cancel, progress)
            .await
    }

    async fn detect_scenes(
        &self,
        _source: &Path,
        _threshold: f64,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<Vec<Frame>> {
        if cancel.is_canceled() {
            return Err(TaskError::Canceled);
        }
        progress(100);
        Ok(self.scenes.lock().unwrap().clone())
    }
}
