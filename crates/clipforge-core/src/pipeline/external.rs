//! External tool pipelines.
//!
//! Spawns the encoder/probe/renderer binaries, streams their output,
//! feeds the progress parsers and kills the child when the task's
//! cancel token fires. Exit classification follows the error taxonomy:
//! signal death and nonzero exit both surface as
//! [`TaskError::ExternalToolCrashed`] with the captured log attached.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{
    AudioStreamInfo, CancelToken, EncodeRequest, PipelineEngine, ProgressFn, ProgressParser,
    RenderRequest, SourceInfo, VideoStreamInfo,
};
use crate::process::{configure_command, renice};
use crate::settings::ToolSettings;
use crate::{Frame, TaskError, TaskResult};

/// Maximum captured log size per run; older lines are dropped
const LOG_CAP: usize = 64 * 1024;

/// Pipeline engine backed by external command-line tools.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    tools: ToolSettings,
}

impl ExternalEngine {
    pub fn new(tools: ToolSettings) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolSettings {
        &self.tools
    }

    /// Verifies a tool binary can be spawned, before any work begins.
    pub fn ensure_tool(path: &Path) -> TaskResult<()> {
        if tool_available(path) {
            Ok(())
        } else {
            Err(TaskError::ExternalToolMissing(
                path.to_string_lossy().to_string(),
            ))
        }
    }

    /// Spawns a tool, watches its stderr through the given parser and
    /// returns the captured log on normal exit.
    async fn spawn_and_watch(
        &self,
        binary: &Path,
        args: &[String],
        mut parser: ProgressParser,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<String> {
        Self::ensure_tool(binary)?;
        debug!("Spawning {} {:?}", binary.display(), args);

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_command(&mut cmd);

        let mut child = cmd.spawn().map_err(TaskError::Io)?;
        renice(child.id());

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Internal("child stderr not captured".into()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut log = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(TaskError::Canceled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            append_log(&mut log, &line);
                            if let Some(pct) = parser.feed(&line) {
                                progress(pct);
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }

        let status = child.wait().await.map_err(TaskError::Io)?;
        if cancel.is_canceled() {
            return Err(TaskError::Canceled);
        }
        if !status.success() {
            let message = match status.code() {
                Some(code) => format!("{} exited with status {}", binary.display(), code),
                None => format!("{} was terminated by a signal", binary.display()),
            };
            return Err(TaskError::ExternalToolCrashed { message, log });
        }
        Ok(log)
    }
}

fn append_log(log: &mut String, line: &str) {
    log.push_str(line);
    log.push('\n');
    if log.len() > LOG_CAP {
        let cut = log.len() - LOG_CAP;
        // Drop whole leading lines up to the cap
        let cut = log[cut..]
            .find('\n')
            .map(|i| cut + i + 1)
            .unwrap_or(cut);
        log.drain(..cut);
    }
}

/// Checks a binary path: absolute/relative paths must exist, bare names
/// are searched on PATH.
fn tool_available(path: &Path) -> bool {
    if path.components().count() > 1 {
        return path.is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(path).is_file())
}

#[async_trait]
impl PipelineEngine for ExternalEngine {
    async fn probe(&self, source: &Path) -> TaskResult<SourceInfo> {
        Self::ensure_tool(&self.tools.ffprobe_path)?;
        if !source.exists() {
            return Err(TaskError::InvalidParameters(format!(
                "Input file does not exist: {}",
                source.display()
            )));
        }
        let mut cmd = Command::new(&self.tools.ffprobe_path);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(source)
        .stdin(Stdio::null());
        configure_command(&mut cmd);

        let output = cmd.output().await.map_err(TaskError::Io)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(TaskError::ExternalToolCrashed {
                message: "probe failed".into(),
                log: stderr,
            });
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn extract_frame(
        &self,
        source: &Path,
        time_sec: f64,
        output: &Path,
    ) -> TaskResult<()> {
        Self::ensure_tool(&self.tools.ffmpeg_path)?;
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // -ss before -i for fast seeking, single frame, good quality
        let mut cmd = Command::new(&self.tools.ffmpeg_path);
        cmd.args(["-hide_banner", "-v", "error", "-ss", &format!("{:.3}", time_sec), "-i"])
            .arg(source)
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(output)
            .stdin(Stdio::null());
        configure_command(&mut cmd);

        let result = cmd.output().await.map_err(TaskError::Io)?;
        if !result.status.success() {
            return Err(TaskError::ExternalToolCrashed {
                message: "frame extraction failed".into(),
                log: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn audio_levels(&self, source: &Path, stream_index: usize) -> TaskResult<Vec<u8>> {
        Self::ensure_tool(&self.tools.ffmpeg_path)?;
        // Mono unsigned 8-bit samples at a coarse rate; one byte per
        // level point is what the waveform painter consumes.
        let mut cmd = Command::new(&self.tools.ffmpeg_path);
        cmd.args(["-hide_banner", "-v", "error", "-i"])
            .arg(source)
            .args([
                "-map",
                &format!("0:a:{}", stream_index),
                "-ac",
                "1",
                "-ar",
                "50",
                "-f",
                "u8",
                "pipe:1",
            ])
            .stdin(Stdio::null());
        configure_command(&mut cmd);

        let output = cmd.output().await.map_err(TaskError::Io)?;
        if !output.status.success() {
            return Err(TaskError::ExternalToolCrashed {
                message: format!("audio decode failed for stream {}", stream_index),
                log: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run_encode(
        &self,
        request: &EncodeRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        if let Some(parent) = request.destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-y".into(),
            "-stats".into(),
            "-v".into(),
            "error".into(),
        ];
        args.extend(request.args.iter().cloned());
        args.push(request.destination.to_string_lossy().to_string());

        let parser = ProgressParser::encoder(request.duration_hint);
        self.spawn_and_watch(&self.tools.ffmpeg_path, &args, parser, cancel, progress)
            .await?;
        Ok(())
    }

    async fn run_tool(
        &self,
        binary: &Path,
        args: &[String],
        _output: Option<&Path>,
        duration_hint: Option<f64>,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        let parser = ProgressParser::encoder(duration_hint);
        self.spawn_and_watch(binary, args, parser, cancel, progress)
            .await?;
        Ok(())
    }

    async fn run_render(
        &self,
        request: &RenderRequest,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<()> {
        let mut args: Vec<String> = vec!["-progress".into()];
        args.push(request.producer.clone());
        args.extend(request.producer_args.iter().cloned());
        if let Some((filter, filter_args)) = &request.filter {
            args.push("-attach".into());
            args.push(filter.clone());
            args.extend(filter_args.iter().cloned());
        }
        args.push("-consumer".into());
        args.push(request.consumer.clone());
        args.extend(request.consumer_args.iter().cloned());
        args.push("terminate_on_pause=1".into());

        let parser = ProgressParser::renderer();
        self.spawn_and_watch(&self.tools.renderer_path, &args, parser, cancel, progress)
            .await?;
        Ok(())
    }

    async fn detect_scenes(
        &self,
        source: &Path,
        threshold: f64,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> TaskResult<Vec<Frame>> {
        Self::ensure_tool(&self.tools.ffmpeg_path)?;
        let info = self.probe(source).await?;
        let fps = info.video.as_ref().map(|v| v.fps).unwrap_or(25.0);

        let args: Vec<String> = vec![
            "-hide_banner".into(),
            "-i".into(),
            source.to_string_lossy().to_string(),
            "-vf".into(),
            format!("select='gt(scene,{})',showinfo", threshold),
            "-f".into(),
            "null".into(),
            "-".into(),
        ];

        // showinfo prints one line per selected frame with its pts_time;
        // progress is derived from how far into the source it got.
        let duration = info.duration_sec.max(f64::EPSILON);
        let parser = ScenePassParser {
            re: regex::Regex::new(r"pts_time:\s*([0-9]+(?:\.[0-9]+)?)")
                .map_err(|e| TaskError::Internal(e.to_string()))?,
        };

        // The scene pass yields data, not just percentages, so it runs
        // its own watch loop instead of spawn_and_watch.
        let mut cut_times: Vec<f64> = Vec::new();
        let mut cmd = Command::new(&self.tools.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_command(&mut cmd);
        let mut child = cmd.spawn().map_err(TaskError::Io)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Internal("child stderr not captured".into()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut log = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(TaskError::Canceled);
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            append_log(&mut log, &line);
                            if let Some(time) = parser.feed(&line) {
                                cut_times.push(time);
                                progress(((time / duration) * 100.0) as i32);
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
        }
        let status = child.wait().await.map_err(TaskError::Io)?;
        if cancel.is_canceled() {
            return Err(TaskError::Canceled);
        }
        if !status.success() {
            let message = match status.code() {
                Some(code) => format!("scene detection exited with status {}", code),
                None => "scene detection was terminated by a signal".to_string(),
            };
            return Err(TaskError::ExternalToolCrashed { message, log });
        }

        Ok(cut_times
            .into_iter()
            .map(|t| (t * fps).round() as Frame)
            .collect())
    }
}

struct ScenePassParser {
    re: regex::Regex,
}

impl ScenePassParser {
    fn feed(&self, line: &str) -> Option<f64> {
        if !line.contains("showinfo") {
            return None;
        }
        let captures = self.re.captures(line)?;
        captures.get(1)?.as_str().parse().ok()
    }
}

/// Parse the probe tool's JSON output
fn parse_probe_output(json_str: &str) -> TaskResult<SourceInfo> {
    let json: serde_json::Value = serde_json::from_str(json_str)?;

    let format = json
        .get("format")
        .ok_or_else(|| TaskError::Internal("probe output missing format info".into()))?;

    let duration_sec = format
        .get("duration")
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .get("size")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let format_name = format
        .get("format_name")
        .and_then(|f| f.as_str())
        .unwrap_or("unknown")
        .to_string();

    let streams = json
        .get("streams")
        .and_then(|s| s.as_array())
        .cloned()
        .unwrap_or_default();

    let mut video: Option<VideoStreamInfo> = None;
    let mut audio_streams: Vec<AudioStreamInfo> = Vec::new();

    for stream in &streams {
        match stream.get("codec_type").and_then(|c| c.as_str()) {
            Some("video") if video.is_none() => {
                video = Some(VideoStreamInfo {
                    width: stream.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    height: stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    fps: stream
                        .get("r_frame_rate")
                        .and_then(|v| v.as_str())
                        .map(parse_frame_rate)
                        .unwrap_or(0.0),
                    codec: stream
                        .get("codec_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    pixel_format: stream
                        .get("pix_fmt")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            Some("audio") => {
                audio_streams.push(AudioStreamInfo {
                    index: audio_streams.len(),
                    sample_rate: stream
                        .get("sample_rate")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0),
                    channels: stream.get("channels").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    codec: stream
                        .get("codec_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(SourceInfo {
        duration_sec,
        video,
        audio_streams,
        format: format_name,
        size_bytes,
    })
}

/// Parses "30000/1001"-style frame rates
fn parse_frame_rate(raw: &str) -> f64 {
    let mut parts = raw.splitn(2, '/');
    let num: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
    let den: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1.0);
    if den == 0.0 {
        return 0.0;
    }
    num / den
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output_full() {
        let json = r#"{
            "format": {"duration": "12.5", "size": "1024", "format_name": "mov,mp4"},
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080,
                 "r_frame_rate": "30000/1001", "codec_name": "h264", "pix_fmt": "yuv420p"},
                {"codec_type": "audio", "sample_rate": "48000", "channels": 2, "codec_name": "aac"}
            ]
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.duration_sec, 12.5);
        assert_eq!(info.size_bytes, 1024);
        let video = info.video.unwrap();
        assert_eq!(video.width, 1920);
        assert!((video.fps - 29.97).abs() < 0.01);
        assert_eq!(info.audio_streams.len(), 1);
        assert_eq!(info.audio_streams[0].sample_rate, 48000);
    }

    #[test]
    fn test_parse_probe_output_missing_format() {
        assert!(parse_probe_output("{}").is_err());
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), 25.0);
        assert_eq!(parse_frame_rate("0/0"), 0.0);
        assert_eq!(parse_frame_rate("30"), 30.0);
    }

    #[test]
    fn test_tool_available_for_missing_path() {
        assert!(!tool_available(Path::new("/nonexistent/bin/ffmpeg")));
    }

    #[test]
    fn test_append_log_caps_size() {
        let mut log = String::new();
        let line = "x".repeat(1000);
        for _ in 0..100 {
            append_log(&mut log, &line);
        }
        assert!(log.len() <= LOG_CAP + 1001);
    }

    #[test]
    fn test_scene_parser_extracts_pts_time() {
        let parser = ScenePassParser {
            re: regex::Regex::new(r"pts_time:\s*([0-9]+(?:\.[0-9]+)?)").unwrap(),
        };
        let line = "[Parsed_showinfo_1 @ 0x55] n: 0 pts: 12800 pts_time:4.26 duration: 512";
        assert_eq!(parser.feed(line), Some(4.26));
        assert_eq!(parser.feed("frame= 100"), None);
    }
}
