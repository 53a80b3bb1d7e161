//! Proxy task: encodes a low-resolution stand-in for a clip through the
//! external encoder. Runs on the constrained encode pool. On failure
//! the clip's proxy property is reset to the `-` sentinel so playback
//! falls back to the original.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::EncodeRequest;
use crate::project::{props, BinClip};
use crate::tasks::{ClipTask, TaskContext, TaskManager, TaskState};
use crate::{KindFilter, TaskError, TaskKind, TaskOwner, TaskResult};

pub struct ProxyTask {
    state: TaskState,
}

impl ProxyTask {
    /// Schedules proxy generation unless one is already pending for the
    /// clip. The destination comes from the clip's proxy property,
    /// which the caller must have set.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, force: bool) {
        if manager.has_pending_task(owner.item_id, KindFilter::Only(TaskKind::Proxy)) {
            return;
        }
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Proxy, "Creating proxy"),
        });
        task.state.set_force(force);
        manager.start_task(task);
    }

    fn stage_apply(&self, clip: &Arc<BinClip>, dest: &str) {
        let previous = clip.property(props::PROXY);
        let apply_clip = Arc::clone(clip);
        let revert_clip = Arc::clone(clip);
        let dest = dest.to_string();
        self.state.stage_commit(
            Box::new(move || {
                apply_clip.set_property(props::PROXY, dest.clone());
                true
            }),
            Box::new(move || {
                match &previous {
                    Some(value) => revert_clip.set_property(props::PROXY, value.clone()),
                    None => {
                        revert_clip.remove_property(props::PROXY);
                    }
                }
                true
            }),
        );
    }
}

#[async_trait]
impl ClipTask for ProxyTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let dest = match clip.property(props::PROXY) {
            Some(dest) if dest != props::PROXY_NONE && !dest.is_empty() => dest,
            _ => {
                self.state.append_error("No proxy configured for this clip.");
                return Err(TaskError::InvalidParameters(
                    "clip has no proxy destination".into(),
                ));
            }
        };
        if !clip.kind().is_av() {
            self.state
                .append_error("Cannot create a proxy for this clip type.");
            return Err(TaskError::InvalidParameters(
                "unsupported clip type for proxy".into(),
            ));
        }

        let dest_path = PathBuf::from(&dest);
        let overwrite = self.state.is_force()
            || clip.int_property(props::PROXY_OVERWRITE).unwrap_or(0) == 1;
        if !overwrite
            && dest_path.is_file()
            && dest_path.metadata().map(|m| m.len()).unwrap_or(0) > 0
        {
            // Proxy already created by an earlier session
            debug!("Proxy for clip {} already exists", item_id);
            self.state.report_progress(100, &ctx.events);
            self.stage_apply(&clip, &dest);
            return Ok(());
        }

        let settings = ctx.settings();
        let params = settings
            .encoding
            .proxy_params
            .replace("%width", &settings.encoding.proxy_resize.to_string());
        let mut args: Vec<String> = vec![
            "-noautorotate".into(),
            "-i".into(),
            clip.url().to_string_lossy().to_string(),
        ];
        args.extend(params.split_whitespace().map(str::to_string));
        // Keep stream order, drop subtitles/data, tolerate unknown streams
        args.extend(
            ["-sn", "-dn", "-map", "0", "-ignore_unknown"]
                .iter()
                .map(|s| s.to_string()),
        );

        let request = EncodeRequest {
            source: clip.url(),
            destination: dest_path.clone(),
            args,
            duration_hint: Some(clip.duration_seconds()).filter(|d| *d > 0.0),
        };
        let events = ctx.events.clone();
        let result = ctx
            .engine
            .run_encode(&request, self.state.cancel_token(), &|pct| {
                self.state.report_progress(pct, &events);
            })
            .await;

        match result {
            Ok(()) => {
                if dest_path.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&dest_path);
                    clip.set_property(props::PROXY, props::PROXY_NONE);
                    self.state.append_error("Failed to create proxy clip.");
                    return Err(TaskError::EmptyOutput(dest));
                }
                self.stage_apply(&clip, &dest);
                Ok(())
            }
            Err(TaskError::Canceled) => {
                let _ = std::fs::remove_file(&dest_path);
                Err(TaskError::Canceled)
            }
            Err(err) => {
                // Encoder crashed or failed: drop the partial file and
                // mark the clip as having no usable proxy
                let _ = std::fs::remove_file(&dest_path);
                if !self.state.is_soft_delete() {
                    clip.set_property(props::PROXY, props::PROXY_NONE);
                }
                self.state.append_error("Failed to create proxy clip.");
                Err(err)
            }
        }
    }
}
