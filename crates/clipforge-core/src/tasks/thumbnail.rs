//! Thumbnail task: extracts one poster frame for a clip into the
//! persistent cache and writes the resulting path back onto the clip.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::EngineEvent;
use crate::project::props;
use crate::tasks::{ClipTask, TaskContext, TaskManager, TaskState};
use crate::{Frame, KindFilter, TaskError, TaskKind, TaskOwner, TaskResult, DEFAULT_FRAME};

pub struct ThumbnailTask {
    state: TaskState,
    /// Frame to capture; [`DEFAULT_FRAME`] resolves through the clip's
    /// stored default-frame property
    frame: Frame,
}

impl ThumbnailTask {
    /// Schedules a thumbnail unless one is already pending for the clip.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, frame: Frame, force: bool) {
        if manager.has_pending_task(owner.item_id, KindFilter::Only(TaskKind::Thumbnail)) {
            return;
        }
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Thumbnail, "Creating thumbnail"),
            frame,
        });
        task.state.set_force(force);
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for ThumbnailTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let Some(producer) = clip.producer() else {
            self.state.append_error("No producer for this clip.");
            return Err(TaskError::InvalidParameters("clip has no producer".into()));
        };

        let frame = if self.frame == DEFAULT_FRAME {
            clip.int_property(props::DEFAULT_FRAME).unwrap_or(0)
        } else {
            self.frame
        };
        let frame = frame.clamp(0, producer.length.max(1) - 1);
        let output = ctx.cache.thumbnail_path(clip.content_hash(), frame);

        if !self.state.is_force() && output.is_file() {
            // Cached thumbnail from an earlier run
            clip.set_property(props::THUMBNAIL, output.to_string_lossy());
            self.state.report_progress(100, &ctx.events);
            ctx.events.emit(EngineEvent::ClipUpdated { item_id });
            return Ok(());
        }

        let fps = if producer.fps > 0.0 { producer.fps } else { 25.0 };
        let time_sec = frame as f64 / fps;
        ctx.engine
            .extract_frame(&clip.url(), time_sec, &output)
            .await?;
        if self.state.is_canceled() {
            let _ = std::fs::remove_file(&output);
            return Err(TaskError::Canceled);
        }

        clip.set_property(props::THUMBNAIL, output.to_string_lossy());
        self.state.report_progress(100, &ctx.events);
        ctx.events.emit(EngineEvent::ClipUpdated { item_id });
        Ok(())
    }
}
