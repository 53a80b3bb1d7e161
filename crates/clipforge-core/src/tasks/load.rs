//! Clip load task: probes a source file and attaches its producer
//! metadata to the bin clip. Runs at the highest priority so freshly
//! imported clips become usable before any analysis work.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::events::EngineEvent;
use crate::project::{AudioStream, ClipKind, ProducerHandle};
use crate::tasks::{ClipTask, TaskContext, TaskManager, TaskState};
use crate::{KindFilter, TaskError, TaskKind, TaskOwner, TaskResult};

pub struct LoadTask {
    state: TaskState,
}

impl LoadTask {
    /// Schedules a load for the clip unless one is already pending.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, force: bool) {
        if manager.has_pending_task(owner.item_id, KindFilter::Only(TaskKind::Load)) {
            return;
        }
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Load, "Loading clip"),
        });
        task.state.set_force(force);
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for LoadTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        if clip.producer().is_some() && !self.state.is_force() {
            return Ok(());
        }

        let url = clip.url();
        let info = ctx.engine.probe(&url).await?;
        if self.state.is_canceled() {
            return Err(TaskError::Canceled);
        }

        let fps = info.video.as_ref().map(|v| v.fps).filter(|f| *f > 0.0);
        let kind = match (&info.video, info.audio_streams.is_empty()) {
            (Some(_), false) => ClipKind::AudioVideo,
            (Some(_), true) => ClipKind::Video,
            (None, false) => ClipKind::Audio,
            (None, true) => ClipKind::Unknown,
        };
        let producer = ProducerHandle {
            length: info.duration_frames(),
            fps: fps.unwrap_or(25.0),
            audio_streams: info
                .audio_streams
                .iter()
                .map(|s| AudioStream {
                    index: s.index,
                    channels: s.channels,
                    sample_rate: s.sample_rate,
                })
                .collect(),
            video_codec: info.video.as_ref().map(|v| v.codec.clone()),
            audio_codec: info.audio_streams.first().map(|s| s.codec.clone()),
        };

        debug!(
            "Loaded clip {}: {} frames at {} fps",
            item_id,
            producer.length,
            producer.fps
        );
        clip.set_kind(kind);
        clip.set_producer(producer);
        self.state.report_progress(100, &ctx.events);
        ctx.events.emit(EngineEvent::ClipUpdated { item_id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::Harness;
    use crate::{TaskStatus, ROOT_FOLDER};

    #[tokio::test]
    async fn test_load_attaches_producer() {
        let harness = Harness::new();
        let path = harness.dir.path().join("raw.mp4");
        std::fs::write(&path, b"bytes").unwrap();
        let clip = harness
            .project
            .add_clip(path, ClipKind::Unknown, ROOT_FOLDER);

        LoadTask::start(&harness.manager, TaskOwner::clip(clip.id()), false);
        let tasks = harness.manager.tasks_for_clip(clip.id());
        assert_eq!(tasks.len(), 1);
        tasks[0].state().wait_done().await;

        let producer = clip.producer().unwrap();
        assert_eq!(producer.length, 100);
        assert_eq!(producer.fps, 25.0);
        assert_eq!(clip.kind(), ClipKind::AudioVideo);
    }

    #[tokio::test]
    async fn test_load_is_exclusive_per_clip() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");
        // add_clip attached a producer, so force re-load to keep tasks alive
        LoadTask::start(&harness.manager, TaskOwner::clip(item), true);
        LoadTask::start(&harness.manager, TaskOwner::clip(item), true);

        let tasks = harness.manager.tasks_for_clip(item);
        assert_eq!(tasks.len(), 1);
        tasks[0].state().wait_done().await;
    }

    #[tokio::test]
    async fn test_load_on_deleted_clip_is_silent() {
        let mut harness = Harness::new();
        let item = harness.add_clip("a.mp4");
        let clip = harness.project.clip(item).unwrap();
        clip.set_producer(crate::project::ProducerHandle::default());

        harness.project.remove_clip(item);
        LoadTask::start(&harness.manager, TaskOwner::clip(item), true);
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;

        assert_eq!(tasks[0].state().status(), TaskStatus::Failed);
        let messages = harness
            .drain_events()
            .into_iter()
            .filter(|ev| matches!(ev, EngineEvent::Message { .. }))
            .count();
        assert_eq!(messages, 0);
    }
}
