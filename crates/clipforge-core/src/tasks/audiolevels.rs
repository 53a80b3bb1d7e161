//! Audio levels task: decodes each audio stream of a clip into peak
//! data for waveform painting, cached per stream under the clip's
//! content hash.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::EngineEvent;
use crate::project::props;
use crate::tasks::{ClipTask, TaskContext, TaskManager, TaskState};
use crate::{KindFilter, TaskError, TaskKind, TaskOwner, TaskResult};

pub struct AudioLevelsTask {
    state: TaskState,
}

impl AudioLevelsTask {
    /// Schedules audio level generation unless one is already pending.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, force: bool) {
        if manager.has_pending_task(owner.item_id, KindFilter::Only(TaskKind::AudioThumb)) {
            return;
        }
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::AudioThumb, "Creating audio levels"),
        });
        task.state.set_force(force);
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for AudioLevelsTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let streams = clip.audio_streams();
        if streams.is_empty() {
            // Nothing to do for silent clips
            return Ok(());
        }
        if clip.has_property(props::AUDIO_LEVELS_CREATED) && !self.state.is_force() {
            return Ok(());
        }

        let url = clip.url();
        let hash = clip.content_hash().to_string();
        let total = streams.len();
        for (done, stream) in streams.iter().enumerate() {
            if self.state.is_canceled() {
                return Err(TaskError::Canceled);
            }
            let cache_path = ctx.cache.audio_levels_path(&hash, stream.index);
            if self.state.is_force() || !cache_path.is_file() {
                let levels = ctx.engine.audio_levels(&url, stream.index).await?;
                if self.state.is_canceled() {
                    return Err(TaskError::Canceled);
                }
                std::fs::write(&cache_path, &levels)?;
            }
            clip.set_property(
                &format!("{}{}", props::AUDIO_LEVELS_PREFIX, stream.index),
                cache_path.to_string_lossy(),
            );
            self.state
                .report_progress(((done + 1) * 100 / total) as i32, &ctx.events);
        }

        clip.set_property(props::AUDIO_LEVELS_CREATED, "1");
        ctx.events.emit(EngineEvent::ClipUpdated { item_id });
        Ok(())
    }
}
