//! Scene split task: detects scene changes in a clip and, on commit,
//! appends markers and/or subclips for the found cut points.

use std::sync::Arc;

use async_trait::async_trait;

use crate::project::{Marker, SubClip};
use crate::tasks::{ClipTask, Configurator, TaskContext, TaskManager, TaskState};
use crate::{Frame, KindFilter, TaskError, TaskKind, TaskOwner, TaskResult};

/// Validated parameters for scene detection
#[derive(Clone, Debug)]
pub struct SceneSplitParams {
    /// Detection threshold in 0..1, higher finds fewer cuts
    pub threshold: f64,
    /// Marker category to file cut markers under; `None` adds no markers
    pub marker_category: Option<i32>,
    /// Create one subclip per detected scene
    pub add_subclips: bool,
    /// Scenes shorter than this many frames are merged into their
    /// neighbor
    pub min_duration: Frame,
}

pub struct SceneSplitTask {
    state: TaskState,
    params: SceneSplitParams,
}

impl SceneSplitTask {
    /// Runs the blocking configuration step, then schedules detection
    /// unless an analysis is already pending for the clip.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, config: &dyn Configurator) {
        let ctx = manager.context();
        let Some(clip) = ctx.project.clip(owner.item_id) else {
            return;
        };
        let Some(params) = config.configure_scene_split(&clip) else {
            return;
        };
        Self::start_with_params(manager, owner, params);
    }

    pub fn start_with_params(
        manager: &Arc<TaskManager>,
        owner: TaskOwner,
        params: SceneSplitParams,
    ) {
        if manager.has_pending_task(owner.item_id, KindFilter::Only(TaskKind::Analyse)) {
            return;
        }
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Analyse, "Detecting scene change"),
            params,
        });
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for SceneSplitTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let length = clip.duration_frames();

        let events = ctx.events.clone();
        let cuts = ctx
            .engine
            .detect_scenes(
                &clip.url(),
                self.params.threshold,
                self.state.cancel_token(),
                &|pct| self.state.report_progress(pct, &events),
            )
            .await?;
        if self.state.is_canceled() {
            return Err(TaskError::Canceled);
        }

        // Drop cuts that would create a scene shorter than the minimum
        let mut kept: Vec<Frame> = Vec::new();
        let mut last = 0;
        for cut in cuts {
            if cut - last >= self.params.min_duration {
                kept.push(cut);
                last = cut;
            }
        }

        if kept.is_empty() {
            return Ok(());
        }

        let markers: Vec<Marker> = match self.params.marker_category {
            Some(category) => kept
                .iter()
                .enumerate()
                .map(|(i, frame)| Marker {
                    frame: *frame,
                    comment: format!("Scene {}", i + 1),
                    category,
                })
                .collect(),
            None => Vec::new(),
        };
        let subclips: Vec<SubClip> = if self.params.add_subclips {
            let mut bounds = vec![0];
            bounds.extend(kept.iter().copied());
            if length > 0 {
                bounds.push(length);
            }
            bounds
                .windows(2)
                .enumerate()
                .filter(|(_, w)| w[1] > w[0])
                .map(|(i, w)| SubClip {
                    name: format!("scene {}", i + 1),
                    zone_in: w[0],
                    zone_out: w[1] - 1,
                })
                .collect()
        } else {
            Vec::new()
        };

        if markers.is_empty() && subclips.is_empty() {
            return Ok(());
        }

        let apply_clip = Arc::clone(&clip);
        let revert_clip = Arc::clone(&clip);
        let markers_apply = markers.clone();
        let subclips_apply = subclips.clone();
        self.state.stage_commit(
            Box::new(move || {
                apply_clip.add_markers(markers_apply.clone());
                apply_clip.add_subclips(subclips_apply.clone());
                true
            }),
            Box::new(move || {
                for marker in &markers {
                    revert_clip.remove_marker(marker);
                }
                for subclip in &subclips {
                    revert_clip.remove_subclip(subclip);
                }
                true
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fake::FakeEngine;
    use crate::tasks::testutil::Harness;
    use crate::undo::shared_undo_stack;
    use crate::TaskStatus;

    fn params() -> SceneSplitParams {
        SceneSplitParams {
            threshold: 0.3,
            marker_category: Some(3),
            add_subclips: true,
            min_duration: 10,
        }
    }

    fn harness_with_scenes(scenes: Vec<Frame>) -> Harness {
        let engine = FakeEngine::new();
        *engine.scenes.lock().unwrap() = scenes;
        Harness::with_engine(engine)
    }

    #[tokio::test]
    async fn test_markers_and_subclips_committed_with_undo() {
        let harness = harness_with_scenes(vec![30, 70]);
        let item = harness.add_clip("a.mp4");
        let clip = harness.project.clip(item).unwrap();

        SceneSplitTask::start_with_params(&harness.manager, TaskOwner::clip(item), params());
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;
        assert_eq!(tasks[0].state().status(), TaskStatus::Succeeded);

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));

        let markers = clip.markers();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].frame, 30);
        assert_eq!(markers[0].category, 3);

        // Clip is 100 frames: scenes 0-29, 30-69, 70-99
        let subclips = clip.subclips();
        assert_eq!(subclips.len(), 3);
        assert_eq!(subclips[0].zone_out, 29);
        assert_eq!(subclips[2].zone_in, 70);

        assert!(undo.lock().unwrap().undo());
        assert!(clip.markers().is_empty());
        assert!(clip.subclips().is_empty());
        assert!(undo.lock().unwrap().redo());
        assert_eq!(clip.markers().len(), 2);
    }

    #[tokio::test]
    async fn test_short_scenes_are_merged() {
        let harness = harness_with_scenes(vec![30, 35, 70]);
        let item = harness.add_clip("a.mp4");
        let clip = harness.project.clip(item).unwrap();

        SceneSplitTask::start_with_params(&harness.manager, TaskOwner::clip(item), params());
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));
        // The cut at 35 is within 10 frames of the one at 30
        let frames: Vec<Frame> = clip.markers().iter().map(|m| m.frame).collect();
        assert_eq!(frames, vec![30, 70]);
    }

    #[tokio::test]
    async fn test_no_cuts_found_commits_nothing() {
        let harness = harness_with_scenes(vec![]);
        let item = harness.add_clip("a.mp4");
        let clip = harness.project.clip(item).unwrap();

        SceneSplitTask::start_with_params(&harness.manager, TaskOwner::clip(item), params());
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));
        assert!(clip.markers().is_empty());
        assert!(!undo.lock().unwrap().can_undo());
    }

    #[tokio::test]
    async fn test_analysis_is_exclusive_per_clip() {
        let harness = harness_with_scenes(vec![50]);
        let item = harness.add_clip("a.mp4");
        SceneSplitTask::start_with_params(&harness.manager, TaskOwner::clip(item), params());
        SceneSplitTask::start_with_params(&harness.manager, TaskOwner::clip(item), params());
        let tasks = harness.manager.tasks_for_clip(item);
        assert_eq!(tasks.len(), 1);
        tasks[0].state().wait_done().await;
    }
}
