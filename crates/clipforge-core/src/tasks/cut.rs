//! Cut task: extracts a zone of a clip into a standalone file via the
//! external encoder, preferring stream copy. Several cuts of the same
//! clip with different zones may run at the same time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::EncodeRequest;
use crate::tasks::{
    ClipTask, Configurator, DestinationLease, TaskContext, TaskManager, TaskState,
};
use crate::{Frame, TaskError, TaskKind, TaskOwner, TaskResult};

/// Validated parameters for one zone extraction
#[derive(Clone, Debug)]
pub struct CutParams {
    pub destination: std::path::PathBuf,
    /// Encoder arguments after input/zone flags, e.g. codec choices
    pub encoding_args: Vec<String>,
    /// Insert the extracted file into the project on commit
    pub add_to_project: bool,
}

pub struct CutTask {
    state: TaskState,
    params: CutParams,
    lease: DestinationLease,
    zone: (Frame, Frame),
}

impl CutTask {
    /// Gathers parameters through the blocking configuration step, then
    /// schedules the extraction. Intentionally not exclusive: different
    /// zones of one clip cut concurrently.
    pub fn start(
        manager: &Arc<TaskManager>,
        owner: TaskOwner,
        config: &dyn Configurator,
    ) {
        let ctx = manager.context();
        let Some(clip) = ctx.project.clip(owner.item_id) else {
            return;
        };
        if !clip.kind().is_av() {
            return;
        }
        let zone = match (owner.zone_in, owner.zone_out) {
            (Some(zone_in), Some(zone_out)) if zone_out > zone_in => (zone_in, zone_out),
            _ => {
                ctx.events.warn("Invalid zone to extract.", None);
                return;
            }
        };
        let Some(params) = config.configure_cut(&clip, zone) else {
            return;
        };
        Self::start_with_params(manager, owner, zone, params);
    }

    pub fn start_with_params(
        manager: &Arc<TaskManager>,
        owner: TaskOwner,
        zone: (Frame, Frame),
        params: CutParams,
    ) {
        let ctx = manager.context();
        let Some(clip) = ctx.project.clip(owner.item_id) else {
            return;
        };
        if params.destination == clip.url() {
            ctx.events
                .warn("You cannot overwrite the original clip.", None);
            return;
        }
        let lease = ctx.destinations.claim(params.destination.clone());
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Cut, "Extracting zone"),
            params,
            lease,
            zone,
        });
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for CutTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let source = clip.url();
        let destination = self.lease.path().to_path_buf();
        let fps = clip.producer().map(|p| p.fps).filter(|f| *f > 0.0).unwrap_or(25.0);
        let in_sec = self.zone.0 as f64 / fps;
        let duration_sec = (self.zone.1 - self.zone.0) as f64 / fps;

        let mut args: Vec<String> = vec![
            "-noaccurate_seek".into(),
            "-ss".into(),
            format!("{:.3}", in_sec),
            "-i".into(),
            source.to_string_lossy().to_string(),
            "-t".into(),
            format!("{:.3}", duration_sec),
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-sn".into(),
            "-dn".into(),
            "-map".into(),
            "0".into(),
        ];
        args.extend(self.params.encoding_args.iter().cloned());

        let request = EncodeRequest {
            source,
            destination: destination.clone(),
            args,
            duration_hint: Some(duration_sec).filter(|d| *d > 0.0),
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
                if destination.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&destination);
                    self.state.append_error("Failed to create file.");
                    return Err(TaskError::EmptyOutput(
                        destination.to_string_lossy().to_string(),
                    ));
                }
                if self.params.add_to_project {
                    let new_clip = ctx.project.create_clip(
                        destination,
                        clip.kind(),
                        clip.parent_folder(),
                    );
                    let project_apply = Arc::clone(&ctx.project);
                    let project_revert = Arc::clone(&ctx.project);
                    let insert = Arc::clone(&new_clip);
                    let new_id = new_clip.id();
                    self.state.stage_commit(
                        Box::new(move || {
                            project_apply.restore_clip(Arc::clone(&insert));
                            true
                        }),
                        Box::new(move || project_revert.remove_clip(new_id).is_some()),
                    );
                }
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&destination);
                if !matches!(err, TaskError::Canceled) {
                    self.state.append_error("Cut job failed.");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::Harness;
    use crate::undo::shared_undo_stack;
    use crate::{KindFilter, TaskStatus};

    fn cut_params(harness: &Harness, name: &str) -> CutParams {
        CutParams {
            destination: harness.dir.path().join(name),
            encoding_args: vec!["-c:a".into(), "copy".into(), "-c:v".into(), "copy".into()],
            add_to_project: true,
        }
    }

    #[tokio::test]
    async fn test_cut_zone_produces_and_commits_clip() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        CutTask::start_with_params(
            &harness.manager,
            TaskOwner::zone(item, 25, 75),
            (25, 75),
            cut_params(&harness, "a-1-3.mp4"),
        );
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;
        assert_eq!(tasks[0].state().status(), TaskStatus::Succeeded);

        // Zone mapped to seconds at 25 fps
        let calls = harness.engine.encode_calls.lock().unwrap().clone();
        let args = calls[0].args.join(" ");
        assert!(args.contains("-ss 1.000"));
        assert!(args.contains("-t 2.000"));

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));
        assert_eq!(harness.project.clip_count(), 2);
        assert!(undo.lock().unwrap().undo());
        assert_eq!(harness.project.clip_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cuts_on_same_clip_are_allowed() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        CutTask::start_with_params(
            &harness.manager,
            TaskOwner::zone(item, 0, 25),
            (0, 25),
            cut_params(&harness, "a-head.mp4"),
        );
        CutTask::start_with_params(
            &harness.manager,
            TaskOwner::zone(item, 50, 100),
            (50, 100),
            cut_params(&harness, "a-tail.mp4"),
        );
        let tasks = harness.manager.tasks_for_clip(item);
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            task.state().wait_done().await;
            assert_eq!(task.state().status(), TaskStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn test_invalid_zone_does_not_schedule() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");
        let config = crate::tasks::FixedConfigurator {
            cut: Some(cut_params(&harness, "x.mp4")),
            ..Default::default()
        };

        CutTask::start(&harness.manager, TaskOwner::clip(item), &config);
        assert!(!harness.manager.has_pending_task(item, KindFilter::Any));
    }

    #[tokio::test]
    async fn test_configurator_cancellation_does_not_schedule() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");
        let config = crate::tasks::FixedConfigurator::default();

        CutTask::start(&harness.manager, TaskOwner::zone(item, 0, 50), &config);
        assert!(!harness.manager.has_pending_task(item, KindFilter::Any));
    }
}
