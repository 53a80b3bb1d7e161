//! Speed task: renders a time-warped variant of a clip through the host
//! renderer and inserts the result into a "Speed Change" folder on
//! commit.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::RenderRequest;
use crate::project::ClipKind;
use crate::tasks::{
    ClipTask, Configurator, DestinationLease, TaskContext, TaskManager, TaskState,
};
use crate::{Frame, TaskError, TaskKind, TaskOwner, TaskResult};

/// Folder new speed clips land in
const SPEED_FOLDER: &str = "Speed Change";

/// Validated parameters for a speed change
#[derive(Clone, Debug)]
pub struct SpeedParams {
    /// New speed as a percentage (100 = unchanged, 50 = half speed)
    pub percent: f64,
    /// Compensate audio pitch
    pub pitch_compensation: bool,
    /// Output playlist file; for multi-clip batches a directory the
    /// per-clip names are derived under
    pub destination: PathBuf,
    /// Place the result in the speed folder instead of the clip's own
    pub add_to_folder: bool,
}

pub struct SpeedTask {
    state: TaskState,
    speed: f64,
    pitch_compensation: bool,
    add_to_folder: bool,
    lease: DestinationLease,
    zone: Option<(Frame, Frame)>,
}

impl SpeedTask {
    /// Runs the blocking configuration step once for the whole
    /// selection, then schedules one task per clip. Zones on the owner
    /// are rescaled by the chosen speed.
    pub fn start(manager: &Arc<TaskManager>, owners: &[TaskOwner], config: &dyn Configurator) {
        let ctx = manager.context();
        let Some(first) = owners.first() else {
            return;
        };
        let Some(first_clip) = ctx.project.clip(first.item_id) else {
            return;
        };
        let Some(params) = config.configure_speed(&first_clip) else {
            return;
        };
        let multi = owners.len() > 1;
        for owner in owners {
            let Some(clip) = ctx.project.clip(owner.item_id) else {
                continue;
            };
            let destination = if multi {
                let stem = clip
                    .url()
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| format!("clip-{}", owner.item_id));
                params
                    .destination
                    .join(format!("{}-{}.mlt", stem, params.percent as i64))
            } else {
                params.destination.clone()
            };
            Self::start_one(
                manager,
                *owner,
                SpeedParams {
                    destination,
                    ..params.clone()
                },
            );
        }
    }

    /// Schedules one speed change with pre-validated parameters.
    pub fn start_one(manager: &Arc<TaskManager>, owner: TaskOwner, params: SpeedParams) {
        let ctx = manager.context();
        if params.percent == 0.0 {
            ctx.events.warn("Invalid speed value.", None);
            return;
        }
        let speed = params.percent / 100.0;
        let zone = match (owner.zone_in, owner.zone_out) {
            (Some(zone_in), Some(zone_out)) => Some((
                (zone_in as f64 / speed).round() as Frame,
                (zone_out as f64 / speed).round() as Frame,
            )),
            _ => None,
        };
        let lease = ctx.destinations.claim(params.destination.clone());
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Speed, "Changing clip speed"),
            speed,
            pitch_compensation: params.pitch_compensation,
            add_to_folder: params.add_to_folder,
            lease,
            zone,
        });
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for SpeedTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let url = clip.url();
        if url.as_os_str().is_empty() {
            self.state.append_error("No producer for this clip.");
            return Err(TaskError::InvalidParameters("clip has no source url".into()));
        }
        let destination = self.lease.path().to_path_buf();

        let mut producer_args = Vec::new();
        if let Some((zone_in, zone_out)) = self.zone {
            producer_args.push(format!("in={}", zone_in));
            producer_args.push(format!("out={}", zone_out));
        }
        if self.pitch_compensation {
            producer_args.push("warp_pitch=1".into());
        }
        let request = RenderRequest {
            producer: format!("timewarp:{}:{}", self.speed, url.to_string_lossy()),
            producer_args,
            filter: None,
            consumer: format!("xml:{}", destination.to_string_lossy()),
            consumer_args: vec!["all=1".into()],
        };
        let events = ctx.events.clone();
        let result = ctx
            .engine
            .run_render(&request, self.state.cancel_token(), &|pct| {
                self.state.report_progress(pct, &events);
            })
            .await;

        match result {
            Ok(()) => {
                if destination.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&destination);
                    self.state.append_error("Failed to change clip speed.");
                    return Err(TaskError::EmptyOutput(
                        destination.to_string_lossy().to_string(),
                    ));
                }
                let parent = clip.parent_folder();
                let add_to_folder = self.add_to_folder;
                let new_clip =
                    ctx.project
                        .create_clip(destination, ClipKind::Playlist, parent);
                let project_apply = Arc::clone(&ctx.project);
                let project_revert = Arc::clone(&ctx.project);
                let insert = Arc::clone(&new_clip);
                let new_id = new_clip.id();
                self.state.stage_commit(
                    Box::new(move || {
                        if add_to_folder {
                            // Find-or-create keeps replays idempotent:
                            // the folder persists across an undo
                            let (folder, _) =
                                project_apply.find_or_create_folder(SPEED_FOLDER, parent);
                            insert.set_parent_folder(folder);
                        }
                        project_apply.restore_clip(Arc::clone(&insert));
                        true
                    }),
                    Box::new(move || project_revert.remove_clip(new_id).is_some()),
                );
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&destination);
                if !matches!(err, TaskError::Canceled) {
                    self.state.append_error("Failed to change clip speed.");
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
    use crate::tasks::FixedConfigurator;
    use crate::undo::shared_undo_stack;
    use crate::{TaskStatus, ROOT_FOLDER};

    fn speed_params(harness: &Harness, dest: &str) -> SpeedParams {
        SpeedParams {
            percent: 50.0,
            pitch_compensation: true,
            destination: harness.dir.path().join(dest),
            add_to_folder: true,
        }
    }

    #[tokio::test]
    async fn test_speed_render_uses_timewarp_producer() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        SpeedTask::start_one(
            &harness.manager,
            TaskOwner::clip(item),
            speed_params(&harness, "a.mlt"),
        );
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;
        assert_eq!(tasks[0].state().status(), TaskStatus::Succeeded);

        let calls = harness.engine.render_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].producer.starts_with("timewarp:0.5:"));
        assert!(calls[0].producer_args.contains(&"warp_pitch=1".to_string()));
    }

    #[tokio::test]
    async fn test_zone_is_rescaled_by_speed() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        SpeedTask::start_one(
            &harness.manager,
            TaskOwner::zone(item, 10, 50),
            speed_params(&harness, "a.mlt"),
        );
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;

        let calls = harness.engine.render_calls.lock().unwrap().clone();
        assert!(calls[0].producer_args.contains(&"in=20".to_string()));
        assert!(calls[0].producer_args.contains(&"out=100".to_string()));
    }

    #[tokio::test]
    async fn test_commit_places_clip_in_speed_folder() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        SpeedTask::start_one(
            &harness.manager,
            TaskOwner::clip(item),
            speed_params(&harness, "a.mlt"),
        );
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));

        let folder = harness
            .project
            .find_folder(SPEED_FOLDER, ROOT_FOLDER)
            .expect("speed folder created on commit");
        let inserted = harness
            .project
            .clips_by_url(&harness.dir.path().join("a.mlt"));
        assert_eq!(inserted.len(), 1);
        let new_clip = harness.project.clip(inserted[0]).unwrap();
        assert_eq!(new_clip.parent_folder(), folder);

        // Undo removes the clip; redo reinserts the same one
        assert!(undo.lock().unwrap().undo());
        assert!(harness.project.clip(inserted[0]).is_none());
        assert!(undo.lock().unwrap().redo());
        assert!(harness.project.clip(inserted[0]).is_some());
    }

    #[tokio::test]
    async fn test_batch_start_configures_once_and_fans_out() {
        let harness = Harness::new();
        let a = harness.add_clip("a.mp4");
        let b = harness.add_clip("b.mp4");
        let config = FixedConfigurator {
            speed: Some(SpeedParams {
                percent: 200.0,
                pitch_compensation: false,
                destination: harness.dir.path().to_path_buf(),
                add_to_folder: false,
            }),
            ..Default::default()
        };

        SpeedTask::start(
            &harness.manager,
            &[TaskOwner::clip(a), TaskOwner::clip(b)],
            &config,
        );
        let task_a = harness.manager.tasks_for_clip(a);
        let task_b = harness.manager.tasks_for_clip(b);
        assert_eq!(task_a.len(), 1);
        assert_eq!(task_b.len(), 1);
        task_a[0].state().wait_done().await;
        task_b[0].state().wait_done().await;

        let calls = harness.engine.render_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].consumer, calls[1].consumer);
    }
}
