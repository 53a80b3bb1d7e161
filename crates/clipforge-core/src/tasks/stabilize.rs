//! Stabilize task: runs the video stabilization filter through the host
//! renderer, producing a playlist plus a transform sidecar file, and
//! inserts the stabilized clip on commit.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::RenderRequest;
use crate::project::{props, ClipKind};
use crate::tasks::{
    ClipTask, Configurator, DestinationLease, TaskContext, TaskManager, TaskState,
};
use crate::{Frame, TaskError, TaskKind, TaskOwner, TaskResult};

/// Validated parameters for one stabilization run
#[derive(Clone, Debug)]
pub struct StabilizeParams {
    /// Output playlist file; for multi-clip batches a directory
    pub destination: std::path::PathBuf,
    /// Filter parameters (shakiness, accuracy, smoothing, ...)
    pub filter_params: Vec<(String, String)>,
}

pub struct StabilizeTask {
    state: TaskState,
    filter_params: Vec<(String, String)>,
    lease: DestinationLease,
    trf_lease: DestinationLease,
    zone: Option<(Frame, Frame)>,
}

impl StabilizeTask {
    /// Runs the blocking configuration step once for the selection and
    /// schedules one task per clip.
    pub fn start(manager: &Arc<TaskManager>, owners: &[TaskOwner], config: &dyn Configurator) {
        let ctx = manager.context();
        let Some(first) = owners.first() else {
            return;
        };
        let Some(first_clip) = ctx.project.clip(first.item_id) else {
            return;
        };
        let Some(params) = config.configure_stabilize(&first_clip) else {
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
                params.destination.join(format!("{}-stab.mlt", stem))
            } else {
                params.destination.clone()
            };
            Self::start_one(
                manager,
                *owner,
                StabilizeParams {
                    destination,
                    filter_params: params.filter_params.clone(),
                },
            );
        }
    }

    pub fn start_one(manager: &Arc<TaskManager>, owner: TaskOwner, params: StabilizeParams) {
        let ctx = manager.context();
        let lease = ctx.destinations.claim(params.destination.clone());
        let trf_lease = ctx
            .destinations
            .claim(params.destination.with_extension("trf"));
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Stabilize, "Stabilizing clip"),
            filter_params: params.filter_params,
            lease,
            trf_lease,
            zone: owner.zone_in.zip(owner.zone_out),
        });
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for StabilizeTask {
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
        let trf_path = self.trf_lease.path().to_path_buf();

        let mut producer_args = Vec::new();
        if let Some((zone_in, zone_out)) = self.zone {
            producer_args.push(format!("in={}", zone_in));
            producer_args.push(format!("out={}", zone_out));
        }
        let mut filter_args: Vec<String> = self
            .filter_params
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        filter_args.push(format!("filename={}", trf_path.to_string_lossy()));

        let request = RenderRequest {
            producer: url.to_string_lossy().to_string(),
            producer_args,
            filter: Some(("vidstab".into(), filter_args)),
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
                    let _ = std::fs::remove_file(&trf_path);
                    self.state.append_error("Failed to stabilize.");
                    return Err(TaskError::EmptyOutput(
                        destination.to_string_lossy().to_string(),
                    ));
                }
                let new_clip = ctx.project.create_clip(
                    destination,
                    ClipKind::Playlist,
                    clip.parent_folder(),
                );
                new_clip.set_property(props::STABILIZATION_DATA, trf_path.to_string_lossy());
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
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&destination);
                let _ = std::fs::remove_file(&trf_path);
                if !matches!(err, TaskError::Canceled) {
                    self.state.append_error("Failed to stabilize.");
                }
                Err(err)
            }
        }
    }
}
