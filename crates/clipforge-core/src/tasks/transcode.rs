//! Transcode task: re-encodes a clip to a new file through the external
//! encoder. On commit the result is either inserted as a new bin clip
//! or swapped in as the clip's resource, undoably.

use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::EncodeRequest;
use crate::tasks::{
    ClipTask, Configurator, DestinationLease, TaskContext, TaskManager, TaskState,
};
use crate::{TaskError, TaskKind, TaskOwner, TaskResult};

/// Validated parameters for one transcode run
#[derive(Clone, Debug)]
pub struct TranscodeParams {
    /// Desired output path; de-duplicated against other pending outputs
    pub destination: std::path::PathBuf,
    /// Encoder arguments between input and output
    pub encode_args: Vec<String>,
    /// Swap the clip's resource to the result instead of adding a new
    /// clip
    pub replace_source: bool,
}

pub struct TranscodeTask {
    state: TaskState,
    params: TranscodeParams,
    lease: DestinationLease,
}

impl TranscodeTask {
    /// Gathers parameters through the blocking configuration step, then
    /// schedules the transcode. Concurrent transcodes of one clip are
    /// allowed as long as their destinations differ.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, config: &dyn Configurator) {
        let ctx = manager.context();
        let Some(clip) = ctx.project.clip(owner.item_id) else {
            return;
        };
        if !clip.kind().is_av() {
            ctx.events
                .warn("Cannot transcode this clip type.", None);
            return;
        }
        let Some(params) = config.configure_transcode(&clip) else {
            return;
        };
        Self::start_with_params(manager, owner, params);
    }

    /// Schedules a transcode with pre-validated parameters.
    pub fn start_with_params(
        manager: &Arc<TaskManager>,
        owner: TaskOwner,
        params: TranscodeParams,
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
            state: TaskState::new(owner, TaskKind::Transcode, "Transcoding clip"),
            params,
            lease,
        });
        manager.start_task(task);
    }

    /// Destination actually claimed for this run
    pub fn destination(&self) -> &std::path::Path {
        self.lease.path()
    }
}

#[async_trait]
impl ClipTask for TranscodeTask {
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

        let mut args: Vec<String> = vec!["-i".into(), source.to_string_lossy().to_string()];
        args.extend(self.params.encode_args.iter().cloned());

        let request = EncodeRequest {
            source: source.clone(),
            destination: destination.clone(),
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
                if destination.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&destination);
                    self.state.append_error("Failed to transcode clip.");
                    return Err(TaskError::EmptyOutput(
                        destination.to_string_lossy().to_string(),
                    ));
                }
                if self.params.replace_source {
                    let apply_clip = Arc::clone(&clip);
                    let revert_clip = Arc::clone(&clip);
                    let old_url = source;
                    let new_url = destination;
                    self.state.stage_commit(
                        Box::new(move || {
                            apply_clip.set_url(new_url.clone());
                            true
                        }),
                        Box::new(move || {
                            revert_clip.set_url(old_url.clone());
                            true
                        }),
                    );
                } else {
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
                    self.state.append_error("Failed to transcode clip.");
                }
                Err(err)
            }
        }
    }
}
