//! Legacy filter job: renders a clip with a named filter attached into
//! a sidecar playlist. Typically fanned out over a selection as one
//! batch with a single undo label.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ClipJob, JobState, UndoAccumulator};
use crate::pipeline::RenderRequest;
use crate::project::{ClipKind, SharedProject};
use crate::tasks::{DestinationLease, TaskContext};
use crate::ClipId;

pub struct FilterClipJob {
    state: JobState,
    clip_id: ClipId,
    filter: String,
    filter_params: Vec<(String, String)>,
    lease: DestinationLease,
    project: SharedProject,
}

impl FilterClipJob {
    /// Builds the per-clip factory handed to
    /// [`crate::jobs::JobScheduler::start_job`]. Destinations are
    /// derived next to each source file and de-duplicated against other
    /// pending outputs.
    pub fn prepare(
        ctx: &Arc<TaskContext>,
        filter: &str,
        filter_params: Vec<(String, String)>,
    ) -> impl Fn(ClipId) -> Arc<dyn ClipJob> {
        let ctx = Arc::clone(ctx);
        let filter = filter.to_string();
        move |clip_id| {
            let destination = match ctx.project.clip(clip_id) {
                Some(clip) => {
                    let url = clip.url();
                    let stem = url
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| format!("clip-{clip_id}"));
                    url.parent()
                        .unwrap_or_else(|| std::path::Path::new(""))
                        .join(format!("{}-{}.mlt", stem, filter))
                }
                None => std::env::temp_dir().join(format!("clip-{clip_id}-{filter}.mlt")),
            };
            Arc::new(FilterClipJob {
                state: JobState::new(),
                clip_id,
                filter: filter.clone(),
                filter_params: filter_params.clone(),
                lease: ctx.destinations.claim(destination),
                project: Arc::clone(&ctx.project),
            }) as Arc<dyn ClipJob>
        }
    }

    pub fn destination(&self) -> &std::path::Path {
        self.lease.path()
    }
}

#[async_trait]
impl ClipJob for FilterClipJob {
    fn job_state(&self) -> &JobState {
        &self.state
    }

    fn clip_id(&self) -> ClipId {
        self.clip_id
    }

    fn description(&self) -> String {
        format!("Apply {} filter", self.filter)
    }

    async fn run(&self, ctx: &TaskContext) -> bool {
        if self.state.is_canceled() {
            self.state.finish(false);
            return false;
        }
        let Some(clip) = ctx.project.clip(self.clip_id) else {
            // Clip deleted while queued; unwind without a message
            self.state.finish(false);
            return false;
        };
        let destination = self.lease.path().to_path_buf();

        let filter_args: Vec<String> = self
            .filter_params
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        let request = RenderRequest {
            producer: clip.url().to_string_lossy().to_string(),
            producer_args: vec![],
            filter: Some((self.filter.clone(), filter_args)),
            consumer: format!("xml:{}", destination.to_string_lossy()),
            consumer_args: vec!["all=1".into()],
        };
        let events = ctx.events.clone();
        let clip_id = self.clip_id;
        let result = ctx
            .engine
            .run_render(&request, self.state.cancel_token(), &|pct| {
                self.state.report_progress(clip_id, pct, &events);
            })
            .await;

        let ok = match result {
            Ok(()) => {
                if destination.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&destination);
                    self.state.append_error("Filter produced no output.");
                    false
                } else {
                    self.state.report_progress(clip_id, 100, &events);
                    true
                }
            }
            Err(err) => {
                let _ = std::fs::remove_file(&destination);
                if let Some(log) = err.log_details() {
                    self.state.append_log(log);
                }
                if !err.is_silent() {
                    self.state.append_error(&format!("Failed to apply filter: {}", err));
                }
                false
            }
        };
        self.state.finish(ok);
        ok
    }

    fn commit_result(&self, accum: &mut UndoAccumulator) -> bool {
        if !self.state.begin_commit() {
            return false;
        }
        let Some(source) = self.project.clip(self.clip_id) else {
            return false;
        };
        let new_clip = self.project.create_clip(
            self.lease.path().to_path_buf(),
            ClipKind::Playlist,
            source.parent_folder(),
        );
        let new_id = new_clip.id();
        self.project.restore_clip(Arc::clone(&new_clip));

        let project_apply = Arc::clone(&self.project);
        let project_revert = Arc::clone(&self.project);
        accum.push(
            Box::new(move || {
                project_apply.restore_clip(Arc::clone(&new_clip));
                true
            }),
            Box::new(move || project_revert.remove_clip(new_id).is_some()),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobScheduler;
    use crate::tasks::testutil::Harness;
    use crate::undo::shared_undo_stack;
    use crate::NO_PARENT_BATCH;

    #[tokio::test]
    async fn test_filter_batch_inserts_clips_under_one_undo_entry() {
        let harness = Harness::new();
        let a = harness.add_clip("a.mp4");
        let b = harness.add_clip("b.mp4");
        let undo = shared_undo_stack();
        let scheduler =
            JobScheduler::new(Arc::clone(harness.manager.context()), Arc::clone(&undo));

        let factory = FilterClipJob::prepare(
            harness.manager.context(),
            "greyscale",
            vec![("start".into(), "0".into())],
        );
        let id = scheduler.start_job(
            &[a, b],
            NO_PARENT_BATCH,
            Some("Apply greyscale".into()),
            factory,
        );
        let batch = scheduler.batch(id).unwrap();
        batch.wait_done().await;
        assert!(batch.succeeded());

        // One render per clip, filter attached
        let calls = harness.engine.render_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.filter.as_ref().unwrap().0 == "greyscale"));

        // Both result clips inserted, one undo entry for the batch
        assert_eq!(harness.project.clip_count(), 4);
        {
            let stack = undo.lock().unwrap();
            assert_eq!(stack.undo_count(), 1);
            assert_eq!(stack.last_label(), Some("Apply greyscale"));
        }

        // Undo removes both inserted clips
        assert!(undo.lock().unwrap().undo());
        assert_eq!(harness.project.clip_count(), 2);
        assert!(undo.lock().unwrap().redo());
        assert_eq!(harness.project.clip_count(), 4);
    }

    #[tokio::test]
    async fn test_filter_job_on_deleted_clip_fails_batch() {
        let harness = Harness::new();
        let a = harness.add_clip("a.mp4");
        let undo = shared_undo_stack();
        let scheduler =
            JobScheduler::new(Arc::clone(harness.manager.context()), Arc::clone(&undo));

        let factory = FilterClipJob::prepare(harness.manager.context(), "greyscale", vec![]);
        harness.project.remove_clip(a);
        let id = scheduler.start_job(&[a], NO_PARENT_BATCH, Some("Apply".into()), factory);
        let batch = scheduler.batch(id).unwrap();
        batch.wait_done().await;

        assert!(!batch.succeeded());
        assert!(!undo.lock().unwrap().can_undo());
    }
}
