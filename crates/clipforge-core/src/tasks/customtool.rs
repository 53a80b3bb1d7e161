//! Custom tool task: runs a user-configured external program against a
//! clip. The argument list uses `{source}` and `{output}` placeholders;
//! the tool is expected to follow the encoder family's `time=` progress
//! convention if it reports progress at all.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::pipeline::ExternalEngine;
use crate::tasks::{ClipTask, DestinationLease, TaskContext, TaskManager, TaskState};
use crate::{TaskError, TaskKind, TaskOwner, TaskResult};

/// Parameters for a custom external-tool job
#[derive(Clone, Debug)]
pub struct CustomParams {
    /// Program to run
    pub binary: PathBuf,
    /// Arguments; `{source}` and `{output}` are substituted
    pub arguments: Vec<String>,
    /// Artifact the tool writes
    pub output: PathBuf,
    /// Insert the artifact into the project on commit
    pub add_to_project: bool,
}

pub struct CustomTask {
    state: TaskState,
    params: CustomParams,
    lease: DestinationLease,
}

impl CustomTask {
    /// Schedules a custom tool run. A missing binary is reported
    /// immediately and nothing is scheduled.
    pub fn start(manager: &Arc<TaskManager>, owner: TaskOwner, params: CustomParams) {
        let ctx = manager.context();
        if ExternalEngine::ensure_tool(&params.binary).is_err() {
            ctx.events.warn(
                format!(
                    "Application {} not found, please update the job settings",
                    params.binary.display()
                ),
                None,
            );
            return;
        }
        let lease = ctx.destinations.claim(params.output.clone());
        let task = Arc::new(Self {
            state: TaskState::new(owner, TaskKind::Custom, "Processing clip"),
            params,
            lease,
        });
        manager.start_task(task);
    }
}

#[async_trait]
impl ClipTask for CustomTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        let item_id = self.state.owner().item_id;
        let Some(clip) = ctx.project.clip(item_id) else {
            return Err(TaskError::ResourceGone(item_id));
        };
        let source = clip.url();
        let output = self.lease.path().to_path_buf();

        let args: Vec<String> = self
            .params
            .arguments
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect();

        let events = ctx.events.clone();
        let result = ctx
            .engine
            .run_tool(
                &self.params.binary,
                &args,
                Some(output.as_path()),
                Some(clip.duration_seconds()).filter(|d| *d > 0.0),
                self.state.cancel_token(),
                &|pct| self.state.report_progress(pct, &events),
            )
            .await;

        match result {
            Ok(()) => {
                if output.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                    let _ = std::fs::remove_file(&output);
                    self.state.append_error("Job produced no output.");
                    return Err(TaskError::EmptyOutput(
                        output.to_string_lossy().to_string(),
                    ));
                }
                if self.params.add_to_project {
                    let new_clip =
                        ctx.project
                            .create_clip(output, clip.kind(), clip.parent_folder());
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
                let _ = std::fs::remove_file(&output);
                if !matches!(err, TaskError::Canceled) {
                    self.state.append_error("Job failed.");
                }
                Err(err)
            }
        }
    }
}

/// Splits a user-entered argument line the way a shell would split
/// unquoted words; the job settings UI stores one string.
pub fn split_argument_line(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testutil::Harness;
    use crate::undo::shared_undo_stack;
    use crate::{KindFilter, TaskStatus};

    fn tool_params(harness: &Harness) -> CustomParams {
        CustomParams {
            // An existing file stands in for the tool binary; the fake
            // engine never spawns it
            binary: harness.dir.path().join("a.mp4"),
            arguments: split_argument_line("-i {source} -codec copy {output}"),
            output: harness.dir.path().join("processed.mkv"),
            add_to_project: true,
        }
    }

    #[tokio::test]
    async fn test_custom_tool_runs_and_commits_output() {
        let harness = Harness::new();
        let item = harness.add_clip("a.mp4");

        CustomTask::start(&harness.manager, TaskOwner::clip(item), tool_params(&harness));
        let tasks = harness.manager.tasks_for_clip(item);
        tasks[0].state().wait_done().await;
        assert_eq!(tasks[0].state().status(), TaskStatus::Succeeded);

        let undo = shared_undo_stack();
        assert!(tasks[0].state().commit_result(&undo));
        assert_eq!(
            harness
                .project
                .clips_by_url(&harness.dir.path().join("processed.mkv"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_binary_reports_and_skips() {
        let mut harness = Harness::new();
        let item = harness.add_clip("a.mp4");
        let mut params = tool_params(&harness);
        params.binary = PathBuf::from("/nonexistent/tool");

        CustomTask::start(&harness.manager, TaskOwner::clip(item), params);
        assert!(!harness.manager.has_pending_task(item, KindFilter::Any));
        let warned = harness
            .drain_events()
            .into_iter()
            .any(|ev| matches!(ev, crate::events::EngineEvent::Message { .. }));
        assert!(warned);
    }

    #[test]
    fn test_split_argument_line() {
        assert_eq!(
            split_argument_line("-i {source} {output}"),
            vec!["-i", "{source}", "{output}"]
        );
        assert!(split_argument_line("  ").is_empty());
    }
}
