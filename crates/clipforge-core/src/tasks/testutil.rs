//! Shared fixtures for task and scheduler tests.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Semaphore;

use crate::events::{EngineEvent, EventSink};
use crate::pipeline::fake::FakeEngine;
use crate::project::{ClipKind, ProjectModel, SharedProject};
use crate::settings::EngineSettings;
use crate::tasks::{
    CacheDirs, ClipTask, DestinationRegistry, TaskContext, TaskManager, TaskState,
};
use crate::{ClipId, TaskError, TaskKind, TaskOwner, TaskResult, ROOT_FOLDER};

/// How a scripted test task behaves when executed
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    SucceedAfter(Duration),
    Crash,
    BlockUntilCanceled,
    /// Waits for a permit before succeeding; lets tests hold a worker busy
    WaitPermit(Arc<Semaphore>),
}

/// Minimal task whose body follows a script; used to exercise the
/// manager and pools without media tools.
pub struct ScriptedTask {
    state: TaskState,
    behavior: Behavior,
    label: String,
    run_log: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedTask {
    pub fn new(owner: TaskOwner, kind: TaskKind, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            state: TaskState::new(owner, kind, "scripted task"),
            behavior,
            label: String::new(),
            run_log: None,
        })
    }

    pub fn labeled(
        owner: TaskOwner,
        kind: TaskKind,
        behavior: Behavior,
        label: &str,
        run_log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: TaskState::new(owner, kind, "scripted task"),
            behavior,
            label: label.to_string(),
            run_log: Some(run_log),
        })
    }
}

#[async_trait]
impl ClipTask for ScriptedTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn execute(&self, ctx: &TaskContext) -> TaskResult<()> {
        if let Some(log) = &self.run_log {
            log.lock().unwrap().push(self.label.clone());
        }
        match &self.behavior {
            Behavior::Succeed => {
                self.state.report_progress(100, &ctx.events);
                Ok(())
            }
            Behavior::SucceedAfter(duration) => {
                let steps = 4u32;
                for step in 1..=steps {
                    if self.state.is_canceled() {
                        return Err(TaskError::Canceled);
                    }
                    tokio::time::sleep(*duration / steps).await;
                    self.state
                        .report_progress((step * 100 / steps) as i32, &ctx.events);
                }
                Ok(())
            }
            Behavior::Crash => Err(TaskError::ExternalToolCrashed {
                message: "scripted crash".into(),
                log: "crash log".into(),
            }),
            Behavior::BlockUntilCanceled => {
                self.state.cancel_token().cancelled().await;
                Err(TaskError::Canceled)
            }
            Behavior::WaitPermit(gate) => {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TaskError::Internal("gate closed".into()))?;
                permit.forget();
                Ok(())
            }
        }
    }
}

/// Engine harness around a fake pipeline and a scratch project.
pub struct Harness {
    pub manager: Arc<TaskManager>,
    pub project: SharedProject,
    pub engine: Arc<FakeEngine>,
    pub events: UnboundedReceiver<EngineEvent>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_engine(FakeEngine::new())
    }

    pub fn with_engine(engine: FakeEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine);
        let project: SharedProject = Arc::new(ProjectModel::new());
        let (events_tx, events_rx) = EventSink::channel();
        let cache = CacheDirs::new(dir.path().join("cache"));
        cache.ensure().unwrap();

        let mut settings = EngineSettings::default();
        settings.cache_root = dir.path().join("cache");

        let context = TaskContext {
            project: Arc::clone(&project),
            engine: Arc::clone(&engine) as Arc<dyn crate::pipeline::PipelineEngine>,
            events: events_tx,
            destinations: DestinationRegistry::new(),
            cache,
            settings: Arc::new(RwLock::new(settings)),
        };
        let manager = TaskManager::new(context);
        Self {
            manager,
            project,
            engine,
            events: events_rx,
            dir,
        }
    }

    /// Adds a source clip file on disk and in the project
    pub fn add_clip(&self, name: &str) -> ClipId {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"source-bytes").unwrap();
        let clip = self
            .project
            .add_clip(path, ClipKind::AudioVideo, ROOT_FOLDER);
        clip.set_producer(crate::project::ProducerHandle {
            length: 100,
            fps: 25.0,
            audio_streams: vec![crate::project::AudioStream {
                index: 0,
                channels: 2,
                sample_rate: 48000,
            }],
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
        });
        clip.id()
    }

    /// Drains currently queued events
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = vec![];
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}
