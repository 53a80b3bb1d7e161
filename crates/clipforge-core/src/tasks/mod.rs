//! Task System
//!
//! The canonical scheduling path: tasks are registered per owning clip
//! in the task manager, dispatched onto bounded priority pools, and
//! report progress through the engine event channel. Each concrete kind
//! lives in its own module and plugs in through the [`ClipTask`] trait.

mod manager;
mod task;

pub mod dest;
pub mod pool;

mod audiolevels;
mod customtool;
mod cut;
mod load;
mod proxy;
mod scenesplit;
mod speed;
mod stabilize;
mod thumbnail;
mod transcode;

pub use audiolevels::*;
pub use customtool::*;
pub use cut::*;
pub use dest::*;
pub use load::*;
pub use manager::*;
pub use pool::WorkerPool;
pub use proxy::*;
pub use scenesplit::*;
pub use speed::*;
pub use stabilize::*;
pub use task::*;
pub use thumbnail::*;
pub use transcode::*;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::{Arc, RwLock};

use crate::events::EventSink;
use crate::pipeline::PipelineEngine;
use crate::project::{BinClip, SharedProject};
use crate::settings::EngineSettings;

/// Process-scoped collaborators injected into every task.
///
/// Tasks never reach for hidden globals; tests instantiate isolated
/// contexts around fake engines and scratch directories.
pub struct TaskContext {
    /// The live project model
    pub project: SharedProject,
    /// Media-processing capability
    pub engine: Arc<dyn PipelineEngine>,
    /// Event channel to the single consumer
    pub events: EventSink,
    /// Claimed-but-unwritten output paths
    pub destinations: Arc<DestinationRegistry>,
    /// Derived artifact locations
    pub cache: CacheDirs,
    /// Engine settings (tool paths, encode parameters)
    pub settings: Arc<RwLock<EngineSettings>>,
}

impl TaskContext {
    pub fn settings(&self) -> EngineSettings {
        self.settings.read().unwrap().clone()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("cache", &self.cache)
            .finish()
    }
}

// =============================================================================
// Blocking configuration step
// =============================================================================

/// User-configuration surface invoked by a kind's `start` step.
///
/// The contract with the host UI: block the calling thread and return
/// either `None` (cancellation) or a validated parameter bag. Headless
/// callers use [`FixedConfigurator`] with canned values.
pub trait Configurator: Send + Sync {
    fn configure_cut(&self, clip: &BinClip, zone: (crate::Frame, crate::Frame))
        -> Option<CutParams>;
    fn configure_speed(&self, clip: &BinClip) -> Option<SpeedParams>;
    fn configure_stabilize(&self, clip: &BinClip) -> Option<StabilizeParams>;
    fn configure_scene_split(&self, clip: &BinClip) -> Option<SceneSplitParams>;
    fn configure_transcode(&self, clip: &BinClip) -> Option<TranscodeParams>;
}

/// Configurator that answers every request with pre-validated
/// parameters, or a cancellation when none were provided.
#[derive(Debug, Default)]
pub struct FixedConfigurator {
    pub cut: Option<CutParams>,
    pub speed: Option<SpeedParams>,
    pub stabilize: Option<StabilizeParams>,
    pub scene_split: Option<SceneSplitParams>,
    pub transcode: Option<TranscodeParams>,
}

impl Configurator for FixedConfigurator {
    fn configure_cut(
        &self,
        _clip: &BinClip,
        _zone: (crate::Frame, crate::Frame),
    ) -> Option<CutParams> {
        self.cut.clone()
    }

    fn configure_speed(&self, _clip: &BinClip) -> Option<SpeedParams> {
        self.speed.clone()
    }

    fn configure_stabilize(&self, _clip: &BinClip) -> Option<StabilizeParams> {
        self.stabilize.clone()
    }

    fn configure_scene_split(&self, _clip: &BinClip) -> Option<SceneSplitParams> {
        self.scene_split.clone()
    }

    fn configure_transcode(&self, _clip: &BinClip) -> Option<TranscodeParams> {
        self.transcode.clone()
    }
}
