//! ClipForge CLI — headless clip job execution.
//!
//! Drives the job engine against files on disk: probe media, generate
//! thumbnails, audio levels and proxies, extract zones. Results land in
//! the cache directory or next to the sources; progress is printed as
//! it is reported by the engine.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clipforge_core::events::{EngineEvent, EventSink, Severity};
use clipforge_core::pipeline::{ExternalEngine, PipelineEngine};
use clipforge_core::project::{props, ClipKind, ProjectModel};
use clipforge_core::settings::EngineSettings;
use clipforge_core::tasks::{
    AudioLevelsTask, CacheDirs, CutParams, CutTask, DestinationRegistry, ProxyTask, TaskContext,
    TaskManager, ThumbnailTask, TranscodeParams, TranscodeTask,
};
use clipforge_core::undo::shared_undo_stack;
use clipforge_core::{TaskOwner, DEFAULT_FRAME, ROOT_FOLDER};

#[derive(Parser)]
#[command(name = "clipforge-cli", about = "Headless clip job execution", version)]
struct Cli {
    /// Settings file; defaults to the per-user location
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print media information for a file as JSON
    Probe { file: PathBuf },
    /// Generate a poster thumbnail
    Thumbnail {
        file: PathBuf,
        /// Frame to capture; omitted means the default frame
        #[arg(long)]
        frame: Option<i64>,
    },
    /// Generate audio level data
    AudioLevels { file: PathBuf },
    /// Generate a proxy file
    Proxy {
        file: PathBuf,
        /// Re-encode even when a proxy already exists
        #[arg(long)]
        force: bool,
    },
    /// Transcode to a new file
    Transcode {
        file: PathBuf,
        /// Output path
        #[arg(long)]
        dest: PathBuf,
        /// Encoder arguments, e.g. "-c:v libx264 -crf 20 -c:a aac"
        #[arg(long, default_value = "-c:v libx264 -crf 23 -c:a aac")]
        args: String,
    },
    /// Extract a zone into a standalone file
    Cut {
        file: PathBuf,
        /// Zone in point (frames)
        #[arg(long)]
        from: i64,
        /// Zone out point (frames)
        #[arg(long)]
        to: i64,
        /// Output path
        #[arg(long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(EngineSettings::default_path);
    let settings = EngineSettings::load(&settings_path);

    let engine = Arc::new(ExternalEngine::new(settings.tools.clone()));

    if let Command::Probe { file } = &cli.command {
        let info = engine.probe(file).await.context("probe failed")?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let cache = CacheDirs::new(settings.cache_root.clone());
    cache.ensure().context("failed to create cache directories")?;

    let project = Arc::new(ProjectModel::new());
    let (events, mut events_rx) = EventSink::channel();
    let context = TaskContext {
        project: Arc::clone(&project),
        engine: engine.clone() as Arc<dyn PipelineEngine>,
        events,
        destinations: DestinationRegistry::new(),
        cache,
        settings: Arc::new(RwLock::new(settings)),
    };
    let manager = TaskManager::new(context);
    let undo = shared_undo_stack();

    // Import the source file and wait for its metadata before queueing
    // the requested job
    let file = match &cli.command {
        Command::Thumbnail { file, .. }
        | Command::AudioLevels { file }
        | Command::Proxy { file, .. }
        | Command::Transcode { file, .. }
        | Command::Cut { file, .. } => file.clone(),
        Command::Probe { .. } => unreachable!(),
    };
    if !file.is_file() {
        bail!("no such file: {}", file.display());
    }
    let clip = project.add_clip(file.clone(), ClipKind::AudioVideo, ROOT_FOLDER);
    let info = engine.probe(&file).await.context("probe failed")?;
    let fps = info.video.as_ref().map(|v| v.fps).unwrap_or(25.0);
    clip.set_producer(clipforge_core::project::ProducerHandle {
        length: info.duration_frames(),
        fps,
        audio_streams: info
            .audio_streams
            .iter()
            .map(|s| clipforge_core::project::AudioStream {
                index: s.index,
                channels: s.channels,
                sample_rate: s.sample_rate,
            })
            .collect(),
        video_codec: info.video.as_ref().map(|v| v.codec.clone()),
        audio_codec: info.audio_streams.first().map(|s| s.codec.clone()),
    });
    let owner = TaskOwner::clip(clip.id());

    match &cli.command {
        Command::Probe { .. } => unreachable!(),
        Command::Thumbnail { frame, .. } => {
            ThumbnailTask::start(&manager, owner, frame.unwrap_or(DEFAULT_FRAME), true);
        }
        Command::AudioLevels { .. } => {
            AudioLevelsTask::start(&manager, owner, true);
        }
        Command::Proxy { force, .. } => {
            let dest = manager
                .context()
                .cache
                .proxy_path(clip.content_hash(), "mp4");
            clip.set_property(props::PROXY, dest.to_string_lossy());
            ProxyTask::start(&manager, owner, *force);
        }
        Command::Transcode { dest, args, .. } => {
            TranscodeTask::start_with_params(
                &manager,
                owner,
                TranscodeParams {
                    destination: dest.clone(),
                    encode_args: args.split_whitespace().map(str::to_string).collect(),
                    replace_source: false,
                },
            );
        }
        Command::Cut { from, to, dest, .. } => {
            CutTask::start_with_params(
                &manager,
                TaskOwner::zone(clip.id(), *from, *to),
                (*from, *to),
                CutParams {
                    destination: dest.clone(),
                    encoding_args: vec![
                        "-c:v".into(),
                        "copy".into(),
                        "-c:a".into(),
                        "copy".into(),
                    ],
                    add_to_project: false,
                },
            );
        }
    }

    if !manager.has_pending_task(clip.id(), clipforge_core::KindFilter::Any) {
        bail!("job was not scheduled; see messages above");
    }
    tracing::info!("Job queued for {}", file.display());

    // Consume engine events until the queue drains; the commit step
    // runs here, on the thread that receives the finish notification
    let mut failed = false;
    while let Some(event) = events_rx.recv().await {
        match event {
            EngineEvent::TaskProgress { progress, .. } => {
                eprint!("\r{:3}%", progress);
            }
            EngineEvent::Message {
                severity, text, log, ..
            } => {
                let tag = match severity {
                    Severity::Info => "info",
                    Severity::Warning => "warning",
                    Severity::Error => "error",
                };
                eprintln!("\n{tag}: {text}");
                if let Some(log) = log {
                    eprintln!("{log}");
                }
                if severity != Severity::Info {
                    failed = true;
                }
            }
            EngineEvent::TaskDone { task } => {
                let ok = task.state().commit_result(&undo);
                eprintln!();
                if ok {
                    report_result(&project, &clip.id());
                } else {
                    failed = true;
                }
                // One job per invocation; the queue is drained
                break;
            }
            _ => {}
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn report_result(project: &Arc<ProjectModel>, source_id: &i64) {
    let Some(clip) = project.clip(*source_id) else {
        return;
    };
    if let Some(thumb) = clip.property(props::THUMBNAIL) {
        println!("thumbnail: {thumb}");
    }
    if let Some(proxy) = clip.property(props::PROXY) {
        if proxy != props::PROXY_NONE {
            println!("proxy: {proxy}");
        }
    }
}
