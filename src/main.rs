use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lumen_core::asset::AssetId;
use lumen_core::codec;
use lumen_core::{BackendProvider, CpuBackend, EditSnapshot, EncodeFormat};
use lumen_gpu::GpuProvider;
use lumen_preview::{
    Backends, EditStore, PreviewConfig, PreviewEngine, PreviewView, Quality, RenderState,
    SourceStatus,
};
use lumen_thumbnails::{FsAssetStore, Outcome};

#[derive(Parser, Debug)]
#[command(name = "lumen", version, about = "Progressive edit-preview renderer")]
struct Cli {
    /// Preview config (TOML). Defaults to <config dir>/lumen/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Representation cache directory. Defaults to <cache dir>/lumen.
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Never try the GPU backend.
    #[arg(long, global = true, default_value_t = false)]
    cpu: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the full-quality preview of one image.
    Render(RenderArgs),
    /// Replay a slider drag against the engine and print render statistics.
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Source image (JPEG, PNG or TIFF).
    image: PathBuf,

    /// Edit snapshot JSON. Omitted fields keep their defaults.
    #[arg(long)]
    edits: Option<PathBuf>,

    /// Output path; `.png` writes PNG, anything else JPEG.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Source image (JPEG, PNG or TIFF).
    image: PathBuf,

    /// Number of slider events.
    #[arg(long, default_value_t = 20)]
    steps: u32,

    /// Milliseconds between events.
    #[arg(long, default_value_t = 16)]
    interval_ms: u64,

    /// Final exposure of the drag, in EV.
    #[arg(long, default_value_t = 1.5)]
    exposure: f32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    let cache_dir = match cli.cache {
        Some(dir) => dir,
        None => dirs::cache_dir()
            .context("no cache directory on this platform, pass --cache")?
            .join("lumen"),
    };
    let store = Arc::new(FsAssetStore::open(cache_dir)?);
    let gpu: Option<Arc<dyn BackendProvider>> = if cli.cpu {
        None
    } else {
        Some(Arc::new(GpuProvider::new(config.max_masks_gpu)))
    };

    match cli.cmd {
        Command::Render(args) => cmd_render(args, config, store, gpu).await,
        Command::Simulate(args) => cmd_simulate(args, config, store, gpu).await,
    }
}

fn load_config(path: Option<&Path>) -> PreviewConfig {
    match path {
        Some(path) => PreviewConfig::load(path),
        None => match dirs::config_dir() {
            Some(dir) => PreviewConfig::load(&dir.join("lumen").join("config.toml")),
            None => PreviewConfig::default(),
        },
    }
}

/// Add `image` to the store and generate its representations.
async fn import(store: &Arc<FsAssetStore>, image: &Path) -> anyhow::Result<AssetId> {
    let store = store.clone();
    let image = image.to_path_buf();
    tokio::task::spawn_blocking(move || -> anyhow::Result<AssetId> {
        let id = store.add(&image)?;
        let generated = store.process_pending();
        info!(asset = %id, generated, "imported {}", image.display());
        Ok(id)
    })
    .await
    .context("import task failed")?
}

/// A running engine plus the worker that serves its generation requests.
struct Session {
    engine: PreviewEngine,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Session {
    fn start(
        config: PreviewConfig,
        store: Arc<FsAssetStore>,
        edits: EditStore,
        gpu: Option<Arc<dyn BackendProvider>>,
    ) -> Self {
        let backends = Backends {
            cpu: Arc::new(CpuBackend::new()),
            gpu,
        };
        let engine = PreviewEngine::spawn(config, store.clone(), edits, backends);

        let events = engine.store_events();
        store.on_generated(move |id, kind, outcome| match outcome {
            Outcome::Ready => events.ready(id, kind),
            Outcome::Failed(reason) => events.failed(id, kind, reason.as_str()),
        });

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = stop.clone();
            tokio::task::spawn_blocking(move || {
                while !stop.load(Ordering::Relaxed) {
                    if store.wait_for_requests(Duration::from_millis(100)) {
                        let generated = store.process_pending();
                        debug!(generated, "served generation requests");
                    }
                }
            })
        };

        Self {
            engine,
            stop,
            worker,
        }
    }

    async fn close(self) {
        self.engine.shutdown().await;
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "generation worker failed");
        }
    }
}

/// Wait for a settled full-quality preview with its analysis.
async fn settled(engine: &PreviewEngine) -> anyhow::Result<PreviewView> {
    let wait = engine.wait_for(|v| {
        let done = v.quality == Some(Quality::Full)
            && v.render_state == RenderState::Idle
            && !v.rendering
            && v.histogram.is_some();
        let failed = v.error.is_some() || matches!(v.source_status, Some(SourceStatus::Failed(_)));
        done || failed
    });
    let view = tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .context("timed out waiting for the preview")?
        .context("preview engine stopped")?;
    if let Some(error) = &view.error {
        bail!("{error}");
    }
    if let Some(SourceStatus::Failed(error)) = &view.source_status {
        bail!("failed to load source: {error}");
    }
    Ok(view)
}

async fn cmd_render(
    args: RenderArgs,
    config: PreviewConfig,
    store: Arc<FsAssetStore>,
    gpu: Option<Arc<dyn BackendProvider>>,
) -> anyhow::Result<()> {
    let snapshot: EditSnapshot = match &args.edits {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read edits '{}'", path.display()))?;
            serde_json::from_str(&json).with_context(|| format!("parse edits '{}'", path.display()))?
        }
        None => EditSnapshot::default(),
    };

    let id = import(&store, &args.image).await?;
    let edits = EditStore::new(snapshot);
    let session = Session::start(config, store, edits, gpu);
    session.engine.open_asset(id);
    let view = settled(&session.engine).await?;

    let Some(pixels) = view.adjusted.clone() else {
        bail!("no pixels were produced");
    };
    let format = match args.out.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => EncodeFormat::Png,
        _ => EncodeFormat::Jpeg { quality: 92 },
    };
    let bytes = codec::encode(&pixels, format)?;
    if let Some(parent) = args.out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    tokio::fs::write(&args.out, bytes)
        .await
        .with_context(|| format!("write '{}'", args.out.display()))?;

    let clipping = view.clipping.as_ref().map(|c| c.flags);
    let summary = serde_json::json!({
        "width": pixels.width,
        "height": pixels.height,
        "path": view.path,
        "backend": view.backend,
        "shadow_clipping": clipping.map(|f| f.shadows),
        "highlight_clipping": clipping.map(|f| f.highlights),
        "histogram_peak": view.histogram.as_ref().map(|h| h.max_count),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    eprintln!("wrote {}", args.out.display());

    drop(view);
    session.close().await;
    Ok(())
}

async fn cmd_simulate(
    args: SimulateArgs,
    config: PreviewConfig,
    store: Arc<FsAssetStore>,
    gpu: Option<Arc<dyn BackendProvider>>,
) -> anyhow::Result<()> {
    let quiet = config.quiet_period();
    let id = import(&store, &args.image).await?;
    let edits = EditStore::default();
    let session = Session::start(config, store, edits.clone(), gpu);
    let engine = &session.engine;
    engine.open_asset(id);
    settled(engine).await?;

    let steps = args.steps.max(1);
    for step in 1..=steps {
        let exposure = args.exposure * step as f32 / steps as f32;
        edits.update(|s| s.adjustments.exposure = exposure);
        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
    tokio::time::sleep(quiet).await;
    let view = settled(engine).await?;

    let summary = serde_json::json!({
        "render_state": view.render_state,
        "path": view.path,
        "backend": view.backend,
        "output_dims": view.output_dims,
        "stats": engine.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    drop(view);
    session.close().await;
    Ok(())
}
