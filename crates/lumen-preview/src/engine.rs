//! The preview engine: one tokio task owning every piece of render state.
//! Commands, edit notifications, scheduler deadlines and finished blocking
//! work are all handled on that task, so at most one render is ever in
//! flight for the current asset.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use lumen_core::analysis::Analysis;
use lumen_core::asset::{AssetId, AssetStore, Priority, RepresentationKind};
use lumen_core::canvas::{CanvasBinding, CanvasTexture};
use lumen_core::image_buf::scaled_dims;
use lumen_core::{BackendError, BackendProvider, ComputeBackend, ImageBuf, RenderError, SourceError};

use crate::analysis::{self, AnalysisBridge};
use crate::config::PreviewConfig;
use crate::delivery::{OutputDelivery, ResourceTracker, TrackedTexture};
use crate::edit_store::EditStore;
use crate::generation::{Generation, StalenessGuard};
use crate::orchestrator::{self, Plan, RenderOutput, RenderPath, RenderRequest};
use crate::scheduler::{Action, InputScheduler};
use crate::selector::BackendSelector;
use crate::source_cache::{SourceCache, SourceImage, SourceLoader};
use crate::state::{RenderState, RenderStateMachine};
use crate::view::{EngineStats, PreviewHandle, PreviewView, Quality, SourceStatus};

/// The compute backends the engine may use. `cpu` also decodes sources.
pub struct Backends {
    pub cpu: Arc<dyn ComputeBackend>,
    pub gpu: Option<Arc<dyn BackendProvider>>,
}

enum Command {
    OpenAsset(AssetId, Generation),
    Input,
    RepresentationReady(AssetId, RepresentationKind),
    RepresentationFailed(AssetId, RepresentationKind, String),
    BindCanvas(Box<dyn CanvasBinding>, oneshot::Sender<bool>),
    UnbindCanvas,
}

enum TaskResult {
    Loaded {
        generation: Generation,
        asset: AssetId,
        result: Result<SourceImage, SourceError>,
    },
    Rendered {
        generation: Generation,
        quality: Quality,
        result: Result<RenderOutput, RenderError>,
        texture: Option<TrackedTexture>,
    },
    Analyzed {
        generation: Generation,
        result: Result<Analysis, RenderError>,
    },
}

pub struct PreviewEngine {
    commands: mpsc::UnboundedSender<Command>,
    guard: StalenessGuard,
    view: watch::Receiver<PreviewView>,
    stats: Arc<Mutex<EngineStats>>,
    tracker: ResourceTracker,
    task: JoinHandle<()>,
}

impl PreviewEngine {
    /// Start the engine on the current tokio runtime.
    pub fn spawn(
        config: PreviewConfig,
        store: Arc<dyn AssetStore>,
        edits: EditStore,
        backends: Backends,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(PreviewView::default());
        let stats = Arc::new(Mutex::new(EngineStats::default()));
        let tracker = ResourceTracker::new();
        let guard = StalenessGuard::new();

        let gpu = if config.prefer_gpu { backends.gpu } else { None };
        let selector = BackendSelector::new(backends.cpu.clone(), gpu, config.gpu_failure_limit);
        let actor = Actor {
            scheduler: InputScheduler::new(config.draft_throttle(), config.quiet_period()),
            bridge: AnalysisBridge::new(config.analysis_interval()),
            config,
            loader: SourceLoader::new(store, backends.cpu),
            selector: Arc::new(selector),
            edits,
            generation: guard.capture(),
            guard: guard.clone(),
            cache: SourceCache::new(),
            machine: RenderStateMachine::new(),
            delivery: OutputDelivery::new(tracker.clone()),
            view: view_tx,
            stats: stats.clone(),
            tasks: JoinSet::new(),
            asset: None,
            busy: false,
            pending: None,
        };
        let task = tokio::spawn(actor.run(commands_rx));

        Self {
            commands,
            guard,
            view,
            stats,
            tracker,
            task,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("preview engine is not running");
        }
    }

    /// Make `id` the current asset. Work in flight for the previous asset
    /// is invalidated before this returns.
    pub fn open_asset(&self, id: impl Into<AssetId>) {
        // Advanced on the caller's side: a result already queued for the
        // engine task must not commit once this returns.
        let generation = self.guard.advance();
        self.send(Command::OpenAsset(id.into(), generation));
    }

    /// An input event that did not go through the edit store.
    pub fn input(&self) {
        self.send(Command::Input);
    }

    /// The asset store finished (re)generating a representation.
    pub fn representation_ready(&self, id: impl Into<AssetId>, kind: RepresentationKind) {
        self.store_events().ready(&id.into(), kind);
    }

    /// Sender for asset store notifications that does not keep the engine
    /// alive; events sent after shutdown are dropped.
    pub fn store_events(&self) -> StoreEvents {
        StoreEvents {
            commands: self.commands.downgrade(),
        }
    }

    /// Render straight into `canvas` from now on. Returns false, keeping
    /// bitmap delivery, when the canvas cannot be configured.
    pub async fn bind_canvas(&self, canvas: Box<dyn CanvasBinding>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BindCanvas(canvas, reply));
        rx.await.unwrap_or(false)
    }

    pub fn unbind_canvas(&self) {
        self.send(Command::UnbindCanvas);
    }

    pub fn view(&self) -> PreviewView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewView> {
        self.view.clone()
    }

    /// Wait until the published view satisfies `pred`. `None` once the
    /// engine has shut down.
    pub async fn wait_for(&self, mut pred: impl FnMut(&PreviewView) -> bool) -> Option<PreviewView> {
        let mut rx = self.view.clone();
        let view = rx.wait_for(|view| pred(view)).await.ok()?.clone();
        Some(view)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resources(&self) -> ResourceTracker {
        self.tracker.clone()
    }

    /// Stop the engine, wait for outstanding work and release every
    /// bitmap and canvas texture.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            error!(error = %e, "preview engine task failed");
        }
    }
}

/// Forwards representation (re)generation outcomes to a [`PreviewEngine`].
#[derive(Clone)]
pub struct StoreEvents {
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl StoreEvents {
    fn send(&self, command: Command) {
        match self.commands.upgrade() {
            Some(commands) => {
                // The engine may stop between upgrade and send.
                let _ = commands.send(command);
            }
            None => debug!("preview engine gone, dropping store event"),
        }
    }

    pub fn ready(&self, id: &AssetId, kind: RepresentationKind) {
        self.send(Command::RepresentationReady(id.clone(), kind));
    }

    /// Generation failed for good; an asset waiting on it is marked failed.
    pub fn failed(&self, id: &AssetId, kind: RepresentationKind, reason: impl Into<String>) {
        self.send(Command::RepresentationFailed(id.clone(), kind, reason.into()));
    }
}

struct Actor {
    config: PreviewConfig,
    edits: EditStore,
    loader: SourceLoader,
    selector: Arc<BackendSelector>,
    guard: StalenessGuard,
    /// Generation of the asset this task last opened. Work is captured
    /// under it, never under the guard's latest value.
    generation: Generation,
    cache: SourceCache,
    machine: RenderStateMachine,
    scheduler: InputScheduler,
    bridge: AnalysisBridge,
    delivery: OutputDelivery,
    view: watch::Sender<PreviewView>,
    stats: Arc<Mutex<EngineStats>>,
    tasks: JoinSet<TaskResult>,
    asset: Option<AssetId>,
    busy: bool,
    /// Best quality requested while a render was in flight.
    pending: Option<Quality>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Run `f`, turning a panic into a value so no task can take the engine
/// down with it.
fn guarded<T>(f: impl FnOnce() -> T, on_panic: impl FnOnce(anyhow::Error) -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%msg, "preview task panicked");
            on_panic(anyhow::anyhow!("preview task panicked: {msg}"))
        }
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut edits = self.edits.subscribe();
        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Ok(()) = edits.changed() => {
                    edits.borrow_and_update();
                    self.on_input();
                }
                _ = sleep_until(deadline) => self.on_timer(),
                Some(joined) = self.tasks.join_next() => self.on_task(joined),
            }
        }
        self.finish().await;
    }

    fn stats(&self) -> MutexGuard<'_, EngineStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update the published view. The render state is always synced.
    fn publish(&mut self, f: impl FnOnce(&mut PreviewView)) {
        let state = self.machine.state();
        self.stats().rejected_transitions = self.machine.rejected();
        self.view.send_modify(|view| {
            f(view);
            view.render_state = state;
        });
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::OpenAsset(id, generation) => self.open_asset(id, generation),
            Command::Input => self.on_input(),
            Command::RepresentationReady(id, kind) => self.on_representation_ready(id, kind),
            Command::RepresentationFailed(id, kind, reason) => {
                self.on_representation_failed(id, kind, reason)
            }
            Command::BindCanvas(canvas, reply) => {
                let bound = self.delivery.bind(canvas);
                // The caller may have stopped waiting.
                let _ = reply.send(bound);
                if bound {
                    self.refresh();
                }
            }
            Command::UnbindCanvas => {
                let was_direct = self.delivery.is_direct();
                self.delivery.unbind();
                if was_direct {
                    self.refresh();
                }
            }
        }
    }

    fn open_asset(&mut self, id: AssetId, generation: Generation) {
        if self.guard.is_stale(generation) {
            debug!(asset = %id, %generation, "superseded before it was opened");
            return;
        }
        self.generation = generation;
        info!(asset = %id, %generation, "opening asset");
        self.stats().asset_switches += 1;

        self.cache.invalidate();
        self.delivery.release_bitmap();
        self.machine.reset();
        self.scheduler.reset();
        self.bridge.reset();
        self.pending = None;
        self.asset = Some(id.clone());
        self.publish(|view| {
            *view = PreviewView {
                asset: Some(id),
                source_status: Some(SourceStatus::Loading),
                ..PreviewView::default()
            };
        });
        self.start_load();
    }

    fn start_load(&mut self) {
        let Some(asset) = self.asset.clone() else {
            return;
        };
        let generation = self.generation;
        let loader = self.loader.clone();
        self.tasks.spawn_blocking(move || {
            let result = guarded(
                || loader.load(&asset),
                |e| {
                    Err(SourceError::Decode {
                        asset: asset.clone(),
                        kind: RepresentationKind::Preview,
                        source: BackendError::failed("decode", e),
                    })
                },
            );
            TaskResult::Loaded {
                generation,
                asset,
                result,
            }
        });
    }

    fn on_representation_ready(&mut self, id: AssetId, kind: RepresentationKind) {
        if self.asset.as_ref() != Some(&id) {
            return;
        }
        let waiting = matches!(
            self.view.borrow().source_status,
            Some(SourceStatus::Waiting | SourceStatus::Failed(_))
        );
        let upgrade = kind == RepresentationKind::Preview
            && self
                .cache
                .get(&id)
                .is_some_and(|s| s.kind == RepresentationKind::Thumbnail);
        if waiting || upgrade {
            debug!(asset = %id, ?kind, "representation ready, reloading");
            self.start_load();
        }
    }

    fn on_representation_failed(&mut self, id: AssetId, kind: RepresentationKind, reason: String) {
        if self.asset.as_ref() != Some(&id) {
            return;
        }
        let waiting = matches!(self.view.borrow().source_status, Some(SourceStatus::Waiting));
        if waiting {
            error!(asset = %id, ?kind, %reason, "no representation can be generated");
            let message = format!("{kind:?} generation failed: {reason}");
            self.publish(|view| view.source_status = Some(SourceStatus::Failed(message)));
        } else {
            warn!(asset = %id, ?kind, %reason, "representation generation failed");
        }
    }

    fn on_loaded(&mut self, generation: Generation, asset: AssetId, result: Result<SourceImage, SourceError>) {
        if self.guard.is_stale(generation) || self.asset.as_ref() != Some(&asset) {
            debug!(asset = %asset, %generation, "discarding stale source load");
            return;
        }
        match result {
            Ok(source) => {
                let kind = source.kind;
                if kind == RepresentationKind::Thumbnail {
                    self.loader
                        .store()
                        .request_generation(&asset, RepresentationKind::Preview, Priority::High);
                }
                self.cache.insert(source);
                self.publish(|view| {
                    view.source_status = Some(SourceStatus::Ready(kind));
                    view.error = None;
                });
                self.refresh();
            }
            Err(e @ (SourceError::NotFound(_) | SourceError::Revoked { .. })) => {
                info!(asset = %asset, error = %e, "waiting for a preview");
                self.loader
                    .store()
                    .request_generation(&asset, RepresentationKind::Preview, Priority::High);
                self.publish(|view| view.source_status = Some(SourceStatus::Waiting));
            }
            Err(e) => {
                error!(asset = %asset, error = ?e, "failed to load source");
                self.publish(|view| view.source_status = Some(SourceStatus::Failed(e.to_string())));
            }
        }
    }

    /// Redraw the current source with the current edits.
    fn refresh(&mut self) {
        if self.cache.current().is_none() {
            return;
        }
        if self.edits.snapshot().is_identity() {
            self.show_source(true);
        } else {
            self.request_render(Quality::Full);
        }
    }

    fn on_input(&mut self) {
        if self.cache.current().is_none() {
            return;
        }
        let now = Instant::now();
        // Rejections are counted by the machine and published below.
        let _ = self.machine.on_input_event();
        if let Some(Action::Draft { .. }) = self.scheduler.on_input(now) {
            self.stats().leading_drafts += 1;
            self.request_render(Quality::Draft);
        }
        self.publish(|_| {});
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        while let Some(action) = self.scheduler.poll(now) {
            match action {
                Action::Draft { .. } => {
                    self.stats().trailing_drafts += 1;
                    self.request_render(Quality::Draft);
                }
                Action::Full => {
                    if self.machine.on_quiet_period_elapsed().is_ok() {
                        self.request_render(Quality::Full);
                    }
                }
            }
        }
        self.publish(|_| {});
    }

    fn request_render(&mut self, quality: Quality) {
        self.stats().requested(quality);
        if self.busy {
            debug!(?quality, "render in flight, queued");
            self.pending = self.pending.max(Some(quality));
            return;
        }
        self.start_render(quality);
    }

    fn start_render(&mut self, quality: Quality) {
        let Some(source) = self.cache.current().map(|s| s.pixels.clone()) else {
            return;
        };
        let snapshot = self.edits.snapshot();
        if snapshot.is_identity() {
            let analyze = self.bridge.should_run(self.machine.state(), quality, Instant::now());
            self.show_source(analyze);
            self.settle(quality);
            return;
        }

        let generation = self.generation;
        let scale = self.config.scale(quality);
        let (w, h) = scaled_dims(source.width, source.height, scale);
        let dims = Plan::from_snapshot(&snapshot).output_dims(w, h);
        let texture = if self.delivery.is_direct() {
            self.delivery.acquire(dims)
        } else {
            None
        };
        let readback = texture.is_none()
            || self
                .bridge
                .should_run(self.machine.state(), quality, Instant::now());

        self.busy = true;
        self.stats().started(quality);
        debug!(?quality, %generation, width = dims.0, height = dims.1, "render started");
        self.publish(|view| view.rendering = true);

        let request = RenderRequest {
            snapshot,
            source,
            scale,
            generation,
        };
        let selector = self.selector.clone();
        let guard = self.guard.clone();
        self.tasks.spawn_blocking(move || {
            let mut texture = texture;
            let result = guarded(
                || {
                    let target = texture.as_mut().map(|t| t as &mut dyn CanvasTexture);
                    orchestrator::render(&selector, &guard, &request, target, readback)
                },
                |e| Err(RenderError::Failed(e)),
            );
            TaskResult::Rendered {
                generation,
                quality,
                result,
                texture,
            }
        });
    }

    fn on_rendered(
        &mut self,
        generation: Generation,
        quality: Quality,
        result: Result<RenderOutput, RenderError>,
        texture: Option<TrackedTexture>,
    ) {
        self.busy = false;
        match result {
            Ok(output) if !self.guard.is_stale(generation) => self.commit(quality, output, texture),
            Ok(_) | Err(RenderError::StaleDiscarded) => {
                // Released here, never presented.
                drop(texture);
                debug!(%generation, ?quality, "discarding stale render");
                self.stats().discarded_stale += 1;
            }
            Err(e) => {
                drop(texture);
                self.stats().failed += 1;
                // A failed full render still ends refinement; the error
                // slot carries the failure.
                self.settle(quality);
                if e.is_user_visible() {
                    error!(error = ?e, ?quality, "render failed, keeping previous preview");
                    let message = e.to_string();
                    self.publish(|view| view.error = Some(message));
                } else {
                    warn!(error = %e, ?quality, "render failed");
                }
            }
        }

        match self.pending.take() {
            Some(quality) => self.start_render(quality),
            None => self.publish(|view| view.rendering = false),
        }
    }

    fn commit(&mut self, quality: Quality, output: RenderOutput, texture: Option<TrackedTexture>) {
        let image = output.image.map(Arc::new);
        let preview = match texture {
            Some(texture) => {
                self.delivery.present(texture);
                self.delivery.release_bitmap();
                PreviewHandle::Canvas
            }
            None => match &image {
                Some(image) => PreviewHandle::Bitmap(self.delivery.commit_bitmap(image.clone())),
                None => PreviewHandle::None,
            },
        };

        {
            let mut stats = self.stats();
            stats.committed(quality);
            if output.gpu_fallback {
                stats.gpu_fallbacks += 1;
            }
        }
        if output.gpu_fallback && !self.selector.is_gpu_ready() {
            warn!("GPU demoted, rendering on CPU for the rest of the session");
        }
        if quality == Quality::Full {
            info!(
                asset = ?self.asset.as_ref().map(AssetId::as_str),
                path = ?output.path,
                backend = ?output.backend,
                width = output.dims.0,
                height = output.dims.1,
                "full-quality preview ready"
            );
        }

        let analyze = image.is_some()
            && self
                .bridge
                .should_run(self.machine.state(), quality, Instant::now());
        self.settle(quality);

        let adjusted = image.clone();
        self.publish(|view| {
            view.preview = preview;
            view.quality = Some(quality);
            view.error = None;
            view.output_dims = Some(output.dims);
            view.path = Some(output.path);
            view.backend = Some(output.backend);
            if adjusted.is_some() {
                view.adjusted = adjusted;
            }
        });

        if analyze && let Some(image) = image {
            self.spawn_analysis(image);
        }
    }

    /// Identity fast path: the source is displayed as-is.
    fn show_source(&mut self, analyze: bool) {
        let Some(pixels) = self.cache.current().map(|s| s.pixels.clone()) else {
            return;
        };
        let dims = (pixels.width, pixels.height);
        let mut preview = PreviewHandle::Source(pixels.clone());
        if let Some(mut texture) = self.delivery.acquire(dims) {
            match texture.write_pixels(&pixels) {
                Ok(()) => {
                    self.delivery.present(texture);
                    preview = PreviewHandle::Canvas;
                }
                Err(e) => warn!(error = ?e, "failed to upload source to canvas"),
            }
        }
        self.delivery.release_bitmap();

        let adjusted = pixels.clone();
        self.publish(|view| {
            view.preview = preview;
            view.quality = Some(Quality::Full);
            view.error = None;
            view.adjusted = Some(adjusted);
            view.output_dims = Some(dims);
            view.path = Some(RenderPath::Identity);
            view.backend = None;
        });
        if analyze {
            self.spawn_analysis(pixels);
        }
    }

    /// Refining -> Complete -> Idle once a full render lands.
    fn settle(&mut self, quality: Quality) {
        if quality == Quality::Full && self.machine.state() == RenderState::Refining {
            let _ = self.machine.on_full_render_complete();
        }
    }

    fn spawn_analysis(&mut self, image: Arc<ImageBuf>) {
        self.bridge.mark_run(Instant::now());
        let generation = self.generation;
        let selector = self.selector.clone();
        self.tasks.spawn_blocking(move || TaskResult::Analyzed {
            generation,
            result: guarded(
                || analysis::analyze(&selector, &image),
                |e| Err(RenderError::Failed(e)),
            ),
        });
    }

    fn on_analyzed(&mut self, generation: Generation, result: Result<Analysis, RenderError>) {
        if self.guard.is_stale(generation) {
            debug!(%generation, "discarding stale analysis");
            return;
        }
        match result {
            Ok(analysis) => {
                self.stats().analysis_runs += 1;
                self.publish(|view| {
                    view.histogram = Some(Arc::new(analysis.histogram));
                    view.clipping = Some(Arc::new(analysis.clipping));
                });
            }
            Err(e) => warn!(error = %e, "analysis failed"),
        }
    }

    fn on_task(&mut self, joined: Result<TaskResult, JoinError>) {
        match joined {
            Ok(TaskResult::Loaded {
                generation,
                asset,
                result,
            }) => self.on_loaded(generation, asset, result),
            Ok(TaskResult::Rendered {
                generation,
                quality,
                result,
                texture,
            }) => self.on_rendered(generation, quality, result, texture),
            Ok(TaskResult::Analyzed { generation, result }) => self.on_analyzed(generation, result),
            Err(e) => error!(error = %e, "preview task did not complete"),
        }
    }

    async fn finish(mut self) {
        self.guard.advance();
        while let Some(joined) = self.tasks.join_next().await {
            // Results are stale; dropping them releases their textures.
            drop(joined);
        }
        self.view.send_replace(PreviewView::default());
        self.delivery.teardown();
        debug!("preview engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{
        ExposureLimitBackend, FailingGpu, FakeProvider, GatedBackend, MemoryStore, RecordingCanvas,
        RecordingGpu, gradient,
    };
    use lumen_core::{BackendKind, CpuBackend};

    const MS: Duration = Duration::from_millis(1);

    fn cpu_backends() -> Backends {
        Backends {
            cpu: Arc::new(CpuBackend::new()),
            gpu: None,
        }
    }

    fn spawn(store: &Arc<MemoryStore>, edits: &EditStore, backends: Backends) -> PreviewEngine {
        PreviewEngine::spawn(PreviewConfig::default(), store.clone(), edits.clone(), backends)
    }

    async fn wait_ready(engine: &PreviewEngine, id: &str) {
        let ready = tokio::time::timeout(
            Duration::from_secs(5),
            engine.wait_for(|v| {
                v.asset.as_ref().map(AssetId::as_str) == Some(id)
                    && matches!(v.source_status, Some(SourceStatus::Ready(_)))
            }),
        )
        .await;
        assert!(matches!(ready, Ok(Some(_))), "asset {id} never became ready");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_input_renders_one_leading_draft_and_one_full() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 32, 24);
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        engine.open_asset("a");
        wait_ready(&engine, "a").await;

        for i in 0..10 {
            edits.update(|s| s.adjustments.exposure = 0.1 * (i + 1) as f32);
            tokio::time::sleep(5 * MS).await;
        }
        tokio::time::sleep(500 * MS).await;

        let stats = engine.stats();
        assert_eq!(stats.leading_drafts, 1);
        assert_eq!(stats.full_started, 1);
        assert_eq!(stats.full_committed, 1);
        assert_eq!(stats.discarded_stale, 0);

        let view = engine.view();
        assert_eq!(view.quality, Some(Quality::Full));
        assert_eq!(view.render_state, RenderState::Idle);
        assert_eq!(view.output_dims, Some((32, 24)));
        assert!(view.histogram.is_some());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn asset_switch_discards_in_flight_render() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 16, 12);
        store.insert_preview("b", 10, 8);
        let edits = EditStore::default();
        let gated = Arc::new(GatedBackend::new());
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: gated.clone(),
                gpu: None,
            },
        );
        engine.open_asset("a");
        wait_ready(&engine, "a").await;

        edits.update(|s| s.adjustments.exposure = 1.0);
        while !gated.entered() {
            tokio::task::yield_now().await;
        }
        engine.open_asset("b");
        wait_ready(&engine, "b").await;
        gated.release();
        settle().await;

        let stats = engine.stats();
        assert_eq!(stats.discarded_stale, 1);
        assert_eq!(stats.draft_committed, 0, "the draft for a must never be shown");
        assert_eq!(stats.full_committed, 1);

        let view = engine.view();
        assert_eq!(view.asset, Some(AssetId::from("b")));
        match &view.preview {
            PreviewHandle::Bitmap(bitmap) => assert_eq!(bitmap.dims(), (10, 8)),
            other => panic!("expected a bitmap, got {other:?}"),
        }
        drop(view);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finished_render_for_previous_asset_is_not_committed_after_switch() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 16, 12);
        store.insert_preview("b", 10, 8);
        let edits = EditStore::default();
        let gated = Arc::new(GatedBackend::new());
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: gated.clone(),
                gpu: None,
            },
        );
        engine.open_asset("a");
        wait_ready(&engine, "a").await;

        edits.update(|s| s.adjustments.exposure = 1.0);
        while !gated.entered() {
            tokio::task::yield_now().await;
        }
        // Let the blocking render for a run to completion without giving
        // the engine task a chance to collect it.
        gated.release();
        while gated.finished() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        std::thread::sleep(Duration::from_millis(20));
        engine.open_asset("b");
        wait_ready(&engine, "b").await;
        settle().await;

        let stats = engine.stats();
        assert_eq!(stats.draft_committed, 0, "a's draft committed after the switch");
        assert_eq!(stats.discarded_stale, 1);
        let view = engine.view();
        assert_eq!(view.asset, Some(AssetId::from("b")));
        assert_eq!(view.path, Some(RenderPath::Sequential));
        assert_eq!(view.output_dims, Some((10, 8)));
        drop(view);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn input_during_a_render_is_replayed_once_afterwards() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 16, 12);
        let edits = EditStore::default();
        let gated = Arc::new(GatedBackend::new());
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: gated.clone(),
                gpu: None,
            },
        );
        engine.open_asset("a");
        wait_ready(&engine, "a").await;

        edits.update(|s| s.adjustments.exposure = 0.5);
        while !gated.entered() {
            tokio::task::yield_now().await;
        }
        edits.update(|s| s.adjustments.exposure = 1.0);
        edits.update(|s| s.adjustments.exposure = 1.5);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // The blocked render keeps the clock from auto-advancing.
        tokio::time::advance(600 * MS).await;
        for _ in 0..100 {
            if engine.stats().full_requested > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let stats = engine.stats();
        assert_eq!(stats.full_requested, 1);
        assert_eq!(stats.draft_started, 1);
        assert_eq!(stats.full_started, 0, "queued behind the draft");

        gated.release();
        let done = engine
            .wait_for(|v| v.quality == Some(Quality::Full) && !v.rendering)
            .await;
        assert!(done.is_some());
        settle().await;

        let stats = engine.stats();
        assert_eq!(stats.draft_started, 1);
        assert_eq!(stats.full_started, 1);
        assert_eq!(stats.draft_committed, 1);
        assert_eq!(stats.full_committed, 1);
        assert_eq!(gated.max_active(), 1, "renders overlapped");
        assert_eq!(engine.view().render_state, RenderState::Idle);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gpu_stage_failure_falls_back_to_cpu() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 16, 12);
        let edits = EditStore::default();
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: Arc::new(CpuBackend::new()),
                gpu: Some(Arc::new(FakeProvider::ready(Arc::new(FailingGpu)))),
            },
        );
        engine.open_asset("a");
        wait_ready(&engine, "a").await;
        edits.update(|s| s.adjustments.exposure = 1.0);
        settle().await;

        let stats = engine.stats();
        assert_eq!(stats.full_committed, 1);
        assert!(stats.gpu_fallbacks >= 1);
        assert_eq!(stats.failed, 0);

        let view = engine.view();
        assert!(view.error.is_none());
        assert_eq!(view.backend, Some(BackendKind::Cpu));
        assert_eq!(view.path, Some(RenderPath::Sequential));
        assert!(matches!(view.preview, PreviewHandle::Bitmap(_)));
        drop(view);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failure_on_every_backend_keeps_the_previous_preview() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 16, 12);
        let edits = EditStore::default();
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: Arc::new(ExposureLimitBackend::new(2.0)),
                gpu: Some(Arc::new(FakeProvider::ready(Arc::new(FailingGpu)))),
            },
        );
        engine.open_asset("a");
        wait_ready(&engine, "a").await;
        edits.update(|s| s.adjustments.exposure = 0.5);
        settle().await;

        let shown = match engine.view().preview {
            PreviewHandle::Bitmap(bitmap) => bitmap,
            other => panic!("expected a bitmap, got {other:?}"),
        };
        assert_eq!(engine.stats().failed, 0);

        edits.update(|s| s.adjustments.exposure = 3.0);
        settle().await;

        let view = engine.view();
        assert!(view.error.is_some(), "the error slot is set");
        match &view.preview {
            PreviewHandle::Bitmap(bitmap) => assert!(Arc::ptr_eq(bitmap, &shown)),
            other => panic!("previous preview was replaced by {other:?}"),
        }
        assert_eq!(view.render_state, RenderState::Idle);
        assert!(!view.rendering);
        assert!(engine.stats().failed >= 1);
        drop(view);
        drop(shown);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_generation_marks_a_waiting_source_failed() {
        let store = Arc::new(MemoryStore::new());
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        engine.open_asset("a");
        let waiting = engine
            .wait_for(|v| v.source_status == Some(SourceStatus::Waiting))
            .await;
        assert!(waiting.is_some());

        let events = engine.store_events();
        events.failed(&AssetId::from("b"), RepresentationKind::Preview, "other asset");
        events.failed(&AssetId::from("a"), RepresentationKind::Preview, "not an image");
        let failed = engine
            .wait_for(|v| matches!(v.source_status, Some(SourceStatus::Failed(_))))
            .await
            .unwrap();
        match failed.source_status {
            Some(SourceStatus::Failed(message)) => assert!(message.contains("not an image")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(failed.asset, Some(AssetId::from("a")));

        engine.shutdown().await;
        // Events after shutdown go nowhere.
        events.ready(&AssetId::from("a"), RepresentationKind::Preview);
    }

    #[tokio::test(start_paused = true)]
    async fn unedited_asset_shows_source_and_analyzes_once() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 20, 10);
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        engine.open_asset("a");
        wait_ready(&engine, "a").await;
        settle().await;

        let view = engine.view();
        match &view.preview {
            PreviewHandle::Source(pixels) => assert_eq!(**pixels, gradient(20, 10)),
            other => panic!("expected the source, got {other:?}"),
        }
        assert_eq!(view.path, Some(RenderPath::Identity));
        assert!(view.histogram.is_some());
        assert!(view.clipping.is_some());

        let stats = engine.stats();
        assert_eq!(stats.analysis_runs, 1);
        assert_eq!(stats.draft_started + stats.full_started, 0);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_preview_waits_and_reloads_when_regenerated() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 12, 12);
        store.revoke("a", RepresentationKind::Preview);
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        engine.open_asset("a");

        let waiting = engine
            .wait_for(|v| v.source_status == Some(SourceStatus::Waiting))
            .await;
        assert!(waiting.is_some());
        assert!(waiting.unwrap().error.is_none(), "waiting is not an error");
        assert_eq!(
            store.requests(),
            vec![(AssetId::from("a"), RepresentationKind::Preview, Priority::High)]
        );

        store.restore("a", RepresentationKind::Preview);
        engine.representation_ready("a", RepresentationKind::Preview);
        wait_ready(&engine, "a").await;
        assert_eq!(
            engine.view().source_status,
            Some(SourceStatus::Ready(RepresentationKind::Preview))
        );
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn thumbnail_source_requests_the_preview() {
        let store = Arc::new(MemoryStore::new());
        store.insert_thumbnail("a", 8, 6);
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        engine.open_asset("a");
        wait_ready(&engine, "a").await;

        assert_eq!(
            engine.view().source_status,
            Some(SourceStatus::Ready(RepresentationKind::Thumbnail))
        );
        assert_eq!(
            store.requests(),
            vec![(AssetId::from("a"), RepresentationKind::Preview, Priority::High)]
        );

        store.insert_preview("a", 16, 12);
        engine.representation_ready("a", RepresentationKind::Preview);
        let upgraded = engine
            .wait_for(|v| {
                v.source_status == Some(SourceStatus::Ready(RepresentationKind::Preview))
                    && v.output_dims == Some((16, 12))
            })
            .await;
        assert!(upgraded.is_some());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_bitmap_is_released_after_shutdown() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b", "c"] {
            store.insert_preview(id, 24, 16);
        }
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        let resources = engine.resources();

        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            engine.open_asset(id);
            wait_ready(&engine, id).await;
            edits.update(|s| s.adjustments.contrast = 10.0 * (i + 1) as f32);
            settle().await;
            assert!(resources.live() <= 1, "live resources: {}", resources.live());
        }
        assert!(engine.stats().full_committed >= 3);

        engine.shutdown().await;
        assert_eq!(resources.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bound_canvas_receives_the_final_pass() {
        let store = Arc::new(MemoryStore::new());
        store.insert_preview("a", 40, 20);
        let edits = EditStore::default();
        let gpu = Arc::new(RecordingGpu::new());
        let engine = spawn(
            &store,
            &edits,
            Backends {
                cpu: Arc::new(CpuBackend::new()),
                gpu: Some(Arc::new(FakeProvider::ready(gpu.clone()))),
            },
        );
        let (canvas, log) = RecordingCanvas::new();
        assert!(engine.bind_canvas(Box::new(canvas)).await);
        let resources = engine.resources();

        engine.open_asset("a");
        wait_ready(&engine, "a").await;
        edits.update(|s| s.rotation.angle = 90.0);
        settle().await;

        let view = engine.view();
        assert!(matches!(view.preview, PreviewHandle::Canvas));
        assert_eq!(view.output_dims, Some((20, 40)));
        assert_eq!(view.path, Some(RenderPath::Unified));
        assert!(view.histogram.is_some());
        assert!(gpu.direct_batches() >= 1);
        {
            let log = log.lock().unwrap();
            assert!(log.presented >= 2, "source and render were presented");
            assert_eq!(log.resized.last(), Some(&(20, 40)));
            let shown = log.last_presented.as_ref().unwrap();
            assert_eq!((shown.width, shown.height), (20, 40));
        }
        assert_eq!(resources.live(), 0, "presented textures are released");

        engine.shutdown().await;
        assert_eq!(log.lock().unwrap().unconfigured, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigurable_canvas_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let edits = EditStore::default();
        let engine = spawn(&store, &edits, cpu_backends());
        let (mut canvas, _log) = RecordingCanvas::new();
        canvas.fail_configure = true;
        assert!(!engine.bind_canvas(Box::new(canvas)).await);
        engine.shutdown().await;
    }
}
