//! Filesystem asset store: source files registered by path, with their
//! preview and thumbnail JPEGs generated on request into a
//! [`RepresentationCache`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use lumen_core::asset::{
    AssetId, AssetRepresentations, AssetStore, Priority, ReadError, RepresentationHandle,
    RepresentationKind,
};

use crate::cache::{RepresentationCache, content_hash};
use crate::generator;

/// What became of one generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The representation is in the cache, freshly generated or not.
    Ready,
    /// It cannot be produced; retrying will not help.
    Failed(String),
}

type GeneratedHook = Box<dyn Fn(&AssetId, RepresentationKind, &Outcome) + Send + Sync>;

struct Entry {
    source: PathBuf,
    hash: String,
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    priority: Priority,
    seq: u64,
    id: AssetId,
    kind: RepresentationKind,
}

impl Ord for Request {
    /// Highest priority first; FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct FsAssetStore {
    cache: RepresentationCache,
    assets: RwLock<HashMap<AssetId, Entry>>,
    pending: Mutex<BinaryHeap<Request>>,
    requested: Condvar,
    seq: AtomicU64,
    on_generated: RwLock<Option<GeneratedHook>>,
}

impl FsAssetStore {
    pub fn open(cache_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            cache: RepresentationCache::new(cache_dir)?,
            assets: RwLock::new(HashMap::new()),
            pending: Mutex::new(BinaryHeap::new()),
            requested: Condvar::new(),
            seq: AtomicU64::new(0),
            on_generated: RwLock::new(None),
        })
    }

    /// Called once per processed request with its outcome.
    pub fn on_generated(
        &self,
        hook: impl Fn(&AssetId, RepresentationKind, &Outcome) + Send + Sync + 'static,
    ) {
        if let Ok(mut slot) = self.on_generated.write() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Register a source file. The asset id is the content hash, so adding
    /// the same file twice yields the same asset. Both representations are
    /// queued for generation.
    pub fn add(&self, path: &Path) -> Result<AssetId> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize: {}", path.display()))?;
        let hash = content_hash(&canonical)?;
        let id = AssetId::from(hash.as_str());
        {
            let mut assets = self.assets.write().map_err(|_| anyhow!("asset table poisoned"))?;
            assets.insert(
                id.clone(),
                Entry {
                    source: canonical,
                    hash,
                },
            );
        }
        info!(asset = %id, path = %path.display(), "added asset");
        self.request_generation(&id, RepresentationKind::Preview, Priority::Normal);
        self.request_generation(&id, RepresentationKind::Thumbnail, Priority::Low);
        Ok(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Block until a request is queued or `timeout` passes. Returns true
    /// when there is work for [`process_pending`](Self::process_pending).
    pub fn wait_for_requests(&self, timeout: Duration) -> bool {
        let Ok(pending) = self.pending.lock() else {
            return false;
        };
        match self
            .requested
            .wait_timeout_while(pending, timeout, |p| p.is_empty())
        {
            Ok((pending, _)) => !pending.is_empty(),
            Err(_) => false,
        }
    }

    /// Generate every queued representation that is not already cached.
    /// Returns how many were generated. Every request, including failed
    /// and already-cached ones, is reported to the `on_generated` hook.
    pub fn process_pending(&self) -> usize {
        let requests: Vec<Request> = match self.pending.lock() {
            Ok(mut pending) => std::iter::from_fn(|| pending.pop()).collect(),
            Err(_) => return 0,
        };
        if requests.is_empty() {
            return 0;
        }

        let mut seen = HashSet::new();
        let mut settled: Vec<(AssetId, RepresentationKind, Outcome)> = Vec::new();
        let jobs: Vec<(AssetId, RepresentationKind, PathBuf, String)> = {
            let Ok(assets) = self.assets.read() else {
                return 0;
            };
            requests
                .into_iter()
                .filter(|r| seen.insert((r.id.clone(), r.kind)))
                .filter_map(|r| match assets.get(&r.id) {
                    None => {
                        settled.push((r.id, r.kind, Outcome::Failed("unknown asset".into())));
                        None
                    }
                    Some(entry) if self.cache.contains(&entry.hash, r.kind) => {
                        settled.push((r.id, r.kind, Outcome::Ready));
                        None
                    }
                    Some(entry) => Some((r.id, r.kind, entry.source.clone(), entry.hash.clone())),
                })
                .collect()
        };

        let processed: Vec<(AssetId, RepresentationKind, Outcome)> = jobs
            .into_par_iter()
            .map(|(id, kind, source, hash)| {
                let result = generator::representation_for_file(&source, kind)
                    .and_then(|jpeg| self.cache.store(&hash, kind, &jpeg));
                let outcome = match result {
                    Ok(path) => {
                        debug!(asset = %id, ?kind, ?path, "representation ready");
                        Outcome::Ready
                    }
                    Err(e) => {
                        warn!(asset = %id, ?kind, error = %e, "representation generation failed");
                        Outcome::Failed(format!("{e:#}"))
                    }
                };
                (id, kind, outcome)
            })
            .collect();
        let generated = processed
            .iter()
            .filter(|(_, _, outcome)| *outcome == Outcome::Ready)
            .count();

        if let Ok(hook) = self.on_generated.read()
            && let Some(hook) = hook.as_ref()
        {
            for (id, kind, outcome) in settled.iter().chain(&processed) {
                hook(id, *kind, outcome);
            }
        }
        generated
    }

    /// Drop a cached representation. Handles issued for it stop resolving.
    pub fn evict(&self, id: &AssetId, kind: RepresentationKind) -> Result<bool> {
        let hash = {
            let assets = self.assets.read().map_err(|_| anyhow!("asset table poisoned"))?;
            match assets.get(id) {
                Some(entry) => entry.hash.clone(),
                None => return Ok(false),
            }
        };
        self.cache.remove(&hash, kind)
    }

    fn handle(&self, hash: &str, kind: RepresentationKind) -> Option<RepresentationHandle> {
        self.cache
            .contains(hash, kind)
            .then(|| RepresentationHandle {
                kind,
                locator: self.cache.path(hash, kind).to_string_lossy().into_owned(),
            })
    }
}

impl AssetStore for FsAssetStore {
    fn get(&self, id: &AssetId) -> Option<AssetRepresentations> {
        let assets = self.assets.read().ok()?;
        let entry = assets.get(id)?;
        Some(AssetRepresentations {
            preview: self.handle(&entry.hash, RepresentationKind::Preview),
            thumbnail: self.handle(&entry.hash, RepresentationKind::Thumbnail),
        })
    }

    fn read(&self, handle: &RepresentationHandle) -> Result<Vec<u8>, ReadError> {
        match std::fs::read(&handle.locator) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ReadError::Revoked),
            Err(e) => Err(ReadError::Io(
                anyhow::Error::new(e).context(format!("read {}", handle.locator)),
            )),
        }
    }

    fn request_generation(&self, id: &AssetId, kind: RepresentationKind, priority: Priority) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(asset = %id, ?kind, ?priority, "generation requested");
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(Request {
                priority,
                seq,
                id: id.clone(),
                kind,
            });
            self.requested.notify_all();
        }
    }
}
