//! Decoded source pixels of the asset being edited.

use std::sync::Arc;

use tracing::{debug, warn};

use lumen_core::asset::{AssetId, AssetStore, ReadError, RepresentationKind};
use lumen_core::{BackendError, ComputeBackend, ImageBuf, SourceError};

#[derive(Clone, Debug)]
pub struct SourceImage {
    pub asset: AssetId,
    pub kind: RepresentationKind,
    pub pixels: Arc<ImageBuf>,
}

/// Reads and decodes an asset's best representation. Cheap to clone into
/// blocking tasks.
#[derive(Clone)]
pub struct SourceLoader {
    store: Arc<dyn AssetStore>,
    decoder: Arc<dyn ComputeBackend>,
}

impl SourceLoader {
    pub fn new(store: Arc<dyn AssetStore>, decoder: Arc<dyn ComputeBackend>) -> Self {
        Self { store, decoder }
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    /// Preview first, thumbnail second. A revoked or undecodable handle
    /// falls through to the next one; if none loads, a revocation wins
    /// over a decode failure so the caller re-requests generation.
    pub fn load(&self, id: &AssetId) -> Result<SourceImage, SourceError> {
        let Some(reps) = self.store.get(id) else {
            return Err(SourceError::NotFound(id.clone()));
        };

        let mut revoked = None;
        let mut decode_failure = None;
        for handle in reps.by_preference() {
            let bytes = match self.store.read(handle) {
                Ok(bytes) => bytes,
                Err(ReadError::Revoked) => {
                    debug!(asset = %id, kind = ?handle.kind, "representation revoked");
                    revoked.get_or_insert(handle.kind);
                    continue;
                }
                Err(ReadError::Io(e)) => {
                    warn!(asset = %id, kind = ?handle.kind, error = ?e, "failed to read representation");
                    decode_failure.get_or_insert((handle.kind, BackendError::failed("read", e)));
                    continue;
                }
            };
            match self.decoder.decode(&bytes) {
                Ok(pixels) => {
                    debug!(
                        asset = %id,
                        kind = ?handle.kind,
                        width = pixels.width,
                        height = pixels.height,
                        "source decoded"
                    );
                    return Ok(SourceImage {
                        asset: id.clone(),
                        kind: handle.kind,
                        pixels: Arc::new(pixels),
                    });
                }
                Err(e) => {
                    warn!(asset = %id, kind = ?handle.kind, error = %e, "failed to decode representation");
                    decode_failure.get_or_insert((handle.kind, e));
                }
            }
        }

        if let Some(kind) = revoked {
            return Err(SourceError::Revoked {
                asset: id.clone(),
                kind,
            });
        }
        if let Some((kind, source)) = decode_failure {
            return Err(SourceError::Decode {
                asset: id.clone(),
                kind,
                source,
            });
        }
        Err(SourceError::NotFound(id.clone()))
    }
}

/// Holds at most one asset's pixels. A new asset replaces the previous
/// buffer wholesale.
#[derive(Debug, Default)]
pub struct SourceCache {
    current: Option<SourceImage>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: SourceImage) {
        self.current = Some(image);
    }

    pub fn current(&self) -> Option<&SourceImage> {
        self.current.as_ref()
    }

    pub fn get(&self, id: &AssetId) -> Option<&SourceImage> {
        self.current.as_ref().filter(|s| &s.asset == id)
    }

    pub fn invalidate(&mut self) {
        self.current = None;
    }
}
