use crate::asset::{AssetId, RepresentationKind};

/// Failure of a single primitive on a compute backend.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The backend could not be initialized (no adapter, device lost).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend does not implement this operation (e.g. crop on GPU).
    #[error("operation {op} is not supported by this backend")]
    Unsupported { op: &'static str },

    /// The operation was attempted and threw.
    #[error("operation {op} failed")]
    Failed {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl BackendError {
    pub fn failed(op: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            op,
            source: source.into(),
        }
    }
}

/// Why the source cache could not produce pixels for an asset.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// The asset has no preview and no thumbnail yet.
    #[error("asset {0} has no representation to load")]
    NotFound(AssetId),

    /// A representation was listed but its handle no longer resolves
    /// (evicted cache entry). Re-requesting it from the store can fix this.
    #[error("{kind:?} representation of asset {asset} was revoked")]
    Revoked {
        asset: AssetId,
        kind: RepresentationKind,
    },

    #[error("failed to decode {kind:?} representation of asset {asset}")]
    Decode {
        asset: AssetId,
        kind: RepresentationKind,
        #[source]
        source: BackendError,
    },
}

/// Outcome taxonomy of one render.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("waiting for a source image")]
    SourceUnavailable(#[from] SourceError),

    #[error("GPU backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("stage {stage} failed")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: BackendError,
    },

    /// The target asset changed while the render was in flight.
    #[error("render result discarded as stale")]
    StaleDiscarded,

    /// Both the GPU path and the CPU fallback failed.
    #[error("failed to render preview: {0}")]
    Failed(#[source] anyhow::Error),
}

impl RenderError {
    /// Errors that reach the UI error slot. Backend and stage failures are
    /// recovered by the CPU fallback and only logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
