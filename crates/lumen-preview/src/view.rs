//! What the engine publishes to the UI.

use std::sync::Arc;

use serde::Serialize;

use lumen_core::BackendKind;
use lumen_core::analysis::{ClippingMap, Histogram};
use lumen_core::asset::{AssetId, RepresentationKind};
use lumen_core::image_buf::ImageBuf;

use crate::delivery::Bitmap;
use crate::orchestrator::RenderPath;
use crate::state::RenderState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Draft,
    Full,
}

/// The displayable preview.
#[derive(Clone, Debug, Default)]
pub enum PreviewHandle {
    #[default]
    None,
    /// Unedited source pixels, shown as-is.
    Source(Arc<ImageBuf>),
    Bitmap(Arc<Bitmap>),
    /// The last render was presented on the bound canvas.
    Canvas,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceStatus {
    Loading,
    /// No usable representation yet; regeneration has been requested.
    Waiting,
    Ready(RepresentationKind),
    Failed(String),
}

#[derive(Clone, Debug, Default)]
pub struct PreviewView {
    pub asset: Option<AssetId>,
    pub preview: PreviewHandle,
    pub rendering: bool,
    pub quality: Option<Quality>,
    /// Set only when both the GPU and CPU paths failed. The previous
    /// preview stays in place.
    pub error: Option<String>,
    pub source_status: Option<SourceStatus>,
    pub clipping: Option<Arc<ClippingMap>>,
    pub histogram: Option<Arc<Histogram>>,
    /// Pixels of the last committed render, for histogram consumers.
    pub adjusted: Option<Arc<ImageBuf>>,
    pub render_state: RenderState,
    pub output_dims: Option<(u32, u32)>,
    pub path: Option<RenderPath>,
    pub backend: Option<BackendKind>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub asset_switches: u64,
    pub draft_requested: u64,
    pub full_requested: u64,
    pub draft_started: u64,
    pub full_started: u64,
    pub draft_committed: u64,
    pub full_committed: u64,
    pub leading_drafts: u64,
    pub trailing_drafts: u64,
    pub discarded_stale: u64,
    pub failed: u64,
    pub gpu_fallbacks: u64,
    pub analysis_runs: u64,
    pub rejected_transitions: u64,
}

impl EngineStats {
    pub fn requested(&mut self, quality: Quality) {
        match quality {
            Quality::Draft => self.draft_requested += 1,
            Quality::Full => self.full_requested += 1,
        }
    }

    pub fn started(&mut self, quality: Quality) {
        match quality {
            Quality::Draft => self.draft_started += 1,
            Quality::Full => self.full_started += 1,
        }
    }

    pub fn committed(&mut self, quality: Quality) {
        match quality {
            Quality::Draft => self.draft_committed += 1,
            Quality::Full => self.full_committed += 1,
        }
    }
}
