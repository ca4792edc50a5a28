//! Histogram and clipping data for the auxiliary displays, computed from
//! the same pixels as the preview and throttled while the user drags.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use lumen_core::RenderError;
use lumen_core::analysis::Analysis;
use lumen_core::image_buf::ImageBuf;

use crate::selector::BackendSelector;
use crate::state::RenderState;
use crate::view::Quality;

#[derive(Debug)]
pub struct AnalysisBridge {
    interval: Duration,
    last_run: Option<Instant>,
}

impl AnalysisBridge {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
        }
    }

    /// Full-quality results are always analyzed. While interacting,
    /// analysis runs at most once per interval.
    pub fn should_run(&self, state: RenderState, quality: Quality, now: Instant) -> bool {
        if quality == Quality::Full || state != RenderState::Interacting {
            return true;
        }
        match self.last_run {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        }
    }

    pub fn mark_run(&mut self, now: Instant) {
        self.last_run = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_run = None;
    }
}

/// Analyze `image` on the GPU when it is ready, on the CPU otherwise.
pub fn analyze(selector: &BackendSelector, image: &ImageBuf) -> Result<Analysis, RenderError> {
    let gpu = selector.try_gpu(|gpu| {
        gpu.compute_histogram(image)
            .map_err(|source| RenderError::StageFailed {
                stage: "histogram",
                source,
            })
    });
    match gpu {
        Ok(analysis) => Ok(analysis),
        Err(e) => {
            debug!(error = %e, "analyzing on CPU");
            selector
                .cpu()
                .compute_histogram(image)
                .map_err(|e| RenderError::Failed(e.into()))
        }
    }
}
