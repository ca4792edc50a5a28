use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::view::Quality;

/// Tunables of the preview engine. Every key is optional in the TOML file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Throttle window for draft renders (leading + trailing edge).
    pub draft_throttle_ms: u64,
    /// No-input period after which the full-quality render runs.
    pub quiet_period_ms: u64,
    /// Minimum interval between analysis runs while interacting.
    pub analysis_interval_ms: u64,
    pub draft_quality: f32,
    pub full_quality: f32,
    pub prefer_gpu: bool,
    /// Consecutive failed GPU renders before the GPU is dropped for the
    /// rest of the session.
    pub gpu_failure_limit: u32,
    pub max_masks_gpu: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            draft_throttle_ms: 50,
            quiet_period_ms: 300,
            analysis_interval_ms: 500,
            draft_quality: 0.5,
            full_quality: 1.0,
            prefer_gpu: true,
            gpu_failure_limit: 3,
            max_masks_gpu: 16,
        }
    }
}

impl PreviewConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("invalid preview config")?;
        Ok(config.sanitized())
    }

    /// Load from `path`, falling back to defaults on any error.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no preview config, using defaults");
                return Self::default();
            }
        };
        Self::from_toml_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = ?e, "ignoring preview config");
            Self::default()
        })
    }

    pub fn draft_throttle(&self) -> Duration {
        Duration::from_millis(self.draft_throttle_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    /// Output scale of a render at `quality`.
    pub fn scale(&self, quality: Quality) -> f32 {
        match quality {
            Quality::Draft => self.draft_quality,
            Quality::Full => self.full_quality,
        }
    }

    fn sanitized(mut self) -> Self {
        let clamp = |q: f32| if q.is_finite() { q.clamp(0.05, 1.0) } else { 1.0 };
        self.draft_quality = clamp(self.draft_quality);
        self.full_quality = clamp(self.full_quality);
        self.gpu_failure_limit = self.gpu_failure_limit.max(1);
        self
    }
}
