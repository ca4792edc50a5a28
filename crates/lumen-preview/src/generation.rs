//! Staleness guard: a generation counter bumped once per asset switch.
//! Async work captures the generation it started under and compares it
//! at every checkpoint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lumen_core::RenderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cloned into every task; all clones share one counter.
#[derive(Clone, Debug, Default)]
pub struct StalenessGuard {
    current: Arc<AtomicU64>,
}

impl StalenessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate everything captured so far.
    pub fn advance(&self) -> Generation {
        Generation(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn capture(&self) -> Generation {
        Generation(self.current.load(Ordering::SeqCst))
    }

    pub fn is_stale(&self, generation: Generation) -> bool {
        generation != self.capture()
    }

    /// `Err(StaleDiscarded)` once `generation` has been superseded.
    pub fn check(&self, generation: Generation) -> Result<(), RenderError> {
        if self.is_stale(generation) {
            Err(RenderError::StaleDiscarded)
        } else {
            Ok(())
        }
    }
}
