//! Input timing: throttled drafts (leading + trailing edge) and a
//! debounced full-quality render.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Draft { leading: bool },
    Full,
}

#[derive(Debug)]
pub struct InputScheduler {
    throttle: Duration,
    quiet: Duration,
    last_draft: Option<Instant>,
    trailing_at: Option<Instant>,
    full_at: Option<Instant>,
}

impl InputScheduler {
    pub fn new(throttle: Duration, quiet: Duration) -> Self {
        Self {
            throttle,
            quiet,
            last_draft: None,
            trailing_at: None,
            full_at: None,
        }
    }

    /// Record an input event. Returns a leading draft when the throttle
    /// window is open; otherwise arms the trailing draft. The full render
    /// is pushed back to `now + quiet` either way.
    pub fn on_input(&mut self, now: Instant) -> Option<Action> {
        self.full_at = Some(now + self.quiet);
        match self.last_draft {
            Some(last) if now < last + self.throttle => {
                self.trailing_at = Some(last + self.throttle);
                None
            }
            _ => {
                self.last_draft = Some(now);
                self.trailing_at = None;
                Some(Action::Draft { leading: true })
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.trailing_at, self.full_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// The next action due at `now`, if any. Call until it returns `None`.
    pub fn poll(&mut self, now: Instant) -> Option<Action> {
        if let Some(at) = self.trailing_at
            && at <= now
        {
            self.trailing_at = None;
            self.last_draft = Some(now);
            return Some(Action::Draft { leading: false });
        }
        if let Some(at) = self.full_at
            && at <= now
        {
            self.full_at = None;
            return Some(Action::Full);
        }
        None
    }

    pub fn reset(&mut self) {
        self.last_draft = None;
        self.trailing_at = None;
        self.full_at = None;
    }
}
