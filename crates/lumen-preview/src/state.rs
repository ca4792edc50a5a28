use serde::Serialize;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    #[default]
    Idle,
    Interacting,
    Refining,
    Complete,
}

impl RenderState {
    pub const ALL: [RenderState; 4] = [
        RenderState::Idle,
        RenderState::Interacting,
        RenderState::Refining,
        RenderState::Complete,
    ];

    pub fn can_transition_to(self, to: RenderState) -> bool {
        use RenderState::*;
        matches!(
            (self, to),
            (Idle, Interacting)
                | (Complete, Idle)
                | (Complete, Interacting)
                | (Interacting, Interacting)
                | (Interacting, Refining)
                | (Refining, Complete)
                | (Refining, Interacting)
        )
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal render state transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: RenderState,
    pub to: RenderState,
}

/// Draft/full scheduling state. Rejected transitions leave the state as it
/// was and are counted.
#[derive(Debug, Default)]
pub struct RenderStateMachine {
    state: RenderState,
    rejected: u64,
}

impl RenderStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn transition(&mut self, to: RenderState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            let err = IllegalTransition {
                from: self.state,
                to,
            };
            self.rejected += 1;
            warn!(from = ?err.from, to = ?err.to, "rejected render state transition");
            return Err(err);
        }
        debug!(from = ?self.state, ?to, "render state");
        self.state = to;
        Ok(())
    }

    /// Any edit mutation.
    pub fn on_input_event(&mut self) -> Result<(), IllegalTransition> {
        self.transition(RenderState::Interacting)
    }

    pub fn on_quiet_period_elapsed(&mut self) -> Result<(), IllegalTransition> {
        self.transition(RenderState::Refining)
    }

    /// Refining -> Complete -> Idle, with no observable dwell in Complete.
    pub fn on_full_render_complete(&mut self) -> Result<(), IllegalTransition> {
        self.transition(RenderState::Complete)?;
        self.transition(RenderState::Idle)
    }

    /// Back to Idle without going through the table (asset switch).
    pub fn reset(&mut self) {
        self.state = RenderState::Idle;
    }
}
