//! Progressive edit preview: turns the live edit state of one asset into
//! a displayed preview, drafting while the user drags and refining once
//! input settles.

pub mod analysis;
pub mod config;
pub mod delivery;
pub mod edit_store;
pub mod engine;
pub mod generation;
pub mod orchestrator;
pub mod scheduler;
pub mod selector;
pub mod source_cache;
pub mod state;
pub mod view;

#[cfg(test)]
mod testing;

pub use config::PreviewConfig;
pub use edit_store::EditStore;
pub use engine::{Backends, PreviewEngine, StoreEvents};
pub use generation::{Generation, StalenessGuard};
pub use orchestrator::{Plan, RenderPath};
pub use state::RenderState;
pub use view::{EngineStats, PreviewHandle, PreviewView, Quality, SourceStatus};
