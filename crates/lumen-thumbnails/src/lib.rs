pub mod cache;
pub mod generator;
pub mod store;

pub use cache::RepresentationCache;
pub use store::{FsAssetStore, Outcome};
