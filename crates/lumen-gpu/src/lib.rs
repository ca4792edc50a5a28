pub mod backend;
pub mod canvas;
pub mod context;
pub mod kernel;
pub mod pipeline;
pub mod texture;

pub use backend::{GpuBackend, GpuProvider};
pub use canvas::{SurfaceCanvas, SurfaceFrame};
pub use context::GpuContext;
