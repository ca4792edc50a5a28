pub mod analysis;
pub mod asset;
pub mod backend;
pub mod canvas;
pub mod codec;
pub mod color;
pub mod cpu;
pub mod error;
pub mod image_buf;
pub mod pipeline;
pub mod snapshot;

pub use backend::{BackendKind, BackendProvider, ComputeBackend, EncodeFormat};
pub use cpu::CpuBackend;
pub use error::{BackendError, RenderError, SourceError};
pub use image_buf::{ImageBuf, PixelLayout};
pub use snapshot::EditSnapshot;
