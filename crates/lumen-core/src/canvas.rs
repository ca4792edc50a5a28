use std::any::Any;

use crate::image_buf::ImageBuf;

/// A GPU-backed display surface the preview can be rendered into directly.
pub trait CanvasBinding: Send {
    /// Prepare the surface for presentation. Returns false when the surface
    /// cannot be used (unsupported format, lost device).
    fn configure(&mut self) -> bool;

    /// The texture for the next frame, sized to the last
    /// [`CanvasBinding::update_dimensions`] call.
    fn current_texture(&mut self) -> Option<Box<dyn CanvasTexture>>;

    fn update_dimensions(&mut self, width: u32, height: u32);

    fn unconfigure(&mut self);
}

/// One frame's worth of canvas texture.
pub trait CanvasTexture: Send + Any {
    fn size(&self) -> (u32, u32);

    /// Upload CPU-side pixels into the texture. Used when the frame was
    /// produced by the CPU backend.
    fn write_pixels(&mut self, image: &ImageBuf) -> anyhow::Result<()>;

    /// Show the frame.
    fn present(self: Box<Self>);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
