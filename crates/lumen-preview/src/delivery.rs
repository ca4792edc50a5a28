//! Output delivery: either a bound canvas the final pass is written into,
//! or a bitmap handed to the UI. Every bitmap and acquired canvas texture
//! holds a lease on a [`ResourceTracker`] so leaks are observable.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use lumen_core::canvas::{CanvasBinding, CanvasTexture};
use lumen_core::image_buf::ImageBuf;

#[derive(Clone, Debug, Default)]
pub struct ResourceTracker {
    live: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self) -> Lease {
        self.live.fetch_add(1, Ordering::SeqCst);
        Lease(self.live.clone())
    }

    /// Bitmaps and canvas textures not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Lease(Arc<AtomicUsize>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A rendered frame ready for display. Released when the last handle
/// drops.
#[derive(Debug)]
pub struct Bitmap {
    image: Arc<ImageBuf>,
    _lease: Lease,
}

impl Bitmap {
    pub fn image(&self) -> &Arc<ImageBuf> {
        &self.image
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.image.width, self.image.height)
    }
}

/// Canvas texture with a lease attached. Downcasts reach the wrapped
/// texture so backends can find their native type.
pub struct TrackedTexture {
    inner: Box<dyn CanvasTexture>,
    _lease: Lease,
}

impl CanvasTexture for TrackedTexture {
    fn size(&self) -> (u32, u32) {
        self.inner.size()
    }

    fn write_pixels(&mut self, image: &ImageBuf) -> anyhow::Result<()> {
        self.inner.write_pixels(image)
    }

    fn present(self: Box<Self>) {
        let TrackedTexture { inner, _lease } = *self;
        inner.present();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self.inner.as_any_mut()
    }
}

pub struct OutputDelivery {
    canvas: Option<Box<dyn CanvasBinding>>,
    bitmap: Option<Arc<Bitmap>>,
    tracker: ResourceTracker,
}

impl OutputDelivery {
    pub fn new(tracker: ResourceTracker) -> Self {
        Self {
            canvas: None,
            bitmap: None,
            tracker,
        }
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Take ownership of a canvas. Returns false, leaving bitmap delivery
    /// in place, when the canvas cannot be configured.
    pub fn bind(&mut self, mut canvas: Box<dyn CanvasBinding>) -> bool {
        self.unbind();
        if !canvas.configure() {
            warn!("canvas could not be configured, keeping bitmap delivery");
            return false;
        }
        debug!("canvas bound");
        self.canvas = Some(canvas);
        true
    }

    pub fn unbind(&mut self) {
        if let Some(mut canvas) = self.canvas.take() {
            canvas.unconfigure();
            debug!("canvas unbound");
        }
    }

    pub fn is_direct(&self) -> bool {
        self.canvas.is_some()
    }

    /// Resize the canvas to `dims` and acquire its next texture.
    pub fn acquire(&mut self, dims: (u32, u32)) -> Option<TrackedTexture> {
        let canvas = self.canvas.as_mut()?;
        canvas.update_dimensions(dims.0, dims.1);
        let inner = canvas.current_texture()?;
        Some(TrackedTexture {
            inner,
            _lease: self.tracker.lease(),
        })
    }

    pub fn present(&mut self, texture: TrackedTexture) {
        Box::new(texture).present();
    }

    /// Replace the current bitmap. The previous one is released first.
    pub fn commit_bitmap(&mut self, image: Arc<ImageBuf>) -> Arc<Bitmap> {
        self.bitmap = None;
        let bitmap = Arc::new(Bitmap {
            image,
            _lease: self.tracker.lease(),
        });
        self.bitmap = Some(bitmap.clone());
        bitmap
    }

    pub fn release_bitmap(&mut self) {
        self.bitmap = None;
    }

    pub fn teardown(&mut self) {
        self.release_bitmap();
        self.unbind();
    }
}
