use std::any::Any;
use std::sync::Arc;

use tracing::{debug, warn};

use lumen_core::canvas::{CanvasBinding, CanvasTexture};
use lumen_core::image_buf::ImageBuf;

use crate::context::GpuContext;
use crate::texture::{FORMAT, write_rgba};

/// A window surface the preview renders into. Must be created from the
/// same instance as `ctx`.
pub struct SurfaceCanvas {
    surface: wgpu::Surface<'static>,
    ctx: Arc<GpuContext>,
    config: Option<wgpu::SurfaceConfiguration>,
    width: u32,
    height: u32,
}

impl SurfaceCanvas {
    pub fn new(
        surface: wgpu::Surface<'static>,
        ctx: Arc<GpuContext>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            surface,
            ctx,
            config: None,
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl CanvasBinding for SurfaceCanvas {
    fn configure(&mut self) -> bool {
        let caps = self.surface.get_capabilities(&self.ctx.adapter);
        if !caps.formats.contains(&FORMAT) {
            warn!(formats = ?caps.formats, "surface does not support rgba8unorm");
            return false;
        }
        if !caps.usages.contains(wgpu::TextureUsages::COPY_DST) {
            warn!("surface textures cannot be copy targets");
            return false;
        }
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
            format: FORMAT,
            width: self.width,
            height: self.height,
            present_mode: wgpu::PresentMode::AutoVsync,
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        self.surface.configure(&self.ctx.device, &config);
        self.config = Some(config);
        debug!(width = self.width, height = self.height, "canvas configured");
        true
    }

    fn current_texture(&mut self) -> Option<Box<dyn CanvasTexture>> {
        let config = self.config.as_ref()?;
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                self.surface.configure(&self.ctx.device, config);
                match self.surface.get_current_texture() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "canvas texture unavailable after reconfigure");
                        return None;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to acquire canvas texture");
                return None;
            }
        };
        Some(Box::new(SurfaceFrame {
            frame,
            ctx: self.ctx.clone(),
        }))
    }

    fn update_dimensions(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
        let Some(config) = &mut self.config else {
            return;
        };
        if (config.width, config.height) != (self.width, self.height) {
            config.width = self.width;
            config.height = self.height;
            self.surface.configure(&self.ctx.device, config);
        }
    }

    fn unconfigure(&mut self) {
        self.config = None;
    }
}

/// One acquired surface texture.
pub struct SurfaceFrame {
    frame: wgpu::SurfaceTexture,
    ctx: Arc<GpuContext>,
}

impl SurfaceFrame {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.frame.texture
    }
}

impl CanvasTexture for SurfaceFrame {
    fn size(&self) -> (u32, u32) {
        (self.frame.texture.width(), self.frame.texture.height())
    }

    fn write_pixels(&mut self, image: &ImageBuf) -> anyhow::Result<()> {
        write_rgba(&self.ctx.queue, &self.frame.texture, image);
        Ok(())
    }

    fn present(self: Box<Self>) {
        self.frame.present();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
