use anyhow::Result;
use lumen_core::image_buf::{ImageBuf, PixelLayout};

pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// A GPU texture holding 8-bit RGBA image data.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuTexture {
    /// Upload an ImageBuf. RGB buffers are widened to opaque RGBA.
    pub fn from_image_buf(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        buf: &ImageBuf,
        label: &str,
    ) -> Self {
        let tex = Self::create(
            device,
            buf.width,
            buf.height,
            label,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
        );
        write_rgba(queue, &tex.texture, buf);
        tex
    }

    /// Create an empty texture for use as a compute shader output.
    pub fn create_storage(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Self {
        Self::create(
            device,
            width,
            height,
            label,
            wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        )
    }

    fn create(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        label: &str,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            width,
            height,
        }
    }

    pub fn size(&self) -> wgpu::Extent3d {
        extent(self.width, self.height)
    }
}

pub fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

/// Write `buf` into the top-left corner of `texture`, cropping to the
/// texture size.
pub fn write_rgba(queue: &wgpu::Queue, texture: &wgpu::Texture, buf: &ImageBuf) {
    let width = buf.width.min(texture.width());
    let height = buf.height.min(texture.height());
    if width == 0 || height == 0 {
        return;
    }
    let rgba = buf.to_rgba8();
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &rgba,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(buf.width * 4),
            rows_per_image: Some(buf.height),
        },
        extent(width, height),
    );
}

/// Staging buffer a texture is copied into for readback. Rows are padded
/// to `COPY_BYTES_PER_ROW_ALIGNMENT`.
pub struct Readback {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
}

impl Readback {
    /// Record a copy of `tex` into a new staging buffer on `encoder`.
    pub fn record(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        tex: &GpuTexture,
    ) -> Self {
        let unpadded = tex.width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = unpadded.div_ceil(align) * align;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture_download_staging"),
            size: (padded_row * tex.height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(tex.height),
                },
            },
            tex.size(),
        );

        Self {
            buffer,
            width: tex.width,
            height: tex.height,
            padded_row,
        }
    }

    /// Map the staging buffer (blocking) and unpack it into `layout`.
    pub fn finish(self, device: &wgpu::Device, layout: PixelLayout) -> Result<ImageBuf> {
        let bytes = map_buffer(device, &self.buffer)?;
        let row = (self.width * 4) as usize;
        let mut rgba = Vec::with_capacity(row * self.height as usize);
        for chunk in bytes.chunks(self.padded_row as usize).take(self.height as usize) {
            rgba.extend_from_slice(&chunk[..row]);
        }
        ImageBuf::from_rgba8(self.width, self.height, layout, rgba)
    }
}

/// Map a `MAP_READ` buffer and copy its contents out.
pub fn map_buffer(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
    let (sender, receiver) = std::sync::mpsc::channel();
    buffer
        .slice(..)
        .map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| anyhow::anyhow!("GPU poll error: {e}"))?;
    receiver
        .recv()
        .map_err(|_| anyhow::anyhow!("buffer map cancelled"))??;

    let mapped = buffer.slice(..).get_mapped_range();
    let out = mapped.to_vec();
    drop(mapped);
    buffer.unmap();
    Ok(out)
}
