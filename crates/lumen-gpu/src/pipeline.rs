use anyhow::{Result, ensure};
use bytemuck::{Pod, Zeroable};
use tracing::debug;

use lumen_core::analysis::{Analysis, ClippingMap, Histogram, NUM_BINS};
use lumen_core::error::BackendError;
use lumen_core::pipeline::StageOp;
use lumen_core::pipeline::modules::{DevelopParams, curve_lut};
use lumen_core::snapshot::{Adjustments, MaskStack, PARAM_EPS, Rotation, ToneCurve};

use crate::context::GpuContext;
use crate::kernel::{Kernel, KernelSet};
use crate::texture::{GpuTexture, map_buffer};

const WORKGROUP_SIZE: u32 = 16;

const FLAG_ADJUST: u32 = 1;
const FLAG_TONE: u32 = 2;
const FLAG_CURVE: u32 = 4;
const FLAG_VIBRANCE: u32 = 8;
const FLAG_SATURATION: u32 = 16;

/// One compute dispatch. Adjust and tone curve share a single pass.
#[derive(Debug)]
pub enum Pass<'a> {
    Rotate(&'a Rotation),
    Develop {
        adjust: Option<&'a Adjustments>,
        curve: Option<&'a ToneCurve>,
    },
    Masks(&'a MaskStack),
}

/// Group stage ops into dispatches. Crop has no GPU kernel.
pub fn plan_passes(ops: &[StageOp], max_masks: usize) -> Result<Vec<Pass<'_>>, BackendError> {
    let mut passes: Vec<Pass<'_>> = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            StageOp::Rotate(r) => passes.push(Pass::Rotate(r)),
            StageOp::Crop(_) => return Err(BackendError::Unsupported { op: "crop" }),
            StageOp::Adjust(a) => passes.push(Pass::Develop {
                adjust: Some(a),
                curve: None,
            }),
            StageOp::ToneCurve(c) => match passes.last_mut() {
                Some(Pass::Develop { curve: slot @ None, .. }) => *slot = Some(c),
                _ => passes.push(Pass::Develop {
                    adjust: None,
                    curve: Some(c),
                }),
            },
            StageOp::Masks(m) => {
                if m.active_count() > max_masks {
                    return Err(BackendError::Unsupported { op: "apply_masks" });
                }
                passes.push(Pass::Masks(m));
            }
        }
    }
    Ok(passes)
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RotateUniform {
    src_size: [f32; 2],
    dst_size: [f32; 2],
    sin_cos: [f32; 2],
    _pad: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DevelopUniform {
    gains: [f32; 4],
    vibrance: f32,
    saturation: f32,
    flags: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MasksUniform {
    size: [f32; 2],
    count: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GpuMask {
    geom: [f32; 4],
    shape: [f32; 4],
    adj0: [f32; 4],
    adj1: [f32; 4],
}

/// Linear masks first, then radial, matching the CPU evaluation order.
fn pack_masks(stack: &MaskStack) -> Vec<GpuMask> {
    let linear = stack.active_linear().map(|m| GpuMask {
        geom: [m.start.x, m.start.y, m.end.x, m.end.y],
        shape: [m.feather, 0.0, 0.0, 0.0],
        adj0: [
            m.adjustments.exposure,
            m.adjustments.contrast,
            m.adjustments.highlights,
            m.adjustments.shadows,
        ],
        adj1: [
            m.adjustments.temperature,
            m.adjustments.tint,
            m.adjustments.saturation,
            0.0,
        ],
    });
    let radial = stack.active_radial().map(|m| {
        let (sin, cos) = m.rotation.to_radians().sin_cos();
        GpuMask {
            geom: [m.center.x, m.center.y, m.radius_x, m.radius_y],
            shape: [sin, cos, m.feather, if m.invert { 1.0 } else { 0.0 }],
            adj0: [
                m.adjustments.exposure,
                m.adjustments.contrast,
                m.adjustments.highlights,
                m.adjustments.shadows,
            ],
            adj1: [
                m.adjustments.temperature,
                m.adjustments.tint,
                m.adjustments.saturation,
                1.0,
            ],
        }
    });
    linear.chain(radial).collect()
}

/// GPU processing pipeline that applies edits via compute shaders.
pub struct GpuPipeline {
    kernels: KernelSet,
}

impl GpuPipeline {
    pub fn new(ctx: &GpuContext) -> Self {
        Self {
            kernels: KernelSet::build(&ctx.device),
        }
    }

    /// Record one pass reading `input` into a new texture.
    pub fn encode_pass(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &GpuTexture,
        pass: &Pass<'_>,
    ) -> Result<GpuTexture> {
        match pass {
            Pass::Rotate(r) => self.encode_rotate(ctx, encoder, input, r),
            Pass::Develop { adjust, curve } => {
                self.encode_develop(ctx, encoder, input, *adjust, *curve)
            }
            Pass::Masks(m) => self.encode_masks(ctx, encoder, input, m),
        }
    }

    fn encode_rotate(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &GpuTexture,
        rotation: &Rotation,
    ) -> Result<GpuTexture> {
        let (w, h) = rotation.output_dims(input.width, input.height);
        debug!(degrees = rotation.total_degrees(), w, h, "GPU rotate");

        let output = GpuTexture::create_storage(&ctx.device, w, h, "rotate_out");
        let (sin, cos) = rotation.total_degrees().to_radians().sin_cos();
        let uniform = RotateUniform {
            src_size: [input.width as f32, input.height as f32],
            dst_size: [w as f32, h as f32],
            sin_cos: [sin, cos],
            _pad: [0.0; 2],
        };
        let params_buf = uniform_buffer(ctx, "rotate_params", bytemuck::bytes_of(&uniform));

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("rotate_bg"),
            layout: self.kernels.layout(Kernel::Rotate),
            entries: &[
                texture_binding(0, &input.view),
                texture_binding(1, &output.view),
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.kernels.pipeline(Kernel::Rotate);
        dispatch(encoder, "rotate_pass", pipeline, &bind_group, w, h);
        Ok(output)
    }

    fn encode_develop(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &GpuTexture,
        adjust: Option<&Adjustments>,
        curve: Option<&ToneCurve>,
    ) -> Result<GpuTexture> {
        debug!(
            adjust = adjust.is_some(),
            curve = curve.is_some(),
            "GPU develop"
        );
        let output =
            GpuTexture::create_storage(&ctx.device, input.width, input.height, "develop_out");

        let mut uniform = DevelopUniform {
            gains: [1.0; 4],
            vibrance: 0.0,
            saturation: 0.0,
            flags: 0,
            _pad: 0,
        };
        // Runtime-sized arrays need at least one element even when unused.
        let mut tone: Vec<f32> = vec![0.0, 1.0];
        if let Some(adj) = adjust {
            let params = DevelopParams::from_adjustments(adj);
            uniform.flags |= FLAG_ADJUST;
            uniform.gains = [params.gains[0], params.gains[1], params.gains[2], 1.0];
            if params.vibrance.abs() > PARAM_EPS {
                uniform.flags |= FLAG_VIBRANCE;
                uniform.vibrance = params.vibrance;
            }
            if params.saturation.abs() > PARAM_EPS {
                uniform.flags |= FLAG_SATURATION;
                uniform.saturation = params.saturation;
            }
            if let Some(lut) = params.tone_lut {
                uniform.flags |= FLAG_TONE;
                tone = lut.to_vec();
            }
        }
        let curve_table: Vec<u32> = match curve {
            Some(c) => {
                uniform.flags |= FLAG_CURVE;
                curve_lut(c).iter().map(|&v| v as u32).collect()
            }
            None => vec![0],
        };

        let params_buf = uniform_buffer(ctx, "develop_params", bytemuck::bytes_of(&uniform));
        let tone_buf = storage_buffer(ctx, "tone_lut", bytemuck::cast_slice(&tone));
        let curve_buf = storage_buffer(ctx, "curve_lut", bytemuck::cast_slice(&curve_table));

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("develop_bg"),
            layout: self.kernels.layout(Kernel::Develop),
            entries: &[
                texture_binding(0, &input.view),
                texture_binding(1, &output.view),
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: tone_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: curve_buf.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.kernels.pipeline(Kernel::Develop);
        dispatch(
            encoder,
            "develop_pass",
            pipeline,
            &bind_group,
            input.width,
            input.height,
        );
        Ok(output)
    }

    fn encode_masks(
        &self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        input: &GpuTexture,
        stack: &MaskStack,
    ) -> Result<GpuTexture> {
        let packed = pack_masks(stack);
        debug!(count = packed.len(), "GPU masks");
        ensure!(!packed.is_empty(), "mask pass with no active masks");

        let output = GpuTexture::create_storage(&ctx.device, input.width, input.height, "masks_out");
        let uniform = MasksUniform {
            size: [input.width as f32, input.height as f32],
            count: packed.len() as u32,
            _pad: 0,
        };
        let params_buf = uniform_buffer(ctx, "masks_params", bytemuck::bytes_of(&uniform));
        let masks_buf = storage_buffer(ctx, "masks", bytemuck::cast_slice(&packed));

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("masks_bg"),
            layout: self.kernels.layout(Kernel::Masks),
            entries: &[
                texture_binding(0, &input.view),
                texture_binding(1, &output.view),
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: masks_buf.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.kernels.pipeline(Kernel::Masks);
        dispatch(
            encoder,
            "masks_pass",
            pipeline,
            &bind_group,
            input.width,
            input.height,
        );
        Ok(output)
    }

    /// Histogram and clipping map of an uploaded texture, one submission.
    pub fn histogram(&self, ctx: &GpuContext, input: &GpuTexture) -> Result<Analysis> {
        let pixels = input.width as u64 * input.height as u64;
        let clip_size = pixels * 4;
        ensure!(
            clip_size <= ctx.device.limits().max_storage_buffer_binding_size as u64,
            "clip buffer of {clip_size} bytes exceeds the storage binding limit"
        );

        let bins_size = (NUM_BINS * 3 * 4) as u64;
        let bins_buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("histogram_bins"),
            size: bins_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let clip_buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("clip_bits"),
            size: clip_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let bins_staging = staging_buffer(ctx, "histogram_bins_staging", bins_size);
        let clip_staging = staging_buffer(ctx, "clip_bits_staging", clip_size);

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("histogram_bg"),
            layout: self.kernels.layout(Kernel::Histogram),
            entries: &[
                texture_binding(0, &input.view),
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bins_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: clip_buf.as_entire_binding(),
                },
            ],
        });

        let pipeline = self.kernels.pipeline(Kernel::Histogram);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("histogram_encoder"),
            });
        dispatch(
            &mut encoder,
            "histogram_pass",
            pipeline,
            &bind_group,
            input.width,
            input.height,
        );
        encoder.copy_buffer_to_buffer(&bins_buf, 0, &bins_staging, 0, bins_size);
        encoder.copy_buffer_to_buffer(&clip_buf, 0, &clip_staging, 0, clip_size);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        let bins_bytes = map_buffer(&ctx.device, &bins_staging)?;
        let clip_bytes = map_buffer(&ctx.device, &clip_staging)?;
        let bins: &[u32] = bytemuck::cast_slice(&bins_bytes);
        let clip: &[u32] = bytemuck::cast_slice(&clip_bytes);

        let mut r = [0u32; NUM_BINS];
        let mut g = [0u32; NUM_BINS];
        let mut b = [0u32; NUM_BINS];
        r.copy_from_slice(&bins[..NUM_BINS]);
        g.copy_from_slice(&bins[NUM_BINS..2 * NUM_BINS]);
        b.copy_from_slice(&bins[2 * NUM_BINS..]);

        Ok(Analysis {
            histogram: Histogram::from_bins(r, g, b),
            clipping: ClippingMap::from_bits(
                input.width,
                input.height,
                clip.iter().map(|&v| v as u8).collect(),
            ),
        })
    }
}

fn dispatch(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    width: u32,
    height: u32,
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(
        width.div_ceil(WORKGROUP_SIZE),
        height.div_ceil(WORKGROUP_SIZE),
        1,
    );
}

fn uniform_buffer(ctx: &GpuContext, label: &str, bytes: &[u8]) -> wgpu::Buffer {
    let buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes.len() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    ctx.queue.write_buffer(&buf, 0, bytes);
    buf
}

fn storage_buffer(ctx: &GpuContext, label: &str, bytes: &[u8]) -> wgpu::Buffer {
    let buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: bytes.len() as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    ctx.queue.write_buffer(&buf, 0, bytes);
    buf
}

fn staging_buffer(ctx: &GpuContext, label: &str, size: u64) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

fn texture_binding(binding: u32, view: &wgpu::TextureView) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::TextureView(view),
    }
}
