//! The fixed set of compute kernels, each built once with its bind group
//! layout when the backend comes up.

use tracing::debug;

use crate::texture::FORMAT;

const COMMON: &str = include_str!("../shaders/common.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Rotate,
    Develop,
    Masks,
    Histogram,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [
        Kernel::Rotate,
        Kernel::Develop,
        Kernel::Masks,
        Kernel::Histogram,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Kernel::Rotate => "rotate",
            Kernel::Develop => "develop",
            Kernel::Masks => "masks",
            Kernel::Histogram => "histogram",
        }
    }

    fn source(self) -> String {
        match self {
            Kernel::Rotate => include_str!("../shaders/rotate.wgsl").to_owned(),
            Kernel::Develop => [COMMON, include_str!("../shaders/develop.wgsl")].concat(),
            Kernel::Masks => [COMMON, include_str!("../shaders/masks.wgsl")].concat(),
            Kernel::Histogram => include_str!("../shaders/histogram.wgsl").to_owned(),
        }
    }

    /// Image kernels read binding 0, write binding 1 and take their params
    /// at binding 2. Extra storage buffers follow.
    fn layout_entries(self) -> Vec<wgpu::BindGroupLayoutEntry> {
        match self {
            Kernel::Rotate => image_entries().to_vec(),
            Kernel::Develop => {
                let mut entries = image_entries().to_vec();
                entries.extend([storage_entry(3, true), storage_entry(4, true)]);
                entries
            }
            Kernel::Masks => {
                let mut entries = image_entries().to_vec();
                entries.push(storage_entry(3, true));
                entries
            }
            Kernel::Histogram => vec![
                image_entries()[0],
                storage_entry(1, false),
                storage_entry(2, false),
            ],
        }
    }
}

struct Compiled {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

pub struct KernelSet {
    compiled: Vec<Compiled>,
}

impl KernelSet {
    /// Compile every kernel. Run inside an error scope to catch shader
    /// validation failures at init.
    pub fn build(device: &wgpu::Device) -> Self {
        let compiled = Kernel::ALL
            .iter()
            .map(|&kernel| compile(device, kernel))
            .collect();
        Self { compiled }
    }

    fn get(&self, kernel: Kernel) -> &Compiled {
        // ALL is in declaration order, so the discriminant is the index.
        &self.compiled[kernel as usize]
    }

    pub fn layout(&self, kernel: Kernel) -> &wgpu::BindGroupLayout {
        &self.get(kernel).layout
    }

    pub fn pipeline(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        &self.get(kernel).pipeline
    }
}

fn compile(device: &wgpu::Device, kernel: Kernel) -> Compiled {
    let name = kernel.label();
    debug!(kernel = name, "compiling compute kernel");
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(name),
        source: wgpu::ShaderSource::Wgsl(kernel.source().into()),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{name}_bgl")),
        entries: &kernel.layout_entries(),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{name}_layout")),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    });
    Compiled { layout, pipeline }
}

fn image_entries() -> [wgpu::BindGroupLayoutEntry; 3] {
    [
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: FORMAT,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 2,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        },
    ]
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
