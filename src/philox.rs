// GPU-resident uniform RNG: Philox4x32-10, counter-based, so a sample's
// value depends only on (seed, position). Requests above u32 range are
// recorded as a chain of chunked dispatches reading their parameters at
// dynamic uniform offsets.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, WrsError};
use crate::gpu::{dynamic_uniform_entry, storage_entry, GpuContext};
use crate::layout::BufferView;

/// Samples per recorded dispatch; a multiple of four so the Philox quad
/// counters stay aligned across chunk boundaries.
pub(crate) const CHUNK_SAMPLES: u64 = 1 << 30;

/// Dynamic-offset stride mandated by the uniform alignment limit.
pub(crate) const PARAMS_STRIDE: u32 = 256;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct PhiloxChunkParams {
    pub seed: u32,
    pub count: u32,
    pub base_lo: u32,
    pub base_hi: u32,
    pub slot_base: u32,
    pub buffer_len: u32,
    pub _pad: [u32; 58],
}

#[derive(Copy, Clone, Debug)]
pub struct PhiloxConfig {
    pub workgroup_size: u32,
}

impl Default for PhiloxConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
        }
    }
}

pub struct PhiloxBuffers {
    /// Receives the uniforms; positions beyond `samples.len()` wrap, so a
    /// throughput run can stream any count through a bounded buffer.
    pub samples: BufferView<f32>,
    pub(crate) params: BufferView<PhiloxChunkParams>,
}

impl PhiloxBuffers {
    pub fn allocate(ctx: &GpuContext, sample_capacity: u64, max_samples: u64) -> Self {
        let chunks = max_samples.div_ceil(CHUNK_SAMPLES).max(1);
        Self {
            samples: BufferView::storage(&ctx.device, "philox samples", sample_capacity),
            params: BufferView::with_usage(
                &ctx.device,
                "philox params",
                chunks,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
        }
    }
}

pub struct Philox {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroup_size: u32,
}

impl Philox {
    pub fn new(ctx: &GpuContext, config: PhiloxConfig) -> Result<Self> {
        let shader = ctx.compile_shader(
            "philox",
            &[
                include_str!("shaders/philox_common.wgsl"),
                include_str!("shaders/philox.wgsl"),
            ],
            &[],
            &[("WORKGROUP_SIZE", config.workgroup_size)],
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("philox layout"),
                entries: &[dynamic_uniform_entry(0), storage_entry(1, false)],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("philox pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("philox"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(Self {
            device: ctx.device.clone(),
            queue: ctx.queue.clone(),
            pipeline,
            layout,
            workgroup_size: config.workgroup_size,
        })
    }

    /// Record the dispatches producing `sample_count` uniforms.
    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PhiloxBuffers,
        sample_count: u64,
        seed: u32,
    ) -> Result<()> {
        let chunks = chunk_params(
            sample_count,
            buffers.samples.len(),
            seed,
            buffers.params.len(),
        )?;
        buffers.params.upload(&self.queue, &chunks);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("philox bind group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: buffers.params.buffer(),
                        offset: 0,
                        size: wgpu::BufferSize::new(PARAMS_STRIDE as u64),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.samples.binding(),
                },
            ],
        });
        buffers.samples.expect_compute_write();

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("philox"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        for (index, chunk) in chunks.iter().enumerate() {
            pass.set_bind_group(0, &bind_group, &[index as u32 * PARAMS_STRIDE]);
            let threads = (chunk.count as u64).div_ceil(4);
            let workgroups = threads.div_ceil(self.workgroup_size as u64).min(65_535) as u32;
            pass.dispatch_workgroups(workgroups.max(1), 1, 1);
        }
        Ok(())
    }
}

/// Split a 64-bit request into u32-sized chunks with consistent 64-bit
/// sample positions and ring slots.
pub(crate) fn chunk_params(
    sample_count: u64,
    buffer_len: u64,
    seed: u32,
    max_chunks: u64,
) -> Result<Vec<PhiloxChunkParams>> {
    if buffer_len == 0 || buffer_len > u32::MAX as u64 {
        return Err(WrsError::Capacity {
            what: "sample buffer length",
            got: buffer_len,
            max: u32::MAX as u64,
        });
    }
    let needed = sample_count.div_ceil(CHUNK_SAMPLES).max(1);
    if needed > max_chunks {
        return Err(WrsError::Capacity {
            what: "sample chunks",
            got: needed,
            max: max_chunks,
        });
    }
    let mut chunks = Vec::with_capacity(needed as usize);
    let mut base = 0u64;
    loop {
        let count = (sample_count - base).min(CHUNK_SAMPLES) as u32;
        chunks.push(PhiloxChunkParams {
            seed,
            count,
            base_lo: base as u32,
            base_hi: (base >> 32) as u32,
            slot_base: (base % buffer_len) as u32,
            buffer_len: buffer_len as u32,
            _pad: [0; 58],
        });
        base += count as u64;
        if base >= sample_count {
            break;
        }
    }
    Ok(chunks)
}
