// Constant-time alias table sampling, deterministic in (seed, s).

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, WrsError};
use crate::gpu::{dynamic_uniform_entry, storage_entry, GpuContext};
use crate::layout::{AliasEntry, BufferView};
use crate::philox::{CHUNK_SAMPLES, PARAMS_STRIDE};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct SampleChunkParams {
    pub n: u32,
    pub seed: u32,
    pub count: u32,
    pub base_lo: u32,
    pub base_hi: u32,
    pub slot_base: u32,
    pub buffer_len: u32,
    pub _pad: [u32; 57],
}

#[derive(Copy, Clone, Debug)]
pub struct SampleAliasTableConfig {
    /// Consecutive slots resolved per lane; 1 selects the plain kernel.
    pub cooperative_sample_size: u32,
    pub workgroup_size: u32,
}

impl Default for SampleAliasTableConfig {
    fn default() -> Self {
        Self {
            cooperative_sample_size: 1,
            workgroup_size: 512,
        }
    }
}

impl SampleAliasTableConfig {
    pub fn new(cooperative_sample_size: u32, workgroup_size: u32) -> Self {
        Self {
            cooperative_sample_size,
            workgroup_size,
        }
    }
}

pub struct SampleAliasTableBuffers {
    pub alias_table: BufferView<AliasEntry>,
    /// Output indices; positions beyond the buffer wrap around.
    pub samples: BufferView<u32>,
    pub(crate) params: BufferView<SampleChunkParams>,
}

impl SampleAliasTableBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, sample_capacity: u64, max_samples: u64) -> Self {
        let chunks = max_samples.div_ceil(CHUNK_SAMPLES).max(1);
        Self {
            alias_table: BufferView::storage(&ctx.device, "sampler alias table", n),
            samples: BufferView::storage(&ctx.device, "sampler output", sample_capacity),
            params: BufferView::with_usage(
                &ctx.device,
                "sampler params",
                chunks,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
        }
    }
}

pub struct SampleAliasTable {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroup_size: u32,
    cooperative_sample_size: u32,
}

impl SampleAliasTable {
    pub fn new(ctx: &GpuContext, config: SampleAliasTableConfig) -> Result<Self> {
        if config.cooperative_sample_size == 0 {
            return Err(WrsError::config("cooperative_sample_size must be nonzero"));
        }
        let cooperative = config.cooperative_sample_size > 1;
        let mut consts = vec![("WORKGROUP_SIZE", config.workgroup_size)];
        if cooperative {
            consts.push(("COOP_SAMPLES", config.cooperative_sample_size));
        }
        let defines: &[&str] = if cooperative { &["COOPERATIVE"] } else { &[] };
        let shader = ctx.compile_shader(
            "sample_alias",
            &[
                include_str!("shaders/philox_common.wgsl"),
                include_str!("shaders/sample_alias.wgsl"),
            ],
            defines,
            &consts,
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("sampler layout"),
                entries: &[
                    dynamic_uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, false),
                ],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("sampler pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("sample-alias-table"),
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
            cooperative_sample_size: config.cooperative_sample_size,
        })
    }

    /// Record the dispatches emitting `s` sample indices from the table of
    /// `n` entries.
    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SampleAliasTableBuffers,
        n: u32,
        s: u64,
        seed: u32,
    ) -> Result<()> {
        if n == 0 {
            return Err(WrsError::config("sampling from an empty alias table"));
        }
        let raw = crate::philox::chunk_params(s, buffers.samples.len(), seed, buffers.params.len())?;
        let chunks: Vec<SampleChunkParams> = raw
            .iter()
            .map(|c| SampleChunkParams {
                n,
                seed: c.seed,
                count: c.count,
                base_lo: c.base_lo,
                base_hi: c.base_hi,
                slot_base: c.slot_base,
                buffer_len: c.buffer_len,
                _pad: [0; 57],
            })
            .collect();
        buffers.params.upload(&self.queue, &chunks);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sampler bind group"),
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
                    resource: buffers.alias_table.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.samples.binding(),
                },
            ],
        });
        buffers.samples.expect_compute_write();

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("sample alias table"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        for (index, chunk) in chunks.iter().enumerate() {
            pass.set_bind_group(0, &bind_group, &[index as u32 * PARAMS_STRIDE]);
            let threads =
                (chunk.count as u64).div_ceil(self.cooperative_sample_size as u64);
            let workgroups = threads.div_ceil(self.workgroup_size as u64).min(65_535) as u32;
            pass.dispatch_workgroups(workgroups.max(1), 1, 1);
        }
        Ok(())
    }
}
