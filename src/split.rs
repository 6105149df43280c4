// PSA split: divides the partitioned input into K = ceil(n / split_size)
// packable subproblems of bounded work.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::{BufferView, SplitEntry};

/// Per-dispatch kernel parameters; owned by the buffer bundles.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct SplitParams {
    pub k_count: u32,
    pub n: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct ScalarSplitConfig {
    pub workgroup_size: u32,
    pub split_size: u32,
}

impl ScalarSplitConfig {
    pub fn new(split_size: u32) -> Self {
        Self {
            workgroup_size: 512,
            split_size,
        }
    }

    pub fn with_workgroup_size(split_size: u32, workgroup_size: u32) -> Self {
        Self {
            workgroup_size,
            split_size,
        }
    }
}

pub struct ScalarSplitBuffers {
    pub partition_prefix: BufferView<f32>,
    pub heavy_count: BufferView<u32>,
    pub mean: BufferView<f32>,
    /// K + 1 entries; entry 0 is the zero boundary, entry K the forced
    /// terminal boundary.
    pub splits: BufferView<SplitEntry>,
    pub(crate) params: BufferView<SplitParams>,
}

impl ScalarSplitBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, split_size: u32) -> Self {
        let k = n.div_ceil(split_size as u64);
        Self {
            partition_prefix: BufferView::storage(&ctx.device, "split partition prefix", n),
            heavy_count: BufferView::storage(&ctx.device, "split heavy count", 1),
            mean: BufferView::storage(&ctx.device, "split mean", 1),
            splits: BufferView::storage(&ctx.device, "splits", k + 1),
            params: allocate_split_params(ctx),
        }
    }
}

pub(crate) fn allocate_split_params(ctx: &GpuContext) -> BufferView<SplitParams> {
    BufferView::with_usage(
        &ctx.device,
        "split params",
        1,
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    )
}

pub struct ScalarSplit {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroup_size: u32,
    split_size: u32,
}

impl ScalarSplit {
    pub fn new(ctx: &GpuContext, config: ScalarSplitConfig) -> Result<Self> {
        if config.split_size < 2 {
            return Err(WrsError::config("split size must be at least 2"));
        }
        let shader = ctx.compile_shader(
            "split_scalar",
            &[include_str!("shaders/split_scalar.wgsl")],
            &[],
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("SPLIT_SIZE", config.split_size),
            ],
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("scalar-split layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, true),
                    storage_entry(4, false),
                ],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("scalar-split pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("scalar-split"),
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
            split_size: config.split_size,
        })
    }

    pub fn split_size(&self) -> u32 {
        self.split_size
    }

    pub fn split_count(&self, n: u32) -> u32 {
        n.div_ceil(self.split_size)
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &ScalarSplitBuffers,
        n: u32,
    ) -> Result<()> {
        let k = self.split_count(n);
        if buffers.splits.len() < k as u64 + 1 {
            return Err(WrsError::Capacity {
                what: "split count",
                got: k as u64 + 1,
                max: buffers.splits.len(),
            });
        }
        buffers
            .params
            .upload(&self.queue, &[SplitParams { k_count: k, n }]);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("scalar-split bind group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.partition_prefix.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.heavy_count.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.mean.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: buffers.splits.binding(),
                },
            ],
        });
        buffers.splits.expect_compute_write();

        let (x, y) = dispatch_2d(dispatch_count(k, self.workgroup_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("scalar split"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}
