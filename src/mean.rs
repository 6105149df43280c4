// Mean reduction, the pivot source for the prefix-partition.
//
// The atomic variant accumulates normalized tile sums into a single scalar
// and is the cheaper choice; the decoupled variant walks the same lookback
// chain as the scan and avoids cross-workgroup atomic contention on the
// result.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::BufferView;

/// Per-dispatch kernel parameters; owned by the buffer bundles.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct MeanParams {
    pub n: u32,
}

const SCAN_STATE_WORDS: u64 = 4;
const STATE_HEADER_WORDS: u64 = 4;

#[derive(Copy, Clone, Debug)]
pub struct AtomicMeanConfig {
    pub workgroup_size: u32,
    pub rows: u32,
}

impl Default for AtomicMeanConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
            rows: 8,
        }
    }
}

impl AtomicMeanConfig {
    pub fn new(workgroup_size: u32, rows: u32) -> Self {
        Self {
            workgroup_size,
            rows,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DecoupledMeanConfig {
    pub workgroup_size: u32,
    pub rows: u32,
    pub parallel_lookback_depth: u32,
}

impl Default for DecoupledMeanConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
            rows: 4,
            parallel_lookback_depth: 32,
        }
    }
}

impl DecoupledMeanConfig {
    pub fn new(workgroup_size: u32, rows: u32) -> Self {
        Self {
            workgroup_size,
            rows,
            parallel_lookback_depth: 32,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }
}

pub struct AtomicMeanBuffers {
    pub elements: BufferView<f32>,
    pub mean: BufferView<f32>,
    pub(crate) params: BufferView<MeanParams>,
}

impl AtomicMeanBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64) -> Self {
        Self {
            elements: BufferView::storage(&ctx.device, "mean elements", n),
            mean: BufferView::storage(&ctx.device, "mean", 1),
            params: allocate_mean_params(ctx),
        }
    }
}

pub struct DecoupledMeanBuffers {
    pub elements: BufferView<f32>,
    pub mean: BufferView<f32>,
    pub decoupled_states: BufferView<u32>,
    pub(crate) params: BufferView<MeanParams>,
}

impl DecoupledMeanBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, block_size: u32) -> Self {
        Self {
            elements: BufferView::storage(&ctx.device, "mean elements", n),
            mean: BufferView::storage(&ctx.device, "mean", 1),
            decoupled_states: allocate_mean_states(ctx, n, block_size),
            params: allocate_mean_params(ctx),
        }
    }
}

pub(crate) fn allocate_mean_states(ctx: &GpuContext, n: u64, block_size: u32) -> BufferView<u32> {
    let block_count = n.div_ceil(block_size as u64);
    BufferView::storage(
        &ctx.device,
        "mean states",
        STATE_HEADER_WORDS + SCAN_STATE_WORDS * block_count,
    )
}

pub(crate) fn allocate_mean_params(ctx: &GpuContext) -> BufferView<MeanParams> {
    BufferView::with_usage(
        &ctx.device,
        "mean params",
        1,
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    )
}

struct MeanPipeline {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    block_size: u32,
}

impl MeanPipeline {
    fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        entries: &[wgpu::BindGroupEntry],
        n: u32,
    ) {
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.layout,
            entries,
        });
        let (x, y) = dispatch_2d(dispatch_count(n, self.block_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
    }
}

pub struct AtomicMean {
    inner: MeanPipeline,
}

impl AtomicMean {
    pub fn new(ctx: &GpuContext, config: AtomicMeanConfig) -> Result<Self> {
        let shader = ctx.compile_shader(
            "mean_atomic",
            &[
                include_str!("shaders/scan_common.wgsl"),
                include_str!("shaders/mean_atomic.wgsl"),
            ],
            &[],
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("ROWS", config.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
            ],
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("atomic-mean layout"),
                entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("atomic-mean pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("atomic-mean"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(Self {
            inner: MeanPipeline {
                device: ctx.device.clone(),
                queue: ctx.queue.clone(),
                pipeline,
                layout,
                block_size: config.block_size(),
            },
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &AtomicMeanBuffers,
        n: u32,
    ) -> Result<()> {
        if n == 0 {
            return Err(WrsError::config("mean of zero elements"));
        }
        buffers.params.upload(&self.inner.queue, &[MeanParams { n }]);
        buffers.mean.zero(encoder);
        buffers.mean.expect_compute_read(encoder);
        buffers.mean.expect_compute_write();
        self.inner.dispatch(
            encoder,
            "atomic mean",
            &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.elements.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.mean.binding(),
                },
            ],
            n,
        );
        Ok(())
    }
}

pub struct DecoupledMean {
    inner: MeanPipeline,
}

impl DecoupledMean {
    pub fn new(ctx: &GpuContext, config: DecoupledMeanConfig) -> Result<Self> {
        if config.parallel_lookback_depth > ctx.subgroup_size() {
            return Err(WrsError::feature(format!(
                "parallel lookback depth {} exceeds subgroup size {}",
                config.parallel_lookback_depth,
                ctx.subgroup_size()
            )));
        }
        let shader = ctx.compile_shader(
            "mean_decoupled",
            &[
                include_str!("shaders/scan_common.wgsl"),
                include_str!("shaders/mean_decoupled.wgsl"),
            ],
            &[],
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("ROWS", config.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
                ("LOOKBACK_DEPTH", config.parallel_lookback_depth),
            ],
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("decoupled-mean layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, false),
                    storage_entry(3, false),
                ],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("decoupled-mean pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("decoupled-mean"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        Ok(Self {
            inner: MeanPipeline {
                device: ctx.device.clone(),
                queue: ctx.queue.clone(),
                pipeline,
                layout,
                block_size: config.block_size(),
            },
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &DecoupledMeanBuffers,
        n: u32,
    ) -> Result<()> {
        if n == 0 {
            return Err(WrsError::config("mean of zero elements"));
        }
        buffers.params.upload(&self.inner.queue, &[MeanParams { n }]);
        buffers.decoupled_states.zero(encoder);
        buffers.decoupled_states.expect_compute_read(encoder);
        buffers.mean.expect_compute_write();
        self.inner.dispatch(
            encoder,
            "decoupled mean",
            &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.elements.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.mean.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.decoupled_states.binding(),
                },
            ],
            n,
        );
        Ok(())
    }
}

/// Tagged union over the mean strategies.
#[derive(Copy, Clone, Debug)]
pub enum MeanConfig {
    Atomic(AtomicMeanConfig),
    Decoupled(DecoupledMeanConfig),
}

impl MeanConfig {
    pub fn name(&self) -> String {
        match self {
            MeanConfig::Atomic(c) => format!("Atomic-{}-{}", c.workgroup_size, c.rows),
            MeanConfig::Decoupled(c) => format!("Decoupled-{}-{}", c.workgroup_size, c.rows),
        }
    }
}

pub enum MeanBuffers {
    Atomic(AtomicMeanBuffers),
    Decoupled(DecoupledMeanBuffers),
}

impl MeanBuffers {
    pub fn allocate(ctx: &GpuContext, config: &MeanConfig, n: u64) -> Self {
        match config {
            MeanConfig::Atomic(_) => Self::Atomic(AtomicMeanBuffers::allocate(ctx, n)),
            MeanConfig::Decoupled(c) => {
                Self::Decoupled(DecoupledMeanBuffers::allocate(ctx, n, c.block_size()))
            }
        }
    }

    pub fn elements(&self) -> &BufferView<f32> {
        match self {
            MeanBuffers::Atomic(b) => &b.elements,
            MeanBuffers::Decoupled(b) => &b.elements,
        }
    }

    pub fn mean(&self) -> &BufferView<f32> {
        match self {
            MeanBuffers::Atomic(b) => &b.mean,
            MeanBuffers::Decoupled(b) => &b.mean,
        }
    }
}

pub enum Mean {
    Atomic(AtomicMean),
    Decoupled(DecoupledMean),
}

impl Mean {
    pub fn new(ctx: &GpuContext, config: &MeanConfig) -> Result<Self> {
        match config {
            MeanConfig::Atomic(c) => Ok(Self::Atomic(AtomicMean::new(ctx, *c)?)),
            MeanConfig::Decoupled(c) => Ok(Self::Decoupled(DecoupledMean::new(ctx, *c)?)),
        }
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &MeanBuffers,
        n: u32,
    ) -> Result<()> {
        match (self, buffers) {
            (Mean::Atomic(mean), MeanBuffers::Atomic(b)) => mean.run(encoder, b, n),
            (Mean::Decoupled(mean), MeanBuffers::Decoupled(b)) => mean.run(encoder, b, n),
            _ => Err(WrsError::Internal(
                "mean buffers allocated for a different variant".into(),
            )),
        }
    }
}
