// Device-wide prefix sums: the single-dispatch decoupled-lookback scan and
// the two-stage block-wise scan, behind one tagged `PrefixSum` front.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::block_scan::{
    BlockScan, BlockScanBuffers, BlockScanConfig, BlockScanVariant, ScanElement,
};
use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::BufferView;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct DecoupledScanParams {
    pub n: u32,
    /// Element count of the bound arrays. Consumed only by the reverse
    /// kernel, which mirrors logical index k onto buffer_size - 1 - k; the
    /// forward kernel carries the field but never reads it.
    pub buffer_size: u32,
}

/// Words per decoupled scan record (16 bytes) and for the counter header.
const SCAN_STATE_WORDS: u64 = 4;
const STATE_HEADER_WORDS: u64 = 4;

#[derive(Copy, Clone, Debug)]
pub struct DecoupledPrefixSumConfig {
    pub workgroup_size: u32,
    pub rows: u32,
    pub block_scan_variant: BlockScanVariant,
    pub parallel_lookback_depth: u32,
}

impl Default for DecoupledPrefixSumConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
            rows: 8,
            block_scan_variant: BlockScanVariant::RANKED_STRIDED,
            parallel_lookback_depth: 32,
        }
    }
}

impl DecoupledPrefixSumConfig {
    pub fn partition_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }

    pub(crate) fn validate(&self, ctx: &GpuContext) -> Result<()> {
        if self.parallel_lookback_depth > ctx.subgroup_size() {
            return Err(WrsError::feature(format!(
                "parallel lookback depth {} exceeds subgroup size {}",
                self.parallel_lookback_depth,
                ctx.subgroup_size()
            )));
        }
        if self.parallel_lookback_depth == 0 || self.parallel_lookback_depth > 32 {
            return Err(WrsError::config("parallel lookback depth must be in 1..=32"));
        }
        Ok(())
    }
}

pub struct DecoupledPrefixSumBuffers {
    pub elements: BufferView<f32>,
    pub prefix_sum: BufferView<f32>,
    /// Counter header plus one 16-byte record per block; zeroed by `run`.
    pub decoupled_states: BufferView<u32>,
    pub(crate) params: BufferView<DecoupledScanParams>,
}

impl DecoupledPrefixSumBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, partition_size: u32) -> Self {
        let block_count = n.div_ceil(partition_size as u64);
        Self {
            elements: BufferView::storage(&ctx.device, "decoupled-scan elements", n),
            prefix_sum: BufferView::storage(&ctx.device, "decoupled-scan prefix sum", n),
            decoupled_states: BufferView::storage(
                &ctx.device,
                "decoupled-scan states",
                STATE_HEADER_WORDS + SCAN_STATE_WORDS * block_count,
            ),
            params: BufferView::with_usage(
                &ctx.device,
                "decoupled-scan params",
                1,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
        }
    }
}

/// Single-dispatch decoupled-lookback prefix sum. The `reverse` flavor
/// scans in reverse memory order in place, which the partition's light
/// stream consumes directly.
pub struct DecoupledPrefixSum {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    partition_size: u32,
    reverse: bool,
}

impl DecoupledPrefixSum {
    pub fn new(ctx: &GpuContext, config: DecoupledPrefixSumConfig, reverse: bool) -> Result<Self> {
        config.validate(ctx)?;
        let mut defines = config.block_scan_variant.defines()?;
        if reverse {
            defines.push("REVERSE");
        }
        debug!(
            "decoupled prefix sum pipeline: {} wg={} rows={} depth={} reverse={}",
            config.block_scan_variant.name(),
            config.workgroup_size,
            config.rows,
            config.parallel_lookback_depth,
            reverse
        );

        let shader = ctx.compile_shader(
            "decoupled_scan",
            &[
                include_str!("shaders/scan_common.wgsl"),
                include_str!("shaders/decoupled_scan.wgsl"),
            ],
            &defines,
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
                label: Some("decoupled-scan layout"),
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
                label: Some("decoupled-scan pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("decoupled-scan"),
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
            partition_size: config.partition_size(),
            reverse,
        })
    }

    pub fn partition_size(&self) -> u32 {
        self.partition_size
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &DecoupledPrefixSumBuffers,
        n: u32,
    ) -> Result<()> {
        buffers.params.upload(
            &self.queue,
            &[DecoupledScanParams {
                n,
                buffer_size: buffers.elements.len() as u32,
            }],
        );
        // The batch counter and every record must read as INVALID before
        // any workgroup starts.
        buffers.decoupled_states.zero(encoder);
        buffers.decoupled_states.expect_compute_read(encoder);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("decoupled-scan bind group"),
            layout: &self.layout,
            entries: &[
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
                    resource: buffers.prefix_sum.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.decoupled_states.binding(),
                },
            ],
        });
        buffers.prefix_sum.expect_compute_write();

        let (x, y) = dispatch_2d(dispatch_count(n, self.partition_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(if self.reverse {
                "decoupled prefix sum (reverse)"
            } else {
                "decoupled prefix sum"
            }),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub(crate) struct CombineParams {
    pub n: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct BlockCombineConfig {
    pub workgroup_size: u32,
    /// Rows of the combine tile; must cover the element scan's full tile,
    /// i.e. rows * sequential_scan_length of that config.
    pub rows: u32,
}

impl BlockCombineConfig {
    pub fn for_element_scan(config: &BlockScanConfig) -> Self {
        Self {
            workgroup_size: config.workgroup_size,
            rows: config.rows * config.sequential_scan_length,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }
}

/// Adds the scanned per-block reduction onto each tile of the element scan.
pub struct BlockCombine<T: ScanElement> {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    block_size: u32,
    _marker: std::marker::PhantomData<T>,
}

pub struct BlockCombineBuffers<T: ScanElement> {
    pub block_offsets: BufferView<T>,
    pub prefix_sum: BufferView<T>,
    pub(crate) params: BufferView<CombineParams>,
}

impl<T: ScanElement> BlockCombine<T> {
    pub fn new(ctx: &GpuContext, config: BlockCombineConfig) -> Result<Self> {
        let shader = ctx.compile_shader(
            "block_combine",
            &[
                include_str!("shaders/scan_common.wgsl"),
                include_str!("shaders/block_combine.wgsl"),
            ],
            T::WGSL_DEFINES,
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("ROWS", config.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
            ],
        );
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("block-combine layout"),
                entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("block-combine pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("block-combine"),
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
            block_size: config.block_size(),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &BlockCombineBuffers<T>,
        n: u32,
    ) -> Result<()> {
        buffers.params.upload(&self.queue, &[CombineParams { n }]);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("block-combine bind group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.params.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.block_offsets.binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.prefix_sum.binding(),
                },
            ],
        });
        buffers.prefix_sum.expect_compute_write();

        let (x, y) = dispatch_2d(dispatch_count(n, self.block_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("block combine"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BlockWiseScanConfig {
    pub element_scan: BlockScanConfig,
    /// Root scan over the block reductions; must be EXCLUSIVE and fit the
    /// reduction array in a single block.
    pub block_scan: BlockScanConfig,
    pub combine: BlockCombineConfig,
}

impl Default for BlockWiseScanConfig {
    fn default() -> Self {
        let element_scan = BlockScanConfig::new(512, 2, BlockScanVariant::RAKING, 2, true);
        Self {
            element_scan,
            block_scan: BlockScanConfig::new(
                512,
                8,
                BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE,
                1,
                false,
            ),
            combine: BlockCombineConfig::for_element_scan(&element_scan),
        }
    }
}

impl BlockWiseScanConfig {
    pub fn new(element_scan: BlockScanConfig, block_scan: BlockScanConfig) -> Self {
        Self {
            element_scan,
            block_scan,
            combine: BlockCombineConfig::for_element_scan(&element_scan),
        }
    }

    pub fn max_element_count(&self) -> u64 {
        self.element_scan.block_size() as u64 * self.block_scan.block_size() as u64
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.block_scan.variant.contains(BlockScanVariant::EXCLUSIVE)
            || self.block_scan.variant.contains(BlockScanVariant::INCLUSIVE)
        {
            return Err(WrsError::config("block-wise root scan must be EXCLUSIVE"));
        }
        if !self.element_scan.write_block_reductions {
            return Err(WrsError::config("block-wise element scan must write block reductions"));
        }
        if self.combine.block_size() != self.element_scan.block_size() {
            return Err(WrsError::config("combine tile must match the element scan tile"));
        }
        Ok(())
    }
}

pub struct BlockWiseScanBuffers<T: ScanElement> {
    pub elements: BufferView<T>,
    pub reductions: BufferView<T>,
    pub prefix_sum: BufferView<T>,
    pub(crate) element_params: BufferView<crate::block_scan::BlockScanParams>,
    pub(crate) block_params: BufferView<crate::block_scan::BlockScanParams>,
    pub(crate) combine_params: BufferView<CombineParams>,
}

impl<T: ScanElement> BlockWiseScanBuffers<T> {
    pub fn allocate(ctx: &GpuContext, n: u64, element_block_size: u32) -> Self {
        let block_count = n.div_ceil(element_block_size as u64);
        Self {
            elements: BufferView::storage(&ctx.device, "block-wise-scan elements", n),
            reductions: BufferView::storage(&ctx.device, "block-wise-scan reductions", block_count),
            prefix_sum: BufferView::storage(&ctx.device, "block-wise-scan prefix sum", n),
            element_params: BlockScanBuffers::<T>::allocate_params(ctx),
            block_params: BlockScanBuffers::<T>::allocate_params(ctx),
            combine_params: BufferView::with_usage(
                &ctx.device,
                "block-combine params",
                1,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
        }
    }
}

/// Two-stage block-wise scan: element scan writing reductions, a single
/// block scanning the reductions in place, then the combine pass. Bounded
/// by `max_element_count`, but free of the lookback dependency chain.
pub struct BlockWiseScan<T: ScanElement> {
    element_scan: BlockScan<T>,
    block_scan: BlockScan<T>,
    combine: BlockCombine<T>,
    max_element_count: u64,
}

impl<T: ScanElement> BlockWiseScan<T> {
    pub fn new(ctx: &GpuContext, config: BlockWiseScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            element_scan: BlockScan::new(ctx, config.element_scan)?,
            block_scan: BlockScan::new(ctx, config.block_scan)?,
            combine: BlockCombine::new(ctx, config.combine)?,
            max_element_count: config.max_element_count(),
        })
    }

    pub fn max_element_count(&self) -> u64 {
        self.max_element_count
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &BlockWiseScanBuffers<T>,
        n: u32,
    ) -> Result<()> {
        if n as u64 > self.max_element_count {
            return Err(WrsError::Capacity {
                what: "n",
                got: n as u64,
                max: self.max_element_count,
            });
        }

        let element_buffers = BlockScanBuffers {
            elements: buffers.elements.clone(),
            prefix_sum: buffers.prefix_sum.clone(),
            reductions: Some(buffers.reductions.clone()),
            params: buffers.element_params.clone(),
        };
        self.element_scan.run(encoder, &element_buffers, n)?;

        // In-place exclusive scan over the block reductions.
        let block_count = dispatch_count(n, self.element_scan.block_size());
        buffers.reductions.expect_compute_read(encoder);
        let block_buffers = BlockScanBuffers {
            elements: buffers.reductions.clone(),
            prefix_sum: buffers.reductions.clone(),
            reductions: None,
            params: buffers.block_params.clone(),
        };
        self.block_scan.run(encoder, &block_buffers, block_count)?;

        buffers.reductions.expect_compute_read(encoder);
        let combine_buffers = BlockCombineBuffers {
            block_offsets: buffers.reductions.clone(),
            prefix_sum: buffers.prefix_sum.clone(),
            params: buffers.combine_params.clone(),
        };
        self.combine.run(encoder, &combine_buffers, n)
    }
}

/// Tagged-variant front over the two device-wide scans, mirroring the
/// configuration split.
#[derive(Copy, Clone, Debug)]
pub enum PrefixSumConfig {
    Decoupled(DecoupledPrefixSumConfig),
    BlockWise(BlockWiseScanConfig),
}

impl PrefixSumConfig {
    pub fn name(&self) -> String {
        match self {
            PrefixSumConfig::Decoupled(c) => format!(
                "Decoupled-{}-{}-{}",
                c.workgroup_size,
                c.rows,
                c.block_scan_variant.name()
            ),
            PrefixSumConfig::BlockWise(c) => format!(
                "BlockWise-{}-{}",
                c.element_scan.block_size(),
                c.block_scan.block_size()
            ),
        }
    }
}

pub enum PrefixSumBuffers {
    Decoupled(DecoupledPrefixSumBuffers),
    BlockWise(BlockWiseScanBuffers<f32>),
}

impl PrefixSumBuffers {
    pub fn allocate(ctx: &GpuContext, config: &PrefixSumConfig, n: u64) -> Self {
        match config {
            PrefixSumConfig::Decoupled(c) => {
                Self::Decoupled(DecoupledPrefixSumBuffers::allocate(ctx, n, c.partition_size()))
            }
            PrefixSumConfig::BlockWise(c) => Self::BlockWise(BlockWiseScanBuffers::allocate(
                ctx,
                n,
                c.element_scan.block_size(),
            )),
        }
    }

    pub fn elements(&self) -> &BufferView<f32> {
        match self {
            PrefixSumBuffers::Decoupled(b) => &b.elements,
            PrefixSumBuffers::BlockWise(b) => &b.elements,
        }
    }

    pub fn prefix_sum(&self) -> &BufferView<f32> {
        match self {
            PrefixSumBuffers::Decoupled(b) => &b.prefix_sum,
            PrefixSumBuffers::BlockWise(b) => &b.prefix_sum,
        }
    }
}

pub enum PrefixSum {
    Decoupled(DecoupledPrefixSum),
    BlockWise(BlockWiseScan<f32>),
}

impl PrefixSum {
    pub fn new(ctx: &GpuContext, config: &PrefixSumConfig) -> Result<Self> {
        match config {
            PrefixSumConfig::Decoupled(c) => {
                Ok(Self::Decoupled(DecoupledPrefixSum::new(ctx, *c, false)?))
            }
            PrefixSumConfig::BlockWise(c) => Ok(Self::BlockWise(BlockWiseScan::new(ctx, *c)?)),
        }
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PrefixSumBuffers,
        n: u32,
    ) -> Result<()> {
        match (self, buffers) {
            (PrefixSum::Decoupled(scan), PrefixSumBuffers::Decoupled(b)) => {
                scan.run(encoder, b, n)
            }
            (PrefixSum::BlockWise(scan), PrefixSumBuffers::BlockWise(b)) => scan.run(encoder, b, n),
            _ => Err(WrsError::Internal(
                "prefix sum buffers allocated for a different variant".into(),
            )),
        }
    }
}
