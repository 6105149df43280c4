// Prefix-partition: stable heavy/light split of the weights with the
// in-group exclusive weight prefix produced in the same pass. The output
// feeds the PSA split directly; heavy indices grow from the front of the
// index buffer, light indices from the back in reverse source order.

use bytemuck::{Pod, Zeroable};

use crate::block_scan::{BlockScan, BlockScanBuffers, BlockScanConfig, BlockScanVariant};
use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::BufferView;

/// Per-dispatch kernel parameters; owned by the buffer bundles.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct PartitionParams {
    pub n: u32,
}

/// Words per decoupled partition record (32 bytes) and the counter header.
const PARTITION_STATE_WORDS: u64 = 8;
const STATE_HEADER_WORDS: u64 = 4;

#[derive(Copy, Clone, Debug)]
pub struct DecoupledPrefixPartitionConfig {
    pub workgroup_size: u32,
    pub rows: u32,
    pub block_scan_variant: BlockScanVariant,
    pub parallel_lookback_depth: u32,
}

impl Default for DecoupledPrefixPartitionConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
            rows: 8,
            block_scan_variant: BlockScanVariant::RANKED_STRIDED,
            parallel_lookback_depth: 32,
        }
    }
}

impl DecoupledPrefixPartitionConfig {
    pub fn new(
        workgroup_size: u32,
        rows: u32,
        block_scan_variant: BlockScanVariant,
        parallel_lookback_depth: u32,
    ) -> Self {
        Self {
            workgroup_size,
            rows,
            block_scan_variant,
            parallel_lookback_depth,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }
}

pub struct DecoupledPrefixPartitionBuffers {
    pub elements: BufferView<f32>,
    pub pivot: BufferView<f32>,
    pub decoupled_states: BufferView<u32>,
    pub heavy_count: BufferView<u32>,
    pub partition_indices: BufferView<u32>,
    pub partition_prefix: BufferView<f32>,
    pub partition_elements: Option<BufferView<f32>>,
    pub(crate) params: BufferView<PartitionParams>,
}

impl DecoupledPrefixPartitionBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, block_size: u32, with_elements: bool) -> Self {
        Self {
            elements: BufferView::storage(&ctx.device, "partition elements", n),
            pivot: BufferView::storage(&ctx.device, "partition pivot", 1),
            decoupled_states: allocate_partition_states(ctx, n, block_size),
            heavy_count: BufferView::storage(&ctx.device, "heavy count", 1),
            partition_indices: BufferView::storage(&ctx.device, "partition indices", n),
            partition_prefix: BufferView::storage(&ctx.device, "partition prefix", n),
            partition_elements: with_elements
                .then(|| BufferView::storage(&ctx.device, "partition elements out", n)),
            params: allocate_partition_params(ctx),
        }
    }
}

pub(crate) fn allocate_partition_states(
    ctx: &GpuContext,
    n: u64,
    block_size: u32,
) -> BufferView<u32> {
    let block_count = n.div_ceil(block_size as u64);
    BufferView::storage(
        &ctx.device,
        "partition states",
        STATE_HEADER_WORDS + PARTITION_STATE_WORDS * block_count,
    )
}

pub(crate) fn allocate_partition_params(ctx: &GpuContext) -> BufferView<PartitionParams> {
    BufferView::with_usage(
        &ctx.device,
        "partition params",
        1,
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    )
}

/// Single-dispatch prefix-partition over the triple-aggregate lookback.
pub struct DecoupledPrefixPartition {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    block_size: u32,
    use_partition_elements: bool,
}

impl DecoupledPrefixPartition {
    pub fn new(
        ctx: &GpuContext,
        config: DecoupledPrefixPartitionConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        // The variant bits are validated for consistency even though the
        // partition kernel has a fixed staging strategy.
        config.block_scan_variant.defines()?;
        if config.parallel_lookback_depth > ctx.subgroup_size() {
            return Err(WrsError::feature(format!(
                "parallel lookback depth {} exceeds subgroup size {}",
                config.parallel_lookback_depth,
                ctx.subgroup_size()
            )));
        }

        let defines: &[&str] = if use_partition_elements {
            &["USE_PARTITION_ELEMENTS"]
        } else {
            &[]
        };
        let shader = ctx.compile_shader(
            "decoupled_partition",
            &[include_str!("shaders/decoupled_partition.wgsl")],
            defines,
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("ROWS", config.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
                ("LOOKBACK_DEPTH", config.parallel_lookback_depth),
            ],
        );

        let mut entries = vec![
            uniform_entry(0),
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, false),
            storage_entry(4, false),
            storage_entry(5, false),
            storage_entry(6, false),
        ];
        if use_partition_elements {
            entries.push(storage_entry(7, false));
        }
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("decoupled-partition layout"),
                entries: &entries,
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("decoupled-partition pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("decoupled-partition"),
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
            use_partition_elements,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &DecoupledPrefixPartitionBuffers,
        n: u32,
    ) -> Result<()> {
        if self.use_partition_elements && buffers.partition_elements.is_none() {
            return Err(WrsError::config(
                "pipeline scatters partition elements but no buffer was allocated",
            ));
        }
        buffers.params.upload(&self.queue, &[PartitionParams { n }]);
        buffers.decoupled_states.zero(encoder);
        buffers.decoupled_states.expect_compute_read(encoder);

        let mut entries = vec![
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
                resource: buffers.pivot.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: buffers.decoupled_states.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: buffers.heavy_count.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: buffers.partition_indices.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: buffers.partition_prefix.binding(),
            },
        ];
        if let Some(partition_elements) = &buffers.partition_elements {
            if self.use_partition_elements {
                entries.push(wgpu::BindGroupEntry {
                    binding: 7,
                    resource: partition_elements.binding(),
                });
                partition_elements.expect_compute_write();
            }
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("decoupled-partition bind group"),
            layout: &self.layout,
            entries: &entries,
        });
        buffers.heavy_count.expect_compute_write();
        buffers.partition_indices.expect_compute_write();
        buffers.partition_prefix.expect_compute_write();

        let (x, y) = dispatch_2d(dispatch_count(n, self.block_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("decoupled prefix partition"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PartitionBlockConfig {
    pub workgroup_size: u32,
    pub rows: u32,
}

impl PartitionBlockConfig {
    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BlockWisePrefixPartitionConfig {
    /// Pass 1: per-block classify + reduce.
    pub reduce: PartitionBlockConfig,
    /// Pass 2: exclusive scan over the per-block arrays; single block.
    pub block_scan: BlockScanConfig,
    /// Pass 3: classify + local scan + scatter. Must cover the same tile
    /// as the reduce pass.
    pub scan: PartitionBlockConfig,
}

impl Default for BlockWisePrefixPartitionConfig {
    fn default() -> Self {
        let tile = PartitionBlockConfig {
            workgroup_size: 512,
            rows: 8,
        };
        Self {
            reduce: tile,
            block_scan: BlockScanConfig::new(
                512,
                8,
                BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE,
                1,
                false,
            ),
            scan: tile,
        }
    }
}

impl BlockWisePrefixPartitionConfig {
    pub fn max_element_count(&self) -> u64 {
        self.reduce.block_size() as u64 * self.block_scan.block_size() as u64
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.block_scan.variant.contains(BlockScanVariant::EXCLUSIVE)
            || self.block_scan.variant.contains(BlockScanVariant::INCLUSIVE)
        {
            return Err(WrsError::config("block-wise partition root scan must be EXCLUSIVE"));
        }
        if self.reduce.block_size() != self.scan.block_size() {
            return Err(WrsError::config(
                "reduce and scatter passes must share one tile size",
            ));
        }
        Ok(())
    }
}

pub struct BlockWisePrefixPartitionBuffers {
    pub elements: BufferView<f32>,
    pub pivot: BufferView<f32>,
    pub block_heavy_count: BufferView<u32>,
    pub block_heavy_sum: BufferView<f32>,
    pub block_light_sum: BufferView<f32>,
    pub heavy_count: BufferView<u32>,
    pub partition_indices: BufferView<u32>,
    pub partition_prefix: BufferView<f32>,
    pub partition_elements: Option<BufferView<f32>>,
    pub(crate) params: BufferView<PartitionParams>,
    pub(crate) count_scan_params: BufferView<crate::block_scan::BlockScanParams>,
    pub(crate) heavy_scan_params: BufferView<crate::block_scan::BlockScanParams>,
    pub(crate) light_scan_params: BufferView<crate::block_scan::BlockScanParams>,
}

impl BlockWisePrefixPartitionBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, tile_size: u32, with_elements: bool) -> Self {
        let block_count = n.div_ceil(tile_size as u64);
        Self {
            elements: BufferView::storage(&ctx.device, "partition elements", n),
            pivot: BufferView::storage(&ctx.device, "partition pivot", 1),
            block_heavy_count: BufferView::storage(&ctx.device, "block heavy count", block_count),
            block_heavy_sum: BufferView::storage(&ctx.device, "block heavy sum", block_count),
            block_light_sum: BufferView::storage(&ctx.device, "block light sum", block_count),
            heavy_count: BufferView::storage(&ctx.device, "heavy count", 1),
            partition_indices: BufferView::storage(&ctx.device, "partition indices", n),
            partition_prefix: BufferView::storage(&ctx.device, "partition prefix", n),
            partition_elements: with_elements
                .then(|| BufferView::storage(&ctx.device, "partition elements out", n)),
            params: allocate_partition_params(ctx),
            count_scan_params: BlockScanBuffers::<u32>::allocate_params(ctx),
            heavy_scan_params: BlockScanBuffers::<f32>::allocate_params(ctx),
            light_scan_params: BlockScanBuffers::<f32>::allocate_params(ctx),
        }
    }
}

/// Three-pass partition: pre-reducing block aggregates and scanning them in
/// one small dispatch replaces the lookback chain, at the price of reading
/// the elements twice.
pub struct BlockWisePrefixPartition {
    device: wgpu::Device,
    queue: wgpu::Queue,
    reduce_pipeline: wgpu::ComputePipeline,
    reduce_layout: wgpu::BindGroupLayout,
    scatter_pipeline: wgpu::ComputePipeline,
    scatter_layout: wgpu::BindGroupLayout,
    count_scan: BlockScan<u32>,
    sum_scan: BlockScan<f32>,
    tile_size: u32,
    max_element_count: u64,
    use_partition_elements: bool,
}

impl BlockWisePrefixPartition {
    pub fn new(
        ctx: &GpuContext,
        config: BlockWisePrefixPartitionConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        config.validate()?;

        let reduce_shader = ctx.compile_shader(
            "partition_block_reduce",
            &[include_str!("shaders/partition_block_reduce.wgsl")],
            &[],
            &[
                ("WORKGROUP_SIZE", config.reduce.workgroup_size),
                ("ROWS", config.reduce.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
            ],
        );
        let reduce_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("partition-reduce layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, false),
                    storage_entry(4, false),
                    storage_entry(5, false),
                ],
            });
        let reduce_pl = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("partition-reduce pipeline layout"),
                bind_group_layouts: &[&reduce_layout],
                push_constant_ranges: &[],
            });
        let reduce_pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("partition-reduce"),
                layout: Some(&reduce_pl),
                module: &reduce_shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

        let defines: &[&str] = if use_partition_elements {
            &["USE_PARTITION_ELEMENTS"]
        } else {
            &[]
        };
        let scatter_shader = ctx.compile_shader(
            "partition_block_scatter",
            &[include_str!("shaders/partition_block_scatter.wgsl")],
            defines,
            &[
                ("WORKGROUP_SIZE", config.scan.workgroup_size),
                ("ROWS", config.scan.rows),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
            ],
        );
        let mut scatter_entries = vec![
            uniform_entry(0),
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, true),
            storage_entry(4, true),
            storage_entry(5, true),
            storage_entry(6, false),
            storage_entry(7, false),
            storage_entry(8, false),
        ];
        if use_partition_elements {
            scatter_entries.push(storage_entry(9, false));
        }
        let scatter_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("partition-scatter layout"),
                entries: &scatter_entries,
            });
        let scatter_pl = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("partition-scatter pipeline layout"),
                bind_group_layouts: &[&scatter_layout],
                push_constant_ranges: &[],
            });
        let scatter_pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("partition-scatter"),
                layout: Some(&scatter_pl),
                module: &scatter_shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

        Ok(Self {
            device: ctx.device.clone(),
            queue: ctx.queue.clone(),
            reduce_pipeline,
            reduce_layout,
            scatter_pipeline,
            scatter_layout,
            count_scan: BlockScan::new(ctx, config.block_scan)?,
            sum_scan: BlockScan::new(ctx, config.block_scan)?,
            tile_size: config.reduce.block_size(),
            max_element_count: config.max_element_count(),
            use_partition_elements,
        })
    }

    pub fn max_element_count(&self) -> u64 {
        self.max_element_count
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &BlockWisePrefixPartitionBuffers,
        n: u32,
    ) -> Result<()> {
        if n as u64 > self.max_element_count {
            return Err(WrsError::Capacity {
                what: "n",
                got: n as u64,
                max: self.max_element_count,
            });
        }
        if self.use_partition_elements && buffers.partition_elements.is_none() {
            return Err(WrsError::config(
                "pipeline scatters partition elements but no buffer was allocated",
            ));
        }
        buffers.params.upload(&self.queue, &[PartitionParams { n }]);
        let block_count = dispatch_count(n, self.tile_size);

        // Pass 1: per-block triple reduce.
        {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("partition-reduce bind group"),
                layout: &self.reduce_layout,
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
                        resource: buffers.pivot.binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: buffers.block_heavy_count.binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: buffers.block_heavy_sum.binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: buffers.block_light_sum.binding(),
                    },
                ],
            });
            let (x, y) = dispatch_2d(block_count);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("partition block reduce"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reduce_pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }

        // Pass 2: in-place exclusive scans over the three block arrays.
        buffers.block_heavy_count.expect_compute_read(encoder);
        buffers.block_heavy_sum.expect_compute_read(encoder);
        buffers.block_light_sum.expect_compute_read(encoder);
        let count_buffers = BlockScanBuffers {
            elements: buffers.block_heavy_count.clone(),
            prefix_sum: buffers.block_heavy_count.clone(),
            reductions: None,
            params: buffers.count_scan_params.clone(),
        };
        self.count_scan.run(encoder, &count_buffers, block_count)?;
        let heavy_buffers = BlockScanBuffers {
            elements: buffers.block_heavy_sum.clone(),
            prefix_sum: buffers.block_heavy_sum.clone(),
            reductions: None,
            params: buffers.heavy_scan_params.clone(),
        };
        self.sum_scan.run(encoder, &heavy_buffers, block_count)?;
        let light_buffers = BlockScanBuffers {
            elements: buffers.block_light_sum.clone(),
            prefix_sum: buffers.block_light_sum.clone(),
            reductions: None,
            params: buffers.light_scan_params.clone(),
        };
        self.sum_scan.run(encoder, &light_buffers, block_count)?;

        // Pass 3: classify again and scatter to final positions.
        let mut entries = vec![
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
                resource: buffers.pivot.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: buffers.block_heavy_count.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: buffers.block_heavy_sum.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: buffers.block_light_sum.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: buffers.heavy_count.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 7,
                resource: buffers.partition_indices.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 8,
                resource: buffers.partition_prefix.binding(),
            },
        ];
        if let Some(partition_elements) = &buffers.partition_elements {
            if self.use_partition_elements {
                entries.push(wgpu::BindGroupEntry {
                    binding: 9,
                    resource: partition_elements.binding(),
                });
                partition_elements.expect_compute_write();
            }
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("partition-scatter bind group"),
            layout: &self.scatter_layout,
            entries: &entries,
        });
        buffers.heavy_count.expect_compute_write();
        buffers.partition_indices.expect_compute_write();
        buffers.partition_prefix.expect_compute_write();

        let (x, y) = dispatch_2d(block_count);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("partition block scatter"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.scatter_pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

/// Tagged union over the partition strategies.
#[derive(Copy, Clone, Debug)]
pub enum PrefixPartitionConfig {
    Decoupled(DecoupledPrefixPartitionConfig),
    BlockWise(BlockWisePrefixPartitionConfig),
}

impl PrefixPartitionConfig {
    pub fn name(&self) -> String {
        match self {
            PrefixPartitionConfig::Decoupled(c) => {
                format!("Decoupled-{}-{}", c.workgroup_size, c.rows)
            }
            PrefixPartitionConfig::BlockWise(c) => format!(
                "BlockWise-{}-{}",
                c.reduce.block_size(),
                c.block_scan.block_size()
            ),
        }
    }
}

pub enum PrefixPartitionBuffers {
    Decoupled(DecoupledPrefixPartitionBuffers),
    BlockWise(BlockWisePrefixPartitionBuffers),
}

impl PrefixPartitionBuffers {
    pub fn allocate(
        ctx: &GpuContext,
        config: &PrefixPartitionConfig,
        n: u64,
        with_elements: bool,
    ) -> Self {
        match config {
            PrefixPartitionConfig::Decoupled(c) => Self::Decoupled(
                DecoupledPrefixPartitionBuffers::allocate(ctx, n, c.block_size(), with_elements),
            ),
            PrefixPartitionConfig::BlockWise(c) => Self::BlockWise(
                BlockWisePrefixPartitionBuffers::allocate(
                    ctx,
                    n,
                    c.reduce.block_size(),
                    with_elements,
                ),
            ),
        }
    }

    pub fn elements(&self) -> &BufferView<f32> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => &b.elements,
            PrefixPartitionBuffers::BlockWise(b) => &b.elements,
        }
    }

    pub fn pivot(&self) -> &BufferView<f32> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => &b.pivot,
            PrefixPartitionBuffers::BlockWise(b) => &b.pivot,
        }
    }

    pub fn heavy_count(&self) -> &BufferView<u32> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => &b.heavy_count,
            PrefixPartitionBuffers::BlockWise(b) => &b.heavy_count,
        }
    }

    pub fn partition_indices(&self) -> &BufferView<u32> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => &b.partition_indices,
            PrefixPartitionBuffers::BlockWise(b) => &b.partition_indices,
        }
    }

    pub fn partition_prefix(&self) -> &BufferView<f32> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => &b.partition_prefix,
            PrefixPartitionBuffers::BlockWise(b) => &b.partition_prefix,
        }
    }

    pub fn partition_elements(&self) -> Option<&BufferView<f32>> {
        match self {
            PrefixPartitionBuffers::Decoupled(b) => b.partition_elements.as_ref(),
            PrefixPartitionBuffers::BlockWise(b) => b.partition_elements.as_ref(),
        }
    }
}

pub enum PrefixPartition {
    Decoupled(DecoupledPrefixPartition),
    BlockWise(BlockWisePrefixPartition),
}

impl PrefixPartition {
    pub fn new(
        ctx: &GpuContext,
        config: &PrefixPartitionConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        match config {
            PrefixPartitionConfig::Decoupled(c) => Ok(Self::Decoupled(
                DecoupledPrefixPartition::new(ctx, *c, use_partition_elements)?,
            )),
            PrefixPartitionConfig::BlockWise(c) => Ok(Self::BlockWise(
                BlockWisePrefixPartition::new(ctx, *c, use_partition_elements)?,
            )),
        }
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PrefixPartitionBuffers,
        n: u32,
    ) -> Result<()> {
        match (self, buffers) {
            (PrefixPartition::Decoupled(p), PrefixPartitionBuffers::Decoupled(b)) => {
                p.run(encoder, b, n)
            }
            (PrefixPartition::BlockWise(p), PrefixPartitionBuffers::BlockWise(b)) => {
                p.run(encoder, b, n)
            }
            _ => Err(WrsError::Internal(
                "prefix partition buffers allocated for a different variant".into(),
            )),
        }
    }
}
