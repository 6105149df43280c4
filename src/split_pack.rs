// Split-pack stage of the PSA build: either the serial composition of the
// scalar split and a pack variant through an intermediate split buffer, or
// the fused inline kernel that computes boundaries online.

use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, storage_entry, uniform_entry, GpuContext};
use crate::layout::{AliasEntry, BufferView, SplitEntry};
use crate::pack::{allocate_pack_params, Pack, PackBuffers, PackConfig, PackParams};
use crate::split::{allocate_split_params, ScalarSplit, ScalarSplitBuffers, ScalarSplitConfig, SplitParams};

#[derive(Copy, Clone, Debug)]
pub struct SerialSplitPackConfig {
    pub split: ScalarSplitConfig,
    pub pack: PackConfig,
}

impl SerialSplitPackConfig {
    pub fn new(split: ScalarSplitConfig, pack: PackConfig) -> Self {
        Self { split, pack }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct InlineSplitPackConfig {
    pub workgroup_size: u32,
    pub split_size: u32,
}

impl InlineSplitPackConfig {
    pub fn new(split_size: u32) -> Self {
        Self {
            workgroup_size: 512,
            split_size,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum SplitPackConfig {
    Serial(SerialSplitPackConfig),
    Inline(InlineSplitPackConfig),
}

impl SplitPackConfig {
    pub fn split_size(&self) -> u32 {
        match self {
            SplitPackConfig::Serial(c) => c.split.split_size,
            SplitPackConfig::Inline(c) => c.split_size,
        }
    }

    pub fn name(&self) -> String {
        match self {
            SplitPackConfig::Serial(c) => {
                format!("Serial-ScalarSplit-{}-{}", c.split.split_size, c.pack.name())
            }
            SplitPackConfig::Inline(c) => format!("InlineSplitPack-{}", c.split_size),
        }
    }
}

pub enum SplitPackInternals {
    /// The fused kernel needs no intermediate storage.
    Inline {
        params: BufferView<SplitParams>,
    },
    Serial {
        splits: BufferView<SplitEntry>,
        split_params: BufferView<SplitParams>,
        pack_params: BufferView<PackParams>,
    },
}

pub struct SplitPackBuffers {
    pub weights: BufferView<f32>,
    pub partition_indices: BufferView<u32>,
    pub partition_prefix: BufferView<f32>,
    pub heavy_count: BufferView<u32>,
    pub mean: BufferView<f32>,
    pub alias_table: BufferView<AliasEntry>,
    pub partition_elements: Option<BufferView<f32>>,
    pub internals: SplitPackInternals,
}

impl SplitPackBuffers {
    pub fn allocate(
        ctx: &GpuContext,
        config: &SplitPackConfig,
        n: u64,
        with_elements: bool,
    ) -> Self {
        let internals = match config {
            SplitPackConfig::Inline(_) => SplitPackInternals::Inline {
                params: allocate_split_params(ctx),
            },
            SplitPackConfig::Serial(c) => {
                let k = n.div_ceil(c.split.split_size as u64);
                SplitPackInternals::Serial {
                    splits: BufferView::storage(&ctx.device, "splits", k + 1),
                    split_params: allocate_split_params(ctx),
                    pack_params: allocate_pack_params(ctx),
                }
            }
        };
        Self {
            weights: BufferView::storage(&ctx.device, "split-pack weights", n),
            partition_indices: BufferView::storage(&ctx.device, "split-pack indices", n),
            partition_prefix: BufferView::storage(&ctx.device, "split-pack prefix", n),
            heavy_count: BufferView::storage(&ctx.device, "split-pack heavy count", 1),
            mean: BufferView::storage(&ctx.device, "split-pack mean", 1),
            alias_table: BufferView::storage(&ctx.device, "alias table", n),
            partition_elements: with_elements
                .then(|| BufferView::storage(&ctx.device, "split-pack elements", n)),
            internals,
        }
    }
}

pub struct SerialSplitPack {
    split: ScalarSplit,
    pack: Pack,
}

impl SerialSplitPack {
    pub fn new(
        ctx: &GpuContext,
        config: SerialSplitPackConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        if config.split.split_size != config.pack.split_size() {
            return Err(WrsError::config("split and pack must agree on the split size"));
        }
        Ok(Self {
            split: ScalarSplit::new(ctx, config.split)?,
            pack: Pack::new(ctx, &config.pack, use_partition_elements)?,
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SplitPackBuffers,
        n: u32,
    ) -> Result<()> {
        let SplitPackInternals::Serial {
            splits,
            split_params,
            pack_params,
        } = &buffers.internals
        else {
            return Err(WrsError::Internal(
                "split-pack buffers allocated for a different variant".into(),
            ));
        };

        let split_buffers = ScalarSplitBuffers {
            partition_prefix: buffers.partition_prefix.clone(),
            heavy_count: buffers.heavy_count.clone(),
            mean: buffers.mean.clone(),
            splits: splits.clone(),
            params: split_params.clone(),
        };
        self.split.run(encoder, &split_buffers, n)?;
        splits.expect_compute_read(encoder);

        let pack_buffers = PackBuffers {
            partition_indices: buffers.partition_indices.clone(),
            heavy_count: buffers.heavy_count.clone(),
            weights: buffers.weights.clone(),
            mean: buffers.mean.clone(),
            splits: splits.clone(),
            alias_table: buffers.alias_table.clone(),
            partition_elements: buffers.partition_elements.clone(),
            params: pack_params.clone(),
        };
        self.pack.run(encoder, &pack_buffers, n)
    }
}

pub struct InlineSplitPack {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    workgroup_size: u32,
    split_size: u32,
    use_partition_elements: bool,
}

impl InlineSplitPack {
    pub fn new(
        ctx: &GpuContext,
        config: InlineSplitPackConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        if config.split_size < 2 {
            return Err(WrsError::config("split size must be at least 2"));
        }
        if config.workgroup_size < 2 {
            return Err(WrsError::config(
                "inline split-pack needs at least two threads per workgroup",
            ));
        }
        let defines: &[&str] = if use_partition_elements {
            &["USE_PARTITION_ELEMENTS"]
        } else {
            &[]
        };
        let shader = ctx.compile_shader(
            "splitpack_inline",
            &[include_str!("shaders/splitpack_inline.wgsl")],
            defines,
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("SPLIT_SIZE", config.split_size),
            ],
        );
        let mut entries = vec![
            uniform_entry(0),
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, true),
            storage_entry(4, true),
            storage_entry(5, true),
            storage_entry(6, false),
        ];
        if use_partition_elements {
            entries.push(storage_entry(7, true));
        }
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("inline-split-pack layout"),
                entries: &entries,
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("inline-split-pack pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("inline-split-pack"),
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
            use_partition_elements,
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SplitPackBuffers,
        n: u32,
    ) -> Result<()> {
        let SplitPackInternals::Inline { params } = &buffers.internals else {
            return Err(WrsError::Internal(
                "split-pack buffers allocated for a different variant".into(),
            ));
        };
        if self.use_partition_elements && buffers.partition_elements.is_none() {
            return Err(WrsError::config(
                "pipeline reads partition elements but no buffer was allocated",
            ));
        }
        let k = n.div_ceil(self.split_size);
        params.upload(&self.queue, &[SplitParams { k_count: k, n }]);

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: buffers.weights.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: buffers.partition_indices.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: buffers.partition_prefix.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: buffers.heavy_count.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: buffers.mean.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: buffers.alias_table.binding(),
            },
        ];
        if let Some(partition_elements) = &buffers.partition_elements {
            if self.use_partition_elements {
                entries.push(wgpu::BindGroupEntry {
                    binding: 7,
                    resource: partition_elements.binding(),
                });
            }
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("inline-split-pack bind group"),
            layout: &self.layout,
            entries: &entries,
        });
        buffers.alias_table.expect_compute_write();

        let splits_per_workgroup = self.workgroup_size - 1;
        let (x, y) = dispatch_2d(k.div_ceil(splits_per_workgroup));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("inline split-pack"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

pub enum SplitPack {
    Serial(SerialSplitPack),
    Inline(InlineSplitPack),
}

impl SplitPack {
    pub fn new(
        ctx: &GpuContext,
        config: &SplitPackConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        match config {
            SplitPackConfig::Serial(c) => Ok(Self::Serial(SerialSplitPack::new(
                ctx,
                *c,
                use_partition_elements,
            )?)),
            SplitPackConfig::Inline(c) => Ok(Self::Inline(InlineSplitPack::new(
                ctx,
                *c,
                use_partition_elements,
            )?)),
        }
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SplitPackBuffers,
        n: u32,
    ) -> Result<()> {
        match self {
            SplitPack::Serial(sp) => sp.run(encoder, buffers, n),
            SplitPack::Inline(sp) => sp.run(encoder, buffers, n),
        }
    }
}
