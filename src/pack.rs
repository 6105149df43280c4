// PSA pack: converts each split subproblem into its slice of the Walker
// alias table. The scalar variant runs one sequential sweep per thread;
// the subgroup variant shares the weight traffic of a sweep across the
// lanes of a subgroup.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_2d, dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::{AliasEntry, BufferView, SplitEntry};

/// Per-dispatch kernel parameters; owned by the buffer bundles.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct PackParams {
    pub n: u32,
    pub k_count: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct ScalarPackConfig {
    pub workgroup_size: u32,
    pub split_size: u32,
}

impl ScalarPackConfig {
    pub fn new(split_size: u32) -> Self {
        Self {
            workgroup_size: 512,
            split_size,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SubgroupPackConfig {
    pub split_size: u32,
    /// Lanes cooperating per split; a subgroup handles
    /// subgroup_size / subgroup_split splits. 1 degenerates to one thread
    /// per split.
    pub subgroup_split: u32,
    pub workgroup_size: u32,
}

impl SubgroupPackConfig {
    pub fn new(split_size: u32, subgroup_split: u32) -> Self {
        Self {
            split_size,
            subgroup_split,
            workgroup_size: 512,
        }
    }
}

pub struct PackBuffers {
    pub partition_indices: BufferView<u32>,
    pub heavy_count: BufferView<u32>,
    pub weights: BufferView<f32>,
    pub mean: BufferView<f32>,
    pub splits: BufferView<SplitEntry>,
    pub alias_table: BufferView<AliasEntry>,
    pub partition_elements: Option<BufferView<f32>>,
    pub(crate) params: BufferView<PackParams>,
}

impl PackBuffers {
    pub fn allocate(ctx: &GpuContext, n: u64, split_size: u32, with_elements: bool) -> Self {
        let k = n.div_ceil(split_size as u64);
        Self {
            partition_indices: BufferView::storage(&ctx.device, "pack partition indices", n),
            heavy_count: BufferView::storage(&ctx.device, "pack heavy count", 1),
            weights: BufferView::storage(&ctx.device, "pack weights", n),
            mean: BufferView::storage(&ctx.device, "pack mean", 1),
            splits: BufferView::storage(&ctx.device, "pack splits", k + 1),
            alias_table: BufferView::storage(&ctx.device, "alias table", n),
            partition_elements: with_elements
                .then(|| BufferView::storage(&ctx.device, "pack partition elements", n)),
            params: allocate_pack_params(ctx),
        }
    }
}

pub(crate) fn allocate_pack_params(ctx: &GpuContext) -> BufferView<PackParams> {
    BufferView::with_usage(
        &ctx.device,
        "pack params",
        1,
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    )
}

struct PackPipeline {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    split_size: u32,
    /// Threads dispatched per split.
    threads_per_split: u32,
    workgroup_size: u32,
    use_partition_elements: bool,
}

impl PackPipeline {
    fn build(
        ctx: &GpuContext,
        label: &'static str,
        sources: &[&str],
        consts: &[(&str, u32)],
        split_size: u32,
        threads_per_split: u32,
        workgroup_size: u32,
        use_partition_elements: bool,
    ) -> Self {
        let defines: &[&str] = if use_partition_elements {
            &["USE_PARTITION_ELEMENTS"]
        } else {
            &[]
        };
        let shader = ctx.compile_shader(label, sources, defines, consts);
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
                label: Some(label),
                entries: &entries,
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        Self {
            device: ctx.device.clone(),
            queue: ctx.queue.clone(),
            pipeline,
            layout,
            split_size,
            threads_per_split,
            workgroup_size,
            use_partition_elements,
        }
    }

    fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        buffers: &PackBuffers,
        n: u32,
    ) -> Result<()> {
        if self.use_partition_elements && buffers.partition_elements.is_none() {
            return Err(WrsError::config(
                "pipeline reads partition elements but no buffer was allocated",
            ));
        }
        let k = n.div_ceil(self.split_size);
        if buffers.splits.len() < k as u64 + 1 {
            return Err(WrsError::Capacity {
                what: "split count",
                got: k as u64 + 1,
                max: buffers.splits.len(),
            });
        }
        buffers
            .params
            .upload(&self.queue, &[PackParams { n, k_count: k }]);

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: buffers.params.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: buffers.partition_indices.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: buffers.heavy_count.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: buffers.weights.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: buffers.mean.binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: buffers.splits.binding(),
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
            label: Some(label),
            layout: &self.layout,
            entries: &entries,
        });
        buffers.alias_table.expect_compute_write();

        let threads = k
            .checked_mul(self.threads_per_split)
            .ok_or(WrsError::Capacity {
                what: "pack threads",
                got: k as u64 * self.threads_per_split as u64,
                max: u32::MAX as u64,
            })?;
        let (x, y) = dispatch_2d(dispatch_count(threads, self.workgroup_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}

pub struct ScalarPack {
    inner: PackPipeline,
}

impl ScalarPack {
    pub fn new(
        ctx: &GpuContext,
        config: ScalarPackConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        Ok(Self {
            inner: PackPipeline::build(
                ctx,
                "pack_scalar",
                &[include_str!("shaders/pack_scalar.wgsl")],
                &[("WORKGROUP_SIZE", config.workgroup_size)],
                config.split_size,
                1,
                config.workgroup_size,
                use_partition_elements,
            ),
        })
    }

    pub fn split_size(&self) -> u32 {
        self.inner.split_size
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PackBuffers,
        n: u32,
    ) -> Result<()> {
        self.inner.run(encoder, "scalar pack", buffers, n)
    }
}

pub struct SubgroupPack {
    inner: PackPipeline,
}

impl SubgroupPack {
    pub fn new(
        ctx: &GpuContext,
        config: SubgroupPackConfig,
        use_partition_elements: bool,
    ) -> Result<Self> {
        if !config.subgroup_split.is_power_of_two() {
            return Err(WrsError::config("subgroup_split must be a power of two"));
        }
        let sg = ctx.subgroup_size();
        if config.subgroup_split > sg {
            return Err(WrsError::feature(format!(
                "subgroup_split {} exceeds subgroup size {sg}",
                config.subgroup_split
            )));
        }
        let threads_per_split = config.subgroup_split;
        Ok(Self {
            inner: PackPipeline::build(
                ctx,
                "pack_subgroup",
                &[include_str!("shaders/pack_subgroup.wgsl")],
                &[
                    ("WORKGROUP_SIZE", config.workgroup_size),
                    ("SUBGROUP_SIZE", sg),
                    ("SUBGROUP_SPLIT", config.subgroup_split),
                ],
                config.split_size,
                threads_per_split,
                config.workgroup_size,
                use_partition_elements,
            ),
        })
    }

    pub fn split_size(&self) -> u32 {
        self.inner.split_size
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PackBuffers,
        n: u32,
    ) -> Result<()> {
        self.inner.run(encoder, "subgroup pack", buffers, n)
    }
}

/// Tagged union over the pack strategies.
#[derive(Copy, Clone, Debug)]
pub enum PackConfig {
    Scalar(ScalarPackConfig),
    Subgroup(SubgroupPackConfig),
}

impl PackConfig {
    pub fn split_size(&self) -> u32 {
        match self {
            PackConfig::Scalar(c) => c.split_size,
            PackConfig::Subgroup(c) => c.split_size,
        }
    }

    pub fn name(&self) -> String {
        match self {
            PackConfig::Scalar(c) => format!("ScalarPack-{}", c.split_size),
            PackConfig::Subgroup(c) => {
                format!("SubgroupPack-{}-{}", c.split_size, c.subgroup_split)
            }
        }
    }
}

pub enum Pack {
    Scalar(ScalarPack),
    Subgroup(SubgroupPack),
}

impl Pack {
    pub fn new(ctx: &GpuContext, config: &PackConfig, use_partition_elements: bool) -> Result<Self> {
        match config {
            PackConfig::Scalar(c) => Ok(Self::Scalar(ScalarPack::new(
                ctx,
                *c,
                use_partition_elements,
            )?)),
            PackConfig::Subgroup(c) => Ok(Self::Subgroup(SubgroupPack::new(
                ctx,
                *c,
                use_partition_elements,
            )?)),
        }
    }

    pub fn split_size(&self) -> u32 {
        match self {
            Pack::Scalar(p) => p.split_size(),
            Pack::Subgroup(p) => p.split_size(),
        }
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PackBuffers,
        n: u32,
    ) -> Result<()> {
        match self {
            Pack::Scalar(p) => p.run(encoder, buffers, n),
            Pack::Subgroup(p) => p.run(encoder, buffers, n),
        }
    }
}
