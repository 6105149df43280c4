// Block-level scan family: the building block every device-wide primitive
// in this crate composes.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::error::{Result, WrsError};
use crate::gpu::{dispatch_count, storage_entry, uniform_entry, GpuContext};
use crate::layout::BufferView;

/// Marker for the element types the scan kernels are generated for.
pub trait ScanElement: Pod + Default + std::fmt::Debug {
    const WGSL_DEFINES: &'static [&'static str];
    const NAME: &'static str;
}

impl ScanElement for f32 {
    const WGSL_DEFINES: &'static [&'static str] = &[];
    const NAME: &'static str = "f32";
}

impl ScanElement for u32 {
    const WGSL_DEFINES: &'static [&'static str] = &["USE_UINT"];
    const NAME: &'static str = "u32";
}

/// Bit-set of scan strategy flags, combinable with `|`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockScanVariant(u32);

impl BlockScanVariant {
    pub const RAKING: Self = Self(1);
    pub const RANKED: Self = Self(2);
    pub const SUBGROUP_SCAN_SHFL: Self = Self(4);
    pub const EXCLUSIVE: Self = Self(8);
    pub const INCLUSIVE: Self = Self(16);
    pub const STRIDED: Self = Self(32);
    pub const RANKED_STRIDED: Self = Self(2 | 32);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn name(self) -> &'static str {
        if self.contains(Self::RAKING) {
            "RAKING"
        } else if self.contains(Self::RANKED_STRIDED) {
            "RANKED-STRIDED"
        } else if self.contains(Self::RANKED) {
            "RANKED"
        } else {
            "UNNAMED"
        }
    }

    /// Shader defines for this variant. Fails on combinations the kernels
    /// do not support.
    pub(crate) fn defines(self) -> Result<Vec<&'static str>> {
        let mut defines = Vec::new();
        if self.contains(Self::RAKING) && self.contains(Self::RANKED) {
            return Err(WrsError::config("RAKING and RANKED are mutually exclusive"));
        }
        if self.contains(Self::RANKED) {
            defines.push("RANKED");
        } else if self.contains(Self::RAKING) {
            defines.push("RAKING");
        } else {
            return Err(WrsError::config("block scan variant needs RAKING or RANKED"));
        }
        if self.contains(Self::STRIDED) {
            if self.contains(Self::RAKING) {
                return Err(WrsError::config("STRIDED | RAKING is not supported"));
            }
            defines.push("STRIDED");
        }
        if self.contains(Self::SUBGROUP_SCAN_SHFL) {
            defines.push("SUBGROUP_SCAN_SHFL");
        }
        // INCLUSIVE overrides EXCLUSIVE when both bits are set.
        if self.contains(Self::EXCLUSIVE) && !self.contains(Self::INCLUSIVE) {
            defines.push("EXCLUSIVE");
        }
        Ok(defines)
    }
}

impl std::ops::BitOr for BlockScanVariant {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BlockScanConfig {
    pub workgroup_size: u32,
    pub rows: u32,
    pub variant: BlockScanVariant,
    pub sequential_scan_length: u32,
    pub write_block_reductions: bool,
}

impl Default for BlockScanConfig {
    fn default() -> Self {
        Self {
            workgroup_size: 512,
            rows: 8,
            variant: BlockScanVariant::RAKING,
            sequential_scan_length: 1,
            write_block_reductions: true,
        }
    }
}

impl BlockScanConfig {
    pub fn new(
        workgroup_size: u32,
        rows: u32,
        variant: BlockScanVariant,
        sequential_scan_length: u32,
        write_block_reductions: bool,
    ) -> Self {
        Self {
            workgroup_size,
            rows,
            variant,
            sequential_scan_length,
            write_block_reductions,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.workgroup_size * self.rows * self.sequential_scan_length
    }

    pub(crate) fn validate(&self, ctx: &GpuContext) -> Result<()> {
        if self.workgroup_size == 0 || self.rows == 0 || self.sequential_scan_length == 0 {
            return Err(WrsError::config("workgroup_size, rows and sequential_scan_length must be nonzero"));
        }
        let sg = ctx.subgroup_size();
        if self.workgroup_size.div_ceil(sg) > sg {
            return Err(WrsError::config(format!(
                "workgroup size {} needs more than one scan level of subgroup partials at subgroup size {sg}",
                self.workgroup_size
            )));
        }
        Ok(())
    }
}

/// Per-dispatch kernel parameters; owned by the buffer bundles.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BlockScanParams {
    pub n: u32,
}

pub struct BlockScanBuffers<T: ScanElement> {
    pub elements: BufferView<T>,
    pub prefix_sum: BufferView<T>,
    /// Per-block inclusive tile totals; required when the pipeline was
    /// built with `write_block_reductions`.
    pub reductions: Option<BufferView<T>>,
    pub(crate) params: BufferView<BlockScanParams>,
}

impl<T: ScanElement> BlockScanBuffers<T> {
    pub fn allocate(ctx: &GpuContext, n: u64, block_count: u64, with_reductions: bool) -> Self {
        let reductions = with_reductions
            .then(|| BufferView::storage(&ctx.device, "block-scan reductions", block_count));
        Self {
            elements: BufferView::storage(&ctx.device, "block-scan elements", n),
            prefix_sum: BufferView::storage(&ctx.device, "block-scan prefix sum", n),
            reductions,
            params: Self::allocate_params(ctx),
        }
    }

    pub(crate) fn allocate_params(ctx: &GpuContext) -> BufferView<BlockScanParams> {
        BufferView::with_usage(
            &ctx.device,
            "block-scan params",
            1,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )
    }
}

/// One compute pipeline per (config, element type); `run` records a single
/// dispatch covering `ceil(n / block_size)` tiles.
pub struct BlockScan<T: ScanElement> {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    block_size: u32,
    write_reductions: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: ScanElement> BlockScan<T> {
    pub fn new(ctx: &GpuContext, config: BlockScanConfig) -> Result<Self> {
        config.validate(ctx)?;
        let mut defines = config.variant.defines()?;
        defines.extend_from_slice(T::WGSL_DEFINES);
        if config.write_block_reductions {
            defines.push("WRITE_REDUCTIONS");
        }
        debug!(
            "block scan pipeline: {} {} wg={} rows={} seq={}",
            T::NAME,
            config.variant.name(),
            config.workgroup_size,
            config.rows,
            config.sequential_scan_length
        );

        let shader = ctx.compile_shader(
            "block_scan",
            &[
                include_str!("shaders/scan_common.wgsl"),
                include_str!("shaders/block_scan.wgsl"),
            ],
            &defines,
            &[
                ("WORKGROUP_SIZE", config.workgroup_size),
                ("ROWS", config.rows),
                ("SEQ_SCAN_LENGTH", config.sequential_scan_length),
                ("SUBGROUP_SIZE", ctx.subgroup_size()),
            ],
        );

        let mut entries = vec![
            uniform_entry(0),
            // Matches the kernel's read_write input binding; in-place root
            // scans alias it with the output.
            storage_entry(1, false),
            storage_entry(2, false),
        ];
        if config.write_block_reductions {
            entries.push(storage_entry(3, false));
        }
        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("block-scan layout"),
                entries: &entries,
            });
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("block-scan pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("block-scan"),
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
            write_reductions: config.write_block_reductions,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &BlockScanBuffers<T>,
        n: u32,
    ) -> Result<()> {
        if self.write_reductions && buffers.reductions.is_none() {
            return Err(WrsError::config(
                "pipeline writes block reductions but no reductions buffer was allocated",
            ));
        }
        buffers.params.upload(&self.queue, &[BlockScanParams { n }]);

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
                resource: buffers.prefix_sum.binding(),
            },
        ];
        if self.write_reductions {
            if let Some(reductions) = &buffers.reductions {
                entries.push(wgpu::BindGroupEntry {
                    binding: 3,
                    resource: reductions.binding(),
                });
                reductions.expect_compute_write();
            }
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("block-scan bind group"),
            layout: &self.layout,
            entries: &entries,
        });
        buffers.prefix_sum.expect_compute_write();

        let (x, y) = crate::gpu::dispatch_2d(dispatch_count(n, self.block_size));
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("block scan"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }
}
