// End-to-end alias table construction by the partitioned sweep:
// Mean -> PrefixPartition(pivot = mean) -> SplitPack.
//
// The PSA object owns only pipelines; every device buffer lives in
// `PsaBuffers`, allocated once and reused across dispatches. Stage
// buffers are assembled per run from shared views, so intermediates
// (mean, heavy count, partition arrays) can also be wired to other
// pipelines by the caller.

use tracing::debug_span;

use crate::error::{Result, WrsError};
use crate::gpu::GpuContext;
use crate::layout::{AliasEntry, BufferView};
use crate::block_scan::BlockScanBuffers;
use crate::mean::{
    allocate_mean_params, allocate_mean_states, AtomicMeanBuffers, DecoupledMeanBuffers, Mean,
    MeanBuffers, MeanConfig, MeanParams,
};
use crate::prefix_partition::{
    allocate_partition_params, allocate_partition_states, BlockWisePrefixPartitionBuffers,
    DecoupledPrefixPartitionBuffers, PartitionParams, PrefixPartition, PrefixPartitionBuffers,
    PrefixPartitionConfig,
};
use crate::split_pack::{SplitPack, SplitPackBuffers, SplitPackConfig, SplitPackInternals};

#[derive(Copy, Clone, Debug)]
pub struct PsaConfig {
    pub mean: MeanConfig,
    pub prefix_partition: PrefixPartitionConfig,
    pub split_pack: SplitPackConfig,
    pub use_partition_elements: bool,
}

impl PsaConfig {
    pub fn new(
        mean: MeanConfig,
        prefix_partition: PrefixPartitionConfig,
        split_pack: SplitPackConfig,
        use_partition_elements: bool,
    ) -> Self {
        Self {
            mean,
            prefix_partition,
            split_pack,
            use_partition_elements,
        }
    }

    pub fn split_size(&self) -> u32 {
        self.split_pack.split_size()
    }

    pub fn name(&self) -> String {
        format!(
            "PSA-[{}]-[{}]-[{}]",
            self.mean.name(),
            self.prefix_partition.name(),
            self.split_pack.name()
        )
    }
}

pub enum PsaMeanInternals {
    Atomic {
        params: BufferView<MeanParams>,
    },
    Decoupled {
        states: BufferView<u32>,
        params: BufferView<MeanParams>,
    },
}

pub enum PsaPartitionInternals {
    Decoupled {
        states: BufferView<u32>,
        params: BufferView<PartitionParams>,
    },
    BlockWise {
        block_heavy_count: BufferView<u32>,
        block_heavy_sum: BufferView<f32>,
        block_light_sum: BufferView<f32>,
        params: BufferView<PartitionParams>,
        count_scan_params: BufferView<crate::block_scan::BlockScanParams>,
        heavy_scan_params: BufferView<crate::block_scan::BlockScanParams>,
        light_scan_params: BufferView<crate::block_scan::BlockScanParams>,
    },
}

pub struct PsaBuffers {
    pub weights: BufferView<f32>,
    pub alias_table: BufferView<AliasEntry>,
    pub mean: BufferView<f32>,
    pub heavy_count: BufferView<u32>,
    pub partition_indices: BufferView<u32>,
    pub partition_prefix: BufferView<f32>,
    pub partition_elements: Option<BufferView<f32>>,
    pub mean_internals: PsaMeanInternals,
    pub partition_internals: PsaPartitionInternals,
    pub split_pack_internals: SplitPackInternals,
}

impl PsaBuffers {
    pub fn allocate(ctx: &GpuContext, config: &PsaConfig, n: u64) -> Self {
        // Stage allocators produce the internals; the shared views are
        // allocated once here and wired into each stage at run time.
        let mean_internals = match &config.mean {
            MeanConfig::Atomic(_) => PsaMeanInternals::Atomic {
                params: allocate_mean_params(ctx),
            },
            MeanConfig::Decoupled(c) => PsaMeanInternals::Decoupled {
                states: allocate_mean_states(ctx, n, c.block_size()),
                params: allocate_mean_params(ctx),
            },
        };

        let partition_internals = match &config.prefix_partition {
            PrefixPartitionConfig::Decoupled(c) => PsaPartitionInternals::Decoupled {
                states: allocate_partition_states(ctx, n, c.block_size()),
                params: allocate_partition_params(ctx),
            },
            PrefixPartitionConfig::BlockWise(c) => {
                let block_count = n.div_ceil(c.reduce.block_size() as u64);
                PsaPartitionInternals::BlockWise {
                    block_heavy_count: BufferView::storage(
                        &ctx.device,
                        "psa block heavy count",
                        block_count,
                    ),
                    block_heavy_sum: BufferView::storage(
                        &ctx.device,
                        "psa block heavy sum",
                        block_count,
                    ),
                    block_light_sum: BufferView::storage(
                        &ctx.device,
                        "psa block light sum",
                        block_count,
                    ),
                    params: allocate_partition_params(ctx),
                    count_scan_params: BlockScanBuffers::<u32>::allocate_params(ctx),
                    heavy_scan_params: BlockScanBuffers::<f32>::allocate_params(ctx),
                    light_scan_params: BlockScanBuffers::<f32>::allocate_params(ctx),
                }
            }
        };

        let split_pack_internals =
            SplitPackBuffers::allocate(ctx, &config.split_pack, n, false).internals;

        Self {
            weights: BufferView::storage(&ctx.device, "psa weights", n),
            alias_table: BufferView::storage(&ctx.device, "psa alias table", n),
            mean: BufferView::storage(&ctx.device, "psa mean", 1),
            heavy_count: BufferView::storage(&ctx.device, "psa heavy count", 1),
            partition_indices: BufferView::storage(&ctx.device, "psa partition indices", n),
            partition_prefix: BufferView::storage(&ctx.device, "psa partition prefix", n),
            partition_elements: config
                .use_partition_elements
                .then(|| BufferView::storage(&ctx.device, "psa partition elements", n)),
            mean_internals,
            partition_internals,
            split_pack_internals,
        }
    }
}

pub struct Psa {
    mean: Mean,
    prefix_partition: PrefixPartition,
    split_pack: SplitPack,
    use_partition_elements: bool,
}

impl Psa {
    pub fn new(ctx: &GpuContext, config: &PsaConfig) -> Result<Self> {
        Ok(Self {
            mean: Mean::new(ctx, &config.mean)?,
            prefix_partition: PrefixPartition::new(
                ctx,
                &config.prefix_partition,
                config.use_partition_elements,
            )?,
            split_pack: SplitPack::new(ctx, &config.split_pack, config.use_partition_elements)?,
            use_partition_elements: config.use_partition_elements,
        })
    }

    pub fn run(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &PsaBuffers,
        n: u32,
    ) -> Result<()> {
        if self.use_partition_elements && buffers.partition_elements.is_none() {
            return Err(WrsError::config(
                "psa configured with partition elements but none allocated",
            ));
        }

        {
            let _span = debug_span!("psa", stage = "mean").entered();
            let mean_buffers = match &buffers.mean_internals {
                PsaMeanInternals::Atomic { params } => MeanBuffers::Atomic(AtomicMeanBuffers {
                    elements: buffers.weights.clone(),
                    mean: buffers.mean.clone(),
                    params: params.clone(),
                }),
                PsaMeanInternals::Decoupled { states, params } => {
                    MeanBuffers::Decoupled(DecoupledMeanBuffers {
                        elements: buffers.weights.clone(),
                        mean: buffers.mean.clone(),
                        decoupled_states: states.clone(),
                        params: params.clone(),
                    })
                }
            };
            self.mean.run(encoder, &mean_buffers, n)?;
        }

        buffers.mean.expect_compute_read(encoder);

        {
            let _span = debug_span!("psa", stage = "prefix_partition").entered();
            let partition_buffers = match &buffers.partition_internals {
                PsaPartitionInternals::Decoupled { states, params } => {
                    PrefixPartitionBuffers::Decoupled(DecoupledPrefixPartitionBuffers {
                        elements: buffers.weights.clone(),
                        pivot: buffers.mean.clone(),
                        decoupled_states: states.clone(),
                        heavy_count: buffers.heavy_count.clone(),
                        partition_indices: buffers.partition_indices.clone(),
                        partition_prefix: buffers.partition_prefix.clone(),
                        partition_elements: buffers.partition_elements.clone(),
                        params: params.clone(),
                    })
                }
                PsaPartitionInternals::BlockWise {
                    block_heavy_count,
                    block_heavy_sum,
                    block_light_sum,
                    params,
                    count_scan_params,
                    heavy_scan_params,
                    light_scan_params,
                } => PrefixPartitionBuffers::BlockWise(BlockWisePrefixPartitionBuffers {
                    elements: buffers.weights.clone(),
                    pivot: buffers.mean.clone(),
                    block_heavy_count: block_heavy_count.clone(),
                    block_heavy_sum: block_heavy_sum.clone(),
                    block_light_sum: block_light_sum.clone(),
                    heavy_count: buffers.heavy_count.clone(),
                    partition_indices: buffers.partition_indices.clone(),
                    partition_prefix: buffers.partition_prefix.clone(),
                    partition_elements: buffers.partition_elements.clone(),
                    params: params.clone(),
                    count_scan_params: count_scan_params.clone(),
                    heavy_scan_params: heavy_scan_params.clone(),
                    light_scan_params: light_scan_params.clone(),
                }),
            };
            self.prefix_partition.run(encoder, &partition_buffers, n)?;
        }

        buffers.heavy_count.expect_compute_read(encoder);
        buffers.partition_indices.expect_compute_read(encoder);
        buffers.partition_prefix.expect_compute_read(encoder);
        if let Some(partition_elements) = &buffers.partition_elements {
            partition_elements.expect_compute_read(encoder);
        }

        {
            let _span = debug_span!("psa", stage = "split_pack").entered();
            let split_pack_buffers = SplitPackBuffers {
                weights: buffers.weights.clone(),
                partition_indices: buffers.partition_indices.clone(),
                partition_prefix: buffers.partition_prefix.clone(),
                heavy_count: buffers.heavy_count.clone(),
                mean: buffers.mean.clone(),
                alias_table: buffers.alias_table.clone(),
                partition_elements: buffers.partition_elements.clone(),
                internals: match &buffers.split_pack_internals {
                    SplitPackInternals::Inline { params } => SplitPackInternals::Inline {
                        params: params.clone(),
                    },
                    SplitPackInternals::Serial {
                        splits,
                        split_params,
                        pack_params,
                    } => SplitPackInternals::Serial {
                        splits: splits.clone(),
                        split_params: split_params.clone(),
                        pack_params: pack_params.clone(),
                    },
                },
            };
            self.split_pack.run(encoder, &split_pack_buffers, n)?;
        }
        Ok(())
    }
}
