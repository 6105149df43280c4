// GPU-accelerated weighted random sampling over wgpu compute.
//
// The crate provides the parallel building blocks (block scans, device-wide
// prefix sums, prefix-partition, mean reduction), the partitioned-sweep
// construction of a Walker alias table (split, pack and the fused inline
// variant) and a constant-time alias sampler fed by a Philox counter RNG.
//
// All kernels record into a caller-owned command encoder and never submit
// or wait; device buffers are allocated up front through the per-primitive
// `*Buffers::allocate` helpers and stay caller-owned.

// Re-export the GPU substrate so downstream crates and the integration
// tests align on one wgpu version.
pub use wgpu;

pub mod block_scan;
pub mod error;
pub mod gpu;
pub mod layout;
pub mod mean;
pub mod pack;
pub mod philox;
pub mod prefix_partition;
pub mod prefix_sum;
pub mod psa;
pub mod reference;
pub mod sampler;
pub mod split;
pub mod split_pack;

// Re-exports - the handles most callers need
pub use block_scan::{BlockScan, BlockScanBuffers, BlockScanConfig, BlockScanVariant, ScanElement};
pub use error::{Result, WrsError};
pub use gpu::GpuContext;
pub use layout::{AliasEntry, BufferView, SplitEntry};
pub use mean::{
    AtomicMean, AtomicMeanConfig, DecoupledMean, DecoupledMeanConfig, Mean, MeanBuffers, MeanConfig,
};
pub use pack::{
    Pack, PackBuffers, PackConfig, ScalarPack, ScalarPackConfig, SubgroupPack, SubgroupPackConfig,
};
pub use philox::{Philox, PhiloxBuffers, PhiloxConfig};
pub use prefix_partition::{
    BlockWisePrefixPartition, BlockWisePrefixPartitionConfig, DecoupledPrefixPartition,
    DecoupledPrefixPartitionConfig, PartitionBlockConfig, PrefixPartition, PrefixPartitionBuffers,
    PrefixPartitionConfig,
};
pub use prefix_sum::{
    BlockCombineConfig, BlockWiseScan, BlockWiseScanConfig, DecoupledPrefixSum,
    DecoupledPrefixSumConfig, PrefixSum, PrefixSumBuffers, PrefixSumConfig,
};
pub use psa::{Psa, PsaBuffers, PsaConfig};
pub use sampler::{SampleAliasTable, SampleAliasTableBuffers, SampleAliasTableConfig};
pub use split::{ScalarSplit, ScalarSplitBuffers, ScalarSplitConfig};
pub use split_pack::{
    InlineSplitPack, InlineSplitPackConfig, SerialSplitPack, SerialSplitPackConfig, SplitPack,
    SplitPackBuffers, SplitPackConfig,
};
