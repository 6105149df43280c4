// Mean, split, pack and the end-to-end PSA build, validated against the
// CPU references and the alias-table contribution law.

mod common;

use common::{
    all_equal_weights, context, decoupled_context, download, pareto_weights, single_spike_weights,
    submit, two_spike_weights, uniform_weights,
};
use wrs_gpu::layout::{AliasEntry, SplitEntry};
use wrs_gpu::mean::{
    AtomicMean, AtomicMeanBuffers, AtomicMeanConfig, DecoupledMean, DecoupledMeanBuffers,
    DecoupledMeanConfig,
};
use wrs_gpu::pack::PackConfig;
use wrs_gpu::prefix_partition::{DecoupledPrefixPartitionConfig, PrefixPartitionConfig};
use wrs_gpu::split::{ScalarSplit, ScalarSplitBuffers, ScalarSplitConfig};
use wrs_gpu::split_pack::{InlineSplitPackConfig, SerialSplitPackConfig, SplitPackConfig};
use wrs_gpu::wgpu;
use wrs_gpu::{reference, GpuContext, MeanConfig, Psa, PsaBuffers, PsaConfig, ScalarPackConfig, SubgroupPackConfig};

fn encoder(ctx: &GpuContext) -> wgpu::CommandEncoder {
    ctx.device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None })
}

#[test]
fn atomic_mean_matches_reference() {
    let Some(ctx) = context() else { return };
    for n in [1usize, 2, 1000, 70_000] {
        let weights = uniform_weights(n, n as u64);
        let mean_kernel = AtomicMean::new(&ctx, AtomicMeanConfig::new(64, 4)).unwrap();
        let buffers = AtomicMeanBuffers::allocate(&ctx, n as u64);
        buffers.elements.upload(&ctx.queue, &weights);

        let mut enc = encoder(&ctx);
        mean_kernel.run(&mut enc, &buffers, n as u32).unwrap();
        submit(&ctx, enc);

        let result = download(&ctx, &buffers.mean)[0];
        let expected = reference::mean(&weights);
        assert!(
            (result - expected).abs() <= expected.abs() * 1e-4 + 1e-6,
            "atomic mean {result} vs {expected} at n = {n}"
        );
    }
}

#[test]
fn decoupled_mean_matches_reference() {
    let Some(ctx) = decoupled_context() else { return };
    for n in [1usize, 2, 1000, 70_000] {
        let weights = pareto_weights(n, n as u64);
        let config = DecoupledMeanConfig {
            workgroup_size: 64,
            rows: 4,
            parallel_lookback_depth: 16,
        };
        let mean_kernel = DecoupledMean::new(&ctx, config).unwrap();
        let buffers = DecoupledMeanBuffers::allocate(&ctx, n as u64, config.block_size());
        buffers.elements.upload(&ctx.queue, &weights);

        let mut enc = encoder(&ctx);
        mean_kernel.run(&mut enc, &buffers, n as u32).unwrap();
        submit(&ctx, enc);

        let result = download(&ctx, &buffers.mean)[0];
        let expected = reference::mean(&weights);
        assert!(
            (result - expected).abs() <= expected.abs() * 1e-4 + 1e-6,
            "decoupled mean {result} vs {expected} at n = {n}"
        );
    }
}

fn run_scalar_split(ctx: &GpuContext, weights: &[f32], split_size: u32) -> Vec<SplitEntry> {
    let mu = reference::mean(weights);
    let partition = reference::prefix_partition(weights, mu);
    let split_kernel = ScalarSplit::new(ctx, ScalarSplitConfig::new(split_size)).unwrap();
    let buffers = ScalarSplitBuffers::allocate(ctx, weights.len() as u64, split_size);
    buffers
        .partition_prefix
        .upload(&ctx.queue, &partition.partition_prefix);
    buffers
        .heavy_count
        .upload(&ctx.queue, &[partition.heavy_count as u32]);
    buffers.mean.upload(&ctx.queue, &[mu]);

    let mut enc = encoder(ctx);
    split_kernel.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(ctx, enc);

    download(ctx, &buffers.splits)
}

#[test]
fn scalar_split_obeys_split_law() {
    let Some(ctx) = context() else { return };
    let weights = [3.0f32, 3.0, 1.0, 1.0, 1.0, 1.0];
    let mu = reference::mean(&weights);
    let splits = run_scalar_split(&ctx, &weights, 2);
    assert_eq!(splits.len(), 4);
    assert_eq!((splits[0].i, splits[0].j, splits[0].spill), (0, 0, 0.0));
    let last = splits.last().unwrap();
    assert_eq!(last.i, 4);
    assert_eq!(last.j, 2);
    assert!(last.spill.abs() < mu * 2f32.powi(-20));

    // Boundaries must be monotone and reproduce the CPU search.
    let partition = reference::prefix_partition(&weights, mu);
    let expected = reference::split(&partition.partition_prefix, partition.heavy_count, mu, 2);
    for (entry, exp) in splits.iter().zip(&expected) {
        assert_eq!(entry.i, exp.i);
        assert_eq!(entry.j, exp.j);
        assert!((entry.spill - exp.spill).abs() <= mu * 1e-5);
    }
}

#[test]
fn scalar_split_matches_reference_across_sizes() {
    let Some(ctx) = context() else { return };
    for n in [16usize, 1000, 4096] {
        let weights = pareto_weights(n, 31 + n as u64);
        let mu = reference::mean(&weights);
        let partition = reference::prefix_partition(&weights, mu);
        for split_size in [2u32, 8, 64] {
            let splits = run_scalar_split(&ctx, &weights, split_size);
            let expected = reference::split(
                &partition.partition_prefix,
                partition.heavy_count,
                mu,
                split_size as usize,
            );
            assert_eq!(splits.len(), expected.len());
            for (index, (entry, exp)) in splits.iter().zip(&expected).enumerate() {
                assert_eq!(entry.i, exp.i, "split {index} i at n={n} k={split_size}");
                assert_eq!(entry.j, exp.j, "split {index} j at n={n} k={split_size}");
                assert!(
                    (entry.spill - exp.spill).abs() <= mu * 1e-3,
                    "split {index} spill {} vs {}",
                    entry.spill,
                    exp.spill
                );
            }
        }
    }
}

fn assert_alias_table_law(weights: &[f32], table: &[AliasEntry]) {
    let mu = reference::mean(weights);
    let contrib = reference::alias_contributions(table);
    let max_weight = weights.iter().cloned().fold(0.0f32, f32::max);
    let tolerance = (weights.len() as f32 * f32::EPSILON * max_weight).max(1e-3);
    for (index, (&c, &w)) in contrib.iter().zip(weights).enumerate() {
        let expected = w / mu;
        assert!(
            (c - expected).abs() <= tolerance,
            "contrib({index}) = {c}, expected {expected}"
        );
    }
    for (index, entry) in table.iter().enumerate() {
        assert!(
            entry.p >= 0.0 && entry.p <= 1.0 + 1e-5,
            "p out of range at {index}: {}",
            entry.p
        );
        assert!((entry.a as usize) < table.len(), "alias out of range at {index}");
    }
}

fn psa_config(split_pack: SplitPackConfig) -> PsaConfig {
    PsaConfig::new(
        MeanConfig::Atomic(AtomicMeanConfig::new(64, 4)),
        PrefixPartitionConfig::Decoupled(DecoupledPrefixPartitionConfig {
            workgroup_size: 64,
            rows: 4,
            block_scan_variant: wrs_gpu::BlockScanVariant::RANKED_STRIDED,
            parallel_lookback_depth: 16,
        }),
        split_pack,
        false,
    )
}

fn run_psa(ctx: &GpuContext, config: &PsaConfig, weights: &[f32]) -> Vec<AliasEntry> {
    let psa = Psa::new(ctx, config).unwrap();
    let buffers = PsaBuffers::allocate(ctx, config, weights.len() as u64);
    buffers.weights.upload(&ctx.queue, weights);

    let mut enc = encoder(ctx);
    psa.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(ctx, enc);

    download(ctx, &buffers.alias_table)
}

#[test]
fn psa_serial_scalar_pack_builds_valid_tables() {
    let Some(ctx) = decoupled_context() else { return };
    let config = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(2),
        PackConfig::Scalar(ScalarPackConfig::new(2)),
    )));
    for weights in [
        vec![1.0, 1.0, 1.0, 1.0],
        vec![3.0, 1.0],
        vec![0.0, 0.0, 0.0, 1.0],
        uniform_weights(1000, 2),
        pareto_weights(4096, 3),
        two_spike_weights(512, 5, 200),
        all_equal_weights(300),
    ] {
        let table = run_psa(&ctx, &config, &weights);
        assert_alias_table_law(&weights, &table);
    }
}

#[test]
fn psa_inline_split_pack_builds_valid_tables() {
    let Some(ctx) = decoupled_context() else { return };
    let config = psa_config(SplitPackConfig::Inline(InlineSplitPackConfig {
        workgroup_size: 64,
        split_size: 2,
    }));
    for weights in [
        uniform_weights(1000, 7),
        pareto_weights(4096, 9),
        single_spike_weights(257, 100),
    ] {
        let table = run_psa(&ctx, &config, &weights);
        assert_alias_table_law(&weights, &table);
    }
}

#[test]
fn psa_subgroup_pack_builds_valid_tables() {
    let Some(ctx) = decoupled_context() else { return };
    let config = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(16),
        PackConfig::Subgroup(SubgroupPackConfig::new(16, 4)),
    )));
    for weights in [uniform_weights(2000, 13), pareto_weights(4096, 15)] {
        let table = run_psa(&ctx, &config, &weights);
        assert_alias_table_law(&weights, &table);
    }
}

#[test]
fn psa_with_partition_elements_matches_plain() {
    let Some(ctx) = decoupled_context() else { return };
    let weights = pareto_weights(2048, 21);

    let plain = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(8),
        PackConfig::Scalar(ScalarPackConfig::new(8)),
    )));
    let mut gathered = plain;
    gathered.use_partition_elements = true;

    let table_plain = run_psa(&ctx, &plain, &weights);
    let table_gathered = run_psa(&ctx, &gathered, &weights);
    assert_eq!(table_plain, table_gathered);
}

#[test]
fn subgroup_pack_degenerates_to_scalar_at_split_one() {
    // subgroup_split = 1 runs one lane per split and must agree with the
    // scalar pack up to floating-point associativity; the split stream and
    // weights are identical, so here the tables match exactly.
    let Some(ctx) = decoupled_context() else { return };
    let weights = pareto_weights(1024, 29);

    let scalar = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(8),
        PackConfig::Scalar(ScalarPackConfig::new(8)),
    )));
    let subgroup = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(8),
        PackConfig::Subgroup(SubgroupPackConfig::new(8, 1)),
    )));

    let table_scalar = run_psa(&ctx, &scalar, &weights);
    let table_subgroup = run_psa(&ctx, &subgroup, &weights);
    assert_eq!(table_scalar, table_subgroup);
}

#[test]
fn inline_and_serial_split_pack_agree() {
    let Some(ctx) = decoupled_context() else { return };
    let weights = uniform_weights(3000, 37);

    let serial = psa_config(SplitPackConfig::Serial(SerialSplitPackConfig::new(
        ScalarSplitConfig::new(4),
        PackConfig::Scalar(ScalarPackConfig::new(4)),
    )));
    let inline = psa_config(SplitPackConfig::Inline(InlineSplitPackConfig {
        workgroup_size: 64,
        split_size: 4,
    }));

    let table_serial = run_psa(&ctx, &serial, &weights);
    let table_inline = run_psa(&ctx, &inline, &weights);
    assert_eq!(table_serial.len(), table_inline.len());
    for (index, (a, b)) in table_serial.iter().zip(&table_inline).enumerate() {
        assert_eq!(a.a, b.a, "alias mismatch at {index}");
        assert!(
            (a.p - b.p).abs() <= 1e-4,
            "probability mismatch at {index}: {} vs {}",
            a.p,
            b.p
        );
    }
}

#[test]
fn subgroup_split_must_be_power_of_two() {
    let Some(ctx) = context() else { return };
    let result = wrs_gpu::SubgroupPack::new(&ctx, SubgroupPackConfig::new(8, 3), false);
    assert!(matches!(result.err(), Some(wrs_gpu::WrsError::Config(_))));
}
