// Scan correctness: block scan variants, the decoupled single-dispatch
// scan (forward and reverse) and the block-wise two-stage scan, validated
// against the CPU reference over the boundary sizes and distributions.

mod common;

use common::{
    assert_slice_close, context, decoupled_context, download, scan_tolerance, submit,
    uniform_weights,
};
use wrs_gpu::block_scan::{BlockScan, BlockScanBuffers, BlockScanConfig, BlockScanVariant};
use wrs_gpu::prefix_sum::{
    BlockWiseScan, BlockWiseScanBuffers, BlockWiseScanConfig, DecoupledPrefixSum,
    DecoupledPrefixSumBuffers, DecoupledPrefixSumConfig, PrefixSum, PrefixSumBuffers,
    PrefixSumConfig,
};
use wrs_gpu::wgpu;
use wrs_gpu::{reference, GpuContext, WrsError};

fn encoder(ctx: &GpuContext) -> wgpu::CommandEncoder {
    ctx.device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None })
}

fn block_scan_case(
    ctx: &GpuContext,
    config: BlockScanConfig,
    weights: &[f32],
    exclusive: bool,
) {
    let n = weights.len() as u32;
    let block_size = config.block_size();
    let block_count = (n as u64).div_ceil(block_size as u64);
    let scan = BlockScan::<f32>::new(ctx, config).expect("block scan config rejected");
    let buffers = BlockScanBuffers::<f32>::allocate(
        ctx,
        weights.len() as u64,
        block_count,
        config.write_block_reductions,
    );
    buffers.elements.upload(&ctx.queue, weights);

    let mut enc = encoder(ctx);
    scan.run(&mut enc, &buffers, n).expect("run failed");
    submit(ctx, enc);

    let result = download(ctx, &buffers.prefix_sum);
    let tolerance = scan_tolerance(weights);
    // Scans restart at every tile boundary.
    for (block, chunk) in weights.chunks(block_size as usize).enumerate() {
        let expected = if exclusive {
            reference::exclusive_scan(chunk)
        } else {
            reference::inclusive_scan(chunk)
        };
        let offset = block * block_size as usize;
        assert_slice_close(
            &result[offset..offset + chunk.len()],
            &expected,
            tolerance,
            "block scan",
        );
    }

    if config.write_block_reductions {
        let reductions = download(ctx, buffers.reductions.as_ref().unwrap());
        for (block, chunk) in weights.chunks(block_size as usize).enumerate() {
            let expected: f32 = reference::inclusive_scan(chunk).last().copied().unwrap_or(0.0);
            assert!(
                (reductions[block] - expected).abs() <= tolerance,
                "reduction[{block}] = {}, expected {expected}",
                reductions[block]
            );
        }
    }
}

#[test]
fn block_scan_variants_match_reference() {
    let Some(ctx) = context() else { return };
    let variants = [
        BlockScanVariant::RAKING,
        BlockScanVariant::RANKED,
        BlockScanVariant::RANKED_STRIDED,
        BlockScanVariant::RANKED | BlockScanVariant::SUBGROUP_SCAN_SHFL,
        BlockScanVariant::RAKING | BlockScanVariant::SUBGROUP_SCAN_SHFL,
    ];
    for base in variants {
        for exclusive in [false, true] {
            let variant = if exclusive {
                base | BlockScanVariant::EXCLUSIVE
            } else {
                base | BlockScanVariant::INCLUSIVE
            };
            let config = BlockScanConfig::new(64, 4, variant, 2, true);
            let block_size = config.block_size() as usize;
            for n in [1usize, 2, block_size - 1, block_size, block_size + 1, 3 * block_size + 17] {
                let weights = uniform_weights(n, 7 + n as u64);
                block_scan_case(&ctx, config, &weights, exclusive);
            }
        }
    }
}

#[test]
fn block_scan_uint_elements() {
    let Some(ctx) = context() else { return };
    let config = BlockScanConfig::new(
        64,
        4,
        BlockScanVariant::RANKED | BlockScanVariant::EXCLUSIVE,
        1,
        false,
    );
    let scan = BlockScan::<u32>::new(&ctx, config).unwrap();
    let values: Vec<u32> = (0..200u32).map(|i| i % 7).collect();
    let buffers = BlockScanBuffers::<u32>::allocate(&ctx, values.len() as u64, 1, false);
    buffers.elements.upload(&ctx.queue, &values);

    let mut enc = encoder(&ctx);
    scan.run(&mut enc, &buffers, values.len() as u32).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.prefix_sum);
    let mut acc = 0u32;
    for (index, &value) in values.iter().enumerate() {
        assert_eq!(result[index], acc, "exclusive uint scan at {index}");
        acc += value;
    }
}

#[test]
fn strided_raking_is_rejected() {
    let Some(ctx) = context() else { return };
    let config = BlockScanConfig::new(
        64,
        4,
        BlockScanVariant::RAKING | BlockScanVariant::STRIDED,
        1,
        false,
    );
    match BlockScan::<f32>::new(&ctx, config) {
        Err(WrsError::Config(_)) => {}
        other => panic!("expected ConfigError, got {:?}", other.err()),
    }
}

fn decoupled_case(ctx: &GpuContext, weights: &[f32], exclusive: bool) {
    let variant = if exclusive {
        BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE
    } else {
        BlockScanVariant::RANKED_STRIDED
    };
    let config = DecoupledPrefixSumConfig {
        workgroup_size: 64,
        rows: 4,
        block_scan_variant: variant,
        parallel_lookback_depth: 16,
    };
    let scan = DecoupledPrefixSum::new(ctx, config, false).unwrap();
    let buffers =
        DecoupledPrefixSumBuffers::allocate(ctx, weights.len() as u64, config.partition_size());
    buffers.elements.upload(&ctx.queue, weights);

    let mut enc = encoder(ctx);
    scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(ctx, enc);

    let result = download(ctx, &buffers.prefix_sum);
    let expected = if exclusive {
        reference::exclusive_scan(weights)
    } else {
        reference::inclusive_scan(weights)
    };
    assert_slice_close(&result, &expected, scan_tolerance(weights), "decoupled scan");
}

#[test]
fn decoupled_prefix_sum_matches_reference() {
    let Some(ctx) = decoupled_context() else { return };
    for n in [1usize, 2, 256, 257, 4096, 100_000] {
        let weights = uniform_weights(n, n as u64);
        decoupled_case(&ctx, &weights, false);
        decoupled_case(&ctx, &weights, true);
    }
}

#[test]
fn decoupled_prefix_sum_of_ones_is_iota() {
    // 2^20 ones scan to k + 1 (inclusive) and k (exclusive).
    let Some(ctx) = decoupled_context() else { return };
    let n = 1usize << 20;
    let weights = vec![1.0f32; n];

    for exclusive in [false, true] {
        let variant = if exclusive {
            BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE
        } else {
            BlockScanVariant::RANKED_STRIDED
        };
        let config = DecoupledPrefixSumConfig {
            workgroup_size: 256,
            rows: 8,
            block_scan_variant: variant,
            parallel_lookback_depth: 16,
        };
        let scan = DecoupledPrefixSum::new(&ctx, config, false).unwrap();
        let buffers = DecoupledPrefixSumBuffers::allocate(&ctx, n as u64, config.partition_size());
        buffers.elements.upload(&ctx.queue, &weights);

        let mut enc = encoder(&ctx);
        scan.run(&mut enc, &buffers, n as u32).unwrap();
        submit(&ctx, enc);

        let result = download(&ctx, &buffers.prefix_sum);
        for k in [0usize, 1, 1000, 65_535, 65_536, n - 2, n - 1] {
            let expected = if exclusive { k as f32 } else { (k + 1) as f32 };
            assert_eq!(result[k], expected, "ones scan at {k}");
        }
    }
}

#[test]
fn reverse_decoupled_scan_is_reverse_memory_order() {
    let Some(ctx) = decoupled_context() else { return };
    let config = DecoupledPrefixSumConfig {
        workgroup_size: 64,
        rows: 4,
        block_scan_variant: BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE,
        parallel_lookback_depth: 16,
    };
    let scan = DecoupledPrefixSum::new(&ctx, config, true).unwrap();
    let weights = uniform_weights(1000, 3);
    let buffers = DecoupledPrefixSumBuffers::allocate(&ctx, weights.len() as u64, config.partition_size());
    buffers.elements.upload(&ctx.queue, &weights);

    let mut enc = encoder(&ctx);
    scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.prefix_sum);
    // Logical element k is stored at n - 1 - k, so the output read
    // backwards is the exclusive scan of the input read backwards.
    let reversed: Vec<f32> = weights.iter().rev().copied().collect();
    let expected = reference::exclusive_scan(&reversed);
    let result_reversed: Vec<f32> = result.iter().rev().copied().collect();
    assert_slice_close(
        &result_reversed,
        &expected,
        scan_tolerance(&weights),
        "reverse scan",
    );
}

#[test]
fn block_wise_scan_matches_reference_and_enforces_capacity() {
    let Some(ctx) = context() else { return };
    let config = BlockWiseScanConfig::new(
        BlockScanConfig::new(64, 2, BlockScanVariant::RAKING, 2, true),
        BlockScanConfig::new(
            64,
            4,
            BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE,
            1,
            false,
        ),
    );
    let scan = BlockWiseScan::new(&ctx, config).unwrap();

    let weights = uniform_weights(10_000, 11);
    let buffers = BlockWiseScanBuffers::allocate(
        &ctx,
        weights.len() as u64,
        config.element_scan.block_size(),
    );
    buffers.elements.upload(&ctx.queue, &weights);

    let mut enc = encoder(&ctx);
    scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.prefix_sum);
    let expected = reference::inclusive_scan(&weights);
    assert_slice_close(&result, &expected, scan_tolerance(&weights), "block-wise scan");

    let mut enc = encoder(&ctx);
    let too_big = (scan.max_element_count() + 1) as u32;
    match scan.run(&mut enc, &buffers, too_big) {
        Err(WrsError::Capacity { .. }) => {}
        other => panic!("expected CapacityError, got {:?}", other.err()),
    }
}

#[test]
fn block_wise_scan_requires_exclusive_root() {
    let Some(ctx) = context() else { return };
    let config = BlockWiseScanConfig::new(
        BlockScanConfig::new(64, 2, BlockScanVariant::RAKING, 1, true),
        BlockScanConfig::new(64, 4, BlockScanVariant::RANKED_STRIDED, 1, false),
    );
    match BlockWiseScan::<f32>::new(&ctx, config) {
        Err(WrsError::Config(_)) => {}
        other => panic!("expected ConfigError, got {:?}", other.err()),
    }
}

#[test]
fn prefix_sum_front_selects_both_variants() {
    let Some(ctx) = decoupled_context() else { return };
    let weights = uniform_weights(20_000, 23);
    let configs = [
        PrefixSumConfig::Decoupled(DecoupledPrefixSumConfig {
            workgroup_size: 64,
            rows: 4,
            block_scan_variant: BlockScanVariant::RANKED_STRIDED,
            parallel_lookback_depth: 16,
        }),
        PrefixSumConfig::BlockWise(BlockWiseScanConfig::new(
            BlockScanConfig::new(64, 2, BlockScanVariant::RAKING, 2, true),
            BlockScanConfig::new(
                64,
                4,
                BlockScanVariant::RANKED_STRIDED | BlockScanVariant::EXCLUSIVE,
                1,
                false,
            ),
        )),
    ];
    for config in configs {
        let scan = PrefixSum::new(&ctx, &config).expect(&config.name());
        let buffers = PrefixSumBuffers::allocate(&ctx, &config, weights.len() as u64);
        buffers.elements().upload(&ctx.queue, &weights);

        let mut enc = encoder(&ctx);
        scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
        submit(&ctx, enc);

        let result = download(&ctx, buffers.prefix_sum());
        let expected = reference::inclusive_scan(&weights);
        assert_slice_close(&result, &expected, scan_tolerance(&weights), &config.name());
    }
}

#[test]
fn repeated_dispatch_is_stable() {
    // Missing read-after-write barriers show up as diverging results when
    // the same dispatch is recorded twice back to back.
    let Some(ctx) = decoupled_context() else { return };
    let config = DecoupledPrefixSumConfig {
        workgroup_size: 64,
        rows: 4,
        block_scan_variant: BlockScanVariant::RANKED_STRIDED,
        parallel_lookback_depth: 16,
    };
    let scan = DecoupledPrefixSum::new(&ctx, config, false).unwrap();
    let weights = uniform_weights(5000, 17);
    let buffers = DecoupledPrefixSumBuffers::allocate(&ctx, weights.len() as u64, config.partition_size());
    buffers.elements.upload(&ctx.queue, &weights);

    let mut enc = encoder(&ctx);
    scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    scan.run(&mut enc, &buffers, weights.len() as u32).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.prefix_sum);
    let expected = reference::inclusive_scan(&weights);
    assert_slice_close(&result, &expected, scan_tolerance(&weights), "repeated dispatch");
}
