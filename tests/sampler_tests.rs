// Philox generation and alias-table sampling: bit-exact agreement with the
// CPU Philox, determinism in (seed, s), cooperative batching equivalence
// and the end-to-end sampling scenarios.

mod common;

use common::{context, download, submit, uniform_weights};
use rayon::prelude::*;
use wrs_gpu::layout::AliasEntry;
use wrs_gpu::philox::{Philox, PhiloxBuffers, PhiloxConfig};
use wrs_gpu::sampler::{SampleAliasTable, SampleAliasTableBuffers, SampleAliasTableConfig};
use wrs_gpu::wgpu;
use wrs_gpu::{reference, GpuContext};

fn encoder(ctx: &GpuContext) -> wgpu::CommandEncoder {
    ctx.device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None })
}

fn run_sampler(
    ctx: &GpuContext,
    config: SampleAliasTableConfig,
    table: &[AliasEntry],
    s: u64,
    seed: u32,
) -> Vec<u32> {
    let sampler = SampleAliasTable::new(ctx, config).unwrap();
    let buffers = SampleAliasTableBuffers::allocate(ctx, table.len() as u64, s, s);
    buffers.alias_table.upload(&ctx.queue, table);

    let mut enc = encoder(ctx);
    sampler
        .run(&mut enc, &buffers, table.len() as u32, s, seed)
        .unwrap();
    submit(ctx, enc);

    download(ctx, &buffers.samples)
}

#[test]
fn philox_matches_cpu_reference() {
    let Some(ctx) = context() else { return };
    let philox = Philox::new(&ctx, PhiloxConfig::default()).unwrap();
    let count = 4096u64;
    let buffers = PhiloxBuffers::allocate(&ctx, count, count);

    let mut enc = encoder(&ctx);
    philox.run(&mut enc, &buffers, count, 12345).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.samples);
    for quad in 0..(count / 4) {
        let expected = reference::philox_quad(12345, quad * 4);
        for e in 0..4 {
            let index = (quad * 4 + e) as usize;
            assert_eq!(
                result[index].to_bits(),
                expected[e as usize].to_bits(),
                "philox output {index}"
            );
        }
    }
    for &value in &result {
        assert!((0.0..1.0).contains(&value), "uniform out of range: {value}");
    }
}

#[test]
fn sampler_matches_cpu_reference_bit_exact() {
    let Some(ctx) = context() else { return };
    let weights = uniform_weights(100, 5);
    let table = reference::alias_table(&weights, 2);
    let s = 10_000u64;
    let samples = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, s, 999);
    let expected: Vec<u32> = (0..s)
        .into_par_iter()
        .map(|position| reference::sample_index(&table, 999, position))
        .collect();
    assert_eq!(samples, expected);
}

#[test]
fn sampling_is_deterministic_in_seed_and_count() {
    let Some(ctx) = context() else { return };
    let weights = uniform_weights(64, 8);
    let table = reference::alias_table(&weights, 2);
    let a = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, 50_000, 7);
    let b = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, 50_000, 7);
    assert_eq!(a, b);
    let c = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, 50_000, 8);
    assert_ne!(a, c);
}

#[test]
fn cooperative_sampler_matches_plain() {
    let Some(ctx) = context() else { return };
    let weights = uniform_weights(256, 12);
    let table = reference::alias_table(&weights, 4);
    let plain = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, 40_000, 3);
    let coop = run_sampler(
        &ctx,
        SampleAliasTableConfig::new(8, 256),
        &table,
        40_000,
        3,
    );
    assert_eq!(plain, coop);
}

fn histogram(samples: &[u32], n: usize) -> Vec<u64> {
    let mut counts = vec![0u64; n];
    for &sample in samples {
        counts[sample as usize] += 1;
    }
    counts
}

#[test]
fn uniform_weights_sample_uniformly() {
    // W = [1, 1, 1, 1], s = 1e6: each index lands within the 4-sigma
    // binomial band around s / 4. The stream is deterministic in the
    // seed, so this either always passes or flags a real bias.
    let Some(ctx) = context() else { return };
    let table = reference::alias_table(&[1.0, 1.0, 1.0, 1.0], 2);
    let s = 1_000_000u64;
    let samples = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, s, 0);
    let counts = histogram(&samples, 4);
    let expected = 250_000.0f64;
    // 4-sigma binomial band: sigma = sqrt(s * p * (1 - p)).
    let band = 4.0 * (s as f64 * 0.25 * 0.75).sqrt();
    for (index, &count) in counts.iter().enumerate() {
        assert!(
            (count as f64 - expected).abs() <= band,
            "index {index} sampled {count} times, expected {expected} +- {band}"
        );
    }
}

#[test]
fn skewed_weights_sample_proportionally() {
    // W = [3, 1]: index 0 carries three quarters of the mass.
    let Some(ctx) = context() else { return };
    let table = reference::alias_table(&[3.0, 1.0], 2);
    let s = 1_000_000u64;
    let samples = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, s, 0);
    let counts = histogram(&samples, 2);
    let expected = 750_000.0f64;
    let band = 4.0 * (s as f64 * 0.75 * 0.25).sqrt();
    assert!(
        (counts[0] as f64 - expected).abs() <= band,
        "index 0 sampled {} times, expected {expected} +- {band}",
        counts[0]
    );
}

#[test]
fn single_positive_weight_always_sampled() {
    let Some(ctx) = context() else { return };
    let table = reference::alias_table(&[0.0, 0.0, 0.0, 1.0], 2);
    let samples = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, 1000, 0);
    assert!(samples.iter().all(|&sample| sample == 3));
}

#[test]
fn rmse_decays_with_sample_count() {
    // Empirical RMSE against the normalized weights should shrink roughly
    // like 1/sqrt(s); a factor-100 step in s must cut it clearly.
    let Some(ctx) = context() else { return };
    let weights = uniform_weights(32, 44);
    let total: f64 = weights.iter().map(|&w| w as f64).sum();
    let table = reference::alias_table(&weights, 2);

    let rmse = |s: u64| -> f64 {
        let samples = run_sampler(&ctx, SampleAliasTableConfig::default(), &table, s, 11);
        let counts = histogram(&samples, weights.len());
        let mut acc = 0.0f64;
        for (&count, &weight) in counts.iter().zip(&weights) {
            let p_hat = count as f64 / s as f64;
            let p = weight as f64 / total;
            acc += (p_hat - p) * (p_hat - p);
        }
        (acc / weights.len() as f64).sqrt()
    };

    let coarse = rmse(1_000);
    let fine = rmse(100_000);
    assert!(
        fine < coarse / 3.0,
        "rmse did not decay: {coarse} at 1e3 vs {fine} at 1e5"
    );
}

#[test]
fn philox_wraps_ring_buffer() {
    // Requesting more samples than the buffer holds streams through it as
    // a ring; which pass of the ring survives in a slot is scheduling
    // dependent, but every slot must hold one of its stream values.
    let Some(ctx) = context() else { return };
    let philox = Philox::new(&ctx, PhiloxConfig::default()).unwrap();
    let capacity = 1024u64;
    let total = 2048u64;
    let buffers = PhiloxBuffers::allocate(&ctx, capacity, total);

    let mut enc = encoder(&ctx);
    philox.run(&mut enc, &buffers, total, 5).unwrap();
    submit(&ctx, enc);

    let result = download(&ctx, &buffers.samples);
    for slot in 0..capacity {
        let candidates = [slot, slot + capacity].map(|position| {
            reference::philox_quad(5, position / 4 * 4)[(position % 4) as usize].to_bits()
        });
        assert!(
            candidates.contains(&result[slot as usize].to_bits()),
            "ring slot {slot} holds a value from neither pass"
        );
    }
}
