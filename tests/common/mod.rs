// Shared harness for the GPU integration tests: device acquisition with a
// graceful skip when no adapter is present, readback plumbing and the
// weight distributions the properties are exercised against.

#![allow(dead_code)]

use bytemuck::Pod;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use wrs_gpu::wgpu;
use wrs_gpu::{BufferView, GpuContext};

/// Acquire a device or skip the test. CI machines without a GPU (or
/// without subgroup support) print the reason and pass vacuously.
pub fn context() -> Option<GpuContext> {
    match GpuContext::new() {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

/// Like `context`, but additionally skips adapters that serialize
/// workgroups, where the decoupled-lookback spin loops cannot make
/// progress.
pub fn decoupled_context() -> Option<GpuContext> {
    let ctx = context()?;
    if !ctx.supports_decoupled() {
        eprintln!("skipping decoupled-lookback test: workgroups are serialized on this adapter");
        return None;
    }
    Some(ctx)
}

pub fn submit(ctx: &GpuContext, encoder: wgpu::CommandEncoder) {
    ctx.queue.submit(Some(encoder.finish()));
}

/// Copy a device view into a fresh staging buffer and map it back.
pub fn download<T: Pod>(ctx: &GpuContext, view: &BufferView<T>) -> Vec<T> {
    let staging = BufferView::<T>::staging(&ctx.device, "test staging", view.len());
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("test readback"),
        });
    view.expect_compute_read(&mut encoder);
    view.copy_to(&mut encoder, &staging);
    staging.expect_host_read(&mut encoder);
    submit(ctx, encoder);
    staging.download(&ctx.device)
}

pub fn assert_slice_close(actual: &[f32], expected: &[f32], tolerance: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "{what}[{index}] = {a}, expected {e} (tolerance {tolerance})"
        );
    }
}

/// Scan comparison tolerance: n * eps * max|W|.
pub fn scan_tolerance(weights: &[f32]) -> f32 {
    let max = weights.iter().cloned().fold(0.0f32, f32::max).max(1.0);
    (weights.len() as f32 * f32::EPSILON * max).max(1e-4)
}

pub fn uniform_weights(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen::<f32>()).collect()
}

pub fn pareto_weights(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let u: f32 = rng.gen_range(1e-6..1.0);
            u.powf(-1.0 / 2.5)
        })
        .collect()
}

pub fn all_equal_weights(n: usize) -> Vec<f32> {
    vec![1.0; n]
}

pub fn single_spike_weights(n: usize, at: usize) -> Vec<f32> {
    let mut weights = vec![0.0; n];
    weights[at] = 1.0;
    weights
}

pub fn two_spike_weights(n: usize, first: usize, second: usize) -> Vec<f32> {
    let mut weights = vec![0.01; n];
    weights[first] = n as f32;
    weights[second] = n as f32 / 2.0;
    weights
}
