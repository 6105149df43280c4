// Host-side reference implementations of every device primitive. The
// integration tests validate GPU output against these, and the PSA pieces
// double as the oracle for split/pack correctness on the CPU alone.

use crate::layout::{AliasEntry, SplitEntry};

pub fn mean(weights: &[f32]) -> f32 {
    let sum: f64 = weights.iter().map(|&w| w as f64).sum();
    (sum / weights.len() as f64) as f32
}

pub fn inclusive_scan(elements: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(elements.len());
    let mut acc = 0.0f64;
    for &value in elements {
        acc += value as f64;
        out.push(acc as f32);
    }
    out
}

pub fn exclusive_scan(elements: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(elements.len());
    let mut acc = 0.0f64;
    for &value in elements {
        out.push(acc as f32);
        acc += value as f64;
    }
    out
}

pub struct PartitionReference {
    pub heavy_count: usize,
    /// Heavy source indices ascending, then light source indices in
    /// reverse source order, exactly like the device layout.
    pub partition_indices: Vec<u32>,
    /// Exclusive in-group weight prefixes, mirroring partition_indices.
    pub partition_prefix: Vec<f32>,
}

pub fn prefix_partition(weights: &[f32], pivot: f32) -> PartitionReference {
    let n = weights.len();
    let mut partition_indices = vec![0u32; n];
    let mut partition_prefix = vec![0f32; n];
    let mut heavy_rank = 0usize;
    let mut light_rank = 0usize;
    let mut heavy_sum = 0.0f64;
    let mut light_sum = 0.0f64;
    for (index, &weight) in weights.iter().enumerate() {
        if weight > pivot {
            partition_indices[heavy_rank] = index as u32;
            partition_prefix[heavy_rank] = heavy_sum as f32;
            heavy_sum += weight as f64;
            heavy_rank += 1;
        } else {
            partition_indices[n - 1 - light_rank] = index as u32;
            partition_prefix[n - 1 - light_rank] = light_sum as f32;
            light_sum += weight as f64;
            light_rank += 1;
        }
    }
    PartitionReference {
        heavy_count: heavy_rank,
        partition_indices,
        partition_prefix,
    }
}

fn heavy_prefix(partition_prefix: &[f32], j: usize) -> f32 {
    partition_prefix[j]
}

fn light_prefix(partition_prefix: &[f32], n: usize, light_count: usize, i: usize) -> f32 {
    if i >= light_count {
        return f32::MAX;
    }
    partition_prefix[n - 1 - i]
}

/// Reference split: K + 1 entries with the terminal boundary forced.
pub fn split(
    partition_prefix: &[f32],
    heavy_count: usize,
    mean: f32,
    split_size: usize,
) -> Vec<SplitEntry> {
    let n = partition_prefix.len();
    let light_count = n - heavy_count;
    let k = n.div_ceil(split_size);
    let mut out = Vec::with_capacity(k + 1);
    out.push(SplitEntry {
        i: 0,
        j: 0,
        spill: 0.0,
    });
    for s in 1..=k {
        if s == k {
            out.push(SplitEntry {
                i: light_count as u32,
                j: heavy_count as u32,
                spill: 0.0,
            });
            break;
        }
        let n_s = s * split_size;
        let target = n_s as f32 * mean;
        if heavy_count == 0 {
            out.push(SplitEntry {
                i: n_s as u32,
                j: 0,
                spill: 0.0,
            });
            continue;
        }
        // Largest j whose fully packed mass stays below the target; the
        // last heavy element is kept open.
        let mut lo = n_s.saturating_sub(light_count);
        let mut hi = n_s.min(heavy_count - 1);
        let pred = |j: usize| {
            heavy_prefix(partition_prefix, j)
                + light_prefix(partition_prefix, n, light_count, n_s - j)
                <= target
        };
        if pred(lo) {
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                if pred(mid) {
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
        }
        let j = lo;
        let i = n_s - j;
        let mut spill = 0.0;
        if j + 1 < heavy_count {
            spill = heavy_prefix(partition_prefix, j + 1)
                + light_prefix(partition_prefix, n, light_count, i)
                - target;
        }
        let tol = mean * 2f32.powi(-20);
        if spill.abs() < tol {
            spill = 0.0;
        } else if (spill - mean).abs() < tol {
            spill = mean;
        }
        out.push(SplitEntry {
            i: i as u32,
            j: j as u32,
            spill,
        });
    }
    out
}

/// Packs one split subproblem into its alias table slice; returns the
/// residual accumulator for inspection.
#[allow(clippy::too_many_arguments)]
pub fn pack(
    heavy_indices: &[u32],
    light_indices: &[u32],
    weights: &[f32],
    mean: f32,
    i0: usize,
    i1: usize,
    j0: usize,
    j1: usize,
    spill: f32,
    alias_table: &mut [AliasEntry],
) -> f32 {
    let heavy_count = heavy_indices.len();
    let mu = mean as f64;
    // No heavy side means every weight equals the mean; each light bucket
    // is full on its own.
    if heavy_count == 0 {
        for &l in &light_indices[i0..i1] {
            alias_table[l as usize] = AliasEntry {
                p: (weights[l as usize] as f64 / mu) as f32,
                a: l,
            };
        }
        return 0.0;
    }
    let mut i = i0;
    let mut j = j0;
    let mut w = spill as f64;
    if w == 0.0 && j < heavy_count {
        w = weights[heavy_indices[j] as usize] as f64;
    }
    while j != heavy_count {
        if w > mu {
            if i >= i1 {
                while j < j1 {
                    let h = heavy_indices[j];
                    alias_table[h as usize] = AliasEntry { p: 1.0, a: h };
                    w -= mu;
                    j += 1;
                }
                break;
            }
            let l = light_indices[i] as usize;
            let h = heavy_indices[j];
            alias_table[l] = AliasEntry {
                p: (weights[l] as f64 / mu) as f32,
                a: h,
            };
            w = (w + weights[l] as f64) - mu;
            i += 1;
        } else {
            let h = heavy_indices[j];
            if j >= j1 {
                while i < i1 {
                    let l = light_indices[i] as usize;
                    alias_table[l] = AliasEntry {
                        p: (weights[l] as f64 / mu) as f32,
                        a: h,
                    };
                    w = (w + weights[l] as f64) - mu;
                    i += 1;
                }
                break;
            }
            let prob = (w / mu) as f32;
            if j + 1 >= heavy_count {
                alias_table[h as usize] = AliasEntry { p: prob, a: h };
                w -= mu;
                while i < i1 {
                    let l = light_indices[i] as usize;
                    alias_table[l] = AliasEntry {
                        p: (weights[l] as f64 / mu) as f32,
                        a: h,
                    };
                    w = (w + weights[l] as f64) - mu;
                    i += 1;
                }
                break;
            }
            let hnext = heavy_indices[j + 1];
            alias_table[h as usize] = AliasEntry {
                p: prob,
                a: hnext,
            };
            w = (w + weights[hnext as usize] as f64) - mu;
            j += 1;
        }
    }
    w as f32
}

pub fn pack_splits(
    partition: &PartitionReference,
    weights: &[f32],
    mean: f32,
    splits: &[SplitEntry],
) -> Vec<AliasEntry> {
    let n = weights.len();
    let heavy = &partition.partition_indices[..partition.heavy_count];
    let light: Vec<u32> = partition.partition_indices[partition.heavy_count..]
        .iter()
        .rev()
        .copied()
        .collect();
    let mut alias_table = vec![AliasEntry { p: 0.0, a: 0 }; n];
    for pair in splits.windows(2) {
        pack(
            heavy,
            &light,
            weights,
            mean,
            pair[0].i as usize,
            pair[1].i as usize,
            pair[0].j as usize,
            pair[1].j as usize,
            pair[0].spill,
            &mut alias_table,
        );
    }
    alias_table
}

/// Full CPU PSA: partition, split, pack.
pub fn alias_table(weights: &[f32], split_size: usize) -> Vec<AliasEntry> {
    let mu = mean(weights);
    if mu <= 0.0 {
        return vec![AliasEntry { p: 1.0, a: 0 }; weights.len()];
    }
    let partition = prefix_partition(weights, mu);
    let splits = split(&partition.partition_prefix, partition.heavy_count, mu, split_size);
    pack_splits(&partition, weights, mu, &splits)
}

/// contrib(i) = p_i + sum over redirects into i of (1 - p_j); a correct
/// table satisfies contrib(i) == w_i / mean.
pub fn alias_contributions(table: &[AliasEntry]) -> Vec<f32> {
    let mut contrib = vec![0.0f64; table.len()];
    for (index, entry) in table.iter().enumerate() {
        contrib[index] += entry.p as f64;
        if (entry.a as usize) < table.len() {
            contrib[entry.a as usize] += 1.0 - entry.p as f64;
        }
    }
    contrib.into_iter().map(|c| c as f32).collect()
}

// Philox4x32-10, bit-exact with the device kernels.

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;

pub fn philox4x32(counter: [u32; 4], seed: u32) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = [seed, seed ^ 0x85EB_CA6B];
    for _ in 0..10 {
        let p0 = (PHILOX_M0 as u64) * (ctr[0] as u64);
        let p1 = (PHILOX_M1 as u64) * (ctr[2] as u64);
        ctr = [
            (p1 >> 32) as u32 ^ ctr[1] ^ key[0],
            p1 as u32,
            (p0 >> 32) as u32 ^ ctr[3] ^ key[1],
            p0 as u32,
        ];
        key[0] = key[0].wrapping_add(PHILOX_W0);
        key[1] = key[1].wrapping_add(PHILOX_W1);
    }
    ctr
}

pub fn unit_float(word: u32) -> f32 {
    (word >> 8) as f32 * 5.960_464_5e-8
}

/// The uniform quad the generator kernel produces for positions
/// `4 * quad .. 4 * quad + 4`.
pub fn philox_quad(seed: u32, first_position: u64) -> [f32; 4] {
    let r = philox4x32(
        [
            first_position as u32,
            (first_position >> 32) as u32,
            0,
            0,
        ],
        seed,
    );
    [
        unit_float(r[0]),
        unit_float(r[1]),
        unit_float(r[2]),
        unit_float(r[3]),
    ]
}

/// The sampler's output for slot `position`, bit-exact with the kernel.
pub fn sample_index(table: &[AliasEntry], seed: u32, position: u64) -> u32 {
    let r = philox4x32(
        [position as u32, (position >> 32) as u32, 1, 0],
        seed,
    );
    let u = unit_float(r[0]);
    let xi = unit_float(r[1]);
    let n = table.len() as u32;
    let bucket = ((u * n as f32) as u32).min(n - 1);
    let entry = table[bucket as usize];
    if xi < entry.p {
        bucket
    } else {
        entry.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_contributions(weights: &[f32], split_size: usize) {
        let mu = mean(weights);
        let table = alias_table(weights, split_size);
        let contrib = alias_contributions(&table);
        let tolerance = weights.len() as f32
            * f32::EPSILON
            * weights.iter().cloned().fold(0.0f32, f32::max).max(1.0);
        for (index, (&c, &w)) in contrib.iter().zip(weights).enumerate() {
            let expected = w / mu;
            assert!(
                (c - expected).abs() <= tolerance.max(1e-3),
                "contrib({index}) = {c}, expected {expected} for weights {weights:?}"
            );
        }
        for entry in &table {
            assert!(entry.p >= 0.0 && entry.p <= 1.0 + 1e-5, "p out of range: {}", entry.p);
        }
    }

    #[test]
    fn partition_reference_matches_layout() {
        let weights = [2.0, 0.0, 3.0, 0.0];
        let partition = prefix_partition(&weights, 1.0);
        assert_eq!(partition.heavy_count, 2);
        assert_eq!(partition.partition_indices, vec![0, 2, 3, 1]);
        assert_eq!(partition.partition_prefix, vec![0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn split_law_holds() {
        let weights = [3.0, 3.0, 1.0, 1.0, 1.0, 1.0];
        let mu = mean(&weights);
        let partition = prefix_partition(&weights, mu);
        let splits = split(&partition.partition_prefix, partition.heavy_count, mu, 2);
        assert_eq!(splits.len(), 4);
        assert_eq!((splits[0].i, splits[0].j), (0, 0));
        assert_eq!(splits[0].spill, 0.0);
        let last = splits.last().unwrap();
        assert_eq!(last.i as usize, weights.len() - partition.heavy_count);
        assert_eq!(last.j as usize, partition.heavy_count);
        assert!(last.spill.abs() < mu * 2f32.powi(-20));
        for pair in splits.windows(2) {
            assert!(pair[0].i <= pair[1].i);
            assert!(pair[0].j <= pair[1].j);
        }
    }

    #[test]
    fn alias_table_law_small_cases() {
        assert_contributions(&[1.0, 1.0, 1.0, 1.0], 2);
        assert_contributions(&[3.0, 1.0], 2);
        assert_contributions(&[0.0, 0.0, 0.0, 1.0], 2);
        assert_contributions(&[3.0, 3.0, 1.0, 1.0, 1.0, 1.0], 2);
        assert_contributions(&[5.0, 0.25, 0.25, 0.25, 0.25, 1.0, 1.0, 1.0], 4);
    }

    #[test]
    fn alias_table_law_many_sizes() {
        for n in [1usize, 2, 3, 5, 16, 33, 257, 1024] {
            let weights: Vec<f32> = (0..n)
                .map(|i| ((i * 2_654_435_761) % 1000) as f32 / 100.0 + 0.01)
                .collect();
            for split_size in [2usize, 8, 64] {
                assert_contributions(&weights, split_size);
            }
        }
    }

    #[test]
    fn philox_is_deterministic_and_uniform() {
        let a = philox4x32([0, 0, 0, 0], 42);
        let b = philox4x32([0, 0, 0, 0], 42);
        assert_eq!(a, b);
        let c = philox4x32([1, 0, 0, 0], 42);
        assert_ne!(a, c);
        for word in a {
            let f = unit_float(word);
            assert!((0.0..1.0).contains(&f));
        }
    }

    #[test]
    fn single_spike_always_sampled() {
        let weights = [0.0, 0.0, 0.0, 1.0];
        let table = alias_table(&weights, 2);
        for k in 0..1000u64 {
            assert_eq!(sample_index(&table, 0, k), 3);
        }
    }
}
