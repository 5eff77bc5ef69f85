//! Fixed-boundary duration histogram

use std::sync::Arc;

/// Explicit-bucket histogram. `counts[i]` holds observations `v` with
/// `bounds[i-1] < v <= bounds[i]`; the last slot is the overflow bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    bounds: Arc<[f64]>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn new(bounds: Arc<[f64]>) -> Self {
        let slots = bounds.len() + 1;
        Self {
            bounds,
            counts: vec![0; slots],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let slot = self.bounds.partition_point(|&bound| bound < value);
        self.counts[slot] += 1;
        self.sum += value;
        self.count += 1;
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Per-bucket counts, overflow last
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Running totals as rendered for `le` buckets, `+Inf` last
    pub fn cumulative(&self) -> Vec<u64> {
        self.counts
            .iter()
            .scan(0u64, |total, &n| {
                *total += n;
                Some(*total)
            })
            .collect()
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}
