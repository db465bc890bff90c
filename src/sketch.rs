//! Mergeable percentile summaries.
//!
//! Exact and approximate paths share [`MergeableSketch`]: the exact engine and
//! the no-rollup path of the hybrid engine use [`ExactSketch`] (order
//! statistics with `percentile_cont` interpolation), rollups store a
//! [`DigestSketch`] (t-digest), and [`QuantileSketch`] starts exact and only
//! becomes a digest once a digest is merged into it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tdigest::TDigest;

pub const DIGEST_CENTROIDS: usize = 100;
pub const QUANTILES: [f64; 4] = [0.25, 0.5, 0.75, 0.95];

pub trait MergeableSketch {
    fn insert(&mut self, value: f64);
    fn merge(&mut self, other: &Self);
    fn quantile(&self, q: f64) -> Option<f64>;
    fn count(&self) -> u64;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExactSketch {
    values: Vec<f64>,
    sorted: bool,
}

impl ExactSketch {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            sorted: true,
        }
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        let mut sketch = Self {
            values,
            sorted: false,
        };
        sketch.seal();
        sketch
    }

    /// Sorts the retained values so repeated quantile queries do not re-sort.
    pub fn seal(&mut self) {
        if !self.sorted {
            self.values.sort_by(f64::total_cmp);
            self.sorted = true;
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

impl MergeableSketch for ExactSketch {
    fn insert(&mut self, value: f64) {
        if let Some(last) = self.values.last() {
            if value.total_cmp(last) == Ordering::Less {
                self.sorted = false;
            }
        }
        self.values.push(value);
    }

    fn merge(&mut self, other: &Self) {
        if other.values.is_empty() {
            return;
        }
        self.values.extend_from_slice(&other.values);
        self.sorted = false;
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        if self.sorted {
            return percentile_cont(&self.values, q);
        }
        let mut values = self.values.clone();
        values.sort_by(f64::total_cmp);
        percentile_cont(&values, q)
    }

    fn count(&self) -> u64 {
        self.values.len() as u64
    }
}

/// Continuous percentile over sorted values: linear interpolation between the
/// two ranks nearest to `q * (n - 1)`.
pub fn percentile_cont(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || q.is_nan() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let low_value = sorted[lower];
    if lower == upper {
        return Some(low_value);
    }
    Some(low_value + (sorted[upper] - low_value) * (pos - lower as f64))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigestSketch {
    digest: TDigest,
}

impl Default for DigestSketch {
    fn default() -> Self {
        Self {
            digest: TDigest::new_with_size(DIGEST_CENTROIDS),
        }
    }
}

impl DigestSketch {
    /// Builds a digest from a batch of values. Values are sorted first so the
    /// resulting centroids do not depend on input order.
    pub fn from_values(mut values: Vec<f64>) -> Self {
        let mut sketch = Self::default();
        if values.is_empty() {
            return sketch;
        }
        values.sort_by(f64::total_cmp);
        sketch.digest = sketch.digest.merge_sorted(values);
        sketch
    }

    pub fn is_empty(&self) -> bool {
        self.digest.is_empty()
    }
}

impl MergeableSketch for DigestSketch {
    fn insert(&mut self, value: f64) {
        self.digest = self.digest.merge_unsorted(vec![value]);
    }

    fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.digest = other.digest.clone();
            return;
        }
        self.digest = TDigest::merge_digests(vec![self.digest.clone(), other.digest.clone()]);
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() || q.is_nan() {
            return None;
        }
        Some(self.digest.estimate_quantile(q.clamp(0.0, 1.0)))
    }

    fn count(&self) -> u64 {
        self.digest.count().round() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuantileSketch {
    Exact(ExactSketch),
    Digest(DigestSketch),
}

impl Default for QuantileSketch {
    fn default() -> Self {
        QuantileSketch::Exact(ExactSketch::new())
    }
}

impl QuantileSketch {
    pub fn is_exact(&self) -> bool {
        matches!(self, QuantileSketch::Exact(_))
    }

    pub fn seal(&mut self) {
        if let QuantileSketch::Exact(exact) = self {
            exact.seal();
        }
    }

    /// Folds a stored rollup digest in. The sketch stops being exact from
    /// here on.
    pub fn merge_digest(&mut self, other: &DigestSketch) {
        match self {
            QuantileSketch::Digest(digest) => digest.merge(other),
            QuantileSketch::Exact(exact) => {
                let mut promoted = DigestSketch::from_values(exact.values().to_vec());
                promoted.merge(other);
                *self = QuantileSketch::Digest(promoted);
            }
        }
    }

    pub fn percentiles(&self) -> Percentiles {
        let [p25, p50, p75, p95] = QUANTILES.map(|q| self.quantile(q));
        Percentiles { p25, p50, p75, p95 }
    }
}

impl MergeableSketch for QuantileSketch {
    fn insert(&mut self, value: f64) {
        match self {
            QuantileSketch::Exact(exact) => exact.insert(value),
            QuantileSketch::Digest(digest) => digest.insert(value),
        }
    }

    fn merge(&mut self, other: &Self) {
        match other {
            QuantileSketch::Digest(digest) => self.merge_digest(digest),
            QuantileSketch::Exact(other_exact) => match self {
                QuantileSketch::Exact(exact) => exact.merge(other_exact),
                QuantileSketch::Digest(digest) => {
                    digest.merge(&DigestSketch::from_values(other_exact.values().to_vec()))
                }
            },
        }
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        match self {
            QuantileSketch::Exact(exact) => exact.quantile(q),
            QuantileSketch::Digest(digest) => digest.quantile(q),
        }
    }

    fn count(&self) -> u64 {
        match self {
            QuantileSketch::Exact(exact) => exact.count(),
            QuantileSketch::Digest(digest) => digest.count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p95: Option<f64>,
}
