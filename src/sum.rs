//! Correctly rounded floating-point summation.
//!
//! [`ExactSum`] keeps Shewchuk's non-overlapping partials, so the rounded
//! total depends only on the multiset of values added. Exact scans and
//! rollup merges therefore produce bit-identical sums.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExactSum {
    partials: Vec<f64>,
}

impl ExactSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_partials(partials: Vec<f64>) -> Self {
        let mut sum = Self::new();
        for value in partials {
            sum.add(value);
        }
        sum
    }

    pub fn partials(&self) -> &[f64] {
        &self.partials
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Adds `value` without rounding error. Non-finite values are not supported.
    pub fn add(&mut self, value: f64) {
        let mut x = value;
        let mut kept = 0;
        for idx in 0..self.partials.len() {
            let mut y = self.partials[idx];
            if x.abs() < y.abs() {
                std::mem::swap(&mut x, &mut y);
            }
            let hi = x + y;
            let lo = y - (hi - x);
            if lo != 0.0 {
                self.partials[kept] = lo;
                kept += 1;
            }
            x = hi;
        }
        self.partials.truncate(kept);
        self.partials.push(x);
    }

    pub fn merge(&mut self, other: &ExactSum) {
        for value in &other.partials {
            self.add(*value);
        }
    }

    /// The exact total rounded once to the nearest `f64` (ties to even).
    pub fn value(&self) -> f64 {
        let Some((&last, rest)) = self.partials.split_last() else {
            return 0.0;
        };
        let mut hi = last;
        let mut lo = 0.0;
        let mut remaining = rest.len();
        while remaining > 0 {
            let x = hi;
            remaining -= 1;
            let y = rest[remaining];
            hi = x + y;
            let yr = hi - x;
            lo = y - yr;
            if lo != 0.0 {
                break;
            }
        }
        // Half-way case: the partials below decide the rounding direction.
        if remaining > 0 {
            let below = rest[remaining - 1];
            if (lo < 0.0 && below < 0.0) || (lo > 0.0 && below > 0.0) {
                let y = lo * 2.0;
                let x = hi + y;
                if y == x - hi {
                    hi = x;
                }
            }
        }
        hi
    }
}

impl FromIterator<f64> for ExactSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut sum = Self::new();
        for value in iter {
            sum.add(value);
        }
        sum
    }
}
