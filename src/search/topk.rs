//! Top-k estimation
//!
//! With documents spread randomly over `n` partitions, the number of global
//! top-`k` documents on one partition is binomial with mean `k/n` and
//! variance `k * (1/n) * (1 - 1/n)`. Asking each partition for
//! `k/n + q * stddev` hits, where `q` is a Student-t quantile, recovers the
//! global top-`k` with probability about `p`.

use crate::{Error, Result};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Partition counts whose quantile for the default probability is precomputed
const CACHED_PARTITIONS: usize = 64;

pub struct TopKEstimator {
    student_t: StudentsT,
    default_p: f64,
    default_cache: Vec<f64>,
}

impl TopKEstimator {
    pub fn new(degrees_of_freedom: f64, default_probability: f64) -> Result<Self> {
        let student_t = StudentsT::new(0.0, 1.0, degrees_of_freedom).map_err(|e| {
            Error::Config(format!(
                "invalid top-k degrees of freedom {degrees_of_freedom}: {e}"
            ))
        })?;
        let mut estimator = Self {
            student_t,
            default_p: default_probability,
            default_cache: Vec::new(),
        };
        if is_probability(default_probability) {
            estimator.default_cache = (0..CACHED_PARTITIONS)
                .map(|n| estimator.quantile(default_probability, n as u32))
                .collect();
        }
        Ok(estimator)
    }

    pub fn default_probability(&self) -> f64 {
        self.default_p
    }

    /// Per-partition hit count for the default probability.
    pub fn estimate_exact_k(&self, k: u32, n: u32) -> u32 {
        self.estimate_exact_k_with(k, n, self.default_p)
    }

    /// Per-partition hit count `k'`, with `n * k' >= k`. Falls back to `k`
    /// when `n <= 1` or `p` is not a probability strictly inside (0, 1).
    pub fn estimate_exact_k_with(&self, k: u32, n: u32, p: f64) -> u32 {
        if n <= 1 || !is_probability(p) || k == 0 {
            return k;
        }
        let q = self.cached_quantile(p, n);
        let inv_n = 1.0 / n as f64;
        let variance = k as f64 * inv_n * (1.0 - inv_n);
        let exact = (k as f64 * inv_n + q * variance.sqrt()).ceil();
        let floor = k.div_ceil(n);
        if exact.is_finite() && exact > floor as f64 {
            exact.min(u32::MAX as f64) as u32
        } else {
            floor
        }
    }

    /// Hits to request from each of `n` partitions, never more than `k`.
    pub fn estimate_k(&self, k: u32, n: u32) -> u32 {
        self.estimate_k_with(k, n, self.default_p)
    }

    pub fn estimate_k_with(&self, k: u32, n: u32, p: f64) -> u32 {
        if n <= 1 || !is_probability(p) {
            return k;
        }
        k.min(self.estimate_exact_k_with(k, n, p))
    }

    fn cached_quantile(&self, p: f64, n: u32) -> f64 {
        if p == self.default_p {
            if let Some(q) = self.default_cache.get(n as usize) {
                return *q;
            }
        }
        self.quantile(p, n)
    }

    fn quantile(&self, p: f64, n: u32) -> f64 {
        let n = n.max(1) as f64;
        let p2 = 1.0 - (1.0 - p) / n;
        self.student_t.inverse_cdf(p2)
    }
}

impl std::fmt::Debug for TopKEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopKEstimator")
            .field("degrees_of_freedom", &self.student_t.freedom())
            .field("default_p", &self.default_p)
            .finish()
    }
}

fn is_probability(p: f64) -> bool {
    p > 0.0 && p < 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> TopKEstimator {
        TopKEstimator::new(30.0, 0.9999).unwrap()
    }

    #[test]
    fn test_fallbacks_return_k() {
        let e = estimator();
        assert_eq!(e.estimate_k_with(200, 1, 0.9), 200);
        assert_eq!(e.estimate_k_with(200, 0, 0.9), 200);
        assert_eq!(e.estimate_k_with(200, 10, 1.0), 200);
        assert_eq!(e.estimate_k_with(200, 10, 0.0), 200);
        assert_eq!(e.estimate_k_with(200, 10, f64::NAN), 200);
        assert_eq!(e.estimate_exact_k_with(200, 10, 1.5), 200);
    }

    #[test]
    fn test_estimate_reduces_per_partition_hits() {
        let e = estimator();
        let k = e.estimate_k(200, 10);
        assert!(k < 200, "expected reduction, got {k}");
        assert!(k >= 20);
        assert!(k * 10 >= 200);
    }

    #[test]
    fn test_cached_and_uncached_agree() {
        let e = estimator();
        let cached = e.estimate_exact_k(1000, 12);
        let direct = TopKEstimator::new(30.0, 0.5).unwrap().estimate_exact_k_with(1000, 12, 0.9999);
        assert_eq!(cached, direct);
    }

    #[test]
    fn test_monotone_in_probability() {
        let e = estimator();
        for n in [2u32, 3, 8, 40, 100] {
            for k in [1u32, 10, 100, 1000] {
                let mut prev = 0;
                for p in [0.1, 0.5, 0.9, 0.99, 0.999, 0.9999] {
                    let est = e.estimate_exact_k_with(k, n, p);
                    assert!(est >= prev, "k={k} n={n} p={p}: {est} < {prev}");
                    assert!(est as u64 * n as u64 >= k as u64);
                    prev = est;
                }
            }
        }
    }

    #[test]
    fn test_invalid_freedom_is_config_error() {
        assert!(matches!(TopKEstimator::new(0.0, 0.9), Err(Error::Config(_))));
    }
}
