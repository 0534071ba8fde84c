//! K-best semiring.
//!
//! Each element is a descending list of the `k` best log-scores reaching it.
//! `sum` merges lists and keeps the top `k`; `times` keeps the top `k` of all
//! pairwise sums. A single DP pass therefore yields the `k` best structure scores,
//! and differentiating slot `j` of the total recovers the `j`-th best structure.
//!
//! Missing entries (fewer than `k` derivations) are `-inf`.

use crate::semiring::{Differentiable, Error, RandomSource, Result, Semiring};

/// Keep the `k` best scores per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMax {
    k: usize,
}

impl KMax {
    /// `k` must be at least 1.
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(Error::InvalidSize(k));
        }
        Ok(Self { k })
    }

    /// Number of scores kept per element.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Best `k` candidates as `(score, source)`, sorted by descending score.
    ///
    /// Ties keep the lower source index first.
    fn top(&self, candidates: &mut Vec<(f64, usize)>) {
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(self.k);
    }

    fn sum_candidates(&self, xs: &[f64]) -> Vec<(f64, usize)> {
        let mut candidates: Vec<(f64, usize)> = xs
            .iter()
            .enumerate()
            .filter(|(_, x)| **x > f64::NEG_INFINITY)
            .map(|(j, x)| (*x, j))
            .collect();
        self.top(&mut candidates);
        candidates
    }

    fn times_candidates(&self, a: &[f64], b: &[f64]) -> Vec<(f64, usize)> {
        let k = self.k;
        let mut candidates = Vec::with_capacity(k * k);
        for (i, x) in a.iter().enumerate() {
            if *x == f64::NEG_INFINITY {
                // Lists are sorted: the rest of `a` is -inf too.
                break;
            }
            for (j, y) in b.iter().enumerate() {
                if *y == f64::NEG_INFINITY {
                    break;
                }
                candidates.push((x + y, i * k + j));
            }
        }
        self.top(&mut candidates);
        candidates
    }

    fn write(&self, candidates: &[(f64, usize)], out: &mut [f64]) {
        for (slot, o) in out.iter_mut().enumerate() {
            *o = candidates.get(slot).map_or(f64::NEG_INFINITY, |c| c.0);
        }
    }
}

impl Semiring for KMax {
    fn size(&self) -> usize {
        self.k
    }

    fn zero(&self, out: &mut [f64]) {
        out.fill(f64::NEG_INFINITY);
    }

    fn one(&self, out: &mut [f64]) {
        out.fill(f64::NEG_INFINITY);
        out[0] = 0.0;
    }

    fn convert(&self, x: f64, out: &mut [f64]) {
        out.fill(f64::NEG_INFINITY);
        out[0] = x;
    }

    fn unconvert(&self, v: &[f64]) -> Vec<f64> {
        v.to_vec()
    }

    fn sum(&self, xs: &[f64], out: &mut [f64]) {
        let candidates = self.sum_candidates(xs);
        self.write(&candidates, out);
    }

    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        let candidates = self.times_candidates(a, b);
        self.write(&candidates, out);
    }
}

impl Differentiable for KMax {
    fn times_grad(&self, a: &[f64], b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
        let k = self.k;
        for (slot, (_, source)) in self.times_candidates(a, b).into_iter().enumerate() {
            let g = g_out[slot];
            if g != 0.0 {
                g_a[source / k] += g;
                g_b[source % k] += g;
            }
        }
    }

    fn sum_grad(
        &self,
        xs: &[f64],
        _out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        _rng: &mut RandomSource<'_>,
    ) -> Result<()> {
        for (slot, (_, source)) in self.sum_candidates(xs).into_iter().enumerate() {
            let g = g_out[slot];
            if g != 0.0 {
                g_xs[source] += g;
            }
        }
        Ok(())
    }
}
