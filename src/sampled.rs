//! Sampling semirings.
//!
//! The forward pass is ordinary log-sum-exp, so the DP total is \(\log Z\). The
//! reverse pass replaces the softmax gradient of every `sum` with a one-hot draw
//! proportional to \(e^{x_i - \text{out}}\). Propagating a unit gradient from the
//! total top-down then selects one complete structure with probability
//! \(p(z) = e^{\text{score}(z)} / Z\) (forward filtering, backward sampling).
//!
//! Draws come from the [`RandomSource`] passed to the reverse pass, never from
//! global state; the same seed yields the same samples.

use crate::semiring::{
    add_slots, add_slots_grad, log_sum_exp_slot, Differentiable, Error, RandomSource, Result,
    Semiring,
};

/// One sample per reverse pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sampled;

/// `draws` independent samples from one DP: each slot carries its own copy of the
/// log-partition and draws independently in the reverse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiSampled {
    draws: usize,
}

impl MultiSampled {
    /// `draws` must be at least 1.
    pub fn new(draws: usize) -> Result<Self> {
        if draws == 0 {
            return Err(Error::InvalidSize(draws));
        }
        Ok(Self { draws })
    }

    /// Number of independent samples per pass.
    pub fn draws(&self) -> usize {
        self.draws
    }
}

/// Pick an element of `xs` for slot `slot`, proportionally to `exp(x - total)`.
fn draw(xs: &[f64], size: usize, slot: usize, total: f64, u: f64) -> Option<usize> {
    let mut acc = 0.0;
    let mut last = None;
    for (j, e) in xs.chunks_exact(size).enumerate() {
        if e[slot] == f64::NEG_INFINITY {
            continue;
        }
        acc += (e[slot] - total).exp();
        last = Some(j);
        if u < acc {
            return last;
        }
    }
    // Rounding left `acc` just short of 1.
    last
}

fn sample_grad(
    xs: &[f64],
    out: &[f64],
    g_out: &[f64],
    g_xs: &mut [f64],
    rng: &mut RandomSource<'_>,
) -> Result<()> {
    let size = out.len();
    let elements = xs.len() / size;
    for slot in 0..size {
        let g = g_out[slot];
        if g == 0.0 || out[slot] == f64::NEG_INFINITY {
            continue;
        }
        let chosen = if elements == 1 {
            Some(0)
        } else {
            draw(xs, size, slot, out[slot], rng.uniform()?)
        };
        if let Some(j) = chosen {
            g_xs[j * size + slot] += g;
        }
    }
    Ok(())
}

fn fill_slots(x: f64, out: &mut [f64]) {
    out.fill(x);
}

impl Semiring for Sampled {
    fn size(&self) -> usize {
        1
    }

    fn zero(&self, out: &mut [f64]) {
        out[0] = f64::NEG_INFINITY;
    }

    fn one(&self, out: &mut [f64]) {
        out[0] = 0.0;
    }

    fn convert(&self, x: f64, out: &mut [f64]) {
        out[0] = x;
    }

    fn unconvert(&self, v: &[f64]) -> Vec<f64> {
        vec![v[0]]
    }

    fn sum(&self, xs: &[f64], out: &mut [f64]) {
        out[0] = log_sum_exp_slot(xs, 1, 0);
    }

    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        add_slots(a, b, out);
    }
}

impl Differentiable for Sampled {
    fn times_grad(&self, _a: &[f64], _b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
        add_slots_grad(g_out, g_a, g_b);
    }

    fn sum_grad(
        &self,
        xs: &[f64],
        out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        rng: &mut RandomSource<'_>,
    ) -> Result<()> {
        sample_grad(xs, out, g_out, g_xs, rng)
    }
}

impl Semiring for MultiSampled {
    fn size(&self) -> usize {
        self.draws
    }

    fn zero(&self, out: &mut [f64]) {
        fill_slots(f64::NEG_INFINITY, out);
    }

    fn one(&self, out: &mut [f64]) {
        fill_slots(0.0, out);
    }

    fn convert(&self, x: f64, out: &mut [f64]) {
        fill_slots(x, out);
    }

    fn unconvert(&self, v: &[f64]) -> Vec<f64> {
        v.to_vec()
    }

    fn sum(&self, xs: &[f64], out: &mut [f64]) {
        for (slot, o) in out.iter_mut().enumerate() {
            *o = log_sum_exp_slot(xs, self.draws, slot);
        }
    }

    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        add_slots(a, b, out);
    }
}

impl Differentiable for MultiSampled {
    fn times_grad(&self, _a: &[f64], _b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
        add_slots_grad(g_out, g_a, g_b);
    }

    fn sum_grad(
        &self,
        xs: &[f64],
        out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        rng: &mut RandomSource<'_>,
    ) -> Result<()> {
        sample_grad(xs, out, g_out, g_xs, rng)
    }
}
