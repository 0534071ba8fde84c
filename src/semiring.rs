//! Semirings: the algebra a chart is filled with.
//!
//! One dynamic program serves every inference quantity by swapping the semiring:
//!
//! | semiring        | `sum`              | `times` | total of the DP          |
//! |-----------------|--------------------|---------|--------------------------|
//! | [`Log`]         | log-sum-exp        | `+`     | \(\log Z\)               |
//! | [`Max`]         | `max`              | `+`     | best structure score     |
//! | [`Entropy`]     | expectation rule   | `+`     | \(H[p]\)                 |
//! | [`KMax`]        | top-k merge        | top-k of pairwise `+` | k best scores |
//! | [`Sampled`]     | log-sum-exp        | `+`     | \(\log Z\) (reverse pass samples) |
//!
//! A semiring value is a run of [`Semiring::size`] consecutive `f64` slots. Every
//! buffer in this crate stores element `e` at `[e * size .. (e + 1) * size]`, so a
//! slice of `m * size` values is read as `m` semiring elements.
//!
//! The reverse pass that turns totals into parts (marginals, argmax, samples, k-best)
//! only needs the local derivative of `sum` and `times`; see [`Differentiable`].
//!
//! [`KMax`]: crate::kmax::KMax
//! [`Sampled`]: crate::sampled::Sampled

use rand::{Rng, RngCore};

/// Errors for semiring construction and evaluation.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Semirings carrying several values per element need at least one.
    #[error("semiring size must be at least 1, got {0}")]
    InvalidSize(usize),
    /// A sampling semiring was differentiated without a generator.
    #[error("sampling semiring needs a random source, none was supplied")]
    MissingRandomSource,
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Random generator threaded explicitly into the reverse pass.
///
/// Only sampling semirings draw from it. Deterministic semirings accept
/// [`RandomSource::none`].
#[derive(Default)]
pub struct RandomSource<'a> {
    rng: Option<&'a mut dyn RngCore>,
}

impl<'a> RandomSource<'a> {
    /// Wrap a generator.
    pub fn new<R: RngCore + 'a>(rng: &'a mut R) -> Self {
        Self { rng: Some(rng) }
    }

    /// No generator; sampling semirings fail with [`Error::MissingRandomSource`].
    pub fn none() -> Self {
        Self { rng: None }
    }

    /// Whether a generator is attached.
    pub fn is_some(&self) -> bool {
        self.rng.is_some()
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> Result<f64> {
        let rng = self.rng.as_deref_mut().ok_or(Error::MissingRandomSource)?;
        Ok(rng.gen::<f64>())
    }
}

impl std::fmt::Debug for RandomSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomSource")
            .field("attached", &self.rng.is_some())
            .finish()
    }
}

/// Algebra over log-scores.
///
/// Slices passed in and out always hold whole elements (`len % size == 0`).
pub trait Semiring {
    /// Number of `f64` slots per element.
    fn size(&self) -> usize;

    /// Number of values [`Semiring::unconvert`] reports per element.
    fn output_size(&self) -> usize {
        self.size()
    }

    /// Identity for `sum`; annihilates under `times`.
    fn zero(&self, out: &mut [f64]);

    /// Identity for `times`.
    fn one(&self, out: &mut [f64]);

    /// Lift a plain log-score into one element.
    fn convert(&self, x: f64, out: &mut [f64]);

    /// Lower one element to the values it reports.
    fn unconvert(&self, v: &[f64]) -> Vec<f64>;

    /// Reduce all elements of `xs` into `out`. An empty `xs` yields `zero`.
    fn sum(&self, xs: &[f64], out: &mut [f64]);

    /// Combine two co-occurring elements.
    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]);

    /// `sum` of element-wise `times` over two equally long runs of elements.
    fn dot(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        let size = self.size();
        let mut products = vec![0.0; a.len()];
        for ((pa, pb), po) in a
            .chunks_exact(size)
            .zip(b.chunks_exact(size))
            .zip(products.chunks_exact_mut(size))
        {
            self.times(pa, pb, po);
        }
        self.sum(&products, out);
    }
}

/// Local vector-Jacobian products of `sum` and `times`.
///
/// Both methods *accumulate* into their gradient buffers. An element whose value is
/// the semiring zero never receives gradient.
pub trait Differentiable: Semiring {
    /// Given `out = times(a, b)` and the upstream gradient `g_out`, add the
    /// contributions to `g_a` and `g_b`.
    fn times_grad(&self, a: &[f64], b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]);

    /// Given `out = sum(xs)` and the upstream gradient `g_out`, add the
    /// contributions to `g_xs` (same length as `xs`).
    fn sum_grad(
        &self,
        xs: &[f64],
        out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        rng: &mut RandomSource<'_>,
    ) -> Result<()>;
}

/// Numerically stable log-sum-exp of slot `slot` across the elements of `xs`.
pub(crate) fn log_sum_exp_slot(xs: &[f64], size: usize, slot: usize) -> f64 {
    let mut m = f64::NEG_INFINITY;
    for e in xs.chunks_exact(size) {
        if e[slot] > m {
            m = e[slot];
        }
    }
    if !m.is_finite() {
        return f64::NEG_INFINITY;
    }
    let mut s = 0.0;
    for e in xs.chunks_exact(size) {
        s += (e[slot] - m).exp();
    }
    m + s.ln()
}

/// Slot-wise `+`, the `times` of every log-space semiring except k-best.
pub(crate) fn add_slots(a: &[f64], b: &[f64], out: &mut [f64]) {
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x + y;
    }
}

/// Gradient of [`add_slots`]: the upstream gradient flows to both operands.
pub(crate) fn add_slots_grad(g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
    for ((g, ga), gb) in g_out.iter().zip(g_a.iter_mut()).zip(g_b.iter_mut()) {
        *ga += g;
        *gb += g;
    }
}

/// Softmax-weighted gradient of a slot-wise log-sum-exp.
pub(crate) fn log_sum_exp_grad(xs: &[f64], out: &[f64], g_out: &[f64], g_xs: &mut [f64]) {
    let size = out.len();
    for slot in 0..size {
        let g = g_out[slot];
        let total = out[slot];
        if g == 0.0 || total == f64::NEG_INFINITY {
            continue;
        }
        for (e, ge) in xs.chunks_exact(size).zip(g_xs.chunks_exact_mut(size)) {
            if e[slot] > f64::NEG_INFINITY {
                ge[slot] += g * (e[slot] - total).exp();
            }
        }
    }
}

/// Lift a buffer of plain scores into semiring elements.
pub(crate) fn lift<S: Semiring + ?Sized>(semiring: &S, xs: &[f64]) -> Vec<f64> {
    let size = semiring.size();
    let mut out = vec![0.0; xs.len() * size];
    for (x, o) in xs.iter().zip(out.chunks_exact_mut(size)) {
        semiring.convert(*x, o);
    }
    out
}

/// `count` semiring zeros.
pub(crate) fn zeros<S: Semiring + ?Sized>(semiring: &S, count: usize) -> Vec<f64> {
    let size = semiring.size();
    let mut out = vec![0.0; count * size];
    for o in out.chunks_exact_mut(size) {
        semiring.zero(o);
    }
    out
}

/// Log semiring: `sum` = log-sum-exp, `times` = `+`.
///
/// The DP total is the log-partition function and its gradient is the vector of
/// exact marginals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Log;

impl Semiring for Log {
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

impl Differentiable for Log {
    fn times_grad(&self, _a: &[f64], _b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
        add_slots_grad(g_out, g_a, g_b);
    }

    fn sum_grad(
        &self,
        xs: &[f64],
        out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        _rng: &mut RandomSource<'_>,
    ) -> Result<()> {
        log_sum_exp_grad(xs, out, g_out, g_xs);
        Ok(())
    }
}

/// Max (Viterbi) semiring: `sum` = `max`, `times` = `+`.
///
/// The gradient of `max` goes entirely to the first maximal input in iteration
/// order, so the extracted argmax structure is deterministic under ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Max;

impl Semiring for Max {
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
        out[0] = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    }

    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        add_slots(a, b, out);
    }
}

impl Differentiable for Max {
    fn times_grad(&self, _a: &[f64], _b: &[f64], g_out: &[f64], g_a: &mut [f64], g_b: &mut [f64]) {
        add_slots_grad(g_out, g_a, g_b);
    }

    fn sum_grad(
        &self,
        xs: &[f64],
        out: &[f64],
        g_out: &[f64],
        g_xs: &mut [f64],
        _rng: &mut RandomSource<'_>,
    ) -> Result<()> {
        if g_out[0] == 0.0 || out[0] == f64::NEG_INFINITY {
            return Ok(());
        }
        if let Some(j) = xs.iter().position(|&x| x == out[0]) {
            g_xs[j] += g_out[0];
        }
        Ok(())
    }
}

/// Entropy (expectation) semiring over `(log Z, H)` pairs.
///
/// `sum` renormalizes its inputs into \(p_i\) and returns
/// \((\log \sum_i e^{x_i},\ \sum_i p_i (H_i - \log p_i))\); `times` adds both slots.
/// The second slot of the DP total is the Gibbs entropy over structures.
///
/// Not [`Differentiable`]: marginals under this semiring are not defined here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entropy;

impl Semiring for Entropy {
    fn size(&self) -> usize {
        2
    }

    fn output_size(&self) -> usize {
        1
    }

    fn zero(&self, out: &mut [f64]) {
        out[0] = f64::NEG_INFINITY;
        out[1] = 0.0;
    }

    fn one(&self, out: &mut [f64]) {
        out[0] = 0.0;
        out[1] = 0.0;
    }

    fn convert(&self, x: f64, out: &mut [f64]) {
        out[0] = x;
        out[1] = 0.0;
    }

    fn unconvert(&self, v: &[f64]) -> Vec<f64> {
        vec![v[1]]
    }

    fn sum(&self, xs: &[f64], out: &mut [f64]) {
        let z = log_sum_exp_slot(xs, 2, 0);
        if z == f64::NEG_INFINITY {
            self.zero(out);
            return;
        }
        let mut h = 0.0;
        for e in xs.chunks_exact(2) {
            if e[0] == f64::NEG_INFINITY {
                continue;
            }
            let log_p = e[0] - z;
            h += log_p.exp() * (e[1] - log_p);
        }
        out[0] = z;
        out[1] = h;
    }

    fn times(&self, a: &[f64], b: &[f64], out: &mut [f64]) {
        add_slots(a, b, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sum1<S: Semiring + ?Sized>(s: &S, xs: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; s.size()];
        s.sum(&lift(s, xs), &mut out);
        out
    }

    #[test]
    fn log_sum_matches_direct_formula() {
        let out = sum1(&Log, &[0.0, 1.0, -2.0]);
        let expected = (1.0f64 + 1.0f64.exp() + (-2.0f64).exp()).ln();
        assert!((out[0] - expected).abs() < 1e-12, "out={} expected={}", out[0], expected);
    }

    #[test]
    fn identities_hold_for_log_and_max() {
        for x in [-3.0, 0.0, 2.5] {
            for s in [&Log as &dyn Semiring, &Max] {
                let mut zero = [0.0];
                let mut one = [0.0];
                s.zero(&mut zero);
                s.one(&mut one);
                let mut out = [0.0];
                s.times(&[x], &one, &mut out);
                assert_eq!(out[0], x);
                s.sum(&[x, zero[0]], &mut out);
                assert!((out[0] - x).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn empty_sum_is_zero() {
        let mut out = [1.0];
        Log.sum(&[], &mut out);
        assert_eq!(out[0], f64::NEG_INFINITY);
        Max.sum(&[], &mut out);
        assert_eq!(out[0], f64::NEG_INFINITY);
        let mut pair = [1.0, 1.0];
        Entropy.sum(&[], &mut pair);
        assert_eq!(pair, [f64::NEG_INFINITY, 0.0]);
    }

    #[test]
    fn log_gradient_is_softmax() {
        let xs = [0.5, -1.0, 2.0];
        let mut out = [0.0];
        Log.sum(&xs, &mut out);
        let mut g = [0.0; 3];
        Log.sum_grad(&xs, &out, &[1.0], &mut g, &mut RandomSource::none())
            .unwrap();
        let z: f64 = xs.iter().map(|x| x.exp()).sum();
        for (gi, xi) in g.iter().zip(xs) {
            assert!((gi - xi.exp() / z).abs() < 1e-12);
        }
    }

    #[test]
    fn max_gradient_breaks_ties_to_first_maximum() {
        let xs = [1.0, 3.0, 3.0, 2.0];
        let mut out = [0.0];
        Max.sum(&xs, &mut out);
        assert_eq!(out[0], 3.0);
        let mut g = [0.0; 4];
        Max.sum_grad(&xs, &out, &[1.0], &mut g, &mut RandomSource::none())
            .unwrap();
        assert_eq!(g, [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn zero_inputs_receive_no_gradient() {
        let xs = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        let mut out = [0.0];
        Log.sum(&xs, &mut out);
        let mut g = [0.0; 2];
        Log.sum_grad(&xs, &out, &[1.0], &mut g, &mut RandomSource::none())
            .unwrap();
        assert_eq!(g, [0.0, 0.0]);
    }

    #[test]
    fn entropy_of_uniform_choice_is_log_n() {
        let out = sum1(&Entropy, &[0.3, 0.3, 0.3, 0.3]);
        assert!((out[1] - 4.0f64.ln()).abs() < 1e-12, "h={}", out[1]);
        assert!((Entropy.unconvert(&out)[0] - 4.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn entropy_chain_rule_over_products() {
        // Two independent binary choices: H = H(p) + H(q).
        let p = [0.0, 1.0];
        let q = [2.0, -1.0];
        let a = sum1(&Entropy, &p);
        let b = sum1(&Entropy, &q);
        let mut ab = [0.0; 2];
        Entropy.times(&a, &b, &mut ab);

        let h = |xs: &[f64]| {
            let z: f64 = xs.iter().map(|x| x.exp()).sum();
            -xs.iter()
                .map(|x| {
                    let p = x.exp() / z;
                    p * p.ln()
                })
                .sum::<f64>()
        };
        assert!((ab[1] - (h(&p) + h(&q))).abs() < 1e-12);
    }

    #[test]
    fn random_source_without_generator_fails() {
        let mut none = RandomSource::none();
        assert!(!none.is_some());
        assert_eq!(none.uniform(), Err(Error::MissingRandomSource));
    }

    fn fold_matches_flat_sum<S: Semiring + ?Sized>(s: &S, xs: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let size = s.size();
        let lifted = lift(s, xs);
        let mut flat = vec![0.0; size];
        s.sum(&lifted, &mut flat);

        let mut acc = zeros(s, 1);
        let mut pair = vec![0.0; 2 * size];
        for e in lifted.chunks_exact(size) {
            pair[..size].copy_from_slice(&acc);
            pair[size..].copy_from_slice(e);
            s.sum(&pair, &mut acc);
        }
        (flat, acc)
    }

    proptest! {
        #[test]
        fn sequential_and_flat_sums_agree(
            xs in prop::collection::vec(-5.0f64..5.0, 0..12)
        ) {
            for s in [&Log as &dyn Semiring, &Max] {
                let (flat, folded) = fold_matches_flat_sum(s, &xs);
                if flat[0].is_finite() {
                    prop_assert!((flat[0] - folded[0]).abs() < 1e-9);
                } else {
                    prop_assert_eq!(flat[0], folded[0]);
                }
            }
            let (flat, folded) = fold_matches_flat_sum(&Entropy, &xs);
            prop_assert!((flat[1] - folded[1]).abs() < 1e-9, "flat={:?} folded={:?}", flat, folded);
        }

        #[test]
        fn times_distributes_over_sum(
            xs in prop::collection::vec(-5.0f64..5.0, 1..8),
            c in -5.0f64..5.0
        ) {
            let mut lhs = [0.0];
            let mut s = [0.0];
            Log.sum(&xs, &mut s);
            Log.times(&s, &[c], &mut lhs);
            let shifted: Vec<f64> = xs.iter().map(|x| x + c).collect();
            let mut rhs = [0.0];
            Log.sum(&shifted, &mut rhs);
            prop_assert!((lhs[0] - rhs[0]).abs() < 1e-9);
        }
    }
}
