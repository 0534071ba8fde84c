//! Span-scored binary tree CRF.
//!
//! Potentials `scores[b, i, j, A]` score label `A` on leaves `i..=j`. A structure
//! is any binary bracketing of the first `len` leaves in which every span, leaves
//! included, carries one of `nt` labels; its score is the sum of its span scores.
//! There are no grammar rules and no root scores, so the inside pass only needs a
//! single state per cell: the label-summed score of the span times the combined
//! score of its splits.
//!
//! Marginals, argmax, samples and k-best come back as [`SpanParts`] in the layout of
//! the potentials.

use log::{debug, trace};

use crate::chart::{Chart, Totals};
use crate::cky;
use crate::kmax::KMax;
use crate::sampled::MultiSampled;
use crate::semiring::{self, lift, Differentiable, Entropy, Log, Max, RandomSource, Semiring};

/// Errors for span CRF inference.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Parts and potentials describe different problems.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape of the potentials.
        expected: SpanShape,
        /// Shape of the parts.
        got: SpanShape,
    },
    /// Shape, length or extraction-state validation failed.
    #[error(transparent)]
    Cky(#[from] cky::Error),
    /// Semiring construction or evaluation failed.
    #[error(transparent)]
    Semiring(#[from] semiring::Error),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Dimensions of a span CRF problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanShape {
    /// Number of sequences.
    pub batch: usize,
    /// Padded sequence length.
    pub n: usize,
    /// Number of span labels.
    pub nt: usize,
}

impl SpanShape {
    /// Reject zero dimensions.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("batch", self.batch), ("n", self.n), ("nt", self.nt)] {
            if v == 0 {
                return Err(cky::Error::EmptyDimension { name }.into());
            }
        }
        Ok(())
    }

    /// Length of the `scores` buffer.
    pub fn scores_len(&self) -> usize {
        self.batch * self.n * self.n * self.nt
    }

    /// Offset of `scores[b, i, j, a]`.
    pub fn index(&self, b: usize, i: usize, j: usize, a: usize) -> usize {
        ((b * self.n + i) * self.n + j) * self.nt + a
    }

    fn span_index(&self, b: usize, i: usize, j: usize) -> usize {
        (b * self.n + i) * self.n + j
    }
}

/// Log-potentials of a batch of span CRF problems.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPotentials {
    shape: SpanShape,
    scores: Vec<f64>,
}

impl SpanPotentials {
    /// Validate the buffer length against `shape`.
    pub fn new(shape: SpanShape, scores: Vec<f64>) -> Result<Self> {
        shape.validate()?;
        if scores.len() != shape.scores_len() {
            return Err(cky::Error::BufferLength {
                name: "scores",
                len: scores.len(),
                expected: shape.scores_len(),
            }
            .into());
        }
        Ok(Self { shape, scores })
    }

    /// Problem dimensions.
    pub fn shape(&self) -> SpanShape {
        self.shape
    }

    /// `scores[b, i, j, A]`, row-major.
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Score of label `a` on leaves `i..=j`.
    pub fn score_of(&self, b: usize, i: usize, j: usize, a: usize) -> f64 {
        self.scores[self.shape.index(b, i, j, a)]
    }

    /// Total potential of `parts` per batch element.
    pub fn score(&self, parts: &SpanParts) -> Result<Vec<f64>> {
        if parts.shape != self.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                got: parts.shape,
            });
        }
        let per = self.shape.n * self.shape.n * self.shape.nt;
        Ok(self
            .scores
            .chunks_exact(per)
            .zip(parts.values.chunks_exact(per))
            .map(|(x, m)| {
                x.iter()
                    .zip(m)
                    .filter(|(_, m)| **m != 0.0)
                    .map(|(x, m)| x * m)
                    .sum()
            })
            .collect())
    }
}

/// Span-label parts `values[b, i, j, A]`, the layout of the potentials.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanParts {
    shape: SpanShape,
    values: Vec<f64>,
}

impl SpanParts {
    /// All-zero parts.
    pub fn zeros(shape: SpanShape) -> Self {
        Self {
            shape,
            values: vec![0.0; shape.scores_len()],
        }
    }

    /// Problem dimensions.
    pub fn shape(&self) -> SpanShape {
        self.shape
    }

    /// Row-major values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Part of label `a` on leaves `i..=j`.
    pub fn get(&self, b: usize, i: usize, j: usize, a: usize) -> f64 {
        self.values[self.shape.index(b, i, j, a)]
    }

    pub(crate) fn get_mut(&mut self, b: usize, i: usize, j: usize, a: usize) -> &mut f64 {
        let o = self.shape.index(b, i, j, a);
        &mut self.values[o]
    }

    /// Number of labelled spans of batch element `b` (a weighted count for marginals).
    pub fn span_count(&self, b: usize) -> f64 {
        let per = self.shape.n * self.shape.n * self.shape.nt;
        self.values[b * per..(b + 1) * per].iter().sum()
    }
}

/// State retained from the inside pass for the reverse pass.
#[derive(Debug, Clone)]
pub struct SpanState {
    shape: SpanShape,
    lengths: Vec<usize>,
    scores: Vec<f64>,
    /// `(batch, n, n)` elements: label-summed span scores.
    reduced: Vec<f64>,
    chart: Chart,
}

impl SpanState {
    /// The filled single-state chart.
    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    /// Lengths the pass was run with.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }
}

/// Result of an inside pass.
#[derive(Debug, Clone)]
pub struct SpanInside {
    /// Per-batch totals after `unconvert`.
    pub totals: Totals,
    /// Present when the pass was run with `force_grad`.
    pub state: Option<SpanState>,
}

/// Span CRF over a semiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct CkyCrf<S> {
    semiring: S,
}

fn add_into(dst: &mut [f64], src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

fn is_zero_grad(g: &[f64]) -> bool {
    g.iter().all(|v| *v == 0.0)
}

impl<S: Semiring> CkyCrf<S> {
    /// CRF over `semiring`.
    pub fn new(semiring: S) -> Self {
        Self { semiring }
    }

    /// The semiring charts are filled with.
    pub fn semiring(&self) -> &S {
        &self.semiring
    }

    /// Totals only; no state is retained.
    pub fn sum(&self, potentials: &SpanPotentials, lengths: Option<&[usize]>) -> Result<Totals> {
        Ok(self.compute(potentials, lengths, false)?.totals)
    }

    /// Inside pass. With `force_grad` the chart and reduced span scores are kept for
    /// [`CkyCrf::extract`].
    pub fn compute(
        &self,
        potentials: &SpanPotentials,
        lengths: Option<&[usize]>,
        force_grad: bool,
    ) -> Result<SpanInside> {
        let sr = &self.semiring;
        let shape = potentials.shape;
        shape.validate()?;
        let lengths = cky::resolve_lengths(shape.batch, shape.n, lengths)?;
        let SpanShape { batch, n, nt } = shape;
        let size = sr.size();
        debug!("span crf inside: batch={batch} n={n} nt={nt} size={size} force_grad={force_grad}");

        let scores = lift(sr, &potentials.scores);
        let mut reduced = vec![0.0; batch * n * n * size];
        for (o, labels) in reduced
            .chunks_exact_mut(size)
            .zip(scores.chunks_exact(nt * size))
        {
            sr.sum(labels, o);
        }

        let mut chart = Chart::new(sr, batch, n, 1);
        for b in 0..batch {
            for i in 0..n {
                let o = shape.span_index(b, i, i) * size;
                chart.write(b, i, 0, 0, &reduced[o..o + size]);
            }
        }

        let mut products = Vec::new();
        let mut inner = vec![0.0; size];
        let mut cell = vec![0.0; size];
        for w in 1..n {
            trace!("span crf width {w}/{}", n - 1);
            for b in 0..batch {
                for i in 0..n - w {
                    products.clear();
                    products.resize(w * size, 0.0);
                    for (k, p) in products.chunks_exact_mut(size).enumerate() {
                        let y = chart.state_by_start(b, i, k, 0);
                        let z = chart.state_by_end(b, i + w, w - 1 - k, 0);
                        sr.times(y, z, p);
                    }
                    sr.sum(&products, &mut inner);
                    let o = shape.span_index(b, i, i + w) * size;
                    sr.times(&inner, &reduced[o..o + size], &mut cell);
                    chart.write(b, i, w, 0, &cell);
                }
            }
        }

        let mut totals = Totals::with_width(sr.output_size(), batch);
        for (b, &len) in lengths.iter().enumerate() {
            totals.push(&sr.unconvert(chart.state_by_start(b, 0, len - 1, 0)));
        }

        let state = force_grad.then(|| SpanState {
            shape,
            lengths,
            scores,
            reduced,
            chart,
        });
        Ok(SpanInside { totals, state })
    }
}

impl<S: Differentiable> CkyCrf<S> {
    /// One parts tensor per semiring slot, as [`Cky::extract`](crate::cky::Cky::extract).
    pub fn extract(&self, inside: &SpanInside, rng: &mut RandomSource<'_>) -> Result<Vec<SpanParts>> {
        let state = inside.state.as_ref().ok_or(cky::Error::StateNotRetained)?;
        (0..self.semiring.size())
            .map(|slot| self.backward(state, slot, rng))
            .collect()
    }

    /// Parts tensor of a single semiring slot.
    pub fn extract_slot(
        &self,
        inside: &SpanInside,
        slot: usize,
        rng: &mut RandomSource<'_>,
    ) -> Result<SpanParts> {
        let state = inside.state.as_ref().ok_or(cky::Error::StateNotRetained)?;
        let size = self.semiring.size();
        if slot >= size {
            return Err(cky::Error::SlotOutOfRange { slot, size }.into());
        }
        self.backward(state, slot, rng)
    }

    fn backward(&self, st: &SpanState, slot: usize, rng: &mut RandomSource<'_>) -> Result<SpanParts> {
        let sr = &self.semiring;
        let shape = st.shape;
        let SpanShape { batch, n, nt } = shape;
        let size = sr.size();
        debug!("span crf reverse pass: batch={batch} n={n} slot={slot}");

        let mut g_chart = vec![0.0; st.chart.len()];
        for (b, &len) in st.lengths.iter().enumerate() {
            g_chart[st.chart.start_index(b, 0, len - 1) + slot] += 1.0;
        }
        let mut g_reduced = vec![0.0; st.reduced.len()];

        let mut products = Vec::new();
        let mut g_products = Vec::new();
        let mut inner = vec![0.0; size];
        let mut g_inner = vec![0.0; size];
        let mut g_span = vec![0.0; size];
        let mut g_y = vec![0.0; size];
        let mut g_z = vec![0.0; size];
        for w in (1..n).rev() {
            trace!("span crf reverse width {w}");
            for b in 0..batch {
                for i in 0..n - w {
                    let cell = st.chart.start_index(b, i, w);
                    let g = &g_chart[cell..cell + size];
                    if is_zero_grad(g) {
                        continue;
                    }
                    let g = g.to_vec();
                    products.clear();
                    products.resize(w * size, 0.0);
                    for (k, p) in products.chunks_exact_mut(size).enumerate() {
                        let y = st.chart.state_by_start(b, i, k, 0);
                        let z = st.chart.state_by_end(b, i + w, w - 1 - k, 0);
                        sr.times(y, z, p);
                    }
                    sr.sum(&products, &mut inner);
                    let o = shape.span_index(b, i, i + w) * size;
                    g_inner.fill(0.0);
                    g_span.fill(0.0);
                    sr.times_grad(&inner, &st.reduced[o..o + size], &g, &mut g_inner, &mut g_span);
                    add_into(&mut g_reduced[o..o + size], &g_span);

                    g_products.clear();
                    g_products.resize(products.len(), 0.0);
                    sr.sum_grad(&products, &inner, &g_inner, &mut g_products, rng)?;
                    for (k, gp) in g_products.chunks_exact(size).enumerate() {
                        if is_zero_grad(gp) {
                            continue;
                        }
                        let kr = w - 1 - k;
                        let y = st.chart.state_by_start(b, i, k, 0);
                        let z = st.chart.state_by_end(b, i + w, kr, 0);
                        g_y.fill(0.0);
                        g_z.fill(0.0);
                        sr.times_grad(y, z, gp, &mut g_y, &mut g_z);
                        let ly = st.chart.start_index(b, i, k);
                        add_into(&mut g_chart[ly..ly + size], &g_y);
                        let lz = st.chart.start_index(b, i + w - kr, kr);
                        add_into(&mut g_chart[lz..lz + size], &g_z);
                    }
                }
            }
        }
        for b in 0..batch {
            for i in 0..n {
                let cell = st.chart.start_index(b, i, 0);
                let o = shape.span_index(b, i, i) * size;
                let g = g_chart[cell..cell + size].to_vec();
                add_into(&mut g_reduced[o..o + size], &g);
            }
        }

        let mut parts = SpanParts::zeros(shape);
        let mut g_labels = vec![0.0; nt * size];
        for (span, g) in g_reduced.chunks_exact(size).enumerate() {
            if is_zero_grad(g) {
                continue;
            }
            let labels = &st.scores[span * nt * size..(span + 1) * nt * size];
            g_labels.fill(0.0);
            sr.sum_grad(labels, &st.reduced[span * size..(span + 1) * size], g, &mut g_labels, rng)?;
            for (a, ga) in g_labels.chunks_exact(size).enumerate() {
                parts.values[span * nt + a] = ga.iter().sum();
            }
        }
        Ok(parts)
    }
}

/// \(\log Z\) per batch element.
pub fn partition(potentials: &SpanPotentials, lengths: Option<&[usize]>) -> Result<Vec<f64>> {
    Ok(CkyCrf::new(Log).sum(potentials, lengths)?.scalars())
}

/// Exact span-label marginals.
pub fn marginals(potentials: &SpanPotentials, lengths: Option<&[usize]>) -> Result<SpanParts> {
    let crf = CkyCrf::new(Log);
    let inside = crf.compute(potentials, lengths, true)?;
    crf.extract_slot(&inside, 0, &mut RandomSource::none())
}

/// Best bracketing score and its 0/1 span labels.
pub fn argmax(potentials: &SpanPotentials, lengths: Option<&[usize]>) -> Result<(Vec<f64>, SpanParts)> {
    let crf = CkyCrf::new(Max);
    let inside = crf.compute(potentials, lengths, true)?;
    let parts = crf.extract_slot(&inside, 0, &mut RandomSource::none())?;
    Ok((inside.totals.scalars(), parts))
}

/// Gibbs entropy over bracketings per batch element.
pub fn entropy(potentials: &SpanPotentials, lengths: Option<&[usize]>) -> Result<Vec<f64>> {
    Ok(CkyCrf::new(Entropy).sum(potentials, lengths)?.scalars())
}

/// The `k` best bracketings, best first.
pub fn topk(
    potentials: &SpanPotentials,
    lengths: Option<&[usize]>,
    k: usize,
) -> Result<(Totals, Vec<SpanParts>)> {
    let crf = CkyCrf::new(KMax::new(k)?);
    let inside = crf.compute(potentials, lengths, true)?;
    let parts = crf.extract(&inside, &mut RandomSource::none())?;
    Ok((inside.totals, parts))
}

/// `draws` independent bracketings sampled from the Gibbs distribution.
pub fn sample<R: rand::RngCore>(
    potentials: &SpanPotentials,
    lengths: Option<&[usize]>,
    draws: usize,
    rng: &mut R,
) -> Result<Vec<SpanParts>> {
    let crf = CkyCrf::new(MultiSampled::new(draws)?);
    let inside = crf.compute(potentials, lengths, true)?;
    crf.extract(&inside, &mut RandomSource::new(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::{enumerate_spans, span_bracketings};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-8 || (a == b)
    }

    fn crf(shape: SpanShape, seed: f64) -> SpanPotentials {
        let value = |k: usize| ((k as f64 * 78.233 + seed).sin() * 43758.5453).fract();
        SpanPotentials::new(shape, (0..shape.scores_len()).map(value).collect()).unwrap()
    }

    fn potentials_strategy() -> impl Strategy<Value = (SpanPotentials, Vec<usize>)> {
        (1usize..=2, 1usize..=4, 1usize..=3)
            .prop_flat_map(|(batch, n, nt)| {
                let shape = SpanShape { batch, n, nt };
                (
                    Just(shape),
                    prop::collection::vec(-2.0f64..2.0, shape.scores_len()),
                    prop::collection::vec(1usize..=n, batch),
                )
            })
            .prop_map(|(shape, scores, lengths)| (SpanPotentials::new(shape, scores).unwrap(), lengths))
    }

    /// Same scores over `extra` more leaves; every span touching them scores `fill`.
    fn pad(pot: &SpanPotentials, extra: usize, fill: f64) -> SpanPotentials {
        let short = pot.shape();
        let shape = SpanShape {
            n: short.n + extra,
            ..short
        };
        let mut scores = vec![fill; shape.scores_len()];
        for b in 0..short.batch {
            for i in 0..short.n {
                for j in 0..short.n {
                    for a in 0..short.nt {
                        scores[shape.index(b, i, j, a)] = pot.score_of(b, i, j, a);
                    }
                }
            }
        }
        SpanPotentials::new(shape, scores).unwrap()
    }

    fn totals_close(a: &Totals, b: &Totals) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| x.iter().zip(y).all(|(u, v)| close(*u, *v)))
    }

    #[test]
    fn single_leaf_sums_its_labels() {
        let shape = SpanShape { batch: 1, n: 1, nt: 2 };
        let pot = SpanPotentials::new(shape, vec![0.0, 2.0f64.ln()]).unwrap();
        let z = partition(&pot, None).unwrap();
        assert!(close(z[0], 3.0f64.ln()));
        let m = marginals(&pot, None).unwrap();
        assert!(close(m.get(0, 0, 0, 0), 1.0 / 3.0));
        assert!(close(m.get(0, 0, 0, 1), 2.0 / 3.0));
    }

    #[test]
    fn bracketing_count_matches_catalan() {
        // Three leaves, two labels: 2 bracketings times 2^5 labelings.
        let shape = SpanShape { batch: 1, n: 3, nt: 2 };
        let pot = SpanPotentials::new(shape, vec![0.0; shape.scores_len()]).unwrap();
        assert_eq!(span_bracketings(&pot, 0, 3).len(), 64);
        let z = partition(&pot, None).unwrap();
        assert!(close(z[0], 64.0f64.ln()));
    }

    #[test]
    fn score_buffer_is_validated() {
        let shape = SpanShape { batch: 1, n: 2, nt: 2 };
        assert_eq!(
            SpanPotentials::new(shape, vec![0.0; 7]).unwrap_err(),
            Error::Cky(cky::Error::BufferLength {
                name: "scores",
                len: 7,
                expected: 8
            })
        );
        let shape = SpanShape { batch: 1, n: 2, nt: 0 };
        assert_eq!(
            SpanPotentials::new(shape, vec![]).unwrap_err(),
            Error::Cky(cky::Error::EmptyDimension { name: "nt" })
        );
    }

    #[test]
    fn mismatched_parts_are_rejected() {
        let pot = crf(SpanShape { batch: 1, n: 3, nt: 2 }, 0.1);
        let other = SpanParts::zeros(SpanShape { batch: 1, n: 2, nt: 2 });
        assert!(matches!(pot.score(&other), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn marginals_cover_every_leaf_and_the_whole_span() {
        let shape = SpanShape { batch: 2, n: 5, nt: 3 };
        let pot = crf(shape, 0.9);
        let lengths = [5, 3];
        let m = marginals(&pot, Some(&lengths)).unwrap();
        for (b, &len) in lengths.iter().enumerate() {
            for i in 0..len {
                let leaf: f64 = (0..3).map(|a| m.get(b, i, i, a)).sum();
                assert!(close(leaf, 1.0));
            }
            let whole: f64 = (0..3).map(|a| m.get(b, 0, len - 1, a)).sum();
            assert!(close(whole, 1.0));
            // A binary bracketing of `len` leaves has `2 len - 1` spans.
            assert!(close(m.span_count(b), (2 * len - 1) as f64));
        }
    }

    #[test]
    fn argmax_scores_the_best_bracketing() {
        let shape = SpanShape { batch: 2, n: 4, nt: 2 };
        let pot = crf(shape, 1.7);
        let (best, parts) = argmax(&pot, Some(&[4, 2])).unwrap();
        let scored = pot.score(&parts).unwrap();
        for b in 0..2 {
            assert!(close(best[b], scored[b]));
        }
        assert!(parts.values().iter().all(|v| *v == 0.0 || *v == 1.0));
        assert_eq!(parts.span_count(0), 7.0);
        assert_eq!(parts.span_count(1), 3.0);
    }

    #[test]
    fn topk_matches_sorted_enumeration() {
        let shape = SpanShape { batch: 1, n: 3, nt: 2 };
        let pot = crf(shape, 2.3);
        let (_, all) = enumerate_spans(&pot, None, &Log).unwrap();
        let mut scores: Vec<f64> = all[0].iter().map(|(s, _)| *s).collect();
        scores.sort_by(|a, b| b.total_cmp(a));
        let (totals, parts) = topk(&pot, None, 4).unwrap();
        for j in 0..4 {
            assert!(close(totals.get(0)[j], scores[j]));
            assert!(close(pot.score(&parts[j]).unwrap()[0], scores[j]));
        }
    }

    #[test]
    fn samples_follow_the_gibbs_distribution() {
        // Two leaves have a single bracketing, so only the labels vary.
        let shape = SpanShape { batch: 1, n: 2, nt: 2 };
        let mut scores = vec![0.0; shape.scores_len()];
        scores[shape.index(0, 0, 1, 1)] = 1.0;
        let pot = SpanPotentials::new(shape, scores).unwrap();
        let draws = 2000;
        let samples = sample(&pot, None, draws, &mut StdRng::seed_from_u64(17)).unwrap();
        let mut hits = 0;
        for s in &samples {
            assert_eq!(s.span_count(0), 3.0);
            if s.get(0, 0, 1, 1) == 1.0 {
                hits += 1;
            }
        }
        let p = 1.0f64.exp() / (1.0f64.exp() + 1.0);
        let freq = hits as f64 / draws as f64;
        assert!((freq - p).abs() < 0.04, "freq={freq} p={p}");
    }

    #[test]
    fn extraction_requires_retained_state() {
        let pot = crf(SpanShape { batch: 1, n: 3, nt: 2 }, 0.4);
        let crf = CkyCrf::new(Max);
        let inside = crf.compute(&pot, None, false).unwrap();
        assert_eq!(
            crf.extract(&inside, &mut RandomSource::none()).unwrap_err(),
            Error::Cky(cky::Error::StateNotRetained)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn log_and_max_match_enumeration((pot, lengths) in potentials_strategy()) {
            let z = partition(&pot, Some(&lengths)).unwrap();
            let (brute, all) = enumerate_spans(&pot, Some(&lengths), &Log).unwrap();
            let best = CkyCrf::new(Max).sum(&pot, Some(&lengths)).unwrap();
            for b in 0..z.len() {
                prop_assert!(close(z[b], brute.get(b)[0]));
                let m = all[b].iter().map(|(s, _)| *s).fold(f64::NEG_INFINITY, f64::max);
                prop_assert!(close(best.get(b)[0], m));
            }
        }

        #[test]
        fn entropy_matches_enumeration((pot, lengths) in potentials_strategy()) {
            let h = entropy(&pot, Some(&lengths)).unwrap();
            let (brute, _) = enumerate_spans(&pot, Some(&lengths), &Entropy).unwrap();
            for b in 0..h.len() {
                prop_assert!((h[b] - brute.get(b)[0]).abs() < 1e-7);
            }
        }

        #[test]
        fn padding_leaves_totals_and_marginals_unchanged(
            (pot, lengths) in potentials_strategy(),
            extra in 1usize..=2
        ) {
            let padded = pad(&pot, extra, 5.0);
            let lengths = Some(lengths.as_slice());
            prop_assert!(totals_close(
                &CkyCrf::new(Log).sum(&pot, lengths).unwrap(),
                &CkyCrf::new(Log).sum(&padded, lengths).unwrap()
            ));
            prop_assert!(totals_close(
                &CkyCrf::new(Max).sum(&pot, lengths).unwrap(),
                &CkyCrf::new(Max).sum(&padded, lengths).unwrap()
            ));
            prop_assert!(totals_close(
                &CkyCrf::new(Entropy).sum(&pot, lengths).unwrap(),
                &CkyCrf::new(Entropy).sum(&padded, lengths).unwrap()
            ));
            let kmax = CkyCrf::new(KMax::new(3).unwrap());
            prop_assert!(totals_close(
                &kmax.sum(&pot, lengths).unwrap(),
                &kmax.sum(&padded, lengths).unwrap()
            ));

            let ma = marginals(&pot, lengths).unwrap();
            let mb = marginals(&padded, lengths).unwrap();
            let SpanShape { batch, n, nt } = pot.shape();
            for b in 0..batch {
                for i in 0..n + extra {
                    for j in 0..n + extra {
                        for a in 0..nt {
                            let expected = if i < n && j < n { ma.get(b, i, j, a) } else { 0.0 };
                            prop_assert!(close(expected, mb.get(b, i, j, a)));
                        }
                    }
                }
            }
        }

        #[test]
        fn marginals_match_enumeration((pot, lengths) in potentials_strategy()) {
            let m = marginals(&pot, Some(&lengths)).unwrap();
            let (totals, all) = enumerate_spans(&pot, Some(&lengths), &Log).unwrap();
            let mut expected = SpanParts::zeros(pot.shape());
            for (b, bs) in all.iter().enumerate() {
                for (score, bracketing) in bs {
                    bracketing.add_to(&mut expected, b, (score - totals.get(b)[0]).exp());
                }
            }
            for (x, y) in m.values().iter().zip(expected.values()) {
                prop_assert!((x - y).abs() < 1e-8);
            }
        }
    }
}
