//! CKY inside algorithm for binary context-free grammars, generic over a semiring.
//!
//! Potentials for a batch of `batch` sequences of (padded) length `n`, with `nt`
//! nonterminals and `t` terminals, combined into `S = nt + t` states (nonterminals
//! first):
//!
//! - `terms[b, i, t]`: score of terminal `t` at leaf `i`
//! - `rules[b, A, B, C]`: score of the production \(A \to B\,C\), `A < nt`, `B, C < S`
//! - `roots[b, A]`: score of `A` as the start symbol
//!
//! A structure is a binary derivation of the first `len` leaves whose leaves are
//! terminals and whose internal nodes are nonterminals. Its score is the sum of
//! the terminal, rule and root scores it uses. Under [`Log`] the DP total is
//! \(\log \sum_z e^{\text{score}(z)}\); under [`Max`] it is \(\max_z \text{score}(z)\).
//!
//! The chart is filled by increasing width. For a span of width `w` the four child
//! kinds (nonterminal or terminal on each side) differ only in which split points
//! are admissible, see [`split_range`]. Each width's per-rule combination
//! (`rule_use[w][b, i, A, B, C]`) is retained when requested so that
//! [`Cky::extract`] can differentiate the total with respect to it: under `Log`
//! that gradient is the vector of rule-application marginals.

use std::ops::Range;

use log::{debug, trace};

use crate::chart::{Chart, Totals};
use crate::kmax::KMax;
use crate::parts::CkyParts;
use crate::sampled::MultiSampled;
use crate::semiring::{self, lift, zeros, Differentiable, Entropy, Log, Max, RandomSource, Semiring};

/// Errors for CKY inference.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A dimension of the problem is zero.
    #[error("{name} must be positive")]
    EmptyDimension {
        /// Which dimension.
        name: &'static str,
    },
    /// A potentials or parts buffer does not match the declared shape.
    #[error("{name} has length {len}, expected {expected}")]
    BufferLength {
        /// Which buffer.
        name: &'static str,
        /// The provided length.
        len: usize,
        /// Length implied by the shape.
        expected: usize,
    },
    /// Parts and potentials describe different problems.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Shape of the potentials.
        expected: CkyShape,
        /// Shape of the parts.
        got: CkyShape,
    },
    /// One length per batch element is required.
    #[error("got {len} lengths for a batch of {batch}")]
    LengthCount {
        /// Number of lengths provided.
        len: usize,
        /// Batch size.
        batch: usize,
    },
    /// A sequence length outside `1..=n`.
    #[error("length {length} of batch element {index} is outside 1..={n}")]
    InvalidLength {
        /// Batch element.
        index: usize,
        /// Offending length.
        length: usize,
        /// Padded length.
        n: usize,
    },
    /// Differentiation requested on an inside pass that kept no state.
    #[error("inside pass did not retain its intermediate state; compute with force_grad")]
    StateNotRetained,
    /// Requested semiring slot does not exist.
    #[error("slot {slot} out of range for semiring size {size}")]
    SlotOutOfRange {
        /// Requested slot.
        slot: usize,
        /// Semiring size.
        size: usize,
    },
    /// Semiring construction or evaluation failed.
    #[error(transparent)]
    Semiring(#[from] semiring::Error),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Dimensions of a CKY problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkyShape {
    /// Number of sequences.
    pub batch: usize,
    /// Padded sequence length.
    pub n: usize,
    /// Number of nonterminals.
    pub nt: usize,
    /// Number of terminals.
    pub t: usize,
}

impl CkyShape {
    /// Combined state count `nt + t`.
    pub fn states(&self) -> usize {
        self.nt + self.t
    }

    /// Reject zero dimensions.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("batch", self.batch),
            ("n", self.n),
            ("nt", self.nt),
            ("t", self.t),
        ] {
            if v == 0 {
                return Err(Error::EmptyDimension { name });
            }
        }
        Ok(())
    }

    /// Length of the `terms` buffer.
    pub fn terms_len(&self) -> usize {
        self.batch * self.n * self.t
    }

    /// Length of the `rules` buffer.
    pub fn rules_len(&self) -> usize {
        self.batch * self.nt * self.states() * self.states()
    }

    /// Length of the `roots` buffer.
    pub fn roots_len(&self) -> usize {
        self.batch * self.nt
    }

    /// Offset of `terms[b, i, t]`.
    pub fn term_index(&self, b: usize, i: usize, t: usize) -> usize {
        (b * self.n + i) * self.t + t
    }

    /// Offset of `rules[b, a, l, r]`.
    pub fn rule_index(&self, b: usize, a: usize, l: usize, r: usize) -> usize {
        let s = self.states();
        ((b * self.nt + a) * s + l) * s + r
    }

    /// Offset of `roots[b, a]`.
    pub fn root_index(&self, b: usize, a: usize) -> usize {
        b * self.nt + a
    }

    /// `None` means full length for every element.
    pub(crate) fn resolve_lengths(&self, lengths: Option<&[usize]>) -> Result<Vec<usize>> {
        resolve_lengths(self.batch, self.n, lengths)
    }
}

pub(crate) fn resolve_lengths(batch: usize, n: usize, lengths: Option<&[usize]>) -> Result<Vec<usize>> {
    let Some(lengths) = lengths else {
        return Ok(vec![n; batch]);
    };
    if lengths.len() != batch {
        return Err(Error::LengthCount {
            len: lengths.len(),
            batch,
        });
    }
    for (index, &length) in lengths.iter().enumerate() {
        if length == 0 || length > n {
            return Err(Error::InvalidLength { index, length, n });
        }
    }
    Ok(lengths.to_vec())
}

/// Log-potentials of a batch of CKY problems.
#[derive(Debug, Clone, PartialEq)]
pub struct CkyPotentials {
    shape: CkyShape,
    terms: Vec<f64>,
    rules: Vec<f64>,
    roots: Vec<f64>,
}

impl CkyPotentials {
    /// Validate buffer lengths against `shape`.
    pub fn new(shape: CkyShape, terms: Vec<f64>, rules: Vec<f64>, roots: Vec<f64>) -> Result<Self> {
        shape.validate()?;
        for (name, len, expected) in [
            ("terms", terms.len(), shape.terms_len()),
            ("rules", rules.len(), shape.rules_len()),
            ("roots", roots.len(), shape.roots_len()),
        ] {
            if len != expected {
                return Err(Error::BufferLength {
                    name,
                    len,
                    expected,
                });
            }
        }
        Ok(Self {
            shape,
            terms,
            rules,
            roots,
        })
    }

    /// Problem dimensions.
    pub fn shape(&self) -> CkyShape {
        self.shape
    }

    /// `terms[b, i, t]`, row-major.
    pub fn terms(&self) -> &[f64] {
        &self.terms
    }

    /// `rules[b, A, B, C]`, row-major.
    pub fn rules(&self) -> &[f64] {
        &self.rules
    }

    /// `roots[b, A]`, row-major.
    pub fn roots(&self) -> &[f64] {
        &self.roots
    }

    /// Total potential of `parts` per batch element:
    /// \(\sum \text{terms}\cdot m_\text{terms} + \sum \text{rules}\cdot m_\text{rules} + \sum \text{roots}\cdot m_\text{roots}\).
    ///
    /// For a single-structure parts tensor this is the structure's score, so
    /// `score(z) - log Z` is its log-probability.
    pub fn score(&self, parts: &CkyParts) -> Result<Vec<f64>> {
        if parts.shape() != self.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                got: parts.shape(),
            });
        }
        let shape = self.shape;
        let counts = parts.rule_counts();
        let per_terms = shape.n * shape.t;
        let per_rules = shape.nt * shape.states() * shape.states();
        // Unused parts contribute nothing, even against -inf potentials.
        let dot = |a: &[f64], m: &[f64]| {
            a.iter()
                .zip(m)
                .filter(|(_, m)| **m != 0.0)
                .map(|(x, m)| x * m)
                .sum::<f64>()
        };
        Ok((0..shape.batch)
            .map(|b| {
                dot(
                    &self.terms[b * per_terms..(b + 1) * per_terms],
                    &parts.terms()[b * per_terms..(b + 1) * per_terms],
                ) + dot(
                    &self.rules[b * per_rules..(b + 1) * per_rules],
                    &counts[b * per_rules..(b + 1) * per_rules],
                ) + dot(
                    &self.roots[b * shape.nt..(b + 1) * shape.nt],
                    &parts.roots()[b * shape.nt..(b + 1) * shape.nt],
                )
            })
            .collect())
    }
}

/// Admissible left-child widths for a span of width `w` (in `width` units, a single
/// leaf has width 0) whose children are nonterminals (`true`) or terminals.
///
/// The right child's width is `w - 1 - left`. Terminals only occupy single leaves and
/// nonterminals never do.
pub(crate) fn split_range(left_nt: bool, right_nt: bool, w: usize) -> Range<usize> {
    match (left_nt, right_nt) {
        (false, false) if w == 1 => 0..1,
        (false, true) if w >= 2 => 0..1,
        (true, false) if w >= 2 => w - 1..w,
        (true, true) if w >= 3 => 1..w - 1,
        _ => 0..0,
    }
}

/// Everything the reverse pass needs, kept alive from the inside pass.
#[derive(Debug, Clone)]
pub struct CkyState {
    shape: CkyShape,
    lengths: Vec<usize>,
    rules: Vec<f64>,
    roots: Vec<f64>,
    chart: Chart,
    /// Per width `w = 1..n`: `(batch, n - w, nt, S, S)` elements.
    rule_use: Vec<Vec<f64>>,
    /// `(batch, nt)` elements: the whole-span cell of each sequence.
    top: Vec<f64>,
    /// `(batch)` elements, before `unconvert`.
    total: Vec<f64>,
}

impl CkyState {
    /// The filled chart.
    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    /// Retained rule-use tensor of span width `w` (`1..n`).
    pub fn rule_use(&self, w: usize) -> Option<&[f64]> {
        self.rule_use.get(w.checked_sub(1)?).map(Vec::as_slice)
    }

    /// Lengths the pass was run with.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }
}

/// Result of an inside pass.
#[derive(Debug, Clone)]
pub struct Inside {
    /// Per-batch totals after `unconvert`.
    pub totals: Totals,
    /// Present when the pass was run with `force_grad`.
    pub state: Option<CkyState>,
}

/// CKY parser over a semiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cky<S> {
    semiring: S,
}

fn rule_use_index(shape: &CkyShape, spans: usize, b: usize, i: usize, a: usize) -> usize {
    let s = shape.states();
    ((b * spans + i) * shape.nt + a) * s * s
}

fn slot_sum(g: &[f64]) -> f64 {
    g.iter().sum()
}

fn is_zero_grad(g: &[f64]) -> bool {
    g.iter().all(|v| *v == 0.0)
}

fn add_into(dst: &mut [f64], src: &[f64]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

impl<S: Semiring> Cky<S> {
    /// Parser over `semiring`.
    pub fn new(semiring: S) -> Self {
        Self { semiring }
    }

    /// The semiring charts are filled with.
    pub fn semiring(&self) -> &S {
        &self.semiring
    }

    /// Totals only; no state is retained.
    pub fn sum(&self, potentials: &CkyPotentials, lengths: Option<&[usize]>) -> Result<Totals> {
        Ok(self.compute(potentials, lengths, false)?.totals)
    }

    /// Inside pass. With `force_grad` the chart and every per-width rule-use tensor
    /// are retained for [`Cky::extract`].
    pub fn compute(
        &self,
        potentials: &CkyPotentials,
        lengths: Option<&[usize]>,
        force_grad: bool,
    ) -> Result<Inside> {
        let sr = &self.semiring;
        let shape = potentials.shape;
        shape.validate()?;
        let lengths = shape.resolve_lengths(lengths)?;
        let CkyShape { batch, n, nt, t } = shape;
        let s = shape.states();
        let size = sr.size();
        debug!("cky inside: batch={batch} n={n} nt={nt} t={t} size={size} force_grad={force_grad}");

        let terms = lift(sr, &potentials.terms);
        let rules = lift(sr, &potentials.rules);
        let roots = lift(sr, &potentials.roots);

        let mut chart = Chart::new(sr, batch, n, s);
        for b in 0..batch {
            for i in 0..n {
                let o = shape.term_index(b, i, 0) * size;
                chart.write(b, i, 0, nt, &terms[o..o + t * size]);
            }
        }

        let mut rule_use = Vec::with_capacity(n.saturating_sub(1));
        let mut products = Vec::new();
        let mut inner = vec![0.0; size];
        let mut cell = vec![0.0; nt * size];
        for w in 1..n {
            trace!("cky width {w}/{}", n - 1);
            let spans = n - w;
            let mut ru = zeros(sr, batch * spans * nt * s * s);
            for b in 0..batch {
                for i in 0..spans {
                    for l in 0..s {
                        for r in 0..s {
                            let splits = split_range(l < nt, r < nt, w);
                            if splits.is_empty() {
                                continue;
                            }
                            products.clear();
                            products.resize(splits.len() * size, 0.0);
                            for (p, k) in products.chunks_exact_mut(size).zip(splits) {
                                let y = chart.state_by_start(b, i, k, l);
                                let z = chart.state_by_end(b, i + w, w - 1 - k, r);
                                sr.times(y, z, p);
                            }
                            sr.sum(&products, &mut inner);
                            for a in 0..nt {
                                let o = (rule_use_index(&shape, spans, b, i, a) + l * s + r) * size;
                                let rule = &rules[shape.rule_index(b, a, l, r) * size..][..size];
                                sr.times(&inner, rule, &mut ru[o..o + size]);
                            }
                        }
                    }
                    for a in 0..nt {
                        let o = rule_use_index(&shape, spans, b, i, a) * size;
                        sr.sum(&ru[o..o + s * s * size], &mut cell[a * size..(a + 1) * size]);
                    }
                    chart.write(b, i, w, 0, &cell);
                }
            }
            rule_use.push(ru);
        }

        let mut top = Vec::with_capacity(batch * nt * size);
        let mut total = vec![0.0; batch * size];
        let mut totals = Totals::with_width(sr.output_size(), batch);
        for (b, &len) in lengths.iter().enumerate() {
            let whole = &chart.by_start(b, 0, len - 1)[..nt * size];
            top.extend_from_slice(whole);
            let root = &roots[b * nt * size..(b + 1) * nt * size];
            let out = &mut total[b * size..(b + 1) * size];
            sr.dot(whole, root, out);
            totals.push(&sr.unconvert(out));
        }

        let state = force_grad.then(|| CkyState {
            shape,
            lengths,
            rules,
            roots,
            chart,
            rule_use,
            top,
            total,
        });
        Ok(Inside { totals, state })
    }
}

impl<S: Differentiable> Cky<S> {
    /// One parts tensor per semiring slot: the gradient of that slot of every batch
    /// total with respect to the retained terminal, rule-use and root tensors.
    ///
    /// - [`Log`]: a single tensor of exact marginals
    /// - [`Max`]: a single 0/1 argmax structure
    /// - [`Sampled`](crate::sampled::Sampled): a single sampled structure
    /// - [`KMax`]: the `k` best structures, best first
    /// - [`MultiSampled`]: one independent sample per draw
    pub fn extract(&self, inside: &Inside, rng: &mut RandomSource<'_>) -> Result<Vec<CkyParts>> {
        let state = inside.state.as_ref().ok_or(Error::StateNotRetained)?;
        (0..self.semiring.size())
            .map(|slot| self.backward(state, slot, rng))
            .collect()
    }

    /// Parts tensor of a single semiring slot.
    pub fn extract_slot(
        &self,
        inside: &Inside,
        slot: usize,
        rng: &mut RandomSource<'_>,
    ) -> Result<CkyParts> {
        let state = inside.state.as_ref().ok_or(Error::StateNotRetained)?;
        let size = self.semiring.size();
        if slot >= size {
            return Err(Error::SlotOutOfRange { slot, size });
        }
        self.backward(state, slot, rng)
    }

    /// Reverse pass mirroring [`Cky::compute`]: root, then widths `n-1` down to `1`,
    /// then leaves.
    fn backward(&self, st: &CkyState, slot: usize, rng: &mut RandomSource<'_>) -> Result<CkyParts> {
        let sr = &self.semiring;
        let shape = st.shape;
        let CkyShape { batch, n, nt, t } = shape;
        let s = shape.states();
        let size = sr.size();
        debug!("cky reverse pass: batch={batch} n={n} slot={slot}");

        let mut parts = CkyParts::zeros(shape);
        let mut g_chart = vec![0.0; st.chart.len()];

        let mut seed = vec![0.0; size];
        seed[slot] = 1.0;
        let mut products = vec![0.0; nt * size];
        let mut g_products = vec![0.0; nt * size];
        let mut g_top = vec![0.0; nt * size];
        let mut g_root = vec![0.0; nt * size];
        for (b, &len) in st.lengths.iter().enumerate() {
            let top = &st.top[b * nt * size..(b + 1) * nt * size];
            let root = &st.roots[b * nt * size..(b + 1) * nt * size];
            for ((p, x), y) in products
                .chunks_exact_mut(size)
                .zip(top.chunks_exact(size))
                .zip(root.chunks_exact(size))
            {
                sr.times(x, y, p);
            }
            g_products.fill(0.0);
            sr.sum_grad(&products, &st.total[b * size..(b + 1) * size], &seed, &mut g_products, rng)?;
            g_top.fill(0.0);
            g_root.fill(0.0);
            for a in 0..nt {
                let e = a * size..(a + 1) * size;
                sr.times_grad(
                    &top[e.clone()],
                    &root[e.clone()],
                    &g_products[e.clone()],
                    &mut g_top[e.clone()],
                    &mut g_root[e.clone()],
                );
                parts.roots_mut()[shape.root_index(b, a)] = slot_sum(&g_root[e]);
            }
            let o = st.chart.start_index(b, 0, len - 1);
            add_into(&mut g_chart[o..o + nt * size], &g_top);
        }

        let mut g_span = vec![0.0; size];
        let mut g_ru = vec![0.0; s * s * size];
        let mut inner = vec![0.0; size];
        let mut g_inner = vec![0.0; size];
        let mut g_rule = vec![0.0; size];
        let mut split_products = Vec::new();
        let mut g_split = Vec::new();
        let mut g_y = vec![0.0; size];
        let mut g_z = vec![0.0; size];
        for w in (1..n).rev() {
            trace!("cky reverse width {w}");
            let spans = n - w;
            let ru = &st.rule_use[w - 1];
            for b in 0..batch {
                for i in 0..spans {
                    let cell = st.chart.start_index(b, i, w);
                    for a in 0..nt {
                        g_span.copy_from_slice(&g_chart[cell + a * size..cell + (a + 1) * size]);
                        if is_zero_grad(&g_span) {
                            continue;
                        }
                        let o = rule_use_index(&shape, spans, b, i, a) * size;
                        let out = st.chart.state_by_start(b, i, w, a);
                        g_ru.fill(0.0);
                        sr.sum_grad(&ru[o..o + s * s * size], out, &g_span, &mut g_ru, rng)?;

                        for l in 0..s {
                            for r in 0..s {
                                let g = &g_ru[(l * s + r) * size..(l * s + r + 1) * size];
                                if is_zero_grad(g) {
                                    continue;
                                }
                                *parts.rule_mut(b, w, i, a, l, r) = slot_sum(g);

                                let splits = split_range(l < nt, r < nt, w);
                                if splits.is_empty() {
                                    continue;
                                }
                                split_products.clear();
                                split_products.resize(splits.len() * size, 0.0);
                                for (p, k) in split_products.chunks_exact_mut(size).zip(splits.clone()) {
                                    let y = st.chart.state_by_start(b, i, k, l);
                                    let z = st.chart.state_by_end(b, i + w, w - 1 - k, r);
                                    sr.times(y, z, p);
                                }
                                sr.sum(&split_products, &mut inner);
                                let rule = &st.rules[shape.rule_index(b, a, l, r) * size..][..size];
                                g_inner.fill(0.0);
                                g_rule.fill(0.0);
                                sr.times_grad(&inner, rule, g, &mut g_inner, &mut g_rule);

                                g_split.clear();
                                g_split.resize(split_products.len(), 0.0);
                                sr.sum_grad(&split_products, &inner, &g_inner, &mut g_split, rng)?;
                                for (gp, k) in g_split.chunks_exact(size).zip(splits) {
                                    if is_zero_grad(gp) {
                                        continue;
                                    }
                                    let kr = w - 1 - k;
                                    let y = st.chart.state_by_start(b, i, k, l);
                                    let z = st.chart.state_by_end(b, i + w, kr, r);
                                    g_y.fill(0.0);
                                    g_z.fill(0.0);
                                    sr.times_grad(y, z, gp, &mut g_y, &mut g_z);
                                    let ly = st.chart.start_index(b, i, k) + l * size;
                                    add_into(&mut g_chart[ly..ly + size], &g_y);
                                    let lz = st.chart.start_index(b, i + w - kr, kr) + r * size;
                                    add_into(&mut g_chart[lz..lz + size], &g_z);
                                }
                            }
                        }
                    }
                }
            }
        }

        for b in 0..batch {
            for i in 0..n {
                let cell = st.chart.start_index(b, i, 0);
                for x in 0..t {
                    let o = cell + (nt + x) * size;
                    parts.terms_mut()[shape.term_index(b, i, x)] = slot_sum(&g_chart[o..o + size]);
                }
            }
        }
        Ok(parts)
    }
}

/// \(\log Z\) per batch element.
pub fn partition(potentials: &CkyPotentials, lengths: Option<&[usize]>) -> Result<Vec<f64>> {
    Ok(Cky::new(Log).sum(potentials, lengths)?.scalars())
}

/// Exact marginals of every terminal, rule application and root.
pub fn marginals(potentials: &CkyPotentials, lengths: Option<&[usize]>) -> Result<CkyParts> {
    let cky = Cky::new(Log);
    let inside = cky.compute(potentials, lengths, true)?;
    cky.extract_slot(&inside, 0, &mut RandomSource::none())
}

/// Best derivation score and its 0/1 parts tensor.
pub fn argmax(potentials: &CkyPotentials, lengths: Option<&[usize]>) -> Result<(Vec<f64>, CkyParts)> {
    let cky = Cky::new(Max);
    let inside = cky.compute(potentials, lengths, true)?;
    let parts = cky.extract_slot(&inside, 0, &mut RandomSource::none())?;
    Ok((inside.totals.scalars(), parts))
}

/// Gibbs entropy over derivations per batch element.
pub fn entropy(potentials: &CkyPotentials, lengths: Option<&[usize]>) -> Result<Vec<f64>> {
    Ok(Cky::new(Entropy).sum(potentials, lengths)?.scalars())
}

/// The `k` best derivation scores and their parts tensors, best first.
///
/// Slots beyond the number of existing derivations score `-inf` and have empty parts.
pub fn topk(
    potentials: &CkyPotentials,
    lengths: Option<&[usize]>,
    k: usize,
) -> Result<(Totals, Vec<CkyParts>)> {
    let cky = Cky::new(KMax::new(k)?);
    let inside = cky.compute(potentials, lengths, true)?;
    let parts = cky.extract(&inside, &mut RandomSource::none())?;
    Ok((inside.totals, parts))
}

/// `draws` independent derivations sampled from the Gibbs distribution.
pub fn sample<R: rand::RngCore>(
    potentials: &CkyPotentials,
    lengths: Option<&[usize]>,
    draws: usize,
    rng: &mut R,
) -> Result<Vec<CkyParts>> {
    let cky = Cky::new(MultiSampled::new(draws)?);
    let inside = cky.compute(potentials, lengths, true)?;
    cky.extract(&inside, &mut RandomSource::new(rng))
}
