//! Parts tensors for CKY and the codec between them and span labelings.
//!
//! A [`CkyParts`] value lives in the same index space as the potentials, except
//! that rule applications are kept per position:
//!
//! - `terms[b, i, t]`
//! - `rules[b, w - 1, start, A, B, C]` for span width `w` in `1..n`
//! - `roots[b, A]`
//!
//! It holds a single structure (0/1), marginals (expectations), or occurrence
//! counts. [`SpanLabels`] is the compact form of a single tree: which symbol covers
//! each substring.

use crate::cky::{self, CkyShape};

/// Errors for the structure codec.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Span labels have a state axis that does not equal `nt + t`.
    #[error("span labels have {states} states, expected nt={nt} + t={t}")]
    LabelCount {
        /// States in the labels.
        states: usize,
        /// Nonterminals requested.
        nt: usize,
        /// Terminals requested.
        t: usize,
    },
    /// A labelled span has no pair of labelled children that tile it.
    #[error("span {start}..={end} labelled {label} of batch element {batch} has no consistent split")]
    InconsistentTree {
        /// Batch element.
        batch: usize,
        /// First leaf.
        start: usize,
        /// Last leaf.
        end: usize,
        /// Label of the span.
        label: usize,
    },
    /// Shape or length validation failed.
    #[error(transparent)]
    Cky(#[from] cky::Error),
}

/// Convenience result type for this module.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-position parts tensor of a CKY problem.
#[derive(Debug, Clone, PartialEq)]
pub struct CkyParts {
    shape: CkyShape,
    terms: Vec<f64>,
    rules: Vec<f64>,
    roots: Vec<f64>,
}

impl CkyParts {
    /// All-zero parts.
    pub fn zeros(shape: CkyShape) -> Self {
        let s = shape.states();
        Self {
            shape,
            terms: vec![0.0; shape.terms_len()],
            rules: vec![0.0; shape.batch * shape.n * shape.n * shape.nt * s * s],
            roots: vec![0.0; shape.roots_len()],
        }
    }

    /// Problem dimensions.
    pub fn shape(&self) -> CkyShape {
        self.shape
    }

    /// `terms[b, i, t]`, row-major.
    pub fn terms(&self) -> &[f64] {
        &self.terms
    }

    /// `rules[b, w - 1, start, A, B, C]`, row-major.
    pub fn rules(&self) -> &[f64] {
        &self.rules
    }

    /// `roots[b, A]`, row-major.
    pub fn roots(&self) -> &[f64] {
        &self.roots
    }

    pub(crate) fn terms_mut(&mut self) -> &mut [f64] {
        &mut self.terms
    }

    pub(crate) fn roots_mut(&mut self) -> &mut [f64] {
        &mut self.roots
    }

    fn rule_index(&self, b: usize, width: usize, start: usize, a: usize, l: usize, r: usize) -> usize {
        let CkyShape { n, nt, .. } = self.shape;
        let s = self.shape.states();
        (((((b * n + width - 1) * n + start) * nt + a) * s + l) * s) + r
    }

    /// Terminal `t` at leaf `i`.
    pub fn term(&self, b: usize, i: usize, t: usize) -> f64 {
        self.terms[self.shape.term_index(b, i, t)]
    }

    /// Rule `a -> l r` applied to the span of `width` (`1..n`) starting at `start`.
    pub fn rule(&self, b: usize, width: usize, start: usize, a: usize, l: usize, r: usize) -> f64 {
        self.rules[self.rule_index(b, width, start, a, l, r)]
    }

    pub(crate) fn rule_mut(
        &mut self,
        b: usize,
        width: usize,
        start: usize,
        a: usize,
        l: usize,
        r: usize,
    ) -> &mut f64 {
        let o = self.rule_index(b, width, start, a, l, r);
        &mut self.rules[o]
    }

    /// Root symbol `a`.
    pub fn root(&self, b: usize, a: usize) -> f64 {
        self.roots[self.shape.root_index(b, a)]
    }

    /// Rule parts summed over positions: `(b, nt, S, S)`, the layout of the `rules`
    /// potentials.
    pub fn rule_counts(&self) -> Vec<f64> {
        let shape = self.shape;
        let per = shape.nt * shape.states() * shape.states();
        let mut counts = vec![0.0; shape.batch * per];
        for b in 0..shape.batch {
            let out = &mut counts[b * per..(b + 1) * per];
            let block = &self.rules[b * shape.n * shape.n * per..(b + 1) * shape.n * shape.n * per];
            for position in block.chunks_exact(per) {
                for (o, v) in out.iter_mut().zip(position) {
                    *o += v;
                }
            }
        }
        counts
    }
}

/// Dense span labeling `values[b, i, j, s]`, nonzero when symbol `s` covers leaves
/// `i..=j`. Leaves carry terminal labels `nt + t` on the diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanLabels {
    /// Number of sequences.
    pub batch: usize,
    /// Padded sequence length.
    pub n: usize,
    /// State count `nt + t`.
    pub states: usize,
    /// Row-major `(batch, n, n, states)`.
    pub values: Vec<f64>,
}

impl SpanLabels {
    /// All-zero labeling.
    pub fn zeros(batch: usize, n: usize, states: usize) -> Self {
        Self {
            batch,
            n,
            states,
            values: vec![0.0; batch * n * n * states],
        }
    }

    fn index(&self, b: usize, i: usize, j: usize, s: usize) -> usize {
        ((b * self.n + i) * self.n + j) * self.states + s
    }

    /// Label weight of `s` on `i..=j`.
    pub fn get(&self, b: usize, i: usize, j: usize, s: usize) -> f64 {
        self.values[self.index(b, i, j, s)]
    }

    /// Set the label weight of `s` on `i..=j`.
    pub fn set(&mut self, b: usize, i: usize, j: usize, s: usize, v: f64) {
        let o = self.index(b, i, j, s);
        self.values[o] = v;
    }
}

/// Parts tensor of the binary tree described by `spans`.
///
/// Every labelled span wider than one leaf must be tiled by two labelled spans that
/// meet; the first such pair (in left-child end order) becomes the span's rule.
pub fn to_parts(spans: &SpanLabels, nt: usize, t: usize, lengths: Option<&[usize]>) -> Result<CkyParts> {
    if spans.states != nt + t {
        return Err(Error::LabelCount {
            states: spans.states,
            nt,
            t,
        });
    }
    let shape = CkyShape {
        batch: spans.batch,
        n: spans.n,
        nt,
        t,
    };
    shape.validate()?;
    let expected = spans.batch * spans.n * spans.n * spans.states;
    if spans.values.len() != expected {
        return Err(cky::Error::BufferLength {
            name: "spans",
            len: spans.values.len(),
            expected,
        }
        .into());
    }
    let lengths = shape.resolve_lengths(lengths)?;
    let mut parts = CkyParts::zeros(shape);

    for (b, &len) in lengths.iter().enumerate() {
        for a in 0..nt {
            parts.roots[shape.root_index(b, a)] = spans.get(b, 0, len - 1, a);
        }
        for i in 0..len {
            for x in 0..t {
                parts.terms[shape.term_index(b, i, x)] = spans.get(b, i, i, nt + x);
            }
        }

        // by_start[i]: (end, label) of spans starting at i; by_end[j]: (start, label).
        let mut by_start: Vec<Vec<(usize, usize)>> = vec![Vec::new(); len];
        let mut by_end: Vec<Vec<(usize, usize)>> = vec![Vec::new(); len];
        let mut cover = Vec::new();
        for i in 0..len {
            for j in i..len {
                for s in 0..spans.states {
                    if spans.get(b, i, j, s) != 0.0 {
                        by_start[i].push((j, s));
                        by_end[j].push((i, s));
                        cover.push((i, j, s));
                    }
                }
            }
        }

        for &(i, j, a) in &cover {
            if i == j {
                continue;
            }
            let inconsistent = Error::InconsistentTree {
                batch: b,
                start: i,
                end: j,
                label: a,
            };
            if a >= nt {
                return Err(inconsistent);
            }
            let split = by_start[i].iter().find_map(|&(k, l)| {
                if k >= j {
                    return None;
                }
                by_end[j]
                    .iter()
                    .find(|&&(k2, _)| k2 == k + 1)
                    .map(|&(_, r)| (l, r))
            });
            let (l, r) = split.ok_or(inconsistent)?;
            *parts.rule_mut(b, j - i, i, a, l, r) += 1.0;
        }
    }
    Ok(parts)
}

/// Span labeling of `parts`, together with `(nt, t)`.
///
/// Rule parts of a span are summed over their children, so this is only lossless
/// for parts describing a single structure.
pub fn from_parts(parts: &CkyParts) -> (SpanLabels, (usize, usize)) {
    let shape = parts.shape;
    let CkyShape { batch, n, nt, t } = shape;
    let s = shape.states();
    let mut spans = SpanLabels::zeros(batch, n, s);
    for b in 0..batch {
        for w in 1..n {
            for i in 0..n - w {
                for a in 0..nt {
                    let mut v = 0.0;
                    for l in 0..s {
                        for r in 0..s {
                            v += parts.rule(b, w, i, a, l, r);
                        }
                    }
                    spans.set(b, i, i + w, a, v);
                }
            }
        }
        for i in 0..n {
            for x in 0..t {
                spans.set(b, i, i, nt + x, parts.term(b, i, x));
            }
        }
    }
    (spans, (nt, t))
}
