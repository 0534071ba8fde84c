//! Brute-force enumeration of every structure, for checking the DP on small inputs.
//!
//! Exponential in the sequence length; only meant for tests and sanity checks.

use crate::chart::Totals;
use crate::cky::{self, CkyPotentials, CkyShape};
use crate::cky_crf::{SpanParts, SpanPotentials};
use crate::parts::{CkyParts, SpanLabels};
use crate::semiring::{lift, Semiring};

/// One production applied to leaves `start..=end`, left child ending at `split`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleApplication {
    /// First leaf.
    pub start: usize,
    /// Last leaf of the left child.
    pub split: usize,
    /// Last leaf.
    pub end: usize,
    /// Parent nonterminal.
    pub parent: usize,
    /// Left child state.
    pub left: usize,
    /// Right child state.
    pub right: usize,
}

/// A complete binary derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    /// Start symbol.
    pub root: usize,
    /// `(leaf, terminal)` in leaf order.
    pub leaves: Vec<(usize, usize)>,
    /// Productions, parents before children.
    pub rules: Vec<RuleApplication>,
}

impl Derivation {
    /// Add `weight` times this derivation's indicator to batch element `b` of `parts`.
    pub fn add_to(&self, parts: &mut CkyParts, b: usize, weight: f64) {
        let shape = parts.shape();
        parts.roots_mut()[shape.root_index(b, self.root)] += weight;
        for &(i, x) in &self.leaves {
            parts.terms_mut()[shape.term_index(b, i, x)] += weight;
        }
        for r in &self.rules {
            *parts.rule_mut(b, r.end - r.start, r.start, r.parent, r.left, r.right) += weight;
        }
    }

    /// Mark every span of this derivation in batch element `b` of `spans`; leaves
    /// carry the state `nt + terminal`.
    pub fn write_spans(&self, spans: &mut SpanLabels, b: usize, nt: usize) {
        for &(i, x) in &self.leaves {
            spans.set(b, i, i, nt + x, 1.0);
        }
        for r in &self.rules {
            spans.set(b, r.start, r.end, r.parent, 1.0);
        }
    }
}

struct Partial {
    score: f64,
    leaves: Vec<(usize, usize)>,
    rules: Vec<RuleApplication>,
}

fn derive(pot: &CkyPotentials, b: usize, x: usize, start: usize, end: usize) -> Vec<Partial> {
    let shape = pot.shape();
    let nt = shape.nt;
    if end - start == 1 {
        if x < nt {
            return Vec::new();
        }
        let t = x - nt;
        return vec![Partial {
            score: pot.terms()[shape.term_index(b, start, t)],
            leaves: vec![(start, t)],
            rules: Vec::new(),
        }];
    }
    if x >= nt {
        return Vec::new();
    }
    let mut out = Vec::new();
    for mid in start + 1..end {
        let lefts = if mid == start + 1 { nt..shape.states() } else { 0..nt };
        let rights = if mid == end - 1 { nt..shape.states() } else { 0..nt };
        for y in lefts {
            let ls = derive(pot, b, y, start, mid);
            if ls.is_empty() {
                continue;
            }
            for z in rights.clone() {
                let rs = derive(pot, b, z, mid, end);
                let rule = pot.rules()[shape.rule_index(b, x, y, z)];
                for l in &ls {
                    for r in &rs {
                        let mut rules = vec![RuleApplication {
                            start,
                            split: mid - 1,
                            end: end - 1,
                            parent: x,
                            left: y,
                            right: z,
                        }];
                        rules.extend_from_slice(&l.rules);
                        rules.extend_from_slice(&r.rules);
                        let mut leaves = l.leaves.clone();
                        leaves.extend_from_slice(&r.leaves);
                        out.push(Partial {
                            score: l.score + r.score + rule,
                            leaves,
                            rules,
                        });
                    }
                }
            }
        }
    }
    out
}

/// Every derivation of the first `len` leaves of batch element `b`, with its score.
pub fn cky_derivations(pot: &CkyPotentials, b: usize, len: usize) -> Vec<(f64, Derivation)> {
    let shape = pot.shape();
    let mut out = Vec::new();
    for a in 0..shape.nt {
        let root = pot.roots()[shape.root_index(b, a)];
        for p in derive(pot, b, a, 0, len) {
            out.push((
                p.score + root,
                Derivation {
                    root: a,
                    leaves: p.leaves,
                    rules: p.rules,
                },
            ));
        }
    }
    out
}

fn fold_scores<S: Semiring + ?Sized>(semiring: &S, scores: &[f64], totals: &mut Totals) {
    let lifted = lift(semiring, scores);
    let mut out = vec![0.0; semiring.size()];
    semiring.sum(&lifted, &mut out);
    totals.push(&semiring.unconvert(&out));
}

/// Enumerate every derivation per batch element and fold their scores with
/// `semiring`: `Log` gives \(\log Z\), `Max` the best score, `Entropy` the entropy.
pub fn enumerate_all<S: Semiring + ?Sized>(
    pot: &CkyPotentials,
    lengths: Option<&[usize]>,
    semiring: &S,
) -> cky::Result<(Totals, Vec<Vec<(f64, Derivation)>>)> {
    let shape: CkyShape = pot.shape();
    let lengths = shape.resolve_lengths(lengths)?;
    let mut totals = Totals::with_width(semiring.output_size(), shape.batch);
    let mut all = Vec::with_capacity(shape.batch);
    for (b, &len) in lengths.iter().enumerate() {
        let derivations = cky_derivations(pot, b, len);
        let scores: Vec<f64> = derivations.iter().map(|(s, _)| *s).collect();
        fold_scores(semiring, &scores, &mut totals);
        all.push(derivations);
    }
    Ok((totals, all))
}

/// A labelled binary bracketing: `(start, end, label)` for every span, leaves included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bracketing {
    /// Spans, parents before children.
    pub spans: Vec<(usize, usize, usize)>,
}

impl Bracketing {
    /// Add `weight` times this bracketing's indicator to batch element `b` of `parts`.
    pub fn add_to(&self, parts: &mut SpanParts, b: usize, weight: f64) {
        for &(i, j, a) in &self.spans {
            *parts.get_mut(b, i, j, a) += weight;
        }
    }
}

fn bracket(pot: &SpanPotentials, b: usize, x: usize, start: usize, end: usize) -> Vec<(f64, Vec<(usize, usize, usize)>)> {
    let here = pot.score_of(b, start, end - 1, x);
    if end - start == 1 {
        return vec![(here, vec![(start, start, x)])];
    }
    let nt = pot.shape().nt;
    let mut out = Vec::new();
    for mid in start + 1..end {
        for y in 0..nt {
            let ls = bracket(pot, b, y, start, mid);
            for z in 0..nt {
                let rs = bracket(pot, b, z, mid, end);
                for (ls_score, l) in &ls {
                    for (rs_score, r) in &rs {
                        let mut spans = vec![(start, end - 1, x)];
                        spans.extend_from_slice(l);
                        spans.extend_from_slice(r);
                        out.push((here + ls_score + rs_score, spans));
                    }
                }
            }
        }
    }
    out
}

/// Every labelled bracketing of the first `len` leaves of batch element `b`.
pub fn span_bracketings(pot: &SpanPotentials, b: usize, len: usize) -> Vec<(f64, Bracketing)> {
    (0..pot.shape().nt)
        .flat_map(|a| bracket(pot, b, a, 0, len))
        .map(|(score, spans)| (score, Bracketing { spans }))
        .collect()
}

/// [`enumerate_all`] for the span-scored tree CRF.
pub fn enumerate_spans<S: Semiring + ?Sized>(
    pot: &SpanPotentials,
    lengths: Option<&[usize]>,
    semiring: &S,
) -> cky::Result<(Totals, Vec<Vec<(f64, Bracketing)>>)> {
    let shape = pot.shape();
    let lengths = cky::resolve_lengths(shape.batch, shape.n, lengths)?;
    let mut totals = Totals::with_width(semiring.output_size(), shape.batch);
    let mut all = Vec::with_capacity(shape.batch);
    for (b, &len) in lengths.iter().enumerate() {
        let bracketings = span_bracketings(pot, b, len);
        let scores: Vec<f64> = bracketings.iter().map(|(s, _)| *s).collect();
        fold_scores(semiring, &scores, &mut totals);
        all.push(bracketings);
    }
    Ok((totals, all))
}
