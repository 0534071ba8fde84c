//! Triangular span charts.
//!
//! A chart cell `(b, start, width)` holds, for every state, the semiring-combined
//! score of all derivations covering leaves `start..=start + width` of batch element
//! `b`. Cells are stored twice:
//!
//! - `left`: indexed by `(b, start, width)`
//! - `right`: indexed by `(b, end, width)` with `end = start + width`
//!
//! so that a combination step can slice left children by their start and right
//! children by their end without any gather. Both orientations are written together
//! and must stay exact mirrors of each other.
//!
//! Storage is flat row-major: `[b][index][width][state][slot]`.

use crate::semiring::{zeros, Semiring};

/// Two-orientation triangular chart of semiring elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    batch: usize,
    n: usize,
    states: usize,
    size: usize,
    left: Vec<f64>,
    right: Vec<f64>,
}

impl Chart {
    /// Chart for `batch` sequences of `n` leaves, every cell set to the semiring zero.
    pub fn new<S: Semiring + ?Sized>(semiring: &S, batch: usize, n: usize, states: usize) -> Self {
        let left = zeros(semiring, batch * n * n * states);
        Self {
            batch,
            n,
            states,
            size: semiring.size(),
            right: left.clone(),
            left,
        }
    }

    /// Number of sequences.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Padded sequence length.
    pub fn n(&self) -> usize {
        self.n
    }

    /// States per cell.
    pub fn states(&self) -> usize {
        self.states
    }

    /// Length of one orientation's flat buffer.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    /// Whether the chart holds no cells.
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    fn cell_len(&self) -> usize {
        self.states * self.size
    }

    /// Flat offset of cell `(b, start, width)` in the left orientation.
    ///
    /// Gradient buffers shaped like one orientation share this layout.
    pub(crate) fn start_index(&self, b: usize, start: usize, width: usize) -> usize {
        ((b * self.n + start) * self.n + width) * self.cell_len()
    }

    fn end_index(&self, b: usize, end: usize, width: usize) -> usize {
        ((b * self.n + end) * self.n + width) * self.cell_len()
    }

    /// All states of the cell starting at `start`.
    pub fn by_start(&self, b: usize, start: usize, width: usize) -> &[f64] {
        let o = self.start_index(b, start, width);
        &self.left[o..o + self.cell_len()]
    }

    /// All states of the cell ending at `end`.
    pub fn by_end(&self, b: usize, end: usize, width: usize) -> &[f64] {
        let o = self.end_index(b, end, width);
        &self.right[o..o + self.cell_len()]
    }

    /// One state of the cell starting at `start`.
    pub fn state_by_start(&self, b: usize, start: usize, width: usize, state: usize) -> &[f64] {
        let o = self.start_index(b, start, width) + state * self.size;
        &self.left[o..o + self.size]
    }

    /// One state of the cell ending at `end`.
    pub fn state_by_end(&self, b: usize, end: usize, width: usize, state: usize) -> &[f64] {
        let o = self.end_index(b, end, width) + state * self.size;
        &self.right[o..o + self.size]
    }

    /// Write states `first..first + values.len() / size` of cell `(b, start, width)`
    /// in both orientations.
    pub fn write(&mut self, b: usize, start: usize, width: usize, first: usize, values: &[f64]) {
        let l = self.start_index(b, start, width) + first * self.size;
        let r = self.end_index(b, start + width, width) + first * self.size;
        self.left[l..l + values.len()].copy_from_slice(values);
        self.right[r..r + values.len()].copy_from_slice(values);
    }

    /// Whether every cell reads the same from both orientations.
    pub fn is_mirrored(&self) -> bool {
        (0..self.batch).all(|b| {
            (0..self.n).all(|width| {
                (0..self.n - width).all(|start| {
                    self.by_start(b, start, width) == self.by_end(b, start + width, width)
                })
            })
        })
    }
}

/// Per-batch DP totals after `unconvert`.
///
/// Row `b` holds [`Semiring::output_size`] values: a single value for most
/// semirings, the `k` best scores for k-best, one copy per draw for multi-sampling.
#[derive(Debug, Clone, PartialEq)]
pub struct Totals {
    width: usize,
    values: Vec<f64>,
}

impl Totals {
    pub(crate) fn with_width(width: usize, batch: usize) -> Self {
        Self {
            width,
            values: Vec::with_capacity(width * batch),
        }
    }

    pub(crate) fn push(&mut self, row: &[f64]) {
        debug_assert_eq!(row.len(), self.width);
        self.values.extend_from_slice(row);
    }

    /// Number of batch elements.
    pub fn len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.values.len() / self.width
        }
    }

    /// Whether there are no batch elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values per batch element.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Values of batch element `b`.
    pub fn get(&self, b: usize) -> &[f64] {
        &self.values[b * self.width..(b + 1) * self.width]
    }

    /// First value of every batch element.
    pub fn scalars(&self) -> Vec<f64> {
        self.values.iter().step_by(self.width.max(1)).copied().collect()
    }

    /// Rows in batch order.
    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.width.max(1))
    }
}
