//! Semiring-generic structured inference over binary trees.
//!
//! One inside pass per structure family, parameterised by the algebra it is filled
//! with. Swapping the semiring turns the same chart into the log-partition, the best
//! score, the entropy or the k best scores; differentiating the total through the
//! retained chart turns it into marginals, argmax structures or samples.
//!
//! - [`cky`]: binary context-free grammars (terminals, rules, roots)
//! - [`cky_crf`]: span-scored bracketings
//! - [`parts`]: the parts tensors and the codec to span labelings
//! - [`enumerate`]: brute-force reference for small inputs
//!
//! Public invariants (must not change):
//! - APIs are backend-agnostic (slice-based, `Vec<f64>` buffers, row-major layouts).
//! - Numeric code is deterministic; randomness only enters through an explicit
//!   [`RandomSource`] in the reverse pass.
//! - Semiring parameters (`k`, number of draws) are explicit and validated.
//! - Invalid shapes and lengths are errors, never panics.

pub mod chart;
pub mod cky;
pub mod cky_crf;
pub mod enumerate;
pub mod kmax;
pub mod parts;
pub mod sampled;
pub mod semiring;

pub use chart::{Chart, Totals};
pub use cky::{Cky, CkyPotentials, CkyShape, Inside};
pub use cky_crf::{CkyCrf, SpanParts, SpanPotentials, SpanShape};
pub use kmax::KMax;
pub use parts::{from_parts, to_parts, CkyParts, SpanLabels};
pub use sampled::{MultiSampled, Sampled};
pub use semiring::{Differentiable, Entropy, Log, Max, RandomSource, Semiring};
