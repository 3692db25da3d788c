//! Domain types for the Resonance Rail coordination hub.
//!
//! Strongly-typed newtypes prevent primitive obsession for every value that
//! participates in an invariant: a `Phase` cannot be constructed outside
//! `[0, 2π)`, an `OrderParameter` cannot be constructed outside `[0, 1]`,
//! and so on. Validation happens once, at construction, so downstream code
//! never has to re-check bounds it already holds a witness for.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Client-supplied stable identity, distinct from the server-assigned
/// `ClientId`. Agents are heterogeneous external runtimes that supply
/// their own string identity at join time, rather than a server-minted
/// UUID.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

/// Human-readable display name for an agent.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

/// A phase angle in radians, always in `[0, 2π)`. Phase is naturally
/// circular, so construction wraps rather than rejecting out-of-range
/// input (unlike most nutypes in this module, which reject).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phase(f64);

impl Phase {
    /// Wraps `value` into `[0, 2π)` and constructs a `Phase`.
    #[must_use]
    pub fn wrapped(value: f64) -> Self {
        let wrapped = value.rem_euclid(TAU);
        Self(wrapped)
    }

    #[must_use]
    pub fn radians(&self) -> f64 {
        self.0
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self(0.0)
    }
}

/// A natural oscillator frequency in Hz. Must be finite.
#[nutype(
    validate(finite),
    derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Display, Into),
    default = 1.0
)]
pub struct FrequencyHz(f64);

/// Kuramoto coupling strength K. Finite; callers additionally clamp to a
/// configured `[K_min, K_max]` via `KuramotoConfig`.
#[nutype(
    validate(finite),
    derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Display, Into),
    default = 0.7
)]
pub struct CouplingConstant(f64);

/// The Kuramoto order parameter r, always in `[0, 1]`.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        Into
    ),
    default = 0.0
)]
pub struct OrderParameter(f64);

/// A client's contribution to global coherence, in `[0, 1]`.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        Into
    ),
    default = 0.0
)]
pub struct CoherenceContribution(f64);

/// A monotonically increasing message sequence number. `increment` is the
/// only mutator; the value never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct MessageSeq(u64);

impl MessageSeq {
    #[must_use]
    pub fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the next sequence number without mutating `self`.
    #[must_use]
    pub fn incremented(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MessageSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A variable-length embedding vector. Traces are produced by
/// heterogeneous external agent runtimes, so dimensionality is not fixed
/// crate-wide — only required to match between two vectors being
/// compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    #[must_use]
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity against `other`, clamped to `[0, 1]`.
    ///
    /// Returns `0.0` if either vector is empty, all-zero, or the two
    /// vectors have mismatched dimension — callers that need to
    /// distinguish "no embedding" from "zero similarity" should check
    /// `dimension()` first.
    #[must_use]
    pub fn cosine_similarity(&self, other: &EmbeddingVector) -> f64 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let a = f64::from(*a);
            let b = f64::from(*b);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        if norm_a <= 0.0 || norm_b <= 0.0 {
            return 0.0;
        }
        (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
    }

    /// Component-wise mean of a collection of embeddings, all of which
    /// must share the same dimension; returns `None` on an empty
    /// collection or a dimension mismatch.
    #[must_use]
    pub fn mean<'a>(vectors: impl IntoIterator<Item = &'a EmbeddingVector>) -> Option<Self> {
        let mut iter = vectors.into_iter();
        let first = iter.next()?;
        let dim = first.dimension();
        let mut sum = first.0.clone();
        let mut count = 1usize;
        for v in iter {
            if v.dimension() != dim {
                return None;
            }
            for (s, x) in sum.iter_mut().zip(v.0.iter()) {
                *s += x;
            }
            count += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = count as f32;
        for s in &mut sum {
            *s /= count;
        }
        Some(Self(sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wraps_negative_values_into_range() {
        let p = Phase::wrapped(-0.1);
        assert!(p.radians() >= 0.0 && p.radians() < TAU);
    }

    #[test]
    fn phase_wraps_values_above_tau() {
        let p = Phase::wrapped(TAU + 1.0);
        assert!((p.radians() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn order_parameter_rejects_out_of_range() {
        assert!(OrderParameter::try_new(1.5).is_err());
        assert!(OrderParameter::try_new(-0.1).is_err());
        assert!(OrderParameter::try_new(0.5).is_ok());
    }

    #[test]
    fn message_seq_only_increases() {
        let a = MessageSeq::zero();
        let b = a.incremented();
        assert!(b > a);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = EmbeddingVector::new(vec![1.0, 2.0, 3.0]);
        let sim = v.cosine_similarity(&v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_dimension_is_zero() {
        let a = EmbeddingVector::new(vec![1.0, 0.0]);
        let b = EmbeddingVector::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn embedding_mean_averages_componentwise() {
        let a = EmbeddingVector::new(vec![1.0, 1.0]);
        let b = EmbeddingVector::new(vec![3.0, 5.0]);
        let mean = EmbeddingVector::mean([&a, &b]).unwrap();
        assert_eq!(mean.as_slice(), &[2.0, 3.0]);
    }
}
