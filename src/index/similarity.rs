//! Length normalization hook.
//!
//! While a document is inverted the writer tracks a [`FieldInvertState`]
//! per field and asks the configured [`Similarity`] for the norm value that
//! is stored alongside the postings.

use std::fmt::Debug;

/// Per-field statistics gathered while inverting one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldInvertState {
    /// Field name.
    pub name: String,
    /// Number of tokens.
    pub length: u32,
    /// Tokens stacked on a previous position (increment 0).
    pub num_overlap: u32,
    /// Last position.
    pub position: u32,
    /// Last end offset.
    pub offset: u32,
    /// Highest frequency of any single term.
    pub max_term_frequency: u32,
    /// Number of distinct terms.
    pub unique_term_count: u32,
}

/// Computes per-document norms.
pub trait Similarity: Send + Sync + Debug {
    /// Norm for a field of one document.
    fn compute_norm(&self, state: &FieldInvertState) -> i64;
}

/// Stores `1/sqrt(length)` as the bits of an `f32`.
#[derive(Debug, Clone)]
pub struct DefaultSimilarity {
    /// Exclude stacked tokens from the length.
    pub discount_overlaps: bool,
}

impl Default for DefaultSimilarity {
    fn default() -> Self {
        DefaultSimilarity {
            discount_overlaps: true,
        }
    }
}

impl DefaultSimilarity {
    /// Decode a norm produced by this similarity.
    pub fn decode_norm(norm: i64) -> f32 {
        f32::from_bits(norm as u32)
    }
}

impl Similarity for DefaultSimilarity {
    fn compute_norm(&self, state: &FieldInvertState) -> i64 {
        let length = if self.discount_overlaps {
            state.length.saturating_sub(state.num_overlap)
        } else {
            state.length
        };
        let value = if length == 0 {
            0.0f32
        } else {
            1.0 / (length as f32).sqrt()
        };
        value.to_bits() as i64
    }
}
