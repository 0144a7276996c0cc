//! Embedding generation for template matching.
//!
//! The cache consumes a narrow `Embedder` contract: fixed dimensionality,
//! L2-normalized output, computed over the RAW prompt text. Masked text must
//! never be embedded — masking collapses distinct URLs and IDs to identical
//! tokens, which is exactly the information the semantic score needs to keep.

mod hashed;
mod openai;

use async_trait::async_trait;
pub use hashed::HashedEmbedder;
pub use openai::OpenAiEmbedder;
use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Errors from embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("embedding endpoint returned no vectors")]
    EmptyResponse,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding call timed out")]
    Timeout,
}

/// A source of fixed-dimension, L2-normalized embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text. The returned vector has `dimensions()` components and
    /// unit L2 norm.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Vector dimensionality; runtime-invariant after startup.
    fn dimensions(&self) -> usize;
}

/// Construct the configured embedder.
pub fn build_embedder(config: &EmbeddingConfig) -> Box<dyn Embedder> {
    match config {
        EmbeddingConfig::Openai(c) => Box::new(OpenAiEmbedder::new(c)),
        EmbeddingConfig::Hashed(c) => Box::new(HashedEmbedder::new(c.dimensions)),
    }
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity between two vectors of equal length.
///
/// For unit vectors this is the dot product; the full quotient is computed
/// anyway as defense against a misbehaving embedder.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator <= f64::EPSILON {
        return 0.0;
    }
    (dot / denominator).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_opposite_vectors_is_minus_one() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-9);
    }
}
