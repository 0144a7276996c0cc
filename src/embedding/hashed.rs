//! Deterministic in-process embedder for dev and tests.
//!
//! Feature-hashes character trigrams into a fixed-dimension vector. The
//! result measures lexical overlap, not meaning — close enough to exercise
//! the lookup path locally, but NOT a substitute for a real embedding model
//! in production. In particular it scores near-identical strings with
//! different URLs as highly similar, which a semantic model must not.

use std::hash::Hasher;

use twox_hash::XxHash64;

use super::{Embedder, EmbeddingError, l2_normalize};

const BUCKET_SEED: u64 = 0x7472_6967_7261_6d_u64;
const SIGN_SEED: u64 = 0x7369_676e_u64;

/// Lexical feature-hashing embedder.
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let normalized = text.to_lowercase();
        let chars: Vec<char> = normalized.chars().collect();
        let mut vector = vec![0f32; self.dimensions];

        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            let bucket = (hash_with_seed(&trigram, BUCKET_SEED) as usize) % self.dimensions;
            let sign = if hash_with_seed(&trigram, SIGN_SEED) & 1 == 1 {
                1.0
            } else {
                -1.0
            };
            vector[bucket] += sign;
        }

        l2_normalize(&mut vector);
        vector
    }
}

fn hash_with_seed(token: &str, seed: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(token.as_bytes());
    hasher.finish()
}

#[async_trait::async_trait]
impl Embedder for HashedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
