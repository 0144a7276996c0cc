//! Deterministic chunking and pacing for cached-hit replay.
//!
//! The RNG is seeded from the cache entry's key, so the same entry always
//! splits into the same chunks with the same planned delays. Chunks cut at
//! word boundaries and concatenate back to the original content byte for
//! byte.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::Normal;
use sha2::{Digest, Sha256};

/// Target chunk size distribution, in words.
const CHUNK_WORDS_MEAN: f64 = 15.0;
const CHUNK_WORDS_STDDEV: f64 = 5.0;

/// Inter-chunk delay jitter.
const DELAY_STDDEV_MS: f64 = 20.0;

/// Derive the replay seed: the first 64 bits of the key's SHA-256,
/// little-endian.
pub fn replay_seed(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// A fully planned replay: chunk texts and the delay preceding each chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub chunks: Vec<String>,
    pub delays_ms: Vec<u64>,
}

/// Plan the chunk sequence for a content string.
///
/// Draws a target word count and a pacing delay per chunk from the seeded
/// RNG. Both draws come from the same stream, so the whole plan — content
/// and timing — is a pure function of `(key, content, mean_delay_ms)`.
pub fn plan_chunks(key: &str, content: &str, mean_delay_ms: f64) -> ChunkPlan {
    let mut rng = StdRng::seed_from_u64(replay_seed(key));
    let size_dist = Normal::new(CHUNK_WORDS_MEAN, CHUNK_WORDS_STDDEV)
        .expect("static distribution parameters");
    let delay_dist =
        Normal::new(mean_delay_ms, DELAY_STDDEV_MS).expect("static distribution parameters");

    let segments = word_segments(content);
    let mut chunks = Vec::new();
    let mut delays_ms = Vec::new();
    let mut cursor = 0;

    while cursor < segments.len() {
        let target = rng.sample(size_dist).round().max(1.0) as usize;
        let end = (cursor + target).min(segments.len());
        chunks.push(segments[cursor..end].concat());
        let delay = rng.sample(delay_dist).max(0.0);
        delays_ms.push(delay as u64);
        cursor = end;
    }

    ChunkPlan { chunks, delays_ms }
}

/// Split content into word segments (word plus trailing whitespace). Leading
/// whitespace attaches to the first segment, so the segments concatenate
/// back to the input exactly.
fn word_segments(content: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut prev_was_space = false;

    for (i, ch) in content.char_indices() {
        if !ch.is_whitespace() && prev_was_space && i > start {
            segments.push(&content[start..i]);
            start = i;
        }
        prev_was_space = ch.is_whitespace();
    }
    if start < content.len() {
        segments.push(&content[start..]);
    }
    segments
}
