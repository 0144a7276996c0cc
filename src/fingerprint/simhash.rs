//! 64-bit SimHash over masked prompt text.
//!
//! Nearby texts produce fingerprints at small Hamming distance, which makes
//! the indexed tier's `(tenant, simhash)` window a cheap structural
//! prefilter. Token hashing uses XxHash64 with a fixed seed so fingerprints
//! are stable across processes and platforms.

use std::{
    collections::HashSet,
    hash::Hasher,
};

use once_cell::sync::Lazy;
use twox_hash::XxHash64;

const HASH_SEED: u64 = 0x6d6e_656d_6f_u64;

const BASE_WEIGHT: i64 = 10;
const STOP_WORD_WEIGHT: i64 = 2;
const LONG_TOKEN_BONUS: i64 = 5;
const SYMBOLIC_TOKEN_BONUS: i64 = 3;
const TRIGRAM_WEIGHT: i64 = 1;

/// Closed set of common short function words. These carry little signal, so
/// they vote with reduced weight instead of being dropped outright.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "of", "to", "in", "on", "at", "is", "are", "was", "be", "been", "am",
        "and", "or", "not", "no", "for", "with", "as", "by", "it", "its", "this", "that",
        "these", "those", "from", "but", "if", "then", "so", "do", "does", "did", "has", "have",
        "had", "i", "you", "he", "she", "we", "they", "me", "my", "your", "our", "their",
        "what", "which", "who", "how", "when", "where", "why", "can", "could", "will", "would",
        "should", "may", "might", "must", "about", "into", "over", "under", "up", "down", "out",
        "off",
    ]
    .into_iter()
    .collect()
});

/// Compute the 64-bit SimHash of a text.
pub fn simhash(text: &str) -> i64 {
    let normalized = normalize(text);
    let mut accumulator = [0i64; 64];

    let tokens: HashSet<&str> = normalized
        .split_whitespace()
        .filter(|token| token.chars().count() >= 2)
        .collect();
    for token in tokens {
        vote(&mut accumulator, hash_token(token), token_weight(token));
    }

    let chars: Vec<char> = normalized.chars().collect();
    for window in chars.windows(3) {
        let trigram: String = window.iter().collect();
        vote(&mut accumulator, hash_token(&trigram), TRIGRAM_WEIGHT);
    }

    let mut fingerprint = 0u64;
    for (i, &count) in accumulator.iter().enumerate() {
        if count > 0 {
            fingerprint |= 1 << i;
        }
    }
    fingerprint as i64
}

/// Hamming distance: popcount of the XOR.
pub fn hamming(a: i64, b: i64) -> u32 {
    (a ^ b).count_ones()
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn vote(accumulator: &mut [i64; 64], hash: u64, weight: i64) {
    for (i, slot) in accumulator.iter_mut().enumerate() {
        if (hash >> i) & 1 == 1 {
            *slot += weight;
        } else {
            *slot -= weight;
        }
    }
}

fn hash_token(token: &str) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(token.as_bytes());
    hasher.finish()
}

fn token_weight(token: &str) -> i64 {
    let mut weight = if STOP_WORDS.contains(token) {
        STOP_WORD_WEIGHT
    } else {
        BASE_WEIGHT
    };
    if token.chars().count() > 8 {
        weight += LONG_TOKEN_BONUS;
    }
    if token.chars().any(|c| c.is_ascii_digit() || c == '_' || c == '-') {
        weight += SYMBOLIC_TOKEN_BONUS;
    }
    weight
}
