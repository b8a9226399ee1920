//! 64-bit SimHash fingerprints
//!
//! Features are overlapping 4-character shingles of the lowercased text with
//! every non-word character removed. Each distinct shingle is hashed with MD5
//! (low 64 bits) and weighted by how often it occurs.

use md5::{Digest, Md5};
use std::collections::BTreeMap;

const FINGERPRINT_BITS: usize = 64;
const SHINGLE_WIDTH: usize = 4;

/// A SimHash fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint of a text
    pub fn of(text: &str) -> Self {
        let mut weights = [0i64; FINGERPRINT_BITS];

        for (shingle, count) in shingles(text) {
            let hash = feature_hash(&shingle);
            let weight = count as i64;
            for (bit, slot) in weights.iter_mut().enumerate() {
                if hash & (1u64 << bit) != 0 {
                    *slot += weight;
                } else {
                    *slot -= weight;
                }
            }
        }

        let value = weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > 0)
            .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit));

        Fingerprint(value)
    }

    /// Number of differing bits
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// Shingle counts, keyed by shingle
///
/// Text shorter than the shingle width yields itself as the only shingle,
/// so even empty text has one (empty) feature.
fn shingles(text: &str) -> BTreeMap<String, usize> {
    let content: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    let mut counts = BTreeMap::new();
    let windows = content.len().saturating_sub(SHINGLE_WIDTH - 1).max(1);
    for start in 0..windows {
        let end = (start + SHINGLE_WIDTH).min(content.len());
        let shingle: String = content[start..end].iter().collect();
        *counts.entry(shingle).or_insert(0) += 1;
    }
    counts
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Md5::digest(feature.as_bytes());
    let mut low = [0u8; 8];
    low.copy_from_slice(&digest[8..]);
    u64::from_be_bytes(low)
}

/// Hamming distance between the fingerprints of two texts
pub fn simhash_distance(reference: &str, candidate: &str) -> u32 {
    Fingerprint::of(candidate).distance(&Fingerprint::of(reference))
}
