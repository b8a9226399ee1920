//! Model-backed scoring oracles
//!
//! The scorer only sees these traits; [`bert`] provides the candle
//! implementations loaded from the Hugging Face Hub or a local directory.

pub mod bert;

pub use bert::{BertEncoder, BleurtRegressor};

use crate::quality_metrics::{cosine_similarity, max_aligned_similarity};
use anyhow::{anyhow, Result};

/// Produces one embedding per text
pub trait SentenceEncoder {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Produces one contextual embedding per token, without special tokens
pub trait TokenEncoder {
    fn embed_tokens(&self, text: &str) -> Result<Vec<Vec<f32>>>;
}

/// A learned regression metric over an answer pair
pub trait LearnedScorer {
    fn score(&self, reference: &str, candidate: &str) -> Result<f64>;
}

/// Cosine similarity of the two sentence embeddings
pub fn sentence_similarity(
    encoder: &dyn SentenceEncoder,
    reference: &str,
    candidate: &str,
) -> Result<f64> {
    let reference_embedding = encoder.embed(reference)?;
    let candidate_embedding = encoder.embed(candidate)?;
    if reference_embedding.len() != candidate_embedding.len() {
        return Err(anyhow!(
            "Embedding sizes differ: {} vs {}",
            reference_embedding.len(),
            candidate_embedding.len()
        ));
    }
    Ok(cosine_similarity(&reference_embedding, &candidate_embedding))
}

/// Mean over candidate tokens of the best cosine match among reference tokens
pub fn bert_similarity(encoder: &dyn TokenEncoder, reference: &str, candidate: &str) -> Result<f64> {
    let reference_tokens = encoder.embed_tokens(reference)?;
    let candidate_tokens = encoder.embed_tokens(candidate)?;
    max_aligned_similarity(&candidate_tokens, &reference_tokens)
        .ok_or_else(|| anyhow!("Cannot align an empty token sequence"))
}
