//! Quality metrics for question-answering evaluation
//!
//! This module provides functions to evaluate the quality of generated
//! answers against reference answers using standard NLP metrics:
//! - F1 Score: Token-multiset precision and recall over normalized answers
//! - BLEU: Clipped n-gram precision with a brevity penalty
//! - METEOR: Unigram alignment (exact, then stemmed) with a fragmentation penalty
//! - ROUGE-1/2/L: N-gram and longest-common-subsequence overlap with stemming
//! - Perplexity: Unigram-frequency perplexity of the answer under the reference
//!
//! Every function takes `(reference, candidate)` and is pure.

use crate::normalize::{get_tokens, word_tokenize};
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashMap;

fn counts<T: std::hash::Hash + Eq + Clone>(items: &[T]) -> HashMap<T, usize> {
    let mut counts = HashMap::new();
    for item in items {
        *counts.entry(item.clone()).or_insert(0) += 1;
    }
    counts
}

/// Size of the multiset intersection of two count tables
fn clipped_overlap<T: std::hash::Hash + Eq>(a: &HashMap<T, usize>, b: &HashMap<T, usize>) -> usize {
    a.iter()
        .map(|(item, &count)| count.min(b.get(item).copied().unwrap_or(0)))
        .sum()
}

fn harmonic_mean(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        return 0.0;
    }
    2.0 * (precision * recall) / (precision + recall)
}

// ============================================================================
// F1
// ============================================================================

/// Calculate lexical F1 between a reference and a candidate answer
///
/// Both answers are normalized and split on whitespace:
/// - Precision = overlapping tokens / candidate tokens
/// - Recall = overlapping tokens / reference tokens
/// - F1 = 2 * (precision * recall) / (precision + recall)
///
/// Overlap counts repeated tokens as often as they occur on both sides.
/// Returns a score from 0.0 to 1.0
pub fn f1_score(reference: &str, candidate: &str) -> f64 {
    let reference_tokens = get_tokens(reference);
    let candidate_tokens = get_tokens(candidate);

    if reference_tokens.is_empty() || candidate_tokens.is_empty() {
        if reference_tokens.is_empty() && candidate_tokens.is_empty() {
            return 1.0; // Both empty
        }
        return 0.0; // One is empty
    }

    let overlap = clipped_overlap(&counts(&candidate_tokens), &counts(&reference_tokens));
    if overlap == 0 {
        return 0.0;
    }

    let precision = overlap as f64 / candidate_tokens.len() as f64;
    let recall = overlap as f64 / reference_tokens.len() as f64;

    harmonic_mean(precision, recall)
}

// ============================================================================
// BLEU
// ============================================================================

const BLEU_MAX_ORDER: usize = 4;

fn ngrams(tokens: &[String], n: usize) -> Vec<&[String]> {
    if n == 0 || tokens.len() < n {
        return Vec::new();
    }
    tokens.windows(n).collect()
}

/// Sentence-level BLEU against a single reference
///
/// Uniform weights over 1- to 4-grams and no smoothing: when any n-gram order
/// has no match the score is 0.0. The brevity penalty is `exp(1 - r/c)` for a
/// candidate no longer than the reference.
pub fn bleu_score(reference: &str, candidate: &str) -> f64 {
    let reference_tokens = word_tokenize(reference);
    let candidate_tokens = word_tokenize(candidate);

    if candidate_tokens.is_empty() {
        return 0.0;
    }

    let mut log_precision_sum = 0.0;
    for n in 1..=BLEU_MAX_ORDER {
        let candidate_ngrams = counts(&ngrams(&candidate_tokens, n));
        let reference_ngrams = counts(&ngrams(&reference_tokens, n));

        let matches = clipped_overlap(&candidate_ngrams, &reference_ngrams);
        if matches == 0 {
            return 0.0;
        }
        let total: usize = candidate_ngrams.values().sum();
        log_precision_sum += (matches as f64 / total.max(1) as f64).ln();
    }

    let c = candidate_tokens.len() as f64;
    let r = reference_tokens.len() as f64;
    let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    brevity_penalty * (log_precision_sum / BLEU_MAX_ORDER as f64).exp()
}

// ============================================================================
// METEOR
// ============================================================================

const METEOR_ALPHA: f64 = 0.9;
const METEOR_BETA: f64 = 3.0;
const METEOR_GAMMA: f64 = 0.5;

/// Align words that compare equal, scanning both sides from the end
///
/// Matched words are removed from both lists; the returned pairs are
/// `(candidate index, reference index)` in original positions.
fn align_stage(
    candidate: &mut Vec<(usize, String)>,
    reference: &mut Vec<(usize, String)>,
) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    for i in (0..candidate.len()).rev() {
        if let Some(j) = reference
            .iter()
            .rposition(|(_, word)| *word == candidate[i].1)
        {
            matches.push((candidate[i].0, reference[j].0));
            candidate.remove(i);
            reference.remove(j);
        }
    }
    matches
}

/// Number of runs of adjacent matches in both candidate and reference order
fn count_chunks(matches: &[(usize, usize)]) -> usize {
    if matches.is_empty() {
        return 0;
    }
    1 + matches
        .windows(2)
        .filter(|pair| !(pair[1].0 == pair[0].0 + 1 && pair[1].1 == pair[0].1 + 1))
        .count()
}

/// METEOR against a single reference
///
/// Words are lowercased and aligned first by exact match and then by stem.
/// `Fmean = P*R / (alpha*P + (1-alpha)*R)` is discounted by
/// `gamma * (chunks / matches)^beta`.
pub fn meteor_score(reference: &str, candidate: &str) -> f64 {
    let lower = |text: &str| -> Vec<(usize, String)> {
        word_tokenize(text)
            .into_iter()
            .map(|t| t.to_lowercase())
            .enumerate()
            .collect()
    };
    let mut candidate_words = lower(candidate);
    let mut reference_words = lower(reference);
    let candidate_len = candidate_words.len();
    let reference_len = reference_words.len();

    let mut matches = align_stage(&mut candidate_words, &mut reference_words);

    let stemmer = Stemmer::create(Algorithm::English);
    let stem = |words: Vec<(usize, String)>| -> Vec<(usize, String)> {
        words
            .into_iter()
            .map(|(i, w)| (i, stemmer.stem(&w).into_owned()))
            .collect()
    };
    let mut candidate_stems = stem(candidate_words);
    let mut reference_stems = stem(reference_words);
    matches.extend(align_stage(&mut candidate_stems, &mut reference_stems));

    if matches.is_empty() || candidate_len == 0 || reference_len == 0 {
        return 0.0;
    }
    matches.sort_by_key(|&(candidate_index, _)| candidate_index);

    let matched = matches.len() as f64;
    let precision = matched / candidate_len as f64;
    let recall = matched / reference_len as f64;
    let fmean =
        (precision * recall) / (METEOR_ALPHA * precision + (1.0 - METEOR_ALPHA) * recall);

    let fragmentation = count_chunks(&matches) as f64 / matched;
    let penalty = METEOR_GAMMA * fragmentation.powf(METEOR_BETA);

    (1.0 - penalty) * fmean
}

// ============================================================================
// ROUGE
// ============================================================================

/// Precision, recall and F-measure of one ROUGE variant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

impl RougeScore {
    fn new(precision: f64, recall: f64) -> Self {
        Self {
            precision,
            recall,
            fmeasure: harmonic_mean(precision, recall),
        }
    }
}

/// ROUGE-1, ROUGE-2 and ROUGE-L for one answer pair
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RougeScores {
    pub rouge1: RougeScore,
    pub rouge2: RougeScore,
    pub rouge_l: RougeScore,
}

/// Lowercase, split on anything that is not `[a-z0-9]`, and stem words
/// longer than three characters
fn rouge_tokenize(text: &str, stemmer: &Stemmer) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.len() > 3 {
                stemmer.stem(token).into_owned()
            } else {
                token.to_string()
            }
        })
        .collect()
}

fn rouge_n(reference: &[String], candidate: &[String], n: usize) -> RougeScore {
    let reference_ngrams = counts(&ngrams(reference, n));
    let candidate_ngrams = counts(&ngrams(candidate, n));

    let overlap = clipped_overlap(&candidate_ngrams, &reference_ngrams) as f64;
    let reference_total: usize = reference_ngrams.values().sum();
    let candidate_total: usize = candidate_ngrams.values().sum();

    RougeScore::new(
        overlap / candidate_total.max(1) as f64,
        overlap / reference_total.max(1) as f64,
    )
}

/// Calculate Longest Common Subsequence length
fn lcs_length(a: &[String], b: &[String]) -> usize {
    let m = a.len();
    let n = b.len();

    if m == 0 || n == 0 {
        return 0;
    }

    // Create DP table
    let mut dp = vec![vec![0; n + 1]; m + 1];

    for i in 1..=m {
        for j in 1..=n {
            if a[i - 1] == b[j - 1] {
                dp[i][j] = dp[i - 1][j - 1] + 1;
            } else {
                dp[i][j] = dp[i - 1][j].max(dp[i][j - 1]);
            }
        }
    }

    dp[m][n]
}

fn rouge_l(reference: &[String], candidate: &[String]) -> RougeScore {
    if reference.is_empty() || candidate.is_empty() {
        return RougeScore::default();
    }
    let lcs = lcs_length(reference, candidate) as f64;
    RougeScore::new(lcs / candidate.len() as f64, lcs / reference.len() as f64)
}

/// Calculate ROUGE-1, ROUGE-2 and ROUGE-L with stemming
pub fn rouge_scores(reference: &str, candidate: &str) -> RougeScores {
    let stemmer = Stemmer::create(Algorithm::English);
    let reference_tokens = rouge_tokenize(reference, &stemmer);
    let candidate_tokens = rouge_tokenize(candidate, &stemmer);

    RougeScores {
        rouge1: rouge_n(&reference_tokens, &candidate_tokens, 1),
        rouge2: rouge_n(&reference_tokens, &candidate_tokens, 2),
        rouge_l: rouge_l(&reference_tokens, &candidate_tokens),
    }
}

// ============================================================================
// Perplexity
// ============================================================================

/// Perplexity of the candidate under a unigram model of the reference
///
/// Tokens are split on whitespace. Seen tokens get `frequency / total`,
/// unseen tokens `1 / (total + 1)`. Returns 0.0 for an empty candidate.
pub fn perplexity(reference: &str, candidate: &str) -> f64 {
    let candidate_tokens: Vec<&str> = candidate.split_whitespace().collect();
    let reference_tokens: Vec<&str> = reference.split_whitespace().collect();

    if candidate_tokens.is_empty() {
        return 0.0;
    }

    let frequency = counts(&reference_tokens);
    let total = reference_tokens.len() as f64;

    let log_sum: f64 = candidate_tokens
        .iter()
        .map(|token| match frequency.get(token) {
            Some(&count) => (count as f64 / total).log2(),
            None => (1.0 / (total + 1.0)).log2(),
        })
        .sum();

    2f64.powf(-log_sum / candidate_tokens.len() as f64)
}

// ============================================================================
// Embedding similarity
// ============================================================================

/// Cosine similarity of two vectors; 0.0 when either has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Greedy token alignment score between two token-embedding sequences
///
/// Builds the candidate x reference cosine matrix, keeps the best match for
/// each candidate token and averages those. `None` when either side has no
/// tokens.
pub fn max_aligned_similarity(candidate: &[Vec<f32>], reference: &[Vec<f32>]) -> Option<f64> {
    if candidate.is_empty() || reference.is_empty() {
        return None;
    }

    let best: Vec<f64> = candidate
        .iter()
        .map(|c| {
            reference
                .iter()
                .map(|r| cosine_similarity(c, r))
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .collect();

    Some(best.iter().sum::<f64>() / best.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_f1_perfect_match() {
        let score = f1_score("machine learning", "machine learning");
        assert!((score - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_f1_no_match() {
        let score = f1_score("dog cat", "apple orange");
        assert!((score - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_f1_partial_match() {
        let score = f1_score("machine learning", "machine learning algorithms");
        // overlap: 2 tokens, candidate: 3 tokens, reference: 2 tokens
        // precision = 2/3, recall = 1.0, f1 = 0.8
        assert!((score - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_f1_empty_cases() {
        assert_eq!(f1_score("", ""), 1.0);
        assert_eq!(f1_score("", "x"), 0.0);
        assert_eq!(f1_score("x", ""), 0.0);
    }

    #[test]
    fn test_f1_articles_only_counts_as_empty() {
        // "the" normalizes away, leaving both sides empty
        assert_eq!(f1_score("the", "a"), 1.0);
    }

    #[test]
    fn test_f1_self_is_one() {
        for text in ["Paris", "The capital of France is Paris.", "42 42 42"] {
            assert!((f1_score(text, text) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_f1_counts_repeated_tokens() {
        // reference: [paris, paris], candidate: [paris]
        // overlap = 1, precision = 1.0, recall = 0.5
        let score = f1_score("Paris Paris", "Paris");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_f1_case_and_punctuation_insensitive() {
        let score = f1_score("Machine learning!", "MACHINE, LEARNING");
        assert!((score - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_bleu_identical() {
        let text = "the cat sat on the mat";
        assert!((bleu_score(text, text) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bleu_partial() {
        let score = bleu_score(
            "the quick brown fox jumps over the lazy dog",
            "the quick brown fox jumps over the dog",
        );
        // precisions 8/8, 6/7, 5/6, 4/5; c = 8, r = 9
        let expected = (4.0f64 / 7.0).powf(0.25) * (1.0f64 - 9.0 / 8.0).exp();
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_bleu_short_candidate_is_zero() {
        // no 3-grams to match
        assert_eq!(bleu_score("the cat sat on the mat", "the cat"), 0.0);
        assert_eq!(bleu_score("the cat", ""), 0.0);
    }

    #[test]
    fn test_meteor_identical() {
        let text = "the cat sat on the mat";
        let score = meteor_score(text, text);
        let expected = 1.0 - 0.5 * (1.0f64 / 6.0).powi(3);
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_meteor_no_match() {
        assert_eq!(meteor_score("apple orange", "dog cat"), 0.0);
        assert_eq!(meteor_score("", "dog cat"), 0.0);
    }

    #[test]
    fn test_meteor_stem_match() {
        // "running" and "runs" share the stem "run"
        let exact = meteor_score("the dog runs", "the dog runs");
        let stemmed = meteor_score("the dog runs", "the dog running");
        assert!((stemmed - exact).abs() < 1e-9);
    }

    #[test]
    fn test_meteor_fragmentation_penalty() {
        let ordered = meteor_score("a b c d", "a b c d");
        let shuffled = meteor_score("a b c d", "d c b a");
        assert!(shuffled < ordered);
    }

    #[test]
    fn test_count_chunks() {
        assert_eq!(count_chunks(&[]), 0);
        assert_eq!(count_chunks(&[(0, 0), (1, 1), (2, 2)]), 1);
        assert_eq!(count_chunks(&[(0, 2), (1, 0), (2, 1)]), 2);
    }

    #[test]
    fn test_lcs_simple() {
        let a = tokens(&["a", "b", "c"]);
        assert_eq!(lcs_length(&a, &a), 3);
    }

    #[test]
    fn test_lcs_partial() {
        let a = tokens(&["a", "b", "c"]);
        let b = tokens(&["a", "c"]);
        assert_eq!(lcs_length(&a, &b), 2); // "a" and "c"
    }

    #[test]
    fn test_lcs_empty() {
        let a: Vec<String> = vec![];
        let b = tokens(&["a"]);
        assert_eq!(lcs_length(&a, &b), 0);
    }

    #[test]
    fn test_rouge_partial_match_ordered() {
        // "the cat sat" vs "the dog sat": unigram overlap 2, no bigram overlap, LCS 2
        let scores = rouge_scores("the cat sat", "the dog sat");
        assert!((scores.rouge1.fmeasure - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(scores.rouge2.fmeasure, 0.0);
        assert!((scores.rouge_l.fmeasure - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_uses_stemming() {
        let scores = rouge_scores("running dogs", "run dog");
        assert!((scores.rouge1.fmeasure - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_subsequence_not_substring() {
        // "a b c d" vs "a x c y" - LCS = 2 ("a", "c")
        let scores = rouge_scores("a x c y", "a b c d");
        assert!((scores.rouge_l.fmeasure - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_rouge_empty() {
        let scores = rouge_scores("", "");
        assert_eq!(scores, RougeScores::default());
    }

    #[test]
    fn test_perplexity_values() {
        // p(a) = 3/4 for every candidate token
        assert!((perplexity("a a a b", "a a") - 4.0 / 3.0).abs() < 1e-9);
        // unseen: p = 1/5
        assert!((perplexity("a a a b", "c c") - 5.0).abs() < 1e-9);
        assert_eq!(perplexity("a a a b", "   "), 0.0);
    }

    #[test]
    fn test_perplexity_frequent_token_beats_unseen() {
        let reference = "paris is the capital and paris is large";
        let frequent = perplexity(reference, "paris paris paris");
        let unseen = perplexity(reference, "berlin berlin berlin");
        assert!(frequent < unseen);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_max_aligned_similarity() {
        let candidate = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let reference = vec![vec![1.0, 0.0], vec![1.0, 1.0]];
        // best for [1,0] is 1.0, best for [0,1] is cos45
        let expected = (1.0 + std::f64::consts::FRAC_1_SQRT_2) / 2.0;
        let score = max_aligned_similarity(&candidate, &reference).unwrap();
        assert!((score - expected).abs() < 1e-6);
        assert_eq!(max_aligned_similarity(&[], &reference), None);
    }
}
