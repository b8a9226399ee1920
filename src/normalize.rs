//! Answer normalization and tokenization
//!
//! `normalize_answer` is the SQuAD-style normalizer used before lexical F1:
//! lowercase, strip ASCII punctuation, drop the articles "a", "an" and "the",
//! and collapse whitespace. `word_tokenize` is the punctuation-aware
//! tokenizer used by BLEU and METEOR.

use regex::Regex;
use std::sync::LazyLock;

static ARTICLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(a|an|the)\b").expect("article pattern is valid"));

// Numbers with separators, dotted abbreviations, words with inner
// apostrophes, then any other single non-space character
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:[.,]\d+)+|\w+(?:\.\w+)+\.?|\w+(?:'\w+)*|\S")
        .expect("token pattern is valid")
});

fn remove_punctuation(text: &str) -> String {
    text.chars().filter(|c| !c.is_ascii_punctuation()).collect()
}

fn remove_articles(text: &str) -> String {
    ARTICLE_RE.replace_all(text, " ").into_owned()
}

fn fix_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase, remove punctuation and articles, and collapse whitespace
pub fn normalize_answer(text: &str) -> String {
    fix_whitespace(&remove_articles(&remove_punctuation(&text.to_lowercase())))
}

/// Normalized whitespace tokens; empty input yields no tokens
pub fn get_tokens(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    normalize_answer(text)
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

const CLITICS: [&str; 6] = ["'s", "'re", "'ve", "'ll", "'d", "'m"];

/// Split a word that carries an English contraction into stem and clitic
fn split_contraction(word: &str, tokens: &mut Vec<String>) {
    let lower = word.to_lowercase();
    if lower.len() > 3 && lower.ends_with("n't") && word.is_char_boundary(word.len() - 3) {
        let (stem, clitic) = word.split_at(word.len() - 3);
        tokens.push(stem.to_string());
        tokens.push(clitic.to_string());
        return;
    }
    for clitic in CLITICS {
        if lower.len() > clitic.len()
            && lower.ends_with(clitic)
            && word.is_char_boundary(word.len() - clitic.len())
        {
            let (stem, tail) = word.split_at(word.len() - clitic.len());
            tokens.push(stem.to_string());
            tokens.push(tail.to_string());
            return;
        }
    }
    tokens.push(word.to_string());
}

/// Tokenize text into words and punctuation marks
///
/// Digit groups such as `1,000` and `3.14` and dotted abbreviations such as
/// `U.S.` stay whole; a period closing the text is split off. Contractions
/// are split into stem and clitic (`n't`, `'s`, `'re`, ...). Every other
/// non-word character becomes its own token.
pub fn word_tokenize(text: &str) -> Vec<String> {
    let text_end = text.trim_end().len();
    let mut tokens = Vec::new();

    for m in TOKEN_RE.find_iter(text) {
        let token = m.as_str();
        if token.len() > 1 && token.ends_with('.') {
            if m.end() == text_end {
                tokens.push(token[..token.len() - 1].to_string());
                tokens.push(".".to_string());
            } else {
                tokens.push(token.to_string());
            }
        } else if token.contains('\'') {
            split_contraction(token, &mut tokens);
        } else {
            tokens.push(token.to_string());
        }
    }

    tokens
}
