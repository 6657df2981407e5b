//! Phrase extraction and stopword filtering.
//!
//! Candidate node phrases are contiguous runs of alphanumerics joined
//! by underscores, lowercased. A phrase survives the filter iff it is
//! at least three characters, is not a stopword, and every
//! underscore-separated part is either three characters or longer or
//! carries a digit or symbol. Invalid phrases are discarded, never
//! renamed.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// English navigation verbs, articles, and filler the extractor drops.
pub const STOPWORDS: &[&str] = &[
    "go", "to", "navigate", "open", "then", "and", "the", "a", "an", "of", "in", "on", "at",
    "for", "with", "from", "into", "onto", "via", "please", "now", "next", "first", "second",
    "after", "before", "check", "verify", "click", "press", "select", "launch", "start", "stop",
    "run", "do", "make", "take", "turn", "show", "me", "my", "that", "this", "it", "is", "are",
    "be", "should", "would", "will", "can", "want", "need", "times", "time", "each", "every",
];

static STOPWORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS.iter().copied().collect());

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]+").expect("invalid regex"));

/// Whether a word is in the stopword set.
pub fn is_stopword(word: &str) -> bool {
    STOPWORD_SET.contains(word)
}

/// Whether a phrase survives the validity rules.
pub fn is_valid_phrase(phrase: &str) -> bool {
    if phrase.len() < 3 || is_stopword(phrase) {
        return false;
    }
    phrase.split('_').all(|part| {
        part.len() >= 3 || part.chars().any(|c| c.is_ascii_digit() || !c.is_alphanumeric())
    })
}

/// Extract valid candidate phrases from a prompt, lowercased, deduped,
/// in order of first appearance. Stable: re-filtering the output yields
/// the same set.
pub fn extract_phrases(prompt: &str) -> Vec<String> {
    let lowered = prompt.to_lowercase();
    let mut seen = HashSet::new();
    let mut phrases = Vec::new();
    for token in TOKEN_PATTERN.find_iter(&lowered) {
        let phrase = token.as_str();
        if is_valid_phrase(phrase) && seen.insert(phrase.to_string()) {
            phrases.push(phrase.to_string());
        }
    }
    phrases
}
