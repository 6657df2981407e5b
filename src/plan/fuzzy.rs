//! Fuzzy matching of user phrases against node labels.
//!
//! Similarity is edit distance normalized to [0,1], taken against the
//! whole label and against each of its underscore parts; the best score
//! wins. That way "setings" lands on "settings" by a one-edit miss,
//! while "live" scores 1.0 against both "live_tv" and "live_radio" and
//! forces disambiguation instead of a silent guess.

use serde::{Deserialize, Serialize};

/// Outcome of matching one phrase.
#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyOutcome {
    /// No candidate reached the threshold; the phrase passes through
    /// unchanged for the LLM to interpret.
    PassThrough,
    /// Exactly one candidate strictly above the threshold.
    AutoCorrect(String),
    /// Two or more candidates (or one sitting exactly at the
    /// threshold); the caller must ask the user.
    Disambiguate(Vec<String>),
}

/// A scored candidate label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub candidate: String,
    pub score: f64,
}

/// Classic Levenshtein distance.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

fn normalized(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

/// Similarity of a phrase to a label: the best of the whole-label score
/// and the per-underscore-part scores.
pub fn similarity(phrase: &str, label: &str) -> f64 {
    let whole = normalized(phrase, label);
    label
        .split('_')
        .map(|part| normalized(phrase, part))
        .fold(whole, f64::max)
}

/// Score a phrase against every label, keeping candidates at or above
/// the threshold, best first; equal scores keep label order.
pub fn match_candidates(phrase: &str, labels: &[String], threshold: f64) -> Vec<FuzzyMatch> {
    let mut matches: Vec<FuzzyMatch> = labels
        .iter()
        .map(|label| FuzzyMatch {
            candidate: label.clone(),
            score: similarity(phrase, label),
        })
        .filter(|m| m.score >= threshold)
        .collect();
    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matches
}

/// Maximum suggestions returned in a disambiguation payload.
pub const MAX_SUGGESTIONS: usize = 5;

/// Apply the 0 / 1 / 2+ candidate policy for one phrase.
pub fn classify(phrase: &str, labels: &[String], threshold: f64) -> FuzzyOutcome {
    let matches = match_candidates(phrase, labels, threshold);
    match matches.as_slice() {
        [] => FuzzyOutcome::PassThrough,
        [only] if only.score > threshold => FuzzyOutcome::AutoCorrect(only.candidate.clone()),
        _ => FuzzyOutcome::Disambiguate(
            matches
                .into_iter()
                .take(MAX_SUGGESTIONS)
                .map(|m| m.candidate)
                .collect(),
        ),
    }
}
