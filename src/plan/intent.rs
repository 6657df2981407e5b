//! Structured intent extraction.
//!
//! Pure regex and keyword classes, no LLM: the prompt is scanned once,
//! verbs switch the current category, and valid phrases land in the
//! category that was active when they appeared. Pattern flags (loop,
//! sequence, conditional) come from dedicated regexes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::plan::phrases::is_valid_phrase;

/// Keywords grouped by the category that was active when they appeared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentKeywords {
    pub navigation: Vec<String>,
    pub actions: Vec<String>,
    pub verifications: Vec<String>,
}

impl IntentKeywords {
    pub fn is_empty(&self) -> bool {
        self.navigation.is_empty() && self.actions.is_empty() && self.verifications.is_empty()
    }
}

/// Structural flags detected in the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentPatterns {
    pub has_loop: bool,
    pub loop_count: Option<u32>,
    pub has_sequence: bool,
    pub has_conditional: bool,
}

/// Overall shape the assembler should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureType {
    Single,
    Sequence,
    SequenceWithLoop,
    Conditional,
}

/// The parsed intent of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub keywords: IntentKeywords,
    pub patterns: IntentPatterns,
    pub structure_type: StructureType,
}

const NAV_VERBS: &[&str] = &[
    "go", "goto", "navigate", "open", "visit", "enter", "back", "return",
];

const ACTION_VERBS: &[&str] = &[
    "press", "zap", "click", "tap", "type", "input", "launch", "play", "pause", "select",
    "scroll", "swipe", "toggle", "mute", "set",
];

const VERIFY_VERBS: &[&str] = &["check", "verify", "ensure", "confirm", "assert", "expect"];

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]+").expect("invalid regex"));

static LOOP_COUNT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d+)\s*(?:times|x)\b").expect("invalid regex"));

static LOOP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+\s*times|twice|repeat|for\s+each|loop)\b").expect("invalid regex")
});

static SEQUENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(then|after\s+that|next|followed\s+by)\b|,").expect("invalid regex")
});

static CONDITIONAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(if|when|unless|otherwise|in\s+case)\b").expect("invalid regex")
});

#[derive(Clone, Copy, PartialEq)]
enum Category {
    Navigation,
    Action,
    Verification,
}

/// Extract a structured intent from a prompt.
pub fn extract_intent(prompt: &str) -> Intent {
    let lowered = prompt.to_lowercase();
    let mut keywords = IntentKeywords::default();
    let mut category = Category::Navigation;

    for token in TOKEN_PATTERN.find_iter(&lowered) {
        let word = token.as_str();

        if NAV_VERBS.contains(&word) {
            category = Category::Navigation;
            continue;
        }
        if ACTION_VERBS.contains(&word) {
            category = Category::Action;
            // Self-contained actions ("zap", "play") are keywords themselves.
            if is_valid_phrase(word) && !keywords.actions.iter().any(|k| k == word) {
                keywords.actions.push(word.to_string());
            }
            continue;
        }
        if VERIFY_VERBS.contains(&word) {
            category = Category::Verification;
            continue;
        }

        if !is_valid_phrase(word) {
            continue;
        }
        let bucket = match category {
            Category::Navigation => &mut keywords.navigation,
            Category::Action => &mut keywords.actions,
            Category::Verification => &mut keywords.verifications,
        };
        if !bucket.iter().any(|k| k == word) {
            bucket.push(word.to_string());
        }
    }

    let loop_count = LOOP_COUNT_PATTERN
        .captures(&lowered)
        .and_then(|c| c[1].parse().ok())
        .or_else(|| lowered.contains("twice").then_some(2));
    let has_loop = LOOP_PATTERN.is_match(&lowered);

    let keyword_total =
        keywords.navigation.len() + keywords.actions.len() + keywords.verifications.len();
    let patterns = IntentPatterns {
        has_loop,
        loop_count: if has_loop { loop_count.or(Some(1)) } else { None },
        has_sequence: SEQUENCE_PATTERN.is_match(&lowered) || keyword_total > 1,
        has_conditional: CONDITIONAL_PATTERN.is_match(&lowered),
    };

    let structure_type = if patterns.has_conditional {
        StructureType::Conditional
    } else if patterns.has_loop {
        StructureType::SequenceWithLoop
    } else if patterns.has_sequence {
        StructureType::Sequence
    } else {
        StructureType::Single
    };

    Intent {
        keywords,
        patterns,
        structure_type,
    }
}
