//! Deterministic parser for the LLM step list.
//!
//! The parse is total: lines that match no rule are ignored rather than
//! fatal. Zero extracted steps is the only failure mode, handled by the
//! pipeline's single strict retry.

use regex::Regex;
use std::sync::LazyLock;

/// One typed step extracted from the response text.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    Navigate {
        target: String,
    },
    Action {
        command: String,
        description: Option<String>,
    },
    Verify {
        verification_type: String,
    },
    Sleep {
        duration_ms: u64,
    },
}

/// The parsed response: free-text analysis plus ordered steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub analysis: String,
    pub steps: Vec<PlanStep>,
}

static ANALYSIS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ANALYSIS:\s*(.+)$").expect("invalid regex"));

static STEP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:\d+[.)]\s*)?(navigate\s+to|action|verify|sleep)\s*:\s*(.+)$")
        .expect("invalid regex")
});

static TRAILING_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*\(([^)]*)\)\s*$").expect("invalid regex"));

static LEADING_INT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)").expect("invalid regex"));

/// Parse an LLM response into analysis text and typed steps.
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut response = ParsedResponse::default();

    for line in text.lines() {
        if response.analysis.is_empty() {
            if let Some(captures) = ANALYSIS_PATTERN.captures(line) {
                response.analysis = captures[1].trim().to_string();
                continue;
            }
        }

        let Some(captures) = STEP_PATTERN.captures(line) else {
            continue;
        };
        let kind = captures[1].to_lowercase();
        let content = captures[2].trim().to_string();
        if content.is_empty() {
            continue;
        }

        match kind.split_whitespace().next().unwrap_or("") {
            "navigate" => response.steps.push(PlanStep::Navigate { target: content }),
            "action" => {
                let (command, description) = match TRAILING_PAREN.captures(&content) {
                    Some(c) if !c[1].trim().is_empty() => (
                        c[1].trim().to_string(),
                        Some(c[2].trim().to_string()).filter(|d| !d.is_empty()),
                    ),
                    _ => (content, None),
                };
                response.steps.push(PlanStep::Action {
                    command,
                    description,
                });
            }
            "verify" => response.steps.push(PlanStep::Verify {
                verification_type: content,
            }),
            "sleep" => {
                // Non-numeric sleep content is ignored, not fatal.
                if let Some(c) = LEADING_INT.captures(&content) {
                    if let Ok(duration_ms) = c[1].parse() {
                        response.steps.push(PlanStep::Sleep { duration_ms });
                    }
                }
            }
            _ => {}
        }
    }

    response
}
