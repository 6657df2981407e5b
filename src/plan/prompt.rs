//! LLM prompt template for plan generation.
//!
//! The model is asked for a plain-text step list, never JSON: the text
//! grammar is total to parse and leaves graph construction entirely to
//! the core. The strict variant is used for the single retry after a
//! parse failure.

use crate::plan::filter::FilteredContext;
use crate::plan::intent::Intent;

/// Parameters of one prompt build.
pub struct PromptInput<'a> {
    pub user_prompt: &'a str,
    pub device_model: &'a str,
    pub interface: &'a str,
    pub intent: &'a Intent,
    pub filtered: &'a FilteredContext,
}

fn listing(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        format!("{}: (none)\n", title)
    } else {
        format!("{}: {}\n", title, items.join(", "))
    }
}

/// Build the generation prompt. `strict` tightens the format rules for
/// the retry after a parse failure.
pub fn build_prompt(input: &PromptInput<'_>, strict: bool) -> String {
    let mut prompt = String::new();

    prompt.push_str("You are a test automation planner for a device under test.\n");
    prompt.push_str(&format!(
        "Device model: {} | Interface: {}\n\n",
        input.device_model, input.interface
    ));

    prompt.push_str("Only these items exist; never invent others.\n");
    prompt.push_str(&listing("Available nodes", &input.filtered.nodes.items));
    prompt.push_str(&listing("Available actions", &input.filtered.actions.items));
    prompt.push_str(&listing(
        "Available verifications",
        &input.filtered.verifications.items,
    ));

    let patterns = &input.intent.patterns;
    prompt.push_str(&format!(
        "\nDetected structure: {:?}{}\n",
        input.intent.structure_type,
        match patterns.loop_count {
            Some(count) if patterns.has_loop => format!(" (loop {} times)", count),
            _ => String::new(),
        }
    ));

    prompt.push_str("\nTask: ");
    prompt.push_str(input.user_prompt);
    prompt.push_str("\n\nRespond in exactly this format:\n");
    prompt.push_str("ANALYSIS: <one or two sentences of reasoning>\n");
    prompt.push_str("STEPS:\n");
    prompt.push_str("1. Navigate to: <node>\n");
    prompt.push_str("2. Action: <command> (optional description)\n");
    prompt.push_str("3. Verify: <verification_type>\n");
    prompt.push_str("4. Sleep: <milliseconds>\n");
    prompt.push_str("Use only step kinds Navigate to / Action / Verify / Sleep.\n");

    if strict {
        prompt.push_str(
            "\nSTRICT MODE: output nothing but the ANALYSIS line and numbered STEPS. \
             No markdown, no commentary, no blank steps. Every step must name an \
             available item verbatim.\n",
        );
    }

    prompt
}
