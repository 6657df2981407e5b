//! TF-IDF context filtering.
//!
//! The LLM never sees the whole catalog. Each intent keyword ranks the
//! available items of its category by cosine similarity over TF-IDF
//! term vectors, and only the top N per category survive. A category
//! whose keywords retrieve nothing makes the request infeasible before
//! any LLM call.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::plan::context::PlanContext;
use crate::plan::intent::IntentKeywords;

/// Per-category ceilings for the reduced context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub top_nodes: usize,
    pub top_actions: usize,
    pub top_verifications: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            top_nodes: 15,
            top_actions: 10,
            top_verifications: 8,
        }
    }
}

/// One filtered category.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredCategory {
    pub items: Vec<String>,
    /// False when the category had keywords but none retrieved anything
    pub matched: bool,
}

/// The reduced context handed to the LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredContext {
    pub nodes: FilteredCategory,
    pub actions: FilteredCategory,
    pub verifications: FilteredCategory,
}

impl FilteredContext {
    /// Categories that had keywords but retrieved nothing.
    pub fn empty_categories(&self) -> Vec<&'static str> {
        let mut empty = Vec::new();
        if !self.nodes.matched {
            empty.push("nodes");
        }
        if !self.actions.matched {
            empty.push("actions");
        }
        if !self.verifications.matched {
            empty.push("verifications");
        }
        empty
    }
}

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Sparse TF-IDF vectors over the item corpus, cosine-scored against
/// the keyword query.
fn rank(items: &[String], keywords: &[String]) -> Vec<(usize, f64)> {
    let docs: Vec<Vec<String>> = items.iter().map(|i| terms(i)).collect();

    // Document frequency per term.
    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *df.entry(term).or_insert(0) += 1;
        }
    }
    let total = docs.len().max(1) as f64;
    let idf = |term: &str| {
        let n = df.get(term).copied().unwrap_or(0) as f64;
        (total / (1.0 + n)).ln() + 1.0
    };

    let query: Vec<String> = keywords.iter().flat_map(|k| terms(k)).collect();
    let mut query_vec: HashMap<&str, f64> = HashMap::new();
    for term in &query {
        *query_vec.entry(term.as_str()).or_insert(0.0) += idf(term);
    }
    let query_norm: f64 = query_vec.values().map(|w| w * w).sum::<f64>().sqrt();

    let mut scored = Vec::new();
    for (index, doc) in docs.iter().enumerate() {
        let mut doc_vec: HashMap<&str, f64> = HashMap::new();
        for term in doc {
            *doc_vec.entry(term.as_str()).or_insert(0.0) += idf(term);
        }
        let doc_norm: f64 = doc_vec.values().map(|w| w * w).sum::<f64>().sqrt();

        let dot: f64 = doc_vec
            .iter()
            .filter_map(|(term, w)| query_vec.get(term).map(|q| q * w))
            .sum();

        let score = if doc_norm > 0.0 && query_norm > 0.0 {
            dot / (doc_norm * query_norm)
        } else {
            0.0
        };
        scored.push((index, score));
    }

    // Best first; equal scores keep catalog order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Filter one category. Without keywords the catalog is passed through
/// truncated; with keywords only positively-scored items survive.
pub fn filter_category(items: &[String], keywords: &[String], top_n: usize) -> FilteredCategory {
    if keywords.is_empty() {
        return FilteredCategory {
            items: items.iter().take(top_n).cloned().collect(),
            matched: true,
        };
    }

    let retrieved: Vec<String> = rank(items, keywords)
        .into_iter()
        .filter(|(_, score)| *score > 0.0)
        .take(top_n)
        .map(|(index, _)| items[index].clone())
        .collect();

    FilteredCategory {
        matched: !retrieved.is_empty(),
        items: retrieved,
    }
}

/// Build the reduced context for a request.
pub fn filter_context(
    context: &PlanContext,
    keywords: &IntentKeywords,
    config: &FilterConfig,
) -> FilteredContext {
    FilteredContext {
        nodes: filter_category(&context.nodes, &keywords.navigation, config.top_nodes),
        actions: filter_category(&context.actions, &keywords.actions, config.top_actions),
        verifications: filter_category(
            &context.verifications,
            &keywords.verifications,
            config.top_verifications,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn kw(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keyword_ranks_matching_item_first() {
        let category = filter_category(
            &items(&["check_image", "check_text", "check_audio", "check_video"]),
            &kw(&["audio"]),
            8,
        );
        assert!(category.matched);
        assert_eq!(category.items[0], "check_audio");
    }

    #[test]
    fn test_zero_retrieval_is_unmatched() {
        let category = filter_category(
            &items(&["check_image", "check_text"]),
            &kw(&["bluetooth"]),
            8,
        );
        assert!(!category.matched);
        assert!(category.items.is_empty());
    }

    #[test]
    fn test_no_keywords_passes_through_truncated() {
        let all = items(&["a1", "a2", "a3", "a4"]);
        let category = filter_category(&all, &[], 2);
        assert!(category.matched);
        assert_eq!(category.items, vec!["a1", "a2"]);
    }

    #[test]
    fn test_ceiling_applies() {
        let many: Vec<String> = (0..30).map(|i| format!("audio_item_{}", i)).collect();
        let category = filter_category(&many, &kw(&["audio"]), 15);
        assert_eq!(category.items.len(), 15);
    }

    #[test]
    fn test_empty_categories_reported() {
        let context = PlanContext {
            interface: "tv_ui".into(),
            device_model: "android_tv".into(),
            nodes: items(&["home", "live"]),
            actions: items(&["press_key:UP"]),
            verifications: items(&["check_image"]),
        };
        let keywords = IntentKeywords {
            navigation: kw(&["home"]),
            actions: vec![],
            verifications: kw(&["audio"]),
        };
        let filtered = filter_context(&context, &keywords, &FilterConfig::default());
        assert_eq!(filtered.empty_categories(), vec!["verifications"]);
        assert_eq!(filtered.nodes.items[0], "home");
    }

    #[test]
    fn test_deterministic_ordering_on_ties() {
        let category = filter_category(
            &items(&["audio_a", "audio_b", "audio_c"]),
            &kw(&["audio"]),
            8,
        );
        // idf-equal matches keep catalog order.
        assert_eq!(category.items, vec!["audio_a", "audio_b", "audio_c"]);
    }
}
