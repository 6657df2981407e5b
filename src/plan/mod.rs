//! The AI plan builder.
//!
//! Turns a natural-language prompt into a validated, executable plan
//! graph. Everything around the single LLM call is deterministic:
//! phrase extraction, learned mappings, fuzzy disambiguation, intent
//! extraction, TF-IDF context filtering, total text parsing, graph
//! assembly, label enforcement, target validation, and transition
//! pre-fetch.

pub mod assemble;
pub mod builder;
pub mod cache;
pub mod context;
pub mod filter;
pub mod fingerprint;
pub mod fuzzy;
pub mod graph;
pub mod intent;
pub mod mappings;
pub mod parser;
pub mod phrases;
pub mod postprocess;
pub mod prompt;

pub use builder::{
    GenerateRequest, PlanBuilder, PlanBuilderConfig, PlanOutcome, PlanResponse,
};
pub use cache::{PlanCache, PlanCacheConfig, PlanCacheEntry, PlanCacheStats};
pub use context::{ContextLoader, ContextLoaderConfig, PlanContext};
pub use filter::FilterConfig;
pub use fingerprint::{fingerprint, normalize_prompt, ContextSignature};
pub use graph::{
    label_matches, make_label, BlockKind, EdgeHandle, NodeData, PlanEdge, PlanGraph, PlanNode,
    Position,
};
pub use intent::{extract_intent, Intent, IntentKeywords, IntentPatterns, StructureType};
pub use mappings::{LearnedMapping, LearnedMappings};
pub use postprocess::Ambiguity;
