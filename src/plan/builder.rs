//! The AI plan builder pipeline.
//!
//! Fourteen stages, every one deterministic except the LLM call itself:
//! context load, cache lookup, phrase extraction, exact-match short
//! circuit, learned mappings, fuzzy matching, intent extraction, TF-IDF
//! context filtering, the LLM call, text parsing, graph assembly,
//! post-processing, transition pre-fetch, cache store. Stages may short
//! circuit: a cache hit skips everything, an all-exact prompt never
//! reaches the LLM, ambiguity halts the pipeline with a structured
//! disambiguation payload instead of a guess.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::LlmClient;
use crate::control::Ctx;
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::plan::assemble::{assemble, trivial_navigation_plan};
use crate::plan::cache::PlanCache;
use crate::plan::context::{ContextLoader, PlanContext};
use crate::plan::filter::{filter_context, FilterConfig};
use crate::plan::fingerprint::fingerprint;
use crate::plan::fuzzy::{classify, FuzzyOutcome};
use crate::plan::graph::PlanGraph;
use crate::plan::intent::{extract_intent, Intent};
use crate::plan::mappings::LearnedMappings;
use crate::plan::parser::parse_response;
use crate::plan::phrases::extract_phrases;
use crate::plan::postprocess::{
    enforce_labels, prefetch_transitions, validate_targets, Ambiguity, TargetValidation,
};
use crate::plan::prompt::{build_prompt, PromptInput};
use crate::navigation::NavigationCache;
use crate::registry::DeviceKey;

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PlanBuilderConfig {
    /// Similarity a single fuzzy candidate must exceed to auto-correct
    pub fuzzy_accept_threshold: f64,
    pub filter: FilterConfig,
    pub llm_temperature: f64,
    pub llm_max_tokens: u32,
}

impl Default for PlanBuilderConfig {
    fn default() -> Self {
        Self {
            fuzzy_accept_threshold: 0.75,
            filter: FilterConfig::default(),
            llm_temperature: 0.0,
            llm_max_tokens: 1024,
        }
    }
}

/// One generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub host_name: String,
    pub device_id: String,
    pub interface: String,
    /// Phrase → node choices from a prior disambiguation round
    #[serde(default)]
    pub resolutions: HashMap<String, String>,
}

/// A successfully generated (or cached) plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub graph: PlanGraph,
    pub analysis: String,
    pub fingerprint: String,
    pub cached: bool,
}

/// Pipeline outcome: a plan, or a halt asking the caller to resolve
/// ambiguous phrases. The halt is a successful response, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanOutcome {
    Plan(PlanResponse),
    NeedsDisambiguation {
        ambiguities: Vec<Ambiguity>,
        available_nodes: Vec<String>,
        original_prompt: String,
    },
}

/// The pipeline.
pub struct PlanBuilder {
    context_loader: Arc<ContextLoader>,
    nav_cache: Arc<NavigationCache>,
    store: Arc<dyn Persistence>,
    plan_cache: Arc<PlanCache>,
    mappings: Arc<LearnedMappings>,
    llm: Arc<dyn LlmClient>,
    config: PlanBuilderConfig,
}

impl PlanBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context_loader: Arc<ContextLoader>,
        nav_cache: Arc<NavigationCache>,
        store: Arc<dyn Persistence>,
        plan_cache: Arc<PlanCache>,
        mappings: Arc<LearnedMappings>,
        llm: Arc<dyn LlmClient>,
        config: PlanBuilderConfig,
    ) -> Self {
        Self {
            context_loader,
            nav_cache,
            store,
            plan_cache,
            mappings,
            llm,
            config,
        }
    }

    /// Run the pipeline for one request.
    pub async fn generate(&self, ctx: &Ctx, request: &GenerateRequest) -> Result<PlanOutcome> {
        if request.prompt.trim().is_empty() {
            return Err(Error::invalid_input("prompt must not be empty"));
        }

        // Stage 1: context.
        let device = DeviceKey::new(&request.host_name, &request.device_id);
        let context = self
            .context_loader
            .load(ctx, &device, &request.interface)
            .await?;

        // Stage 2: cache lookup.
        let fp = fingerprint(&request.prompt, &context.signature());
        if let Some(entry) = self.plan_cache.lookup(ctx, &fp).await? {
            return Ok(PlanOutcome::Plan(PlanResponse {
                graph: entry.graph,
                analysis: entry.analysis,
                fingerprint: fp,
                cached: true,
            }));
        }

        // Stage 3: phrases. An all-stopword prompt is infeasible before
        // any model sees it.
        let phrases = extract_phrases(&request.prompt);
        if phrases.is_empty() {
            return Err(Error::infeasible(
                "the prompt contains no usable phrases, only navigation filler",
            ));
        }

        // Stages 4-6: resolutions, learned mappings, fuzzy matching.
        let mut substitutions: HashMap<String, String> = HashMap::new();
        for (phrase, node) in &request.resolutions {
            self.mappings
                .confirm(ctx, &request.interface, phrase, node)
                .await?;
            substitutions.insert(phrase.clone(), node.clone());
        }

        let unresolved: Vec<String> = phrases
            .iter()
            .filter(|p| !substitutions.contains_key(*p))
            .cloned()
            .collect();
        let learned = self
            .mappings
            .lookup_batch(ctx, &request.interface, &unresolved)
            .await?;
        substitutions.extend(learned);

        let mut ambiguities = Vec::new();
        for phrase in &phrases {
            let candidate = substitutions
                .get(phrase)
                .cloned()
                .unwrap_or_else(|| phrase.clone());
            if context.nodes.iter().any(|label| *label == candidate) {
                continue;
            }
            match classify(&candidate, &context.nodes, self.config.fuzzy_accept_threshold) {
                FuzzyOutcome::AutoCorrect(corrected) => {
                    substitutions.insert(phrase.clone(), corrected);
                }
                FuzzyOutcome::Disambiguate(suggestions) => {
                    ambiguities.push(Ambiguity {
                        original: phrase.clone(),
                        suggestions,
                    });
                }
                FuzzyOutcome::PassThrough => {}
            }
        }
        if !ambiguities.is_empty() {
            return Ok(PlanOutcome::NeedsDisambiguation {
                ambiguities,
                available_nodes: context.nodes.clone(),
                original_prompt: request.prompt.clone(),
            });
        }

        // Stage 4 (after substitution): if every phrase now names a node
        // exactly, emit the trivial navigation plan without an LLM call.
        let resolved_phrases: Vec<String> = phrases
            .iter()
            .map(|p| substitutions.get(p).cloned().unwrap_or_else(|| p.clone()))
            .collect();
        let all_exact = resolved_phrases
            .iter()
            .all(|p| context.nodes.iter().any(|label| label == p));
        if all_exact {
            let graph = trivial_navigation_plan(&resolved_phrases);
            let analysis = format!("Direct navigation to {}.", resolved_phrases.join(", "));
            return match self.postprocess(ctx, &context, graph).await? {
                PostProcessed::Ready(graph) => self
                    .finish(ctx, &fp, graph, analysis, &context)
                    .await
                    .map(PlanOutcome::Plan),
                PostProcessed::Ambiguous(ambiguities) => Ok(PlanOutcome::NeedsDisambiguation {
                    ambiguities,
                    available_nodes: context.nodes.clone(),
                    original_prompt: request.prompt.clone(),
                }),
            };
        }

        // Stage 7: intent, with keywords mapped through substitutions.
        let mut intent = extract_intent(&request.prompt);
        apply_substitutions(&mut intent, &substitutions);

        // Stage 8: TF-IDF filtering and early infeasibility.
        let filtered = filter_context(&context, &intent.keywords, &self.config.filter);
        let empty = filtered.empty_categories();
        if !empty.is_empty() {
            return Err(Error::infeasible(format!(
                "no available {} match the request",
                empty.join(", ")
            )));
        }

        // Stages 9-10: one LLM call, total parse, one strict retry.
        let input = PromptInput {
            user_prompt: &request.prompt,
            device_model: &context.device_model,
            interface: &context.interface,
            intent: &intent,
            filtered: &filtered,
        };
        let text = self
            .llm
            .complete(
                &build_prompt(&input, false),
                self.config.llm_temperature,
                self.config.llm_max_tokens,
            )
            .await?;
        let mut parsed = parse_response(&text);
        if parsed.steps.is_empty() {
            tracing::warn!("step-list parse yielded no steps, retrying with strict template");
            let retry_text = self
                .llm
                .complete(
                    &build_prompt(&input, true),
                    self.config.llm_temperature,
                    self.config.llm_max_tokens,
                )
                .await?;
            parsed = parse_response(&retry_text);
            if parsed.steps.is_empty() {
                return Err(Error::ParseFailure(
                    "LLM response contained no recognizable steps".to_string(),
                ));
            }
        }

        // Stage 11: assembly.
        let graph = assemble(&parsed.steps, &intent.patterns);
        let analysis = if parsed.analysis.is_empty() {
            "Plan generated from step list.".to_string()
        } else {
            parsed.analysis
        };

        // Stages 12-14 via finish.
        match self.postprocess(ctx, &context, graph).await? {
            PostProcessed::Ready(graph) => self
                .finish(ctx, &fp, graph, analysis, &context)
                .await
                .map(PlanOutcome::Plan),
            PostProcessed::Ambiguous(ambiguities) => Ok(PlanOutcome::NeedsDisambiguation {
                ambiguities,
                available_nodes: context.nodes.clone(),
                original_prompt: request.prompt.clone(),
            }),
        }
    }

    /// Stage 12: label enforcement and target validation.
    async fn postprocess(
        &self,
        ctx: &Ctx,
        context: &PlanContext,
        mut graph: PlanGraph,
    ) -> Result<PostProcessed> {
        enforce_labels(&mut graph);
        let unified = self
            .nav_cache
            .get_or_build(&ctx.team_id, &context.interface, self.store.as_ref())
            .await?;
        match validate_targets(&mut graph, &unified, self.config.fuzzy_accept_threshold) {
            TargetValidation::Valid => Ok(PostProcessed::Ready(graph)),
            TargetValidation::NeedsDisambiguation(ambiguities) => {
                Ok(PostProcessed::Ambiguous(ambiguities))
            }
        }
    }

    /// Stages 13-14 for a post-processed graph: pre-fetch transitions,
    /// validate structure, store, respond.
    async fn finish(
        &self,
        ctx: &Ctx,
        fp: &str,
        mut graph: PlanGraph,
        analysis: String,
        context: &PlanContext,
    ) -> Result<PlanResponse> {
        let unified = self
            .nav_cache
            .get_or_build(&ctx.team_id, &context.interface, self.store.as_ref())
            .await?;
        prefetch_transitions(&mut graph, &unified)?;
        graph.validate()?;

        self.plan_cache.store(ctx, fp, &graph, &analysis).await?;
        Ok(PlanResponse {
            graph,
            analysis,
            fingerprint: fp.to_string(),
            cached: false,
        })
    }
}

enum PostProcessed {
    Ready(PlanGraph),
    Ambiguous(Vec<Ambiguity>),
}

/// Map intent keywords through the substitution table so filtering
/// ranks against the resolved node names.
fn apply_substitutions(intent: &mut Intent, substitutions: &HashMap<String, String>) {
    for keyword in intent
        .keywords
        .navigation
        .iter_mut()
        .chain(intent.keywords.actions.iter_mut())
        .chain(intent.keywords.verifications.iter_mut())
    {
        if let Some(node) = substitutions.get(keyword) {
            *keyword = node.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedLlm;
    use crate::navigation::tree::{EdgeAction, NavNode, NavigationTree};
    use crate::navigation::NavigationCacheConfig;
    use crate::persistence::SqliteStore;
    use crate::plan::cache::PlanCacheConfig;
    use crate::plan::context::ContextLoaderConfig;
    use crate::plan::graph::BlockKind;
    use crate::registry::DeviceRegistry;
    use pretty_assertions::assert_eq;

    struct Fixture {
        builder: PlanBuilder,
        llm: Arc<ScriptedLlm>,
    }

    /// home -> live_tv / live_radio / settings / live, all one hop out.
    async fn fixture() -> Fixture {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register_host("host1", "http://host1:6109");
        registry
            .register_device("host1", "device1", "android_tv", None)
            .unwrap();

        let store: Arc<dyn Persistence> = Arc::new(SqliteStore::in_memory().unwrap());
        let nav_cache = Arc::new(NavigationCache::new(NavigationCacheConfig::default()));

        let mut tree = NavigationTree::new("tree1", "tv_ui", "android_tv");
        tree.add_node(NavNode::new("n_home", "home"))
            .add_node(NavNode::new("n_live_tv", "live_tv"))
            .add_node(NavNode::new("n_live_radio", "live_radio"))
            .add_node(NavNode::new("n_settings", "settings"))
            .add_node(NavNode::new("n_live", "live"));
        for (edge, target, key) in [
            ("e1", "n_live_tv", "RIGHT"),
            ("e2", "n_live_radio", "LEFT"),
            ("e3", "n_settings", "DOWN"),
            ("e4", "n_live", "UP"),
        ] {
            tree.connect(
                edge,
                "n_home",
                target,
                vec![EdgeAction::new(format!("press_key:{}", key)).with_delay_ms(100)],
            );
        }
        nav_cache
            .store_tree("team1", &tree, store.as_ref())
            .await
            .unwrap();

        let context_loader = Arc::new(ContextLoader::new(
            registry,
            nav_cache.clone(),
            store.clone(),
            ContextLoaderConfig::default(),
        ));
        let plan_cache = Arc::new(PlanCache::new(store.clone(), PlanCacheConfig::default()));
        let mappings = Arc::new(LearnedMappings::new(store.clone()));
        let llm = Arc::new(ScriptedLlm::new());

        Fixture {
            builder: PlanBuilder::new(
                context_loader,
                nav_cache,
                store,
                plan_cache,
                mappings,
                llm.clone(),
                PlanBuilderConfig::default(),
            ),
            llm,
        }
    }

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            host_name: "host1".to_string(),
            device_id: "device1".to_string(),
            interface: "tv_ui".to_string(),
            resolutions: HashMap::new(),
        }
    }

    fn expect_plan(outcome: PlanOutcome) -> PlanResponse {
        match outcome {
            PlanOutcome::Plan(plan) => plan,
            other => panic!("expected a plan, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exact_match_short_circuit() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        let plan = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("home"))
                .await
                .unwrap(),
        );
        assert_eq!(fixture.llm.call_count(), 0);
        assert!(!plan.cached);

        let labels: Vec<_> = plan.graph.nodes.iter().map(|n| n.data.label.clone()).collect();
        assert_eq!(labels, vec!["START", "navigation_1:home", "SUCCESS"]);

        // Second invocation is a cache hit with the identical graph.
        let cached = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("home"))
                .await
                .unwrap(),
        );
        assert!(cached.cached);
        assert_eq!(
            serde_json::to_string(&plan.graph).unwrap(),
            serde_json::to_string(&cached.graph).unwrap()
        );
        assert_eq!(fixture.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_two_step_sequence_via_llm() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        fixture.llm.push_response(
            "ANALYSIS: Navigate home then verify audio.\n\
             STEPS:\n\
             1. Navigate to: home\n\
             2. Verify: check_audio",
        );

        let plan = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("go to home and check audio"))
                .await
                .unwrap(),
        );
        assert_eq!(fixture.llm.call_count(), 1);

        let labels: Vec<_> = plan.graph.nodes.iter().map(|n| n.data.label.clone()).collect();
        assert_eq!(
            labels,
            vec![
                "START",
                "navigation_1:home",
                "verification_1:check_audio",
                "SUCCESS",
                "FAILURE"
            ]
        );

        // Navigation block carries pre-fetched transitions (home is the
        // root: empty path) and both fallible blocks reach FAILURE.
        let nav = plan.graph.node("nav1").unwrap();
        assert!(nav.data.transitions.as_ref().unwrap().is_empty());
        assert_eq!(
            plan.graph
                .outgoing("verify1", crate::plan::graph::EdgeHandle::Failure)
                .unwrap()
                .target,
            "failure"
        );
    }

    #[tokio::test]
    async fn test_disambiguation_then_learned_mapping() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        // "liv" fuzzily matches several nodes: halt with suggestions.
        let outcome = fixture
            .builder
            .generate(&ctx, &request("navigate to liv"))
            .await
            .unwrap();
        let ambiguities = match outcome {
            PlanOutcome::NeedsDisambiguation {
                ambiguities,
                available_nodes,
                original_prompt,
            } => {
                assert_eq!(original_prompt, "navigate to liv");
                assert!(available_nodes.contains(&"live_tv".to_string()));
                ambiguities
            }
            other => panic!("expected disambiguation, got {:?}", other),
        };
        assert_eq!(ambiguities[0].original, "liv");
        assert!(ambiguities[0].suggestions.contains(&"live_tv".to_string()));
        assert_eq!(fixture.llm.call_count(), 0);

        // Resubmit with the user's choice: resolved without the LLM,
        // and the mapping is persisted.
        let mut resolved = request("navigate to liv");
        resolved
            .resolutions
            .insert("liv".to_string(), "live_tv".to_string());
        let plan = expect_plan(fixture.builder.generate(&ctx, &resolved).await.unwrap());
        assert_eq!(
            plan.graph.node("nav1").unwrap().data.target_node.as_deref(),
            Some("live_tv")
        );
        assert_eq!(fixture.llm.call_count(), 0);

        // A later prompt with the same phrase short-circuits through
        // the learned mapping, no disambiguation round.
        let plan = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("open liv please"))
                .await
                .unwrap(),
        );
        assert_eq!(
            plan.graph.node("nav1").unwrap().data.target_node.as_deref(),
            Some("live_tv")
        );
        assert_eq!(fixture.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_scope() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        fixture.llm.push_response(
            "ANALYSIS: Zap twice and verify each time.\n\
             STEPS:\n\
             1. Navigate to: live\n\
             2. Action: zap\n\
             3. Verify: check_audio\n\
             4. Verify: check_video",
        );

        let plan = expect_plan(
            fixture
                .builder
                .generate(
                    &ctx,
                    &request("go to live then zap 2 times, for each zap check audio and video"),
                )
                .await
                .unwrap(),
        );

        let loop_node = plan
            .graph
            .nodes
            .iter()
            .find(|n| n.kind == BlockKind::Loop)
            .expect("loop node");
        assert_eq!(loop_node.data.iterations, Some(2));

        let body = loop_node.data.body.as_ref().unwrap();
        let body_labels: Vec<_> = body.nodes.iter().map(|n| n.data.label.clone()).collect();
        assert_eq!(
            body_labels,
            vec![
                "START",
                "action_1:zap",
                "verification_1:check_audio",
                "verification_2:check_video",
                "SUCCESS",
                "FAILURE"
            ]
        );

        // The navigation stays outside the loop.
        let outer: Vec<_> = plan.graph.nodes.iter().map(|n| n.data.label.clone()).collect();
        assert!(outer.contains(&"navigation_1:live".to_string()));
    }

    #[tokio::test]
    async fn test_empty_prompt_is_invalid_input() {
        let fixture = fixture().await;
        let err = fixture
            .builder
            .generate(&Ctx::new("team1"), &request("   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_stopword_only_prompt_is_infeasible_without_llm() {
        let fixture = fixture().await;
        let err = fixture
            .builder
            .generate(&Ctx::new("team1"), &request("go to the"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Infeasible);
        assert_eq!(fixture.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_category_is_infeasible_before_llm() {
        let fixture = fixture().await;
        let err = fixture
            .builder
            .generate(&Ctx::new("team1"), &request("go to home and check bluetooth"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Infeasible);
        assert_eq!(fixture.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_retries_once_with_strict_template() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        fixture.llm.push_response("I would be happy to help!");
        fixture.llm.push_response(
            "ANALYSIS: ok\n1. Navigate to: home\n2. Verify: check_audio",
        );

        let plan = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("go to home and check audio"))
                .await
                .unwrap(),
        );
        assert_eq!(fixture.llm.call_count(), 2);
        assert!(fixture.llm.calls()[1].contains("STRICT MODE"));
        assert_eq!(plan.graph.nodes.len(), 5);
    }

    #[tokio::test]
    async fn test_double_parse_failure_is_terminal() {
        let fixture = fixture().await;

        fixture.llm.push_response("nothing useful");
        fixture.llm.push_response("still nothing");

        let err = fixture
            .builder
            .generate(&Ctx::new("team1"), &request("go to home and check audio"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ParseFailure);
        assert_eq!(fixture.llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_llm_inventing_node_triggers_postprocess_validation() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        // The model invents "dashboard"; no node is close enough, so
        // post-processing halts with a disambiguation payload.
        fixture.llm.push_response(
            "ANALYSIS: ok\n1. Navigate to: dashboard\n2. Verify: check_audio",
        );

        let outcome = fixture
            .builder
            .generate(&ctx, &request("go to settings and check audio"))
            .await
            .unwrap();
        match outcome {
            PlanOutcome::NeedsDisambiguation { ambiguities, .. } => {
                assert_eq!(ambiguities[0].original, "dashboard");
            }
            other => panic!("expected disambiguation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identical_requests_return_identical_graphs() {
        let fixture = fixture().await;
        let ctx = Ctx::new("team1");

        fixture.llm.push_response(
            "ANALYSIS: ok\n1. Navigate to: home\n2. Verify: check_audio",
        );

        let first = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("go to home and check audio"))
                .await
                .unwrap(),
        );
        let second = expect_plan(
            fixture
                .builder
                .generate(&ctx, &request("  GO TO HOME AND CHECK AUDIO "))
                .await
                .unwrap(),
        );

        // Same normalized prompt, same context: byte-identical graphs.
        assert!(second.cached);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(
            serde_json::to_string(&first.graph).unwrap(),
            serde_json::to_string(&second.graph).unwrap()
        );
    }
}
