//! Stage AB: combined tool selection.
//!
//! Enriches the request with inventory context, derives the platform
//! filter, retrieves candidates under the token budget, scores them
//! deterministically, tie-breaks via the LLM only when the top scores are
//! too close to call, and emits a `SelectionV1` plus one telemetry row.
//! Selection never fails the request: every collaborator outage has a
//! degradation path that is flagged on the output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::assets::AssetFacade;
use crate::catalog::{
    FullToolSpec, MinimalRow, Platform, SelectorTelemetry, SqliteToolIndex, ToolIndexEntry,
};
use crate::embedding::EmbeddingService;
use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, LlmClient, TokenBudget};
use crate::metrics::CoreMetrics;
use crate::pipeline::classify::RuleClassifier;
use crate::pipeline::context::normalize_tool_name;
use crate::pipeline::extract_json;
use crate::pipeline::scoring::{is_ambiguous, score_candidate, PreferenceMode, ScoredCandidate};
use crate::pipeline::types::{
    AssetMetadata, Classification, EntityKind, NextStage, ParameterDescriptor, SelectionV1,
    ToolChoice,
};
use crate::secrets::SecretsBroker;
use crate::trace::TraceId;

/// Parameter names satisfied by a resolved target host.
const HOST_PARAM_NAMES: &[&str] = &["host", "target_host", "hostname", "target", "computer_name"];

/// Selector tuning knobs.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Relative score gap below which the top two candidates are ambiguous
    pub ambiguity_margin: f32,
    /// Vector retrieval depth
    pub vector_top_k: usize,
    /// Lexical retrieval depth
    pub lexical_top_k: usize,
    /// Operator preference mode for deterministic scoring
    pub preference_mode: PreferenceMode,
    /// How many pooled candidates get full-spec scoring
    pub scoring_pool: usize,
    /// Platform alternatives offered when the target is unknown
    pub max_alternatives: usize,
    /// Deadline for the LLM tie-break call
    pub tie_break_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ambiguity_margin: 0.10,
            vector_top_k: 120,
            lexical_top_k: 60,
            preference_mode: PreferenceMode::Balanced,
            scoring_pool: 10,
            max_alternatives: 3,
            tie_break_timeout: Duration::from_secs(15),
        }
    }
}

impl SelectorConfig {
    /// Override the ambiguity margin, kept inside the sane range.
    pub fn with_ambiguity_margin(mut self, margin: f32) -> Self {
        self.ambiguity_margin = margin.clamp(0.05, 0.25);
        self
    }

    pub fn with_preference_mode(mut self, mode: PreferenceMode) -> Self {
        self.preference_mode = mode;
        self
    }
}

/// Caller-supplied request context.
#[derive(Debug, Clone, Default)]
pub struct SelectorContext {
    /// Asset the operator is currently focused on, used as a target fallback
    pub current_asset: Option<String>,
    /// Explicit platform override
    pub platform: Option<Platform>,
}

/// Stage AB selector.
pub struct Selector {
    index: Arc<SqliteToolIndex>,
    embeddings: Arc<EmbeddingService>,
    assets: Arc<dyn AssetFacade>,
    broker: Arc<SecretsBroker>,
    /// Tie-break model; deployments may hand the selector a cheaper client
    /// than the rest of the pipeline
    llm: Arc<dyn LlmClient>,
    budget: TokenBudget,
    metrics: Arc<CoreMetrics>,
    config: SelectorConfig,
}

// Internal candidate carried between retrieval and scoring.
#[derive(Debug, Clone)]
struct Candidate {
    entry: ToolIndexEntry,
    /// Normalized retrieval signal in [0, 1]
    signal: f32,
    /// Best source rank (lower is better)
    rank: usize,
}

impl Selector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<SqliteToolIndex>,
        embeddings: Arc<EmbeddingService>,
        assets: Arc<dyn AssetFacade>,
        broker: Arc<SecretsBroker>,
        llm: Arc<dyn LlmClient>,
        budget: TokenBudget,
        metrics: Arc<CoreMetrics>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            assets,
            broker,
            llm,
            budget,
            metrics,
            config,
        }
    }

    /// Run selection. Infallible by contract: failures degrade and annotate.
    pub async fn select(
        &self,
        trace: &TraceId,
        user_text: &str,
        classification: &Classification,
        ctx: &SelectorContext,
    ) -> SelectionV1 {
        let started = Instant::now();
        let mut telemetry = SelectorTelemetry::new(trace.as_str());
        let mut degraded: Vec<String> = Vec::new();

        // 1. Early entity extraction: never blocks on the LLM.
        let mut targets: Vec<String> =
            classification.targets().iter().map(|t| t.to_string()).collect();
        if targets.is_empty() {
            let rules = RuleClassifier;
            targets = rules
                .extract_entities(user_text)
                .into_iter()
                .filter(|e| matches!(e.kind, EntityKind::Hostname | EntityKind::IpAddress))
                .map(|e| e.value)
                .collect();
        }

        // 2. Asset enrichment with current-asset fallback.
        let enrich_started = Instant::now();
        let (asset_metadata, facade_down, asset_not_found) =
            self.enrich(&targets, ctx.current_asset.as_deref()).await;
        if facade_down {
            degraded.push("asset_facade_unavailable".to_string());
        }
        if asset_not_found {
            degraded.push("asset_not_found".to_string());
        }
        telemetry.stage_timings_ms.insert(
            "enrichment".to_string(),
            enrich_started.elapsed().as_millis() as u64,
        );

        // Fleet-wide requests enumerate their targets via the inventory.
        let enumeration = targets.is_empty()
            && (classification.entity(EntityKind::Tag).is_some()
                || wants_enumeration(user_text));
        let missing_target_info = targets.is_empty() && asset_metadata.is_none() && !enumeration;

        // 3. Platform filter from the closed mapping.
        let platform_filter = asset_metadata
            .as_ref()
            .and_then(|m| m.platform)
            .or(ctx.platform);

        // 4. Token budgeting.
        let row_budget = self.budget.max_rows();
        telemetry.budget_clamped = row_budget.clamped;

        // 5. Candidate retrieval: vector and lexical in parallel.
        let retrieval_started = Instant::now();
        let (pool, candidates_before_budget, index_down) =
            self.retrieve(user_text, platform_filter, row_budget.max_rows, &mut telemetry)
                .await;
        if index_down {
            degraded.push("index_unavailable".to_string());
        }
        telemetry.stage_timings_ms.insert(
            "retrieval".to_string(),
            retrieval_started.elapsed().as_millis() as u64,
        );

        telemetry.catalog_size = self.index.catalog_size().unwrap_or(0);
        telemetry.candidates_before_budget = candidates_before_budget;
        telemetry.rows_sent = pool.len();
        telemetry.budget_used_tokens = self.budget.estimate_used(pool.len());
        telemetry.headroom_left_pct = self.budget.headroom(telemetry.budget_used_tokens);
        telemetry.pool_ids = pool.iter().map(|c| c.entry.id.clone()).collect();

        if pool.is_empty() {
            let selection = self.empty_selection(
                index_down,
                user_text,
                platform_filter,
                asset_metadata,
                missing_target_info,
                degraded,
            );
            telemetry.selected_ids = Vec::new();
            telemetry
                .stage_timings_ms
                .insert("total".to_string(), started.elapsed().as_millis() as u64);
            self.write_telemetry(&telemetry);
            self.metrics
                .record_selector_request("empty", "pipeline", started.elapsed());
            return selection;
        }

        // 6. Deterministic scoring over the head of the pool.
        let scoring_started = Instant::now();
        let (ranked, specs) = self.score_pool(&pool);
        telemetry.stage_timings_ms.insert(
            "scoring".to_string(),
            scoring_started.elapsed().as_millis() as u64,
        );

        // 7-8. Ambiguity detection and conditional LLM tie-break.
        let mut selected = if missing_target_info && platform_filter.is_none() {
            self.platform_alternatives(&ranked, &specs)
        } else {
            self.pick_winner(user_text, &pool, &ranked, &mut telemetry, &mut degraded)
                .await
        };

        if enumeration {
            self.prepend_enumerator(&pool, &ranked, &mut selected);
        }

        // 9. Additional-inputs calculation.
        let additional_inputs_needed = self.unmet_inputs(
            &selected,
            &specs,
            asset_metadata.as_ref(),
            classification,
            enumeration,
            missing_target_info,
        );

        // 10. Assembly.
        let ready_for_execution =
            !selected.is_empty() && additional_inputs_needed.is_empty();
        let next_stage = if selected.is_empty() || missing_target_info {
            NextStage::Clarification
        } else {
            NextStage::Planner
        };

        let selection = SelectionV1 {
            selected_tools: selected,
            platform_filter,
            asset_metadata,
            additional_inputs_needed,
            ready_for_execution,
            next_stage,
            missing_target_info,
            degraded: degraded.clone(),
            error_code: None,
            fallback_recommendation: None,
        };

        // 11. Telemetry is durable before the response returns.
        telemetry.selected_ids = selection.selected_ids();
        telemetry
            .stage_timings_ms
            .insert("total".to_string(), started.elapsed().as_millis() as u64);
        self.write_telemetry(&telemetry);

        let status = if degraded.is_empty() { "success" } else { "degraded" };
        self.metrics
            .record_selector_request(status, "pipeline", started.elapsed());
        selection
    }

    async fn enrich(
        &self,
        targets: &[String],
        current_asset: Option<&str>,
    ) -> (Option<AssetMetadata>, bool, bool) {
        let mut facade_down = false;
        let mut looked_up = false;

        for host in targets.iter().map(String::as_str).chain(current_asset) {
            looked_up = true;
            match self.assets.connection_profile(host).await {
                Ok(profile) if profile.found => {
                    let is_ip = host.parse::<std::net::IpAddr>().is_ok();
                    let metadata = AssetMetadata {
                        hostname: (!is_ip).then(|| host.to_string()),
                        ip: is_ip.then(|| host.to_string()),
                        os: profile.os,
                        platform: profile.platform,
                        default_service: profile.default_service,
                    };
                    return (Some(metadata), false, false);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(host, error = %e, "asset facade unavailable, proceeding without platform filter");
                    facade_down = true;
                    break;
                }
            }
        }

        let asset_not_found = looked_up && !facade_down && !targets.is_empty();
        (None, facade_down, asset_not_found)
    }

    async fn retrieve(
        &self,
        user_text: &str,
        platform: Option<Platform>,
        max_rows: usize,
        telemetry: &mut SelectorTelemetry,
    ) -> (Vec<Candidate>, usize, bool) {
        let mut index_down = false;

        let query_vec = match self.embeddings.embed_query(user_text).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, lexical retrieval only");
                None
            }
        };

        let vector_fut = async {
            match &query_vec {
                Some(v) => self.index.vector_search(v, platform, self.config.vector_top_k),
                None => Ok(Vec::new()),
            }
        };
        let lexical_fut = async {
            self.index
                .lexical_search(user_text, platform, self.config.lexical_top_k)
        };
        let (vector_hits, lexical_hits) = tokio::join!(vector_fut, lexical_fut);

        let vector_hits = vector_hits.unwrap_or_else(|e| {
            tracing::error!(error = %e, "vector search failed");
            self.metrics.inc_selector_db_error();
            index_down = true;
            Vec::new()
        });
        let lexical_hits = lexical_hits.unwrap_or_else(|e| {
            tracing::error!(error = %e, "lexical search failed");
            self.metrics.inc_selector_db_error();
            index_down = true;
            Vec::new()
        });

        // Union-dedupe by id: keep the better source rank and the stronger
        // signal, order by (rank, id).
        let max_lexical = lexical_hits
            .first()
            .map(|h| h.similarity)
            .unwrap_or(1.0)
            .max(1.0);
        let mut by_id: HashMap<String, Candidate> = HashMap::new();
        for (rank, hit) in vector_hits.into_iter().enumerate() {
            by_id.insert(
                hit.entry.id.clone(),
                Candidate {
                    entry: hit.entry,
                    signal: hit.similarity.clamp(0.0, 1.0),
                    rank,
                },
            );
        }
        for (rank, hit) in lexical_hits.into_iter().enumerate() {
            let signal = (hit.similarity / max_lexical).clamp(0.0, 1.0);
            by_id
                .entry(hit.entry.id.clone())
                .and_modify(|c| {
                    c.rank = c.rank.min(rank);
                    c.signal = c.signal.max(signal);
                })
                .or_insert(Candidate {
                    entry: hit.entry,
                    signal,
                    rank,
                });
        }
        let mut pool: Vec<Candidate> = by_id.into_values().collect();
        pool.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.entry.id.cmp(&b.entry.id)));

        // Always-include allowlist goes in front.
        let allowlist = self.index.always_include().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "allowlist load failed");
            Vec::new()
        });
        let mut front: Vec<Candidate> = allowlist
            .into_iter()
            .filter(|a| !pool.iter().any(|c| c.entry.id == a.id))
            .map(|entry| Candidate {
                entry,
                signal: 0.0,
                rank: 0,
            })
            .collect();
        front.extend(pool);
        let candidates_before_budget = front.len();

        if front.len() > max_rows {
            front.truncate(max_rows);
            telemetry.truncation_events += 1;
            self.metrics.inc_budget_truncation();
        }

        (front, candidates_before_budget, index_down)
    }

    /// Score the head of the pool, loading full specs lazily. The blended
    /// score uses the candidate's retrieval signal and preference scores.
    fn score_pool(
        &self,
        pool: &[Candidate],
    ) -> (Vec<ScoredCandidate>, HashMap<String, FullToolSpec>) {
        let mut specs: HashMap<String, FullToolSpec> = HashMap::new();
        let mut ranked: Vec<ScoredCandidate> = Vec::new();

        for candidate in pool.iter().take(self.config.scoring_pool) {
            match self.index.get_full_spec(&candidate.entry.id) {
                Ok(spec) => {
                    ranked.push(score_candidate(
                        &spec,
                        candidate.signal,
                        self.config.preference_mode,
                    ));
                    specs.insert(candidate.entry.id.clone(), spec);
                }
                Err(e) => {
                    tracing::warn!(tool = %candidate.entry.id, error = %e, "full spec load failed, skipping candidate");
                    self.metrics.inc_selector_db_error();
                }
            }
        }

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool_id.cmp(&b.tool_id))
        });
        (ranked, specs)
    }

    async fn pick_winner(
        &self,
        user_text: &str,
        pool: &[Candidate],
        ranked: &[ScoredCandidate],
        telemetry: &mut SelectorTelemetry,
        degraded: &mut Vec<String>,
    ) -> Vec<ToolChoice> {
        let Some(top) = ranked.first() else {
            return Vec::new();
        };

        let ambiguous = ranked
            .get(1)
            .is_some_and(|second| is_ambiguous(top.score, second.score, self.config.ambiguity_margin));

        if ambiguous {
            telemetry.tie_break_attempted = true;
            match self.tie_break(user_text, pool).await {
                Ok(choices) if !choices.is_empty() => return choices,
                Ok(_) => {
                    tracing::debug!("tie-break returned no valid ids, keeping deterministic winner");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tie-break failed, keeping deterministic winner");
                    if !degraded.contains(&"llm_unavailable".to_string()) {
                        degraded.push("llm_unavailable".to_string());
                    }
                }
            }
        }

        vec![ToolChoice {
            tool_id: top.tool_id.clone(),
            rationale: "highest deterministic score".to_string(),
            score: top.score,
        }]
    }

    /// LLM tie-break over the minimal index rows with a strict JSON schema.
    async fn tie_break(&self, user_text: &str, pool: &[Candidate]) -> Result<Vec<ToolChoice>> {
        let rows: Vec<MinimalRow> = pool.iter().map(|c| c.entry.minimal_row()).collect();
        let rows_json = serde_json::to_string(&rows)?;

        let request = CompletionRequest::new(format!(
            "Request: {user_text}\n\nTools:\n{rows_json}"
        ))
        .with_system(
            "Choose the best tool(s) for the request from the provided catalog rows. \
             Respond with only JSON: {\"intent\":\"...\",\"entities\":[],\
             \"select\":[{\"id\":\"...\",\"why\":\"...\"}],\"confidence\":0.0,\
             \"risk_level\":\"low|medium|high\",\"reasoning\":\"...\"}",
        )
        .with_max_tokens(512)
        .with_temperature(0.0);

        let response = tokio::time::timeout(self.config.tie_break_timeout, self.llm.complete(request))
            .await
            .map_err(|_| Error::timeout(self.config.tie_break_timeout.as_millis() as u64))??;

        let json = extract_json(&response.content)
            .ok_or_else(|| Error::llm_api(self.llm.provider(), "tie-break returned no JSON"))?;
        let select = json
            .get("select")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::llm_api(self.llm.provider(), "tie-break missing select array"))?;

        let mut choices = Vec::new();
        for item in select {
            let Some(id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            // Only ids from the visible pool are admissible
            if !pool.iter().any(|c| c.entry.id == id) {
                tracing::warn!(tool = id, "tie-break selected a tool outside the pool, ignoring");
                continue;
            }
            let why = item
                .get("why")
                .and_then(Value::as_str)
                .unwrap_or("LLM tie-break")
                .to_string();
            choices.push(ToolChoice {
                tool_id: id.to_string(),
                rationale: why,
                score: 0.0,
            });
        }
        Ok(choices)
    }

    /// Without a target there is no platform filter; offer the best
    /// candidate per platform so the clarification round is informed.
    fn platform_alternatives(
        &self,
        ranked: &[ScoredCandidate],
        specs: &HashMap<String, FullToolSpec>,
    ) -> Vec<ToolChoice> {
        let mut seen_platforms: Vec<Platform> = Vec::new();
        let mut choices = Vec::new();
        for candidate in ranked {
            let Some(spec) = specs.get(&candidate.tool_id) else {
                continue;
            };
            let platform = spec.entry.platform;
            if seen_platforms.contains(&platform) {
                continue;
            }
            seen_platforms.push(platform);
            choices.push(ToolChoice {
                tool_id: candidate.tool_id.clone(),
                rationale: format!("best {platform} candidate pending target"),
                score: candidate.score,
            });
            if choices.len() >= self.config.max_alternatives {
                break;
            }
        }
        choices
    }

    fn prepend_enumerator(
        &self,
        pool: &[Candidate],
        ranked: &[ScoredCandidate],
        selected: &mut Vec<ToolChoice>,
    ) {
        let Some(enumerator) = pool
            .iter()
            .find(|c| normalize_tool_name(&c.entry.id) == "asset-query")
        else {
            return;
        };
        if selected
            .iter()
            .any(|c| normalize_tool_name(&c.tool_id) == "asset-query")
        {
            return;
        }
        let score = ranked
            .iter()
            .find(|r| r.tool_id == enumerator.entry.id)
            .map(|r| r.score)
            .unwrap_or(0.0);
        selected.insert(
            0,
            ToolChoice {
                tool_id: enumerator.entry.id.clone(),
                rationale: "enumerate targets from inventory".to_string(),
                score,
            },
        );
    }

    /// Diff each selected tool's required inputs against what the context
    /// already resolves: the target host, broker-held credentials, and
    /// entity-supplied parameters.
    fn unmet_inputs(
        &self,
        selected: &[ToolChoice],
        specs: &HashMap<String, FullToolSpec>,
        asset: Option<&AssetMetadata>,
        classification: &Classification,
        enumeration: bool,
        missing_target_info: bool,
    ) -> Vec<ParameterDescriptor> {
        let mut descriptors: Vec<ParameterDescriptor> = Vec::new();
        let mut push = |d: ParameterDescriptor| {
            if !descriptors.iter().any(|existing| existing.name == d.name) {
                descriptors.push(d);
            }
        };
        let host = asset.and_then(AssetMetadata::target);

        for choice in selected {
            let spec = match specs.get(&choice.tool_id) {
                Some(spec) => spec.clone(),
                None => match self.index.get_full_spec(&choice.tool_id) {
                    Ok(spec) => spec,
                    Err(e) => {
                        tracing::warn!(tool = %choice.tool_id, error = %e, "spec unavailable for input diff");
                        continue;
                    }
                },
            };

            let purpose = spec.connection_type.credential_purpose();
            let credentials_available = host
                .map(|h| self.broker.has_credential(h, purpose).unwrap_or(false))
                .unwrap_or(false);

            for param in spec.required_inputs() {
                let name = param.name.to_lowercase();
                let is_host_param =
                    HOST_PARAM_NAMES.iter().any(|h| name == *h) || name.contains("host");
                if is_host_param && (host.is_some() || enumeration) {
                    continue;
                }
                let is_credential_param = param.secret || name == "username" || name == "password";
                if is_credential_param && credentials_available {
                    continue;
                }
                let satisfied_by_entity = match name.as_str() {
                    n if n.contains("path") || n.contains("directory") => {
                        classification.entity(EntityKind::Path).is_some()
                    }
                    n if n.contains("port") => classification.entity(EntityKind::Port).is_some(),
                    n if n.contains("service") => {
                        classification.entity(EntityKind::Service).is_some()
                    }
                    n if n.contains("tag") || n.contains("filter") => {
                        classification.entity(EntityKind::Tag).is_some()
                    }
                    _ => false,
                };
                if satisfied_by_entity {
                    continue;
                }
                push(ParameterDescriptor::from(param));
            }

            // Tools that need credentials but do not declare them as
            // parameters still surface username/password descriptors.
            if spec.requires_credentials && !credentials_available {
                push(ParameterDescriptor::new("username", "string"));
                push(ParameterDescriptor::new("password", "string").secret());
            }
        }

        if missing_target_info {
            push(ParameterDescriptor::target_asset());
        }
        descriptors
    }

    fn empty_selection(
        &self,
        index_down: bool,
        user_text: &str,
        platform_filter: Option<Platform>,
        asset_metadata: Option<AssetMetadata>,
        missing_target_info: bool,
        degraded: Vec<String>,
    ) -> SelectionV1 {
        let (error_code, fallback_recommendation, mut descriptors) = if index_down {
            ("no_candidates", None, Vec::new())
        } else {
            // Healthy store, nothing matched: offer the best lexical hit
            // without a platform filter as a fallback recommendation.
            let fallback = self
                .index
                .lexical_search(user_text, None, 1)
                .ok()
                .and_then(|hits| hits.into_iter().next())
                .map(|h| h.entry.id);
            (
                "no_tools_found",
                fallback,
                vec![ParameterDescriptor::new("no_tools_found", "string")
                    .with_hint("no catalog tool matched this request; refine the wording")],
            )
        };
        if missing_target_info {
            descriptors.push(ParameterDescriptor::target_asset());
        }

        SelectionV1 {
            selected_tools: Vec::new(),
            platform_filter,
            asset_metadata,
            additional_inputs_needed: descriptors,
            ready_for_execution: false,
            next_stage: NextStage::Clarification,
            missing_target_info,
            degraded,
            error_code: Some(error_code.to_string()),
            fallback_recommendation,
        }
    }

    fn write_telemetry(&self, telemetry: &SelectorTelemetry) {
        if let Err(e) = self.index.log_telemetry(telemetry) {
            tracing::error!(error = %e, "telemetry write failed");
            self.metrics.inc_selector_db_error();
        }
    }
}

fn wants_enumeration(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["all ", "every ", "each "]
        .iter()
        .any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::testing::win_asset;
    use crate::assets::StaticAssetFacade;
    use crate::catalog::{
        ConnectionType, CostHint, ExecutionLocation, ParameterSpec, PreferenceScores,
        ToolIndexEntry,
    };
    use crate::llm::testing::{pseudo_embedding, ScriptedLlm};
    use crate::pipeline::classify::RuleClassifier;
    use pretty_assertions::assert_eq;

    const DIM: usize = 8;

    fn seeded_index() -> Arc<SqliteToolIndex> {
        let index = SqliteToolIndex::in_memory().unwrap();

        let mut windows_ls = FullToolSpec::new(
            ToolIndexEntry::new(
                "windows_list_directory",
                "windows_list_directory",
                "List files in a directory on a Windows host over WinRM",
                Platform::Windows,
            )
            .with_tags(["files", "list", "directory"])
            .with_cost_hint(CostHint::Low)
            .with_embedding(pseudo_embedding("list files directory windows", DIM)),
        );
        windows_ls.connection_type = ConnectionType::Powershell;
        windows_ls.requires_credentials = true;
        windows_ls.preferences = PreferenceScores::new(0.8, 0.7, 0.2);
        windows_ls.parameters = vec![
            ParameterSpec::required("target_host", "string"),
            ParameterSpec::optional("path", "string"),
        ];

        let mut linux_ls = FullToolSpec::new(
            ToolIndexEntry::new(
                "linux_list_directory",
                "linux_list_directory",
                "List files in a directory on a Linux host over SSH",
                Platform::Linux,
            )
            .with_tags(["files", "list", "directory"])
            .with_embedding(pseudo_embedding("list files directory linux", DIM)),
        );
        linux_ls.connection_type = ConnectionType::Ssh;
        linux_ls.requires_credentials = true;
        linux_ls.preferences = PreferenceScores::new(0.8, 0.7, 0.2);
        linux_ls.parameters = vec![
            ParameterSpec::required("target_host", "string"),
            ParameterSpec::optional("path", "string"),
        ];

        let mut asset_query = FullToolSpec::new(
            ToolIndexEntry::new(
                "asset-query",
                "asset-query",
                "Query the asset inventory by filters",
                Platform::MultiPlatform,
            )
            .with_tags(["inventory", "assets"])
            .with_embedding(pseudo_embedding("query asset inventory", DIM)),
        );
        asset_query.execution_location = ExecutionLocation::Asset;
        asset_query.always_include = true;
        asset_query.preferences = PreferenceScores::new(0.9, 0.9, 0.1);

        let mut restart = FullToolSpec::new(
            ToolIndexEntry::new(
                "windows_restart_service",
                "windows_restart_service",
                "Restart a Windows service over WinRM",
                Platform::Windows,
            )
            .with_tags(["service", "restart"])
            .with_embedding(pseudo_embedding("restart windows service", DIM)),
        );
        restart.connection_type = ConnectionType::Powershell;
        restart.requires_credentials = true;
        restart.requires_approval = true;
        restart.parameters = vec![
            ParameterSpec::required("target_hosts", "list"),
            ParameterSpec::required("service", "string"),
        ];

        index
            .bulk_upsert(&[windows_ls, linux_ls, asset_query, restart])
            .unwrap();
        Arc::new(index)
    }

    fn selector_with(
        index: Arc<SqliteToolIndex>,
        assets: StaticAssetFacade,
        broker: SecretsBroker,
        llm: ScriptedLlm,
    ) -> Selector {
        let llm: Arc<dyn LlmClient> = Arc::new(llm);
        // A failing embedder forces the deterministic lexical-only path;
        // vector retrieval is exercised separately.
        Selector::new(
            index,
            Arc::new(EmbeddingService::new(Arc::new(ScriptedLlm::failing()))),
            Arc::new(assets),
            Arc::new(broker),
            llm,
            TokenBudget::default(),
            Arc::new(CoreMetrics::new().unwrap()),
            SelectorConfig::default(),
        )
    }

    fn classify(text: &str) -> Classification {
        RuleClassifier.classify(text)
    }

    #[tokio::test]
    async fn test_explicit_windows_target_selects_windows_tool() {
        let index = seeded_index();
        let broker = SecretsBroker::in_memory("k").unwrap();
        broker
            .upsert_credential("seed", "192.168.50.211", "winrm", "admin", "pw", None)
            .unwrap();
        let selector = selector_with(
            index.clone(),
            StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
            broker,
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files on 192.168.50.211";
        let selection = selector
            .select(&TraceId::from("tr_sel_1"), text, &classify(text), &SelectorContext::default())
            .await;

        assert_eq!(selection.platform_filter, Some(Platform::Windows));
        assert_eq!(
            selection.selected_ids(),
            vec!["windows_list_directory".to_string()]
        );
        assert!(!selection.missing_target_info);
        // Host resolved, credentials in the broker, path entity present
        assert!(selection.ready_for_execution, "unmet: {:?}", selection.additional_inputs_needed);
        assert_eq!(selection.next_stage, NextStage::Planner);
    }

    #[tokio::test]
    async fn test_missing_credentials_surface_descriptors() {
        let index = seeded_index();
        let selector = selector_with(
            index,
            StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files on 192.168.50.211";
        let selection = selector
            .select(&TraceId::from("tr_sel_2"), text, &classify(text), &SelectorContext::default())
            .await;

        assert!(!selection.ready_for_execution);
        let names: Vec<&str> = selection
            .additional_inputs_needed
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert!(names.contains(&"username"));
        assert!(names.contains(&"password"));
        let password = selection
            .additional_inputs_needed
            .iter()
            .find(|d| d.name == "password")
            .unwrap();
        assert!(password.secret);
    }

    #[tokio::test]
    async fn test_ambiguous_target_offers_platform_alternatives() {
        let index = seeded_index();
        let selector = selector_with(
            index,
            StaticAssetFacade::default(),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files in the current directory";
        let selection = selector
            .select(&TraceId::from("tr_sel_3"), text, &classify(text), &SelectorContext::default())
            .await;

        assert!(selection.missing_target_info);
        assert_eq!(selection.platform_filter, None);
        assert!(selection.selected_tools.len() >= 2, "want multi-platform alternatives");
        assert!(selection
            .additional_inputs_needed
            .iter()
            .any(|d| d.name == "target_asset"));
        assert_eq!(selection.next_stage, NextStage::Clarification);
    }

    #[tokio::test]
    async fn test_asset_not_found_degrades_without_platform_filter() {
        let index = seeded_index();
        let selector = selector_with(
            index,
            StaticAssetFacade::default(),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files on ghost-99";
        let selection = selector
            .select(&TraceId::from("tr_sel_4"), text, &classify(text), &SelectorContext::default())
            .await;

        assert_eq!(selection.platform_filter, None);
        assert!(selection.degraded.contains(&"asset_not_found".to_string()));
        assert!(!selection.missing_target_info);
        assert!(!selection.selected_tools.is_empty());
    }

    #[tokio::test]
    async fn test_current_asset_fallback() {
        let index = seeded_index();
        let selector = selector_with(
            index,
            StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files in the current directory";
        let ctx = SelectorContext {
            current_asset: Some("web-01".to_string()),
            platform: None,
        };
        let selection = selector
            .select(&TraceId::from("tr_sel_5"), text, &classify(text), &ctx)
            .await;

        assert!(!selection.missing_target_info);
        assert_eq!(selection.platform_filter, Some(Platform::Windows));
    }

    #[tokio::test]
    async fn test_enumeration_prepends_asset_query() {
        let index = seeded_index();
        let selector = selector_with(
            index,
            StaticAssetFacade::default(),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "restart the spooler service on all machines with tag=win10";
        let selection = selector
            .select(&TraceId::from("tr_sel_6"), text, &classify(text), &SelectorContext::default())
            .await;

        let ids = selection.selected_ids();
        assert_eq!(ids.first().map(String::as_str), Some("asset-query"));
        assert!(!selection.missing_target_info);
    }

    #[tokio::test]
    async fn test_selection_is_deterministic() {
        let text = "list files on 192.168.50.211";
        let run = || async {
            let selector = selector_with(
                seeded_index(),
                StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
                SecretsBroker::in_memory("k").unwrap(),
                ScriptedLlm::with_default("{}"),
            );
            selector
                .select(&TraceId::from("tr_det"), text, &classify(text), &SelectorContext::default())
                .await
        };
        let a = run().await;
        let b = run().await;
        assert_eq!(a.selected_ids(), b.selected_ids());
        assert_eq!(a.platform_filter, b.platform_filter);
        assert_eq!(a.additional_inputs_needed, b.additional_inputs_needed);
    }

    #[tokio::test]
    async fn test_telemetry_row_written_with_budget_fields() {
        let index = seeded_index();
        let selector = selector_with(
            index.clone(),
            StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "list files on 192.168.50.211";
        let selection = selector
            .select(&TraceId::from("tr_tel_1"), text, &classify(text), &SelectorContext::default())
            .await;

        // rows_sent respects the budget cap and the executed-id hook works
        let budget = TokenBudget::default();
        index
            .record_executed("tr_tel_1", &selection.selected_ids())
            .unwrap();
        let alerts = index.recent_alerts(10).unwrap();
        assert!(alerts.is_empty(), "healthy run must not alert: {alerts:?}");
        assert!(budget.max_rows().max_rows >= 10);
    }

    #[tokio::test]
    async fn test_tight_budget_truncates_pool_to_clamped_floor() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let tools: Vec<FullToolSpec> = (0..15)
            .map(|i| {
                FullToolSpec::new(
                    ToolIndexEntry::new(
                        format!("linux_tool_{i:02}"),
                        &format!("linux_tool_{i:02}"),
                        "List files on a Linux host",
                        Platform::Linux,
                    )
                    .with_tags(["files", "list"])
                    .with_embedding(pseudo_embedding(&format!("tool {i}"), DIM)),
                )
            })
            .collect();
        index.bulk_upsert(&tools).unwrap();
        let index = Arc::new(index);

        // A 512-token window clamps the row cap to the floor of 10
        let budget = TokenBudget {
            context_window: 512,
            ..TokenBudget::default()
        };
        assert_eq!(budget.max_rows().max_rows, 10);
        assert!(budget.max_rows().clamped);

        let selector = Selector::new(
            Arc::clone(&index),
            Arc::new(EmbeddingService::new(Arc::new(ScriptedLlm::failing()))),
            Arc::new(StaticAssetFacade::default()),
            Arc::new(SecretsBroker::in_memory("k").unwrap()),
            Arc::new(ScriptedLlm::with_default("{}")),
            budget,
            Arc::new(CoreMetrics::new().unwrap()),
            SelectorConfig::default(),
        );

        let text = "list files on app-01";
        let selection = selector
            .select(&TraceId::from("tr_budget"), text, &classify(text), &SelectorContext::default())
            .await;
        assert!(!selection.selected_tools.is_empty());

        // 15 lexical candidates were truncated to the clamped cap and the
        // event is visible through the telemetry alert view.
        let alerts = index.recent_alerts(10).unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.kind == crate::catalog::AlertKind::BudgetTruncation));
    }

    #[tokio::test]
    async fn test_empty_catalog_yields_no_tools_found() {
        let selector = selector_with(
            Arc::new(SqliteToolIndex::in_memory().unwrap()),
            StaticAssetFacade::default(),
            SecretsBroker::in_memory("k").unwrap(),
            ScriptedLlm::with_default("{}"),
        );

        let text = "defragment the flux capacitor";
        let selection = selector
            .select(&TraceId::from("tr_sel_7"), text, &classify(text), &SelectorContext::default())
            .await;

        assert!(selection.selected_tools.is_empty());
        assert_eq!(selection.error_code.as_deref(), Some("no_tools_found"));
        assert!(!selection.ready_for_execution);
        assert_eq!(selection.next_stage, NextStage::Clarification);
    }

    #[tokio::test]
    async fn test_vector_retrieval_ranks_semantic_match() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let text = "check memory pressure on app-01";
        let probe = FullToolSpec::new(
            ToolIndexEntry::new(
                "perf-probe",
                "perf-probe",
                "Inspect runtime resource consumption",
                Platform::Linux,
            )
            .with_embedding(pseudo_embedding(text, DIM)),
        );
        let unrelated = FullToolSpec::new(
            ToolIndexEntry::new(
                "snapshot-rotate",
                "snapshot-rotate",
                "Rotate archival snapshots",
                Platform::Linux,
            )
            .with_embedding(pseudo_embedding("rotate archival snapshots", DIM)),
        );
        index.bulk_upsert(&[probe, unrelated]).unwrap();

        let selector = Selector::new(
            Arc::new(index),
            Arc::new(EmbeddingService::new(Arc::new(
                ScriptedLlm::with_default("").with_dimension(DIM),
            ))),
            Arc::new(StaticAssetFacade::default()),
            Arc::new(SecretsBroker::in_memory("k").unwrap()),
            Arc::new(ScriptedLlm::with_default("{}")),
            TokenBudget::default(),
            Arc::new(CoreMetrics::new().unwrap()),
            SelectorConfig::default(),
        );

        let selection = selector
            .select(&TraceId::from("tr_vec"), text, &classify(text), &SelectorContext::default())
            .await;
        assert_eq!(
            selection.selected_ids().first().map(String::as_str),
            Some("perf-probe")
        );
    }

    #[tokio::test]
    async fn test_llm_outage_still_selects_deterministically() {
        let index = seeded_index();
        let broker = SecretsBroker::in_memory("k").unwrap();
        broker
            .upsert_credential("seed", "192.168.50.211", "winrm", "admin", "pw", None)
            .unwrap();
        let selector = selector_with(
            index,
            StaticAssetFacade::new(vec![win_asset("web-01", "192.168.50.211")]),
            broker,
            ScriptedLlm::failing(),
        );

        // Embedding service inside selector_with still works; only the
        // tie-break client fails, so selection stays deterministic.
        let text = "list files on 192.168.50.211";
        let selection = selector
            .select(&TraceId::from("tr_sel_8"), text, &classify(text), &SelectorContext::default())
            .await;
        assert_eq!(
            selection.selected_ids(),
            vec!["windows_list_directory".to_string()]
        );
    }
}
