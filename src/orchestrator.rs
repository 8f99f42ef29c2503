//! The staged request-to-execution orchestrator.
//!
//! Owns the injected services and drives a request through the pipeline:
//! 1. CLASSIFY: typed intent, entities, confidence, risk
//! 2. SELECT: asset enrichment, retrieval, scoring, tie-break
//! 3. PLAN: step graph with safety gates
//! 4. RESPOND: routed, streamable user-facing response
//! 5. EXECUTE: dispatch over the collaborator fleet (async or on approval)
//!
//! Every stage runs under the smaller of its own timeout and the remaining
//! per-request deadline, emits one structured log event, and records its
//! duration. With `FEATURE_BYPASS_LLM` the echo tool answers without
//! touching the LLM at all.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::assets::AssetFacade;
use crate::catalog::SqliteToolIndex;
use crate::config::CoreConfig;
use crate::embedding::EmbeddingService;
use crate::error::{Error, Result};
use crate::llm::{LlmClient, TokenBudget};
use crate::metrics::CoreMetrics;
use crate::pipeline::classify::{Classifier, RuleClassifier};
use crate::pipeline::execute::{CollaboratorClient, Dispatcher, DispatcherConfig};
use crate::pipeline::plan::Planner;
use crate::pipeline::respond::Responder;
use crate::pipeline::select::{Selector, SelectorConfig, SelectorContext};
use crate::pipeline::types::{
    Classification, ExecutionPlan, ExecutionResult, NextStage, ResponseType, SelectionV1,
};
use crate::secrets::SecretsBroker;
use crate::trace::TraceId;

/// Maximum accepted request length in characters.
pub const MAX_INPUT_LEN: usize = 4_000;

/// Everything the orchestrator is wired with at construction. All external
/// collaborators come in as injected values; nothing lives as process-wide
/// state.
pub struct PipelineServices {
    pub llm: Arc<dyn LlmClient>,
    /// Tie-break model for the selector; defaults to `llm`
    pub tie_break_llm: Option<Arc<dyn LlmClient>>,
    pub index: Arc<SqliteToolIndex>,
    pub embeddings: Arc<EmbeddingService>,
    pub assets: Arc<dyn AssetFacade>,
    pub broker: Arc<SecretsBroker>,
    pub collaborators: Arc<dyn CollaboratorClient>,
    pub metrics: Arc<CoreMetrics>,
}

/// A request entering the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub input: String,
    /// Explicit tool hint (the echo tool under the bypass flag)
    pub tool: Option<String>,
    pub trace: TraceId,
    pub context: SelectorContext,
}

impl PipelineRequest {
    pub fn new(input: impl Into<String>, trace: TraceId) -> Self {
        Self {
            input: input.into(),
            tool: None,
            trace,
            context: SelectorContext::default(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }
}

/// What one pipeline pass produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub trace_id: TraceId,
    /// Primary tool label for metrics and the ingress response
    pub tool: String,
    pub classification: Classification,
    pub selection: Option<SelectionV1>,
    pub plan: Option<ExecutionPlan>,
    pub response_type: ResponseType,
    pub response_text: String,
    pub duration_ms: u64,
}

/// The staged orchestrator.
pub struct Orchestrator {
    config: CoreConfig,
    classifier: Classifier,
    selector: Selector,
    planner: Planner,
    responder: Responder,
    dispatcher: Dispatcher,
    index: Arc<SqliteToolIndex>,
    metrics: Arc<CoreMetrics>,
}

impl Orchestrator {
    pub fn new(config: CoreConfig, services: PipelineServices) -> Self {
        let timeouts = config.timeouts;
        let budget = TokenBudget::from_config(&config);

        let classifier = Classifier::new(Arc::clone(&services.llm), timeouts.llm_call());
        let tie_break = services
            .tie_break_llm
            .unwrap_or_else(|| Arc::clone(&services.llm));
        let selector = Selector::new(
            Arc::clone(&services.index),
            Arc::clone(&services.embeddings),
            Arc::clone(&services.assets),
            Arc::clone(&services.broker),
            tie_break,
            budget,
            Arc::clone(&services.metrics),
            SelectorConfig::default(),
        );
        let planner = Planner::new(
            Arc::clone(&services.llm),
            Arc::clone(&services.index),
            timeouts,
        );
        let responder = Responder::new(Arc::clone(&services.llm), timeouts.respond());
        let dispatcher = Dispatcher::new(
            services.collaborators,
            Arc::clone(&services.index),
            services.assets,
            services.broker,
            Arc::clone(&services.metrics),
            timeouts,
            DispatcherConfig::default(),
        );

        Self {
            config,
            classifier,
            selector,
            planner,
            responder,
            dispatcher,
            index: services.index,
            metrics: services.metrics,
        }
    }

    /// Run one request through stages A → AB → C → D.
    ///
    /// # Errors
    /// [`Error::Validation`] on malformed input. Downstream stages degrade
    /// instead of failing; planner errors surface in the response text.
    pub async fn handle(&self, request: PipelineRequest) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let trace = request.trace.clone();

        let input = request.input.trim();
        if input.is_empty() {
            return Err(Error::validation("input must not be empty"));
        }
        if input.chars().count() > MAX_INPUT_LEN {
            return Err(Error::validation(format!(
                "input exceeds {MAX_INPUT_LEN} characters"
            )));
        }

        if self.config.bypass_llm {
            return Ok(self.echo(input, &request, started));
        }

        let deadline = started + self.config.request_deadline();

        // Stage A
        let stage_started = Instant::now();
        let classification = match tokio::time::timeout(
            self.stage_budget(deadline, self.config.timeouts.classify()),
            self.classifier.classify(input),
        )
        .await
        {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!(trace_id = %trace, "classification timed out, using rules");
                RuleClassifier.classify(input)
            }
        };
        self.metrics.record_stage("classify", stage_started.elapsed());
        tracing::info!(
            event = "stage_complete",
            trace_id = %trace,
            stage = "classify",
            status = "ok",
            intent = %classification.intent.action,
            entities = classification.entities.len(),
            "classification complete"
        );

        // Stage AB
        let stage_started = Instant::now();
        let selection = match tokio::time::timeout(
            self.stage_budget(deadline, self.config.timeouts.select()),
            self.selector
                .select(&trace, input, &classification, &request.context),
        )
        .await
        {
            Ok(selection) => selection,
            Err(_) => {
                tracing::warn!(trace_id = %trace, "selection timed out");
                timed_out_selection()
            }
        };
        self.metrics.record_stage("select", stage_started.elapsed());
        tracing::info!(
            event = "stage_complete",
            trace_id = %trace,
            stage = "select",
            status = if selection.degraded.is_empty() { "ok" } else { "degraded" },
            selected = selection.selected_tools.len(),
            ready = selection.ready_for_execution,
            "selection complete"
        );

        // Stage C
        let stage_started = Instant::now();
        let plan = if selection.next_stage == NextStage::Planner {
            match tokio::time::timeout(
                self.stage_budget(deadline, self.config.timeouts.plan()),
                self.planner.plan(input, &classification, &selection),
            )
            .await
            {
                Ok(Ok(plan)) => Some(plan),
                Ok(Err(e)) => {
                    tracing::warn!(trace_id = %trace, code = e.code(), error = %e, "planning failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(trace_id = %trace, "planning timed out");
                    None
                }
            }
        } else {
            None
        };
        self.metrics.record_stage("plan", stage_started.elapsed());
        tracing::info!(
            event = "stage_complete",
            trace_id = %trace,
            stage = "plan",
            status = if plan.is_some() { "ok" } else { "skipped" },
            steps = plan.as_ref().map(|p| p.steps.len()).unwrap_or(0),
            "planning complete"
        );

        // Stage D
        let stage_started = Instant::now();
        let (response_type, stream) = self
            .responder
            .respond(input, &classification, Some(&selection), plan.as_ref(), None)
            .await;
        let response_text = stream.collect_text().await;
        self.metrics.record_stage("respond", stage_started.elapsed());
        tracing::info!(
            event = "stage_complete",
            trace_id = %trace,
            stage = "respond",
            status = "ok",
            response_type = ?response_type,
            "response complete"
        );

        let tool = selection
            .selected_tools
            .first()
            .map(|t| t.tool_id.clone())
            .unwrap_or_else(|| "pipeline".to_string());
        let duration = started.elapsed();
        self.metrics.record_ai_request("success", &tool, duration);

        Ok(PipelineOutcome {
            trace_id: trace,
            tool,
            classification,
            selection: Some(selection),
            plan,
            response_type,
            response_text,
            duration_ms: duration.as_millis() as u64,
        })
    }

    /// Drive Stage E for a produced plan. Records executed tools back onto
    /// the selection's telemetry row so recall becomes observable.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        selection: &SelectionV1,
        trace: &TraceId,
        approved: bool,
    ) -> ExecutionResult {
        let stage_started = Instant::now();

        let mut seed: Vec<(String, Value)> = Vec::new();
        if let Some(target) = selection.asset_metadata.as_ref().and_then(|m| m.target()) {
            seed.push(("target_host".to_string(), json!(target)));
        }

        let result = self.dispatcher.execute(plan, &seed, trace, approved).await;
        self.metrics.record_stage("execute", stage_started.elapsed());

        if !result.step_results.is_empty() {
            if let Err(e) = self
                .index
                .record_executed(trace.as_str(), &result.executed_tool_ids())
            {
                tracing::debug!(trace_id = %trace, error = %e, "recall bookkeeping skipped");
            }
        }
        tracing::info!(
            event = "stage_complete",
            trace_id = %trace,
            stage = "execute",
            status = ?result.state,
            steps = result.step_results.len(),
            "execution complete"
        );
        result
    }

    /// Execute a single tool by name (the tools ingress).
    pub async fn execute_tool(
        &self,
        tool: &str,
        params: Value,
        trace: &TraceId,
    ) -> Result<Value> {
        let started = Instant::now();
        let outcome = self.dispatcher.execute_tool(tool, params, trace).await;
        match &outcome {
            Ok(_) => self
                .metrics
                .record_ai_request("success", tool, started.elapsed()),
            Err(e) => self.metrics.record_ai_error(e.code(), tool),
        }
        outcome
    }

    /// The deterministic echo path used for walking-skeleton validation and
    /// canary metric seeding. Touches no LLM.
    fn echo(&self, input: &str, request: &PipelineRequest, started: Instant) -> PipelineOutcome {
        let tool = request.tool.clone().unwrap_or_else(|| "echo".to_string());
        let output = if input.eq_ignore_ascii_case("ping") {
            "pong".to_string()
        } else {
            input.to_string()
        };
        let duration = started.elapsed();
        self.metrics.record_ai_request("success", &tool, duration);
        tracing::info!(
            event = "bypass_echo",
            trace_id = %request.trace,
            tool = %tool,
            "bypass path served the request"
        );

        PipelineOutcome {
            trace_id: request.trace.clone(),
            tool,
            classification: RuleClassifier.classify(input),
            selection: None,
            plan: None,
            response_type: ResponseType::Information,
            response_text: output,
            duration_ms: duration.as_millis() as u64,
        }
    }

    fn stage_budget(&self, deadline: Instant, stage: Duration) -> Duration {
        let remaining = deadline.saturating_duration_since(Instant::now());
        stage.min(remaining)
    }

    /// The metrics registry, for the ingress exposition endpoint.
    pub fn metrics(&self) -> &CoreMetrics {
        self.metrics.as_ref()
    }

    /// Recent selector telemetry alerts.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<crate::catalog::TelemetryAlert>> {
        self.index.recent_alerts(limit)
    }
}

fn timed_out_selection() -> SelectionV1 {
    SelectionV1 {
        selected_tools: Vec::new(),
        platform_filter: None,
        asset_metadata: None,
        additional_inputs_needed: Vec::new(),
        ready_for_execution: false,
        next_stage: NextStage::Clarification,
        missing_target_info: false,
        degraded: vec!["selection_timeout".to_string()],
        error_code: Some("timeout".to_string()),
        fallback_recommendation: None,
    }
}
