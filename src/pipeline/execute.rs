//! Stage E: the asset-intelligent plan executor.
//!
//! Drives a validated plan over the collaborator services: per-step service
//! routing, template resolution, loop expansion over collection variables,
//! server-side credential injection, and structured result collection. Step
//! results are appended in step-index order; loop iteration results in
//! iteration order. Credentials resolved here are dispatched and never
//! cross back to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use uuid::Uuid;

use crate::assets::AssetFacade;
use crate::catalog::{ExecutionLocation, FullToolSpec, SqliteToolIndex};
use crate::config::{CoreConfig, StageTimeouts};
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::pipeline::context::{normalize_tool_name, ExecutionContext};
use crate::pipeline::plan::execution_order;
use crate::pipeline::template::resolve_value;
use crate::pipeline::types::{
    ExecutionPlan, ExecutionResult, ParameterDescriptor, PlanState, PlanStep, StepResult,
    StepStatus,
};
use crate::redact::SecretRedactor;
use crate::secrets::SecretsBroker;
use crate::trace::{TraceId, TRACE_HEADER};

/// Uniform request envelope shared by every collaborator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeRequest {
    pub execution_id: String,
    pub plan: EnvelopePlan,
    pub tenant_id: String,
    pub actor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopePlan {
    pub steps: Vec<EnvelopeStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeStep {
    pub tool: String,
    pub inputs: Value,
}

/// Uniform response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeResponse {
    pub execution_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub step_results: Vec<EnvelopeStepResult>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeStepResult {
    pub step: usize,
    pub tool: String,
    pub status: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub loop_iteration: Option<usize>,
    #[serde(default)]
    pub loop_total: Option<usize>,
}

/// Transport to the collaborator fleet. This trait is the extension seam by
/// which new services join.
#[async_trait]
pub trait CollaboratorClient: Send + Sync {
    async fn execute_plan(
        &self,
        service: ExecutionLocation,
        envelope: &EnvelopeRequest,
        trace: &TraceId,
    ) -> Result<EnvelopeResponse>;
}

/// HTTP transport against the configured collaborator endpoints.
pub struct HttpCollaborators {
    urls: HashMap<ExecutionLocation, String>,
    http: reqwest::Client,
}

impl HttpCollaborators {
    pub fn from_config(config: &CoreConfig) -> Self {
        let urls = HashMap::from([
            (
                ExecutionLocation::Automation,
                config.automation_service_url.clone(),
            ),
            (
                ExecutionLocation::Communication,
                config.communication_service_url.clone(),
            ),
            (ExecutionLocation::Asset, config.asset_service_url.clone()),
            (
                ExecutionLocation::Network,
                config.network_service_url.clone(),
            ),
        ]);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.exec_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { urls, http }
    }
}

#[async_trait]
impl CollaboratorClient for HttpCollaborators {
    async fn execute_plan(
        &self,
        service: ExecutionLocation,
        envelope: &EnvelopeRequest,
        trace: &TraceId,
    ) -> Result<EnvelopeResponse> {
        let base = self
            .urls
            .get(&service)
            .or_else(|| self.urls.get(&ExecutionLocation::Automation))
            .ok_or_else(|| Error::Config("no collaborator endpoints configured".to_string()))?;
        let url = format!("{}/execute-plan", base.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .header(TRACE_HEADER, trace.as_str())
            .json(envelope)
            .send()
            .await
            .map_err(|e| Error::upstream(service.to_string(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::upstream(
                service.to_string(),
                format!("collaborator returned {}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::upstream(service.to_string(), format!("bad envelope: {e}")))
    }
}

/// Dispatcher tuning and identity.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tenant_id: String,
    pub actor_id: String,
    /// Loop iteration width; 1 means strictly sequential iterations
    pub loop_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            actor_id: "pipeline".to_string(),
            loop_concurrency: 1,
        }
    }
}

// A step that detected a loop over a collection variable.
struct LoopExpansion {
    /// Plural parameter to rewrite per child
    param: String,
    /// Singular replacement name
    singular: String,
    /// Materialized collection items
    items: Vec<Value>,
}

/// Stage E dispatcher.
pub struct Dispatcher {
    collaborators: Arc<dyn CollaboratorClient>,
    index: Arc<SqliteToolIndex>,
    assets: Arc<dyn AssetFacade>,
    broker: Arc<SecretsBroker>,
    metrics: Arc<CoreMetrics>,
    redactor: SecretRedactor,
    timeouts: StageTimeouts,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collaborators: Arc<dyn CollaboratorClient>,
        index: Arc<SqliteToolIndex>,
        assets: Arc<dyn AssetFacade>,
        broker: Arc<SecretsBroker>,
        metrics: Arc<CoreMetrics>,
        timeouts: StageTimeouts,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            collaborators,
            index,
            assets,
            broker,
            metrics,
            redactor: SecretRedactor::new(),
            timeouts,
            config,
        }
    }

    /// Execute a plan. Plans whose approval gate has not been satisfied
    /// pause before any side effect and are resumable by calling again with
    /// `approved = true`.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        seed_variables: &[(String, Value)],
        trace: &TraceId,
        approved: bool,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();

        if plan.approval_required && !approved {
            return ExecutionResult {
                execution_id,
                state: PlanState::PausedForApproval,
                step_results: Vec::new(),
                completed_at: None,
                error_message: None,
            };
        }

        let order = match execution_order(&plan.steps) {
            Ok(order) => order,
            Err(e) => {
                return ExecutionResult {
                    execution_id,
                    state: PlanState::Failed,
                    step_results: Vec::new(),
                    completed_at: Some(Utc::now()),
                    error_message: Some(e.to_string()),
                };
            }
        };

        let mut ctx = ExecutionContext::new(execution_id.clone());
        for (name, value) in seed_variables {
            ctx.set(name.clone(), value.clone());
        }

        let mut step_results: Vec<StepResult> = Vec::new();
        let mut state = PlanState::Running;
        let mut error_message = None;

        for index in order {
            let step = &plan.steps[index];
            let results = self.run_step(index, step, &mut ctx, trace).await;

            let step_failed = results.iter().all(|r| r.status == StepStatus::Failed)
                && results.iter().any(|r| r.status == StepStatus::Failed);
            if step_failed && !step.continue_on_failure {
                error_message = results
                    .iter()
                    .find_map(|r| r.error.clone())
                    .map(|e| self.redactor.redact(&e));
                step_results.extend(results);
                state = PlanState::Failed;
                break;
            }
            step_results.extend(results);
        }

        // Results land in step-index order regardless of execution order.
        step_results.sort_by_key(|r| (r.step, r.loop_iteration.unwrap_or(0)));

        if state != PlanState::Failed {
            state = PlanState::Completed;
        }
        ExecutionResult {
            execution_id,
            state,
            step_results,
            completed_at: Some(Utc::now()),
            error_message,
        }
    }

    /// Execute a single tool directly, outside a plan. Required parameters
    /// are validated up front so callers get structured `missing_params` /
    /// `missing_credentials` errors with descriptors instead of a failed
    /// plan.
    pub async fn execute_tool(
        &self,
        tool_id: &str,
        params: Value,
        trace: &TraceId,
    ) -> Result<Value> {
        let spec = self.load_spec(tool_id)?;

        let provided = params.as_object().cloned().unwrap_or_default();
        let mut missing: Vec<ParameterDescriptor> = Vec::new();
        for param in spec.required_inputs() {
            if param.secret || param.name == "username" || param.name == "password" {
                continue; // the credential chain owns these
            }
            match provided.get(&param.name) {
                None => missing.push(ParameterDescriptor::from(param)),
                Some(value) => {
                    if let Some(pattern) = &param.validation {
                        let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                        let ok = regex::Regex::new(pattern)
                            .map(|re| re.is_match(&text))
                            .unwrap_or(true);
                        if !ok {
                            return Err(Error::validation(format!(
                                "parameter {} does not match {}",
                                param.name, pattern
                            )));
                        }
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::missing_params(missing));
        }

        let step = PlanStep {
            tool_id: spec.entry.id.clone(),
            inputs: params,
            depends_on: Vec::new(),
            approval_required: spec.requires_approval,
            retry_policy: spec.retry_policy,
            timeout_ms: self.timeouts.clamp_step_ms(spec.timeout_ms),
            continue_on_failure: false,
        };
        let ctx = ExecutionContext::new(Uuid::new_v4().to_string());
        let resolved = resolve_value(&step.inputs, &ctx);
        self.dispatch_once(0, &step, &spec, resolved, &ctx, trace)
            .await
    }

    /// Run one plan step, expanding loops into per-item children.
    async fn run_step(
        &self,
        index: usize,
        step: &PlanStep,
        ctx: &mut ExecutionContext,
        trace: &TraceId,
    ) -> Vec<StepResult> {
        let spec = match self.load_spec(&step.tool_id) {
            Ok(spec) => spec,
            Err(e) => return vec![self.failed_result(index, &step.tool_id, &e, None, None)],
        };

        match detect_loop(&step.inputs, ctx) {
            Some(expansion) => {
                let total = expansion.items.len();
                let mut results = Vec::with_capacity(total);
                // Sequential by default; a wider cap would still append in
                // iteration order.
                for (i, item) in expansion.items.iter().enumerate() {
                    let iteration = i + 1;
                    let child_inputs = resolve_value(
                        &expand_child_inputs(&step.inputs, &expansion, item, iteration, total),
                        ctx,
                    );
                    let result = self
                        .dispatch_once(index, step, &spec, child_inputs, ctx, trace)
                        .await;
                    let result = match result {
                        Ok(output) => StepResult {
                            step: index,
                            tool: step.tool_id.clone(),
                            status: StepStatus::Success,
                            output: Some(output),
                            error: None,
                            loop_iteration: Some(iteration),
                            loop_total: Some(total),
                        },
                        // Individual iteration failure does not abort the loop
                        Err(e) => self.failed_result(
                            index,
                            &step.tool_id,
                            &e,
                            Some(iteration),
                            Some(total),
                        ),
                    };
                    results.push(result);
                }

                let outputs: Vec<Value> = results
                    .iter()
                    .filter_map(|r| r.output.clone())
                    .collect();
                ctx.record_step_result(index, &step.tool_id, &json!({ "iterations": outputs }));
                results
            }
            None => {
                let resolved = resolve_value(&step.inputs, ctx);
                match self
                    .dispatch_once(index, step, &spec, resolved, ctx, trace)
                    .await
                {
                    Ok(output) => {
                        ctx.record_step_result(index, &step.tool_id, &output);
                        vec![StepResult {
                            step: index,
                            tool: step.tool_id.clone(),
                            status: StepStatus::Success,
                            output: Some(output),
                            error: None,
                            loop_iteration: None,
                            loop_total: None,
                        }]
                    }
                    Err(e) => vec![self.failed_result(index, &step.tool_id, &e, None, None)],
                }
            }
        }
    }

    /// Resolve credentials, build the envelope, and dispatch with
    /// exponential backoff up to the step's retry policy.
    async fn dispatch_once(
        &self,
        index: usize,
        step: &PlanStep,
        spec: &FullToolSpec,
        inputs: Value,
        ctx: &ExecutionContext,
        trace: &TraceId,
    ) -> Result<Value> {
        let mut inputs = match inputs {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        self.resolve_credentials(spec, &mut inputs).await?;

        let envelope = EnvelopeRequest {
            execution_id: ctx.execution_id.clone(),
            plan: EnvelopePlan {
                steps: vec![EnvelopeStep {
                    tool: step.tool_id.clone(),
                    inputs: Value::Object(inputs),
                }],
            },
            tenant_id: self.config.tenant_id.clone(),
            actor_id: self.config.actor_id.clone(),
        };

        let service = spec.execution_location;
        let timeout = Duration::from_millis(step.timeout_ms);
        let started = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(
                timeout,
                self.collaborators.execute_plan(service, &envelope, trace),
            )
            .await
            .map_err(|_| Error::timeout(step.timeout_ms))
            .and_then(|r| r);

            match outcome {
                Ok(response) => {
                    let success = matches!(response.status.as_str(), "success" | "completed");
                    self.metrics.record_ai_request(
                        if success { "success" } else { "error" },
                        &step.tool_id,
                        started.elapsed(),
                    );
                    if !success {
                        let message = response
                            .error_message
                            .unwrap_or_else(|| format!("collaborator status {}", response.status));
                        return Err(Error::upstream(service.to_string(), message));
                    }
                    let output = response
                        .step_results
                        .into_iter()
                        .next()
                        .and_then(|r| r.output)
                        .or(response.result)
                        .unwrap_or(Value::Null);
                    tracing::info!(
                        event = "step_dispatched",
                        trace_id = %trace,
                        step = index,
                        tool = %step.tool_id,
                        service = %service,
                        "step dispatched"
                    );
                    return Ok(output);
                }
                Err(e) if e.is_transient() && attempt < step.retry_policy.max_retries => {
                    let backoff =
                        Duration::from_millis(step.retry_policy.backoff_ms * 2u64.pow(attempt));
                    tracing::warn!(
                        step = index,
                        tool = %step.tool_id,
                        attempt,
                        error = %e,
                        "transient dispatch failure, backing off"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_ai_error(e.code(), &step.tool_id);
                    return Err(e);
                }
            }
        }
    }

    /// Credential fallback chain: explicit asset reference, auto-resolution
    /// by target host, then explicit inputs. Resolved secrets are injected
    /// into the dispatched step only.
    async fn resolve_credentials(
        &self,
        spec: &FullToolSpec,
        inputs: &mut Map<String, Value>,
    ) -> Result<()> {
        let use_asset = inputs
            .get("use_asset_credentials")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !spec.requires_credentials && !use_asset {
            return Ok(());
        }

        // a. Explicit asset reference with the use_asset_credentials flag.
        if use_asset {
            let asset_ref = inputs
                .get("asset_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(host) = asset_ref {
                if self.inject_for_host(spec, inputs, &host).await? {
                    return Ok(());
                }
            }
        }

        // b. Auto-resolve by target host through the inventory profile.
        let target = ["target_host", "host", "hostname"]
            .iter()
            .find_map(|k| inputs.get(*k).and_then(Value::as_str))
            .map(str::to_string);
        if let Some(host) = target {
            if self.inject_for_host(spec, inputs, &host).await? {
                return Ok(());
            }
        }

        // c. Explicit username/password in the step inputs.
        if inputs.contains_key("username") && inputs.contains_key("password") {
            return Ok(());
        }

        Err(Error::missing_credentials(vec![
            ParameterDescriptor::new("username", "string"),
            ParameterDescriptor::new("password", "string").secret(),
        ]))
    }

    /// Inject broker credentials for a host; purpose comes from the asset's
    /// default service, falling back to the tool's transport.
    async fn inject_for_host(
        &self,
        spec: &FullToolSpec,
        inputs: &mut Map<String, Value>,
        host: &str,
    ) -> Result<bool> {
        let purpose = match self.assets.connection_profile(host).await {
            Ok(profile) if profile.found => profile
                .default_service
                .map(|s| s.service)
                .unwrap_or_else(|| spec.connection_type.credential_purpose().to_string()),
            Ok(_) => spec.connection_type.credential_purpose().to_string(),
            Err(e) => {
                tracing::warn!(host, error = %e, "asset facade unavailable during credential resolution");
                spec.connection_type.credential_purpose().to_string()
            }
        };

        match self.broker.lookup_credential(&self.config.actor_id, host, &purpose) {
            Ok(credential) => {
                inputs.insert("username".to_string(), json!(credential.username));
                inputs.insert("password".to_string(), json!(credential.password));
                if let Some(domain) = credential.domain {
                    inputs.insert("domain".to_string(), json!(domain));
                }
                Ok(true)
            }
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn load_spec(&self, tool_id: &str) -> Result<FullToolSpec> {
        self.index.get_full_spec(tool_id).or_else(|_| {
            // Filename variants normalize to the canonical spelling
            self.index.get_full_spec(&normalize_tool_name(tool_id))
        })
    }

    fn failed_result(
        &self,
        index: usize,
        tool_id: &str,
        error: &Error,
        loop_iteration: Option<usize>,
        loop_total: Option<usize>,
    ) -> StepResult {
        StepResult {
            step: index,
            tool: tool_id.to_string(),
            status: StepStatus::Failed,
            output: None,
            error: Some(self.redactor.redact(&format!("{}: {error}", error.code()))),
            loop_iteration,
            loop_total,
        }
    }
}

/// Plural target parameter names that trigger loop expansion.
fn is_plural_target_param(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "hosts"
        || lower == "targets"
        || (lower.ends_with('s') && (lower.contains("host") || lower.contains("target")))
}

/// Singular rewrite of a plural parameter name (`target_hosts → target_host`).
fn singularize(name: &str) -> String {
    name.strip_suffix('s').unwrap_or(name).to_string()
}

/// A step loops iff a plural target parameter carries a template referencing
/// a variable that currently holds a non-empty collection.
fn detect_loop(inputs: &Value, ctx: &ExecutionContext) -> Option<LoopExpansion> {
    let object = inputs.as_object()?;
    for (param, value) in object {
        if !is_plural_target_param(param) {
            continue;
        }
        let expression = match value {
            Value::String(s) => s.clone(),
            Value::Array(items) if items.len() == 1 => {
                items[0].as_str().map(str::to_string)?
            }
            _ => continue,
        };
        let variable = template_variable(&expression)?;
        if !ctx.is_collection(&variable) {
            continue;
        }
        let items = ctx
            .get(&variable)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return Some(LoopExpansion {
            param: param.clone(),
            singular: singularize(param),
            items,
        });
    }
    None
}

/// The bare variable name when the expression is a single `{{name}}`.
fn template_variable(expression: &str) -> Option<String> {
    let trimmed = expression.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    inner
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_')
        .then(|| inner.to_string())
}

/// Child inputs for one loop iteration: the plural parameter is rewritten
/// to its singular form bound to the item, remaining templates resolve
/// against the shared context, and the loop frame rides along as metadata.
fn expand_child_inputs(
    inputs: &Value,
    expansion: &LoopExpansion,
    item: &Value,
    iteration: usize,
    total: usize,
) -> Value {
    let mut object = inputs.as_object().cloned().unwrap_or_default();
    object.remove(&expansion.param);
    object.insert(expansion.singular.clone(), item.clone());
    object.insert("_loop_index".to_string(), json!(iteration));
    object.insert("_loop_total".to_string(), json!(total));
    object.insert("_loop_item".to_string(), item.clone());
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::testing::win_asset;
    use crate::assets::StaticAssetFacade;
    use crate::catalog::{ConnectionType, Platform, RetryPolicy, ToolIndexEntry};
    use crate::pipeline::types::RiskLevel;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Collaborator double: records every envelope, scripts outputs per
    /// tool, and can fail specific loop items.
    #[derive(Default)]
    struct MockCollaborator {
        calls: Mutex<Vec<(ExecutionLocation, EnvelopeRequest)>>,
        outputs: HashMap<String, Value>,
        fail_when_input_contains: Option<String>,
        fail_always: bool,
    }

    impl MockCollaborator {
        fn with_output(mut self, tool: &str, output: Value) -> Self {
            self.outputs.insert(tool.to_string(), output);
            self
        }

        fn calls(&self) -> Vec<(ExecutionLocation, EnvelopeRequest)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CollaboratorClient for MockCollaborator {
        async fn execute_plan(
            &self,
            service: ExecutionLocation,
            envelope: &EnvelopeRequest,
            _trace: &TraceId,
        ) -> Result<EnvelopeResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((service, envelope.clone()));

            if self.fail_always {
                return Err(Error::upstream(service.to_string(), "connection refused"));
            }

            let step = &envelope.plan.steps[0];
            if let Some(marker) = &self.fail_when_input_contains {
                if step.inputs.to_string().contains(marker.as_str()) {
                    return Ok(EnvelopeResponse {
                        execution_id: envelope.execution_id.clone(),
                        status: "failed".to_string(),
                        result: None,
                        step_results: Vec::new(),
                        completed_at: None,
                        error_message: Some("scripted iteration failure".to_string()),
                    });
                }
            }

            let output = self
                .outputs
                .get(&step.tool)
                .cloned()
                .unwrap_or_else(|| json!({"ok": true}));
            Ok(EnvelopeResponse {
                execution_id: envelope.execution_id.clone(),
                status: "success".to_string(),
                result: Some(output.clone()),
                step_results: vec![EnvelopeStepResult {
                    step: 0,
                    tool: step.tool.clone(),
                    status: "success".to_string(),
                    output: Some(output),
                    error: None,
                    loop_iteration: None,
                    loop_total: None,
                }],
                completed_at: Some(Utc::now().to_rfc3339()),
                error_message: None,
            })
        }
    }

    fn seeded_index() -> Arc<SqliteToolIndex> {
        let index = SqliteToolIndex::in_memory().unwrap();

        let mut asset_query = FullToolSpec::new(
            ToolIndexEntry::new("asset-query", "asset-query", "Query assets", Platform::MultiPlatform)
                .with_embedding(vec![1.0, 0.0]),
        );
        asset_query.execution_location = ExecutionLocation::Asset;

        let mut invoke = FullToolSpec::new(
            ToolIndexEntry::new(
                "Invoke-Command",
                "Invoke-Command",
                "Run a command on Windows hosts",
                Platform::Windows,
            )
            .with_embedding(vec![0.0, 1.0]),
        );
        invoke.connection_type = ConnectionType::Powershell;

        let mut list_dir = FullToolSpec::new(
            ToolIndexEntry::new(
                "windows_list_directory",
                "windows_list_directory",
                "List a directory",
                Platform::Windows,
            )
            .with_embedding(vec![0.5, 0.5]),
        );
        list_dir.connection_type = ConnectionType::Powershell;
        list_dir.requires_credentials = true;

        index.bulk_upsert(&[asset_query, invoke, list_dir]).unwrap();
        Arc::new(index)
    }

    fn dispatcher(collaborator: MockCollaborator, broker: SecretsBroker) -> (Dispatcher, Arc<MockCollaborator>) {
        let collaborator = Arc::new(collaborator);
        let dispatcher = Dispatcher::new(
            collaborator.clone(),
            seeded_index(),
            Arc::new(StaticAssetFacade::new(vec![win_asset(
                "web-01",
                "192.168.50.211",
            )])),
            Arc::new(broker),
            Arc::new(CoreMetrics::new().unwrap()),
            StageTimeouts::default(),
            DispatcherConfig::default(),
        );
        (dispatcher, collaborator)
    }

    fn step(tool: &str, inputs: Value, depends_on: Vec<usize>) -> PlanStep {
        PlanStep {
            tool_id: tool.to_string(),
            inputs,
            depends_on,
            approval_required: false,
            retry_policy: RetryPolicy::default(),
            timeout_ms: 5_000,
            continue_on_failure: false,
        }
    }

    fn plan(steps: Vec<PlanStep>) -> ExecutionPlan {
        ExecutionPlan {
            approval_required: steps.iter().any(|s| s.approval_required),
            steps,
            risk_level: RiskLevel::Low,
            resource_hints: Default::default(),
        }
    }

    fn assets_output() -> Value {
        json!({
            "assets": [
                {"hostname": "win-01", "ip": "10.0.0.1"},
                {"hostname": "win-02", "ip": "10.0.0.2"},
                {"hostname": "win-03", "ip": "10.0.0.3"},
                {"hostname": "win-04", "ip": "10.0.0.4"},
            ]
        })
    }

    #[tokio::test]
    async fn test_service_routing_by_execution_location() {
        let (dispatcher, collaborator) = dispatcher(
            MockCollaborator::default().with_output("asset-query", assets_output()),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let p = plan(vec![step("asset-query", json!({"tag": "win10"}), vec![])]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e1"), true)
            .await;

        assert_eq!(result.state, PlanState::Completed);
        let calls = collaborator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, ExecutionLocation::Asset);
        assert_eq!(calls[0].1.plan.steps[0].tool, "asset-query");
        assert_eq!(calls[0].1.tenant_id, "default");
    }

    #[tokio::test]
    async fn test_loop_expansion_over_queried_assets() {
        let (dispatcher, collaborator) = dispatcher(
            MockCollaborator::default().with_output("asset-query", assets_output()),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let p = plan(vec![
            step("asset-query", json!({"tag": "win10"}), vec![]),
            step(
                "Invoke-Command",
                json!({"target_hosts": ["{{hostname}}"], "command": "Get-Date"}),
                vec![0],
            ),
        ]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e2"), true)
            .await;

        assert_eq!(result.state, PlanState::Completed);
        // One asset-query result plus four loop children
        assert_eq!(result.step_results.len(), 5);
        let children: Vec<&StepResult> = result
            .step_results
            .iter()
            .filter(|r| r.tool == "Invoke-Command")
            .collect();
        assert_eq!(children.len(), 4);
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.loop_iteration, Some(i + 1));
            assert_eq!(child.loop_total, Some(4));
        }

        // The plural parameter was rewritten singular per child
        let calls = collaborator.calls();
        let invoke_calls: Vec<&EnvelopeRequest> = calls
            .iter()
            .filter(|(_, e)| e.plan.steps[0].tool == "Invoke-Command")
            .map(|(_, e)| e)
            .collect();
        assert_eq!(invoke_calls.len(), 4);
        let first = &invoke_calls[0].plan.steps[0].inputs;
        assert_eq!(first["target_host"], json!("win-01"));
        assert!(first.get("target_hosts").is_none());
        assert_eq!(first["_loop_index"], json!(1));
        assert_eq!(first["_loop_total"], json!(4));
        assert_eq!(first["_loop_item"], json!("win-01"));
    }

    #[tokio::test]
    async fn test_loop_iteration_failure_does_not_abort() {
        let mut mock = MockCollaborator::default().with_output("asset-query", assets_output());
        mock.fail_when_input_contains = Some("win-02".to_string());
        let (dispatcher, _) = dispatcher(mock, SecretsBroker::in_memory("k").unwrap());

        let p = plan(vec![
            step("asset-query", json!({"tag": "win10"}), vec![]),
            step(
                "Invoke-Command",
                json!({"target_hosts": ["{{hostname}}"], "command": "Get-Date"}),
                vec![0],
            ),
        ]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e3"), true)
            .await;

        assert_eq!(result.state, PlanState::Completed);
        let children: Vec<&StepResult> = result
            .step_results
            .iter()
            .filter(|r| r.tool == "Invoke-Command")
            .collect();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].status, StepStatus::Success);
        assert_eq!(children[1].status, StepStatus::Failed);
        assert_eq!(children[2].status, StepStatus::Success);
        assert_eq!(children[3].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_credentials_injected_but_never_returned() {
        let broker = SecretsBroker::in_memory("k").unwrap();
        broker
            .upsert_credential("seed", "web-01", "winrm", "admin", "hunter2", Some("CORP"))
            .unwrap();
        let (dispatcher, collaborator) = dispatcher(MockCollaborator::default(), broker);

        let p = plan(vec![step(
            "windows_list_directory",
            json!({"target_host": "web-01", "path": "C:\\Temp"}),
            vec![],
        )]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e4"), true)
            .await;

        assert_eq!(result.state, PlanState::Completed);

        // Dispatched step carries the resolved credential
        let calls = collaborator.calls();
        let inputs = &calls[0].1.plan.steps[0].inputs;
        assert_eq!(inputs["username"], json!("admin"));
        assert_eq!(inputs["password"], json!("hunter2"));
        assert_eq!(inputs["domain"], json!("CORP"));

        // The caller-visible result never does
        let rendered = serde_json::to_string(&result).unwrap();
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_structured_failure() {
        let (dispatcher, _) = dispatcher(
            MockCollaborator::default(),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let p = plan(vec![step(
            "windows_list_directory",
            json!({"target_host": "ghost-99", "path": "C:\\"}),
            vec![],
        )]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e5"), true)
            .await;

        assert_eq!(result.state, PlanState::Failed);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("missing_credentials"));
    }

    #[tokio::test]
    async fn test_explicit_inputs_are_third_fallback() {
        let (dispatcher, collaborator) = dispatcher(
            MockCollaborator::default(),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let p = plan(vec![step(
            "windows_list_directory",
            json!({"target_host": "ghost-99", "username": "local", "password": "pw", "path": "C:\\"}),
            vec![],
        )]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e6"), true)
            .await;

        assert_eq!(result.state, PlanState::Completed);
        let calls = collaborator.calls();
        assert_eq!(calls[0].1.plan.steps[0].inputs["username"], json!("local"));
    }

    #[tokio::test]
    async fn test_approval_pauses_before_side_effects() {
        let (dispatcher, collaborator) = dispatcher(
            MockCollaborator::default(),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let mut gated = step("asset-query", json!({}), vec![]);
        gated.approval_required = true;
        let p = plan(vec![gated]);

        let paused = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e7"), false)
            .await;
        assert_eq!(paused.state, PlanState::PausedForApproval);
        assert!(paused.step_results.is_empty());
        assert!(collaborator.calls().is_empty(), "no side effects before approval");

        let resumed = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e7"), true)
            .await;
        assert_eq!(resumed.state, PlanState::Completed);
        assert_eq!(collaborator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_exhaustion_surfaces_structured_error() {
        let mut mock = MockCollaborator::default();
        mock.fail_always = true;
        let (dispatcher, collaborator) = dispatcher(mock, SecretsBroker::in_memory("k").unwrap());

        let mut retried = step("asset-query", json!({}), vec![]);
        retried.retry_policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
        };
        let p = plan(vec![retried]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e8"), true)
            .await;

        assert_eq!(result.state, PlanState::Failed);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("upstream_unreachable"));
        // Initial attempt plus two retries
        assert_eq!(collaborator.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_continue_on_failure_keeps_going() {
        let mut mock = MockCollaborator::default();
        mock.fail_always = true;
        let (dispatcher, _) = dispatcher(mock, SecretsBroker::in_memory("k").unwrap());

        let mut tolerant = step("asset-query", json!({}), vec![]);
        tolerant.continue_on_failure = true;
        let p = plan(vec![tolerant, step("Invoke-Command", json!({"command": "x"}), vec![])]);

        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e9"), true)
            .await;
        // Second step also fails (collaborator down), which terminates the
        // plan, but both steps were attempted.
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.state, PlanState::Failed);
    }

    #[tokio::test]
    async fn test_results_in_step_index_order() {
        let (dispatcher, _) = dispatcher(
            MockCollaborator::default().with_output("asset-query", assets_output()),
            SecretsBroker::in_memory("k").unwrap(),
        );
        // Step 1 has no deps; step 0 depends on step 1, so execution order
        // is reversed but results come back sorted by step index.
        let p = plan(vec![
            step("Invoke-Command", json!({"command": "x"}), vec![1]),
            step("asset-query", json!({}), vec![]),
        ]);
        let result = dispatcher
            .execute(&p, &[], &TraceId::from("tr_e10"), true)
            .await;
        assert_eq!(result.state, PlanState::Completed);
        assert_eq!(result.step_results[0].step, 0);
        assert_eq!(result.step_results[1].step, 1);
    }

    #[tokio::test]
    async fn test_execute_tool_validates_required_params() {
        let (dispatcher, _) = dispatcher(
            MockCollaborator::default(),
            SecretsBroker::in_memory("k").unwrap(),
        );
        // Seed a tool with a declared required parameter
        let mut spec = FullToolSpec::new(
            ToolIndexEntry::new("ping-host", "ping-host", "Ping a host", Platform::MultiPlatform)
                .with_embedding(vec![1.0]),
        );
        spec.parameters = vec![crate::catalog::ParameterSpec::required("target", "string")];
        dispatcher.index.upsert(&spec).unwrap();

        let err = dispatcher
            .execute_tool("ping-host", json!({}), &TraceId::from("tr_t1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "missing_params");
        match err {
            Error::MissingInputs { descriptors, .. } => {
                assert_eq!(descriptors[0].name, "target");
            }
            other => panic!("unexpected error: {other}"),
        }

        let output = dispatcher
            .execute_tool("ping-host", json!({"target": "web-01"}), &TraceId::from("tr_t2"))
            .await
            .unwrap();
        assert_eq!(output, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_execute_tool_normalizes_filename_variants() {
        let (dispatcher, collaborator) = dispatcher(
            MockCollaborator::default().with_output("asset-query", assets_output()),
            SecretsBroker::in_memory("k").unwrap(),
        );
        let output = dispatcher
            .execute_tool("asset_query", json!({"tag": "win10"}), &TraceId::from("tr_t3"))
            .await
            .unwrap();
        assert_eq!(output["assets"].as_array().unwrap().len(), 4);
        assert_eq!(collaborator.calls()[0].0, ExecutionLocation::Asset);
    }

    #[test]
    fn test_plural_parameter_detection() {
        assert!(is_plural_target_param("target_hosts"));
        assert!(is_plural_target_param("hosts"));
        assert!(is_plural_target_param("targets"));
        assert!(!is_plural_target_param("target_host"));
        assert!(!is_plural_target_param("status"));
        assert_eq!(singularize("target_hosts"), "target_host");
        assert_eq!(singularize("hosts"), "host");
    }

    #[test]
    fn test_loop_requires_collection_in_context() {
        let mut ctx = ExecutionContext::new("x");
        let inputs = json!({"target_hosts": ["{{hostname}}"]});
        assert!(detect_loop(&inputs, &ctx).is_none());

        ctx.set("hostname", json!([]));
        assert!(detect_loop(&inputs, &ctx).is_none());

        ctx.set("hostname", json!(["a", "b"]));
        let expansion = detect_loop(&inputs, &ctx).unwrap();
        assert_eq!(expansion.param, "target_hosts");
        assert_eq!(expansion.singular, "target_host");
        assert_eq!(expansion.items.len(), 2);
    }
}
