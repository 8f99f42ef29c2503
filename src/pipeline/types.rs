//! Typed stage boundaries: classification, selection, plan, and execution
//! results flow between stages as sum types, never as loose dictionaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assets::ServiceBinding;
use crate::catalog::{ParameterSpec, Platform, RetryPolicy};

/// Broad intent category of an operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    /// Read-only questions: list, show, check
    Information,
    /// State-changing operations: restart, deploy, delete
    Action,
    /// Investigation: why is X failing
    Diagnostic,
    /// Unclassifiable input
    Unknown,
}

/// Classified intent: a category plus the concrete action verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    pub action: String,
}

impl Intent {
    pub fn new(category: IntentCategory, action: impl Into<String>) -> Self {
        Self {
            category,
            action: action.into(),
        }
    }

    /// Conservative default used when classification cannot decide.
    pub fn unknown() -> Self {
        Self::new(IntentCategory::Unknown, "unknown")
    }
}

/// Kind of a typed entity extracted from the request text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hostname,
    IpAddress,
    Service,
    Path,
    Port,
    Tag,
}

/// A typed entity with its raw value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
}

impl Entity {
    pub fn new(kind: EntityKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Risk level of a request or plan.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Stage A output. Always produced; classification never fails a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub entities: Vec<Entity>,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    pub risk_level: RiskLevel,
    /// Set when the text references an implicit target ("this server",
    /// "current directory") and no concrete target was extracted
    #[serde(default)]
    pub ambiguous_target: bool,
}

impl Classification {
    /// Hostname and IP entity values, hostnames first.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .entities
            .iter()
            .filter(|e| e.kind == EntityKind::Hostname)
            .map(|e| e.value.as_str())
            .collect();
        out.extend(
            self.entities
                .iter()
                .filter(|e| e.kind == EntityKind::IpAddress)
                .map(|e| e.value.as_str()),
        );
        out
    }

    /// First entity of the given kind.
    pub fn entity(&self, kind: EntityKind) -> Option<&str> {
        self.entities
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.value.as_str())
    }
}

/// Structured descriptor for an input the caller must still supply.
/// The UI renders these into prompts; `secret` values are masked at entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            secret: false,
            optional: false,
            validation: None,
            hint: None,
        }
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Descriptor for the target asset when none could be resolved.
    pub fn target_asset() -> Self {
        Self::new("target_asset", "string")
            .with_hint("hostname or IP of the asset to operate on")
    }
}

impl From<&ParameterSpec> for ParameterDescriptor {
    fn from(spec: &ParameterSpec) -> Self {
        Self {
            name: spec.name.clone(),
            param_type: spec.param_type.clone(),
            secret: spec.secret,
            optional: !spec.required,
            validation: spec.validation.clone(),
            hint: spec.hint.clone(),
        }
    }
}

/// Snapshot of the asset the selection resolved, carried into planning and
/// execution so they need not re-query the inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service: Option<ServiceBinding>,
}

impl AssetMetadata {
    /// The address execution should dispatch to: hostname, else IP.
    pub fn target(&self) -> Option<&str> {
        self.hostname.as_deref().or(self.ip.as_deref())
    }
}

/// A selected tool with the reason it won.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChoice {
    pub tool_id: String,
    pub rationale: String,
    /// Deterministic score at selection time
    pub score: f32,
}

/// Where the pipeline goes after selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStage {
    /// Enough context to plan
    Planner,
    /// The operator must supply more inputs first
    Clarification,
}

/// Stage AB output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionV1 {
    pub selected_tools: Vec<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_filter: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_metadata: Option<AssetMetadata>,
    pub additional_inputs_needed: Vec<ParameterDescriptor>,
    pub ready_for_execution: bool,
    pub next_stage: NextStage,
    #[serde(default)]
    pub missing_target_info: bool,
    /// Degradation flags accumulated along the way
    /// ("index_unavailable", "asset_facade_unavailable", "llm_unavailable",
    /// "asset_not_found")
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
    /// User-visible error code when selection produced nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Best lexical hit offered when retrieval came back empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_recommendation: Option<String>,
}

impl SelectionV1 {
    /// Ids of the selected tools in rank order.
    pub fn selected_ids(&self) -> Vec<String> {
        self.selected_tools
            .iter()
            .map(|t| t.tool_id.clone())
            .collect()
    }
}

/// One step of an execution plan. Dependencies are step indices into the
/// plan's step arena; the graph must be acyclic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_id: String,
    /// Step inputs; values may contain template expressions
    pub inputs: Value,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub timeout_ms: u64,
    #[serde(default)]
    pub continue_on_failure: bool,
}

/// Advisory hints attached to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

/// Stage C output: a validated, topologically ordered plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    pub risk_level: RiskLevel,
    pub approval_required: bool,
    #[serde(default)]
    pub resource_hints: ResourceHints,
}

/// Outcome of one dispatched step (or loop iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Result of one step, in step-index order; loop children carry their
/// iteration coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub tool: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_total: Option<usize>,
}

/// Plan-level state machine. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Queued,
    Running,
    PausedForApproval,
    Completed,
    Failed,
}

impl PlanState {
    /// Whether this state permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Stage E output for a whole plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub state: PlanState,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// Whether every non-skipped step succeeded.
    pub fn succeeded(&self) -> bool {
        self.state == PlanState::Completed
    }

    /// Distinct tool ids that were actually dispatched.
    pub fn executed_tool_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for r in &self.step_results {
            if !out.contains(&r.tool) {
                out.push(r.tool.clone());
            }
        }
        out
    }
}

/// What kind of response Stage D should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Information,
    PlanSummary,
    ApprovalRequest,
    ExecutionReady,
    ExecutionResult,
}
