//! Stage C: plan construction.
//!
//! One LLM call with a compact prompt (minimal rows, the user text, the
//! selected ids) proposes the step graph; deterministic post-processing
//! drops steps for unselected tools, validates acyclicity, applies safety
//! gates, and attaches retry policies and timeouts from tool metadata.
//! When the LLM is unreachable the planner degrades to a linear plan over
//! the selection order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::catalog::{FullToolSpec, MinimalRow, SqliteToolIndex};
use crate::config::StageTimeouts;
use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pipeline::extract_json;
use crate::pipeline::types::{
    Classification, ExecutionPlan, PlanStep, ResourceHints, RiskLevel, SelectionV1,
};

/// Stage C planner.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    index: Arc<SqliteToolIndex>,
    timeouts: StageTimeouts,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, index: Arc<SqliteToolIndex>, timeouts: StageTimeouts) -> Self {
        Self {
            llm,
            index,
            timeouts,
        }
    }

    /// Build a validated plan from a selection.
    ///
    /// # Errors
    /// [`Error::PlanInvalid`] when the selection is empty, the LLM emits an
    /// unusable step graph, or the dependency graph has a cycle.
    pub async fn plan(
        &self,
        user_text: &str,
        classification: &Classification,
        selection: &SelectionV1,
    ) -> Result<ExecutionPlan> {
        if selection.selected_tools.is_empty() {
            return Err(Error::PlanInvalid("selection is empty".to_string()));
        }

        let mut specs: HashMap<String, FullToolSpec> = HashMap::new();
        for choice in &selection.selected_tools {
            let spec = self.index.get_full_spec(&choice.tool_id)?;
            specs.insert(choice.tool_id.clone(), spec);
        }

        let proposed = match self.llm_steps(user_text, selection, &specs).await {
            Ok(raw) => raw,
            Err(e) if e.is_transient() || matches!(e, Error::LlmApi { .. }) => {
                tracing::warn!(error = %e, "plan call failed, degrading to linear plan");
                self.linear_steps(selection)
            }
            Err(e) => return Err(e),
        };

        self.assemble(proposed, classification, &specs)
    }

    async fn llm_steps(
        &self,
        user_text: &str,
        selection: &SelectionV1,
        specs: &HashMap<String, FullToolSpec>,
    ) -> Result<Vec<RawStep>> {
        let rows: Vec<MinimalRow> = selection
            .selected_tools
            .iter()
            .filter_map(|c| specs.get(&c.tool_id).map(|s| s.entry.minimal_row()))
            .collect();
        let selected_ids: Vec<&str> = selection
            .selected_tools
            .iter()
            .map(|c| c.tool_id.as_str())
            .collect();
        let target = selection
            .asset_metadata
            .as_ref()
            .and_then(|m| m.target())
            .unwrap_or("unknown");

        let request = CompletionRequest::new(format!(
            "Request: {user_text}\nTarget: {target}\nSelected tools: {selected_ids:?}\n\
             Tool catalog rows:\n{}",
            serde_json::to_string(&rows)?
        ))
        .with_system(
            "Produce an execution plan using only the selected tools. Respond with only \
             JSON: {\"steps\":[{\"tool_id\":\"...\",\"inputs\":{},\"depends_on\":[]}],\
             \"risk_level\":\"low|medium|high\"}. Step inputs may reference earlier \
             outputs with {{variable}} template expressions. depends_on lists step \
             indices only.",
        )
        .with_max_tokens(1024)
        .with_temperature(0.0);

        let response = tokio::time::timeout(self.timeouts.plan(), self.llm.complete(request))
            .await
            .map_err(|_| Error::timeout(self.timeouts.plan_ms))??;

        let parsed = extract_json(&response.content)
            .ok_or_else(|| Error::PlanInvalid("planner returned no JSON".to_string()))?;
        let steps = parsed
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::PlanInvalid("plan has no steps array".to_string()))?;

        let risk = parsed
            .get("risk_level")
            .and_then(Value::as_str)
            .and_then(parse_risk);

        let mut raw = Vec::new();
        for step in steps {
            let Some(tool_id) = step.get("tool_id").and_then(Value::as_str) else {
                return Err(Error::PlanInvalid("step without tool_id".to_string()));
            };
            let inputs = step.get("inputs").cloned().unwrap_or_else(|| json!({}));
            let depends_on: Vec<usize> = step
                .get("depends_on")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_u64)
                        .map(|d| d as usize)
                        .collect()
                })
                .unwrap_or_default();
            raw.push(RawStep {
                tool_id: tool_id.to_string(),
                inputs,
                depends_on,
                risk,
            });
        }
        Ok(raw)
    }

    /// Linear fallback: the selected tools in order, each depending on its
    /// predecessor, inputs prefilled with the resolved target.
    fn linear_steps(&self, selection: &SelectionV1) -> Vec<RawStep> {
        let target = selection.asset_metadata.as_ref().and_then(|m| m.target());
        selection
            .selected_tools
            .iter()
            .enumerate()
            .map(|(i, choice)| {
                let mut inputs = serde_json::Map::new();
                if let Some(host) = target {
                    inputs.insert("target_host".to_string(), json!(host));
                }
                RawStep {
                    tool_id: choice.tool_id.clone(),
                    inputs: Value::Object(inputs),
                    depends_on: if i == 0 { Vec::new() } else { vec![i - 1] },
                    risk: None,
                }
            })
            .collect()
    }

    fn assemble(
        &self,
        proposed: Vec<RawStep>,
        classification: &Classification,
        specs: &HashMap<String, FullToolSpec>,
    ) -> Result<ExecutionPlan> {
        let selected_ids: Vec<&String> = specs.keys().collect();

        // Steps may only reference selected tools; everything else is
        // dropped and the dependency indices remapped.
        let mut index_map: HashMap<usize, usize> = HashMap::new();
        let mut kept: Vec<RawStep> = Vec::new();
        for (old_index, step) in proposed.into_iter().enumerate() {
            if selected_ids.iter().any(|id| **id == step.tool_id) {
                index_map.insert(old_index, kept.len());
                kept.push(step);
            } else {
                tracing::warn!(tool = %step.tool_id, "dropping plan step for unselected tool");
            }
        }
        if kept.is_empty() {
            return Err(Error::PlanInvalid(
                "no plan steps reference selected tools".to_string(),
            ));
        }

        let llm_risk = kept.iter().find_map(|s| s.risk);
        let step_count = kept.len();
        let mut steps: Vec<PlanStep> = Vec::with_capacity(step_count);
        for step in kept {
            let spec = specs
                .get(&step.tool_id)
                .ok_or_else(|| Error::Internal(format!("spec missing for {}", step.tool_id)))?;
            let depends_on: Vec<usize> = step
                .depends_on
                .iter()
                .filter_map(|old| index_map.get(old).copied())
                .filter(|&d| d < step_count)
                .collect();
            steps.push(PlanStep {
                tool_id: step.tool_id,
                inputs: step.inputs,
                depends_on,
                approval_required: spec.requires_approval,
                retry_policy: spec.retry_policy,
                timeout_ms: self.timeouts.clamp_step_ms(spec.timeout_ms),
                continue_on_failure: false,
            });
        }

        validate_acyclic(&steps)?;

        let approval_required = steps.iter().any(|s| s.approval_required);
        let risk_level = llm_risk
            .unwrap_or(classification.risk_level)
            .max(classification.risk_level);
        let estimated_duration_ms: u64 = steps.iter().map(|s| s.timeout_ms).sum();

        Ok(ExecutionPlan {
            steps,
            risk_level,
            approval_required,
            resource_hints: ResourceHints {
                estimated_duration_ms: Some(estimated_duration_ms),
                max_concurrency: Some(1),
            },
        })
    }
}

struct RawStep {
    tool_id: String,
    inputs: Value,
    depends_on: Vec<usize>,
    risk: Option<RiskLevel>,
}

fn parse_risk(s: &str) -> Option<RiskLevel> {
    match s {
        "low" => Some(RiskLevel::Low),
        "medium" => Some(RiskLevel::Medium),
        "high" => Some(RiskLevel::High),
        _ => None,
    }
}

/// Kahn's algorithm over the step indices; a leftover node means a cycle.
fn validate_acyclic(steps: &[PlanStep]) -> Result<()> {
    let n = steps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, step) in steps.iter().enumerate() {
        for &dep in &step.depends_on {
            if dep == i {
                return Err(Error::PlanInvalid(format!("step {i} depends on itself")));
            }
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }

    if visited != n {
        return Err(Error::PlanInvalid("dependency cycle detected".to_string()));
    }
    Ok(())
}

/// Topological execution order: step indices such that every dependency
/// precedes its dependents, stable by index.
pub fn execution_order(steps: &[PlanStep]) -> Result<Vec<usize>> {
    validate_acyclic(steps)?;
    let n = steps.len();
    let mut order = Vec::with_capacity(n);
    let mut done = vec![false; n];
    while order.len() < n {
        let mut progressed = false;
        for i in 0..n {
            if !done[i] && steps[i].depends_on.iter().all(|&d| done[d]) {
                done[i] = true;
                order.push(i);
                progressed = true;
            }
        }
        if !progressed {
            return Err(Error::PlanInvalid("dependency cycle detected".to_string()));
        }
    }
    Ok(order)
}
