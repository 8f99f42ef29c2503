//! Stage D: user-facing response formatting.
//!
//! The response type is routed deterministically from what the pipeline
//! produced; the LLM only renders prose. Output is a lazy, finite,
//! non-restartable token stream terminated by a sentinel, so intermediate
//! consumers can surface partial output. On LLM failure a template
//! formatter renders the structured summary instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::llm::{CompletionRequest, LlmClient};
use crate::pipeline::types::{
    Classification, ExecutionPlan, ExecutionResult, ResponseType, SelectionV1,
};

/// One element of the response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseToken {
    Text(String),
    /// Terminal boundary; nothing follows
    Done,
}

/// A finite, non-restartable stream of response tokens.
pub struct ResponseStream {
    rx: mpsc::Receiver<ResponseToken>,
}

impl ResponseStream {
    /// Next token, or `None` once the stream is exhausted.
    pub async fn next_token(&mut self) -> Option<ResponseToken> {
        self.rx.recv().await
    }

    /// Drain the stream into the full response text.
    pub async fn collect_text(mut self) -> String {
        let mut out = String::new();
        while let Some(token) = self.next_token().await {
            match token {
                ResponseToken::Text(t) => out.push_str(&t),
                ResponseToken::Done => break,
            }
        }
        out
    }
}

/// Deterministic response-type routing.
pub fn response_type(
    selection: Option<&SelectionV1>,
    plan: Option<&ExecutionPlan>,
    execution: Option<&ExecutionResult>,
) -> ResponseType {
    if execution.is_some() {
        return ResponseType::ExecutionResult;
    }
    match plan {
        Some(plan) if plan.approval_required => ResponseType::ApprovalRequest,
        Some(_) if selection.is_some_and(|s| s.ready_for_execution) => {
            ResponseType::ExecutionReady
        }
        Some(_) => ResponseType::PlanSummary,
        None => ResponseType::Information,
    }
}

/// Stage D responder.
pub struct Responder {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl Responder {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Format a response, returning the routed type and the token stream.
    pub async fn respond(
        &self,
        user_text: &str,
        classification: &Classification,
        selection: Option<&SelectionV1>,
        plan: Option<&ExecutionPlan>,
        execution: Option<&ExecutionResult>,
    ) -> (ResponseType, ResponseStream) {
        let rtype = response_type(selection, plan, execution);
        let fallback = template_fallback(rtype, classification, selection, plan, execution);

        let prompt = build_prompt(rtype, user_text, selection, plan, execution);
        let llm = Arc::clone(&self.llm);
        let timeout = self.timeout;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let request = CompletionRequest::new(prompt)
                .with_system(
                    "You are the operator-facing voice of an automation platform. \
                     Summarize clearly and briefly. Never invent results.",
                )
                .with_max_tokens(512)
                .with_temperature(0.2);

            let text = match tokio::time::timeout(timeout, llm.complete(request)).await {
                Ok(Ok(response)) => response.content,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "responder LLM failed, using template fallback");
                    fallback
                }
                Err(_) => {
                    tracing::warn!("responder LLM timed out, using template fallback");
                    fallback
                }
            };

            for word in text.split_inclusive(char::is_whitespace) {
                if tx.send(ResponseToken::Text(word.to_string())).await.is_err() {
                    return; // consumer went away
                }
            }
            let _ = tx.send(ResponseToken::Done).await;
        });

        (rtype, ResponseStream { rx })
    }
}

fn build_prompt(
    rtype: ResponseType,
    user_text: &str,
    selection: Option<&SelectionV1>,
    plan: Option<&ExecutionPlan>,
    execution: Option<&ExecutionResult>,
) -> String {
    let mut parts = vec![format!("Request: {user_text}"), format!("Response kind: {rtype:?}")];
    if let Some(selection) = selection {
        parts.push(format!("Selected tools: {:?}", selection.selected_ids()));
        if !selection.additional_inputs_needed.is_empty() {
            let names: Vec<&str> = selection
                .additional_inputs_needed
                .iter()
                .map(|d| d.name.as_str())
                .collect();
            parts.push(format!("Inputs still needed: {names:?}"));
        }
    }
    if let Some(plan) = plan {
        let tools: Vec<&str> = plan.steps.iter().map(|s| s.tool_id.as_str()).collect();
        parts.push(format!(
            "Plan: {} step(s) {tools:?}, risk {:?}, approval required: {}",
            plan.steps.len(),
            plan.risk_level,
            plan.approval_required
        ));
    }
    if let Some(execution) = execution {
        parts.push(format!(
            "Execution {:?}: {} step result(s)",
            execution.state,
            execution.step_results.len()
        ));
    }
    parts.join("\n")
}

/// Structured textual summary used when the LLM path is unavailable.
fn template_fallback(
    rtype: ResponseType,
    classification: &Classification,
    selection: Option<&SelectionV1>,
    plan: Option<&ExecutionPlan>,
    execution: Option<&ExecutionResult>,
) -> String {
    match rtype {
        ResponseType::Information => format!(
            "Understood a {:?} request ({}). No executable plan was produced.",
            classification.intent.category, classification.intent.action
        ),
        ResponseType::PlanSummary | ResponseType::ExecutionReady | ResponseType::ApprovalRequest => {
            let mut out = String::new();
            if let Some(plan) = plan {
                out.push_str(&format!(
                    "Prepared a {} step plan (risk: {:?}).",
                    plan.steps.len(),
                    plan.risk_level
                ));
                for (i, step) in plan.steps.iter().enumerate() {
                    out.push_str(&format!(" Step {}: {}.", i + 1, step.tool_id));
                }
            }
            if rtype == ResponseType::ApprovalRequest {
                out.push_str(" Approval is required before execution.");
            } else if let Some(selection) = selection {
                if !selection.additional_inputs_needed.is_empty() {
                    let names: Vec<&str> = selection
                        .additional_inputs_needed
                        .iter()
                        .map(|d| d.name.as_str())
                        .collect();
                    out.push_str(&format!(" Still needed: {names:?}."));
                } else {
                    out.push_str(" Ready to execute.");
                }
            }
            out
        }
        ResponseType::ExecutionResult => {
            let Some(execution) = execution else {
                return "Execution finished.".to_string();
            };
            let ok = execution
                .step_results
                .iter()
                .filter(|r| r.status == crate::pipeline::types::StepStatus::Success)
                .count();
            format!(
                "Execution {:?}: {ok}/{} step(s) succeeded.",
                execution.state,
                execution.step_results.len()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RetryPolicy;
    use crate::llm::testing::ScriptedLlm;
    use crate::pipeline::classify::RuleClassifier;
    use crate::pipeline::types::{
        NextStage, PlanState, ResourceHints, RiskLevel, StepResult, StepStatus, ToolChoice,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn plan(approval: bool) -> ExecutionPlan {
        ExecutionPlan {
            steps: vec![crate::pipeline::types::PlanStep {
                tool_id: "asset-query".into(),
                inputs: json!({}),
                depends_on: vec![],
                approval_required: approval,
                retry_policy: RetryPolicy::default(),
                timeout_ms: 30_000,
                continue_on_failure: false,
            }],
            risk_level: RiskLevel::Low,
            approval_required: approval,
            resource_hints: ResourceHints::default(),
        }
    }

    fn selection(ready: bool) -> SelectionV1 {
        SelectionV1 {
            selected_tools: vec![ToolChoice {
                tool_id: "asset-query".into(),
                rationale: "test".into(),
                score: 1.0,
            }],
            platform_filter: None,
            asset_metadata: None,
            additional_inputs_needed: Vec::new(),
            ready_for_execution: ready,
            next_stage: NextStage::Planner,
            missing_target_info: false,
            degraded: Vec::new(),
            error_code: None,
            fallback_recommendation: None,
        }
    }

    fn execution() -> ExecutionResult {
        ExecutionResult {
            execution_id: "exec-1".into(),
            state: PlanState::Completed,
            step_results: vec![StepResult {
                step: 0,
                tool: "asset-query".into(),
                status: StepStatus::Success,
                output: None,
                error: None,
                loop_iteration: None,
                loop_total: None,
            }],
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn test_response_type_routing() {
        assert_eq!(response_type(None, None, None), ResponseType::Information);
        assert_eq!(
            response_type(Some(&selection(true)), Some(&plan(false)), None),
            ResponseType::ExecutionReady
        );
        assert_eq!(
            response_type(Some(&selection(false)), Some(&plan(false)), None),
            ResponseType::PlanSummary
        );
        assert_eq!(
            response_type(Some(&selection(true)), Some(&plan(true)), None),
            ResponseType::ApprovalRequest
        );
        assert_eq!(
            response_type(Some(&selection(true)), Some(&plan(false)), Some(&execution())),
            ResponseType::ExecutionResult
        );
    }

    #[tokio::test]
    async fn test_stream_terminates_with_done() {
        let responder = Responder::new(
            Arc::new(ScriptedLlm::with_default("All four hosts responded.")),
            Duration::from_secs(4),
        );
        let c = RuleClassifier.classify("check the hosts");
        let (rtype, mut stream) = responder.respond("check the hosts", &c, None, None, None).await;
        assert_eq!(rtype, ResponseType::Information);

        let mut tokens = Vec::new();
        while let Some(token) = stream.next_token().await {
            let done = token == ResponseToken::Done;
            tokens.push(token);
            if done {
                break;
            }
        }
        assert_eq!(tokens.last(), Some(&ResponseToken::Done));
        let text: String = tokens
            .iter()
            .filter_map(|t| match t {
                ResponseToken::Text(s) => Some(s.as_str()),
                ResponseToken::Done => None,
            })
            .collect();
        assert_eq!(text, "All four hosts responded.");
    }

    #[tokio::test]
    async fn test_llm_failure_uses_template_fallback() {
        let responder = Responder::new(Arc::new(ScriptedLlm::failing()), Duration::from_secs(1));
        let c = RuleClassifier.classify("restart the service");
        let sel = selection(true);
        let p = plan(true);
        let (rtype, stream) = responder
            .respond("restart the service", &c, Some(&sel), Some(&p), None)
            .await;
        assert_eq!(rtype, ResponseType::ApprovalRequest);
        let text = stream.collect_text().await;
        assert!(text.contains("asset-query"));
        assert!(text.contains("Approval is required"));
    }

    #[tokio::test]
    async fn test_execution_result_fallback_counts_successes() {
        let responder = Responder::new(Arc::new(ScriptedLlm::failing()), Duration::from_secs(1));
        let c = RuleClassifier.classify("status");
        let exec = execution();
        let (rtype, stream) = responder
            .respond("status", &c, None, None, Some(&exec))
            .await;
        assert_eq!(rtype, ResponseType::ExecutionResult);
        let text = stream.collect_text().await;
        assert!(text.contains("1/1"));
    }
}
