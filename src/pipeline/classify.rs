//! Stage A: request classification.
//!
//! Four LLM sub-tasks run as two parallel pairs (intent+entities, then
//! confidence+risk), each under its own timeout. Any sub-task that fails is
//! replaced by the deterministic rule-based result, so classification always
//! produces a valid instance and never fails the request.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pipeline::extract_json;
use crate::pipeline::types::{
    Classification, Entity, EntityKind, Intent, IntentCategory, RiskLevel,
};

/// Confidence reported when the LLM sub-task fell back to rules.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Phrases that reference an implicit target.
const AMBIGUITY_KEYWORDS: &[&str] = &["current directory", "this server", "here"];

/// Service names recognized by the lexical fallback.
const KNOWN_SERVICES: &[&str] = &[
    "nginx", "apache", "iis", "sshd", "mysql", "postgres", "redis", "mongodb", "docker",
    "kubelet", "winrm",
];

struct EntityPatterns {
    ip: Regex,
    hostname: Regex,
    path: Regex,
    port: Regex,
    tag: Regex,
}

impl EntityPatterns {
    fn new() -> Self {
        Self {
            ip: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
            // Hyphenated or dotted machine names (web-01, db.internal);
            // a digit or dot is required to keep prose hyphens out
            hostname: Regex::new(
                r"\b[A-Za-z][A-Za-z0-9]*(?:[-.][A-Za-z0-9]+)*(?:-\d+|\.[A-Za-z]{2,})[A-Za-z0-9]*\b",
            )
            .unwrap(),
            path: Regex::new(r#"(?:[A-Za-z]:\\[^\s"']+|(?:^|\s)(/[\w.-]+(?:/[\w.-]+)*))"#).unwrap(),
            port: Regex::new(r"(?i)\bport\s+(\d{1,5})\b").unwrap(),
            tag: Regex::new(r"(?i)\btag[:=]\s*([\w-]+)").unwrap(),
        }
    }
}

fn patterns() -> &'static EntityPatterns {
    static PATTERNS: OnceLock<EntityPatterns> = OnceLock::new();
    PATTERNS.get_or_init(EntityPatterns::new)
}

/// Deterministic keyword/regex classifier used as the Stage A fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    /// Extract typed entities with regex and lexical heuristics.
    pub fn extract_entities(&self, text: &str) -> Vec<Entity> {
        let p = patterns();
        let mut entities: Vec<Entity> = Vec::new();
        let mut push = |kind: EntityKind, value: &str| {
            let value = value.trim();
            if !value.is_empty()
                && !entities
                    .iter()
                    .any(|e| e.kind == kind && e.value.eq_ignore_ascii_case(value))
            {
                entities.push(Entity::new(kind, value));
            }
        };

        for m in p.ip.find_iter(text) {
            push(EntityKind::IpAddress, m.as_str());
        }
        for m in p.hostname.find_iter(text) {
            // The IP pattern wins for dotted quads
            if !p.ip.is_match(m.as_str()) {
                push(EntityKind::Hostname, m.as_str());
            }
        }
        let lower = text.to_lowercase();
        for service in KNOWN_SERVICES {
            if lower.contains(service) {
                push(EntityKind::Service, service);
            }
        }
        for caps in p.path.captures_iter(text) {
            let value = caps
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or_else(|| caps.get(0).map(|m| m.as_str()).unwrap_or_default());
            push(EntityKind::Path, value);
        }
        for caps in p.port.captures_iter(text) {
            push(EntityKind::Port, &caps[1]);
        }
        for caps in p.tag.captures_iter(text) {
            push(EntityKind::Tag, &caps[1]);
        }
        entities
    }

    /// Keyword-based intent classification.
    pub fn intent(&self, text: &str) -> Intent {
        let lower = text.to_lowercase();
        const INFORMATION: &[&str] = &["list", "show", "get", "check", "count", "what", "status"];
        const ACTION: &[&str] = &[
            "restart", "start", "stop", "deploy", "install", "delete", "remove", "create",
            "update", "run", "execute",
        ];
        const DIAGNOSTIC: &[&str] = &["why", "diagnose", "troubleshoot", "investigate", "debug"];

        for verb in ACTION {
            if lower.contains(verb) {
                return Intent::new(IntentCategory::Action, *verb);
            }
        }
        for verb in DIAGNOSTIC {
            if lower.contains(verb) {
                return Intent::new(IntentCategory::Diagnostic, *verb);
            }
        }
        for verb in INFORMATION {
            if lower.contains(verb) {
                return Intent::new(IntentCategory::Information, *verb);
            }
        }
        Intent::unknown()
    }

    /// Conservative verb-class risk assessment.
    pub fn risk(&self, text: &str) -> RiskLevel {
        let lower = text.to_lowercase();
        const HIGH: &[&str] = &["delete", "remove", "format", "shutdown", "wipe", "drop"];
        const MEDIUM: &[&str] = &["restart", "stop", "install", "deploy", "update", "modify"];

        if HIGH.iter().any(|v| lower.contains(v)) {
            RiskLevel::High
        } else if MEDIUM.iter().any(|v| lower.contains(v)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Whether the text leans on an implicit target.
    pub fn has_ambiguity_keyword(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        AMBIGUITY_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    /// Full rule-based classification (used when the LLM is bypassed).
    pub fn classify(&self, text: &str) -> Classification {
        let entities = self.extract_entities(text);
        let ambiguous_target = entities
            .iter()
            .all(|e| e.kind != EntityKind::Hostname && e.kind != EntityKind::IpAddress)
            && self.has_ambiguity_keyword(text);
        Classification {
            intent: self.intent(text),
            entities,
            confidence: FALLBACK_CONFIDENCE,
            risk_level: self.risk(text),
            ambiguous_target,
        }
    }
}

/// Stage A classifier: LLM sub-tasks with the rule fallback.
pub struct Classifier {
    llm: Arc<dyn LlmClient>,
    call_timeout: Duration,
    rules: RuleClassifier,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>, call_timeout: Duration) -> Self {
        Self {
            llm,
            call_timeout,
            rules: RuleClassifier,
        }
    }

    /// Classify the request. Never fails: every sub-task degrades to the
    /// deterministic fallback independently.
    pub async fn classify(&self, user_text: &str) -> Classification {
        let (intent_res, entities_res) =
            tokio::join!(self.llm_intent(user_text), self.llm_entities(user_text));
        let (confidence_res, risk_res) =
            tokio::join!(self.llm_confidence(user_text), self.llm_risk(user_text));

        let intent = intent_res.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "intent sub-task fell back to rules");
            self.rules.intent(user_text)
        });
        let entities = entities_res.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "entity sub-task fell back to rules");
            self.rules.extract_entities(user_text)
        });
        let confidence = confidence_res.unwrap_or(FALLBACK_CONFIDENCE);
        let risk_level = risk_res.unwrap_or_else(|e| {
            tracing::debug!(error = %e, "risk sub-task fell back to rules");
            self.rules.risk(user_text)
        });

        let ambiguous_target = entities
            .iter()
            .all(|e| e.kind != EntityKind::Hostname && e.kind != EntityKind::IpAddress)
            && self.rules.has_ambiguity_keyword(user_text);

        Classification {
            intent,
            entities,
            confidence: confidence.clamp(0.0, 1.0),
            risk_level,
            ambiguous_target,
        }
    }

    async fn call(&self, system: &str, user_text: &str) -> Result<Value> {
        let request = CompletionRequest::new(user_text)
            .with_system(system)
            .with_max_tokens(256)
            .with_temperature(0.0);
        let response = tokio::time::timeout(self.call_timeout, self.llm.complete(request))
            .await
            .map_err(|_| Error::timeout(self.call_timeout.as_millis() as u64))??;
        extract_json(&response.content)
            .ok_or_else(|| Error::llm_api(self.llm.provider(), "no JSON object in response"))
    }

    async fn llm_intent(&self, user_text: &str) -> Result<Intent> {
        let json = self
            .call(
                "Classify the operator request. Respond with only JSON: \
                 {\"category\":\"information|action|diagnostic|unknown\",\"action\":\"<verb>\"}",
                user_text,
            )
            .await?;
        let category = match json.get("category").and_then(Value::as_str) {
            Some("information") => IntentCategory::Information,
            Some("action") => IntentCategory::Action,
            Some("diagnostic") => IntentCategory::Diagnostic,
            _ => IntentCategory::Unknown,
        };
        let action = json
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(Intent { category, action })
    }

    async fn llm_entities(&self, user_text: &str) -> Result<Vec<Entity>> {
        let json = self
            .call(
                "Extract entities from the operator request. Respond with only JSON: \
                 {\"entities\":[{\"kind\":\"hostname|ip_address|service|path|port|tag\",\
                 \"value\":\"...\"}]}",
                user_text,
            )
            .await?;
        let raw = json
            .get("entities")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::llm_api(self.llm.provider(), "missing entities array"))?;

        let mut entities = Vec::new();
        for item in raw {
            let kind = match item.get("kind").and_then(Value::as_str) {
                Some("hostname") => EntityKind::Hostname,
                Some("ip_address") => EntityKind::IpAddress,
                Some("service") => EntityKind::Service,
                Some("path") => EntityKind::Path,
                Some("port") => EntityKind::Port,
                Some("tag") => EntityKind::Tag,
                _ => continue,
            };
            if let Some(value) = item.get("value").and_then(Value::as_str) {
                entities.push(Entity::new(kind, value));
            }
        }
        Ok(entities)
    }

    async fn llm_confidence(&self, user_text: &str) -> Result<f64> {
        let json = self
            .call(
                "Rate how confidently this request can be automated. Respond with only \
                 JSON: {\"confidence\":<0.0-1.0>}",
                user_text,
            )
            .await?;
        json.get("confidence")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::llm_api(self.llm.provider(), "missing confidence"))
    }

    async fn llm_risk(&self, user_text: &str) -> Result<RiskLevel> {
        let json = self
            .call(
                "Assess the operational risk of this request. Respond with only JSON: \
                 {\"risk_level\":\"low|medium|high\"}",
                user_text,
            )
            .await?;
        match json.get("risk_level").and_then(Value::as_str) {
            Some("low") => Ok(RiskLevel::Low),
            Some("medium") => Ok(RiskLevel::Medium),
            Some("high") => Ok(RiskLevel::High),
            _ => Err(Error::llm_api(self.llm.provider(), "missing risk_level")),
        }
    }
}
