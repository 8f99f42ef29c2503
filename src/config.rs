//! Runtime configuration from the closed environment-variable set.
//!
//! Every recognized option is enumerated here; unknown environment variables
//! are ignored. The two secrets (`SECRETS_KMS_KEY`, `INTERNAL_KEY`) are
//! required and missing either is fatal at boot.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-stage timeout defaults, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    /// Stage A (classification)
    pub classify_ms: u64,
    /// Stage AB (selection)
    pub select_ms: u64,
    /// Stage C (planning)
    pub plan_ms: u64,
    /// Stage D (response formatting)
    pub respond_ms: u64,
    /// Any single LLM call
    pub llm_call_ms: u64,
    /// Default per-step execution timeout
    pub step_default_ms: u64,
    /// Hard cap on per-step execution timeout
    pub step_max_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            classify_ms: 3_000,
            select_ms: 5_000,
            plan_ms: 3_000,
            respond_ms: 4_000,
            llm_call_ms: 15_000,
            step_default_ms: 30_000,
            step_max_ms: 600_000,
        }
    }
}

impl StageTimeouts {
    /// Classification timeout as a [`Duration`].
    pub fn classify(&self) -> Duration {
        Duration::from_millis(self.classify_ms)
    }

    /// Selection timeout as a [`Duration`].
    pub fn select(&self) -> Duration {
        Duration::from_millis(self.select_ms)
    }

    /// Planning timeout as a [`Duration`].
    pub fn plan(&self) -> Duration {
        Duration::from_millis(self.plan_ms)
    }

    /// Response-formatting timeout as a [`Duration`].
    pub fn respond(&self) -> Duration {
        Duration::from_millis(self.respond_ms)
    }

    /// Per-LLM-call timeout as a [`Duration`].
    pub fn llm_call(&self) -> Duration {
        Duration::from_millis(self.llm_call_ms)
    }

    /// Clamp a tool-declared step timeout into the allowed range.
    pub fn clamp_step_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.step_default_ms)
            .min(self.step_max_ms)
    }
}

/// Core configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// `FEATURE_BYPASS_LLM`: route the echo tool without touching the LLM
    pub bypass_llm: bool,
    /// `SECRETS_KMS_KEY`: master symmetric key material (required)
    pub secrets_master_key: String,
    /// `INTERNAL_KEY`: service-to-service token (required)
    pub internal_key: String,
    /// `LLM_MAX_MODEL_LEN`: model context window in tokens
    pub llm_max_model_len: u32,
    /// `LLM_OUTPUT_RESERVE`: fraction of the window reserved for output
    pub llm_output_reserve: f64,
    /// `LLM_SAFETY_MARGIN`: additional fractional headroom on the input side
    pub llm_safety_margin: f64,
    /// `SELECTOR_CACHE_TTL_SEC`
    pub selector_cache_ttl_sec: u64,
    /// `SELECTOR_CACHE_MAX_ENTRIES`
    pub selector_cache_max_entries: usize,
    /// `SELECTOR_DEGRADED_ENABLE`: serve warm keys and 503 cold ones
    pub selector_degraded_enable: bool,
    /// `AUTOMATION_SERVICE_URL`
    pub automation_service_url: String,
    /// `COMMUNICATION_SERVICE_URL`
    pub communication_service_url: String,
    /// `ASSET_SERVICE_URL`
    pub asset_service_url: String,
    /// `NETWORK_SERVICE_URL`
    pub network_service_url: String,
    /// `AI_PIPELINE_BASE_URL`
    pub ai_pipeline_base_url: String,
    /// `EXEC_TIMEOUT_MS`: default per-request deadline
    pub exec_timeout_ms: u64,
    /// Per-stage timeouts (defaults; not environment-driven)
    pub timeouts: StageTimeouts,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl CoreConfig {
    /// Build the configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when a required secret is absent.
    pub fn from_env() -> Result<Self> {
        let secrets_master_key = env::var("SECRETS_KMS_KEY")
            .map_err(|_| Error::Config("SECRETS_KMS_KEY is required".to_string()))?;
        let internal_key = env::var("INTERNAL_KEY")
            .map_err(|_| Error::Config("INTERNAL_KEY is required".to_string()))?;

        Ok(Self {
            bypass_llm: env_bool("FEATURE_BYPASS_LLM", false),
            secrets_master_key,
            internal_key,
            llm_max_model_len: env_parse("LLM_MAX_MODEL_LEN", 8_192),
            llm_output_reserve: env_parse("LLM_OUTPUT_RESERVE", 0.30),
            llm_safety_margin: env_parse("LLM_SAFETY_MARGIN", 0.05),
            selector_cache_ttl_sec: env_parse("SELECTOR_CACHE_TTL_SEC", 300),
            selector_cache_max_entries: env_parse("SELECTOR_CACHE_MAX_ENTRIES", 1_024),
            selector_degraded_enable: env_bool("SELECTOR_DEGRADED_ENABLE", false),
            automation_service_url: env_string("AUTOMATION_SERVICE_URL", "http://localhost:8010"),
            communication_service_url: env_string(
                "COMMUNICATION_SERVICE_URL",
                "http://localhost:8011",
            ),
            asset_service_url: env_string("ASSET_SERVICE_URL", "http://localhost:8012"),
            network_service_url: env_string("NETWORK_SERVICE_URL", "http://localhost:8013"),
            ai_pipeline_base_url: env_string("AI_PIPELINE_BASE_URL", "http://localhost:8000"),
            exec_timeout_ms: env_parse("EXEC_TIMEOUT_MS", 60_000),
            timeouts: StageTimeouts::default(),
        })
    }

    /// Configuration with the given secrets and defaults everywhere else.
    pub fn with_keys(master_key: impl Into<String>, internal_key: impl Into<String>) -> Self {
        Self {
            bypass_llm: false,
            secrets_master_key: master_key.into(),
            internal_key: internal_key.into(),
            llm_max_model_len: 8_192,
            llm_output_reserve: 0.30,
            llm_safety_margin: 0.05,
            selector_cache_ttl_sec: 300,
            selector_cache_max_entries: 1_024,
            selector_degraded_enable: false,
            automation_service_url: "http://localhost:8010".to_string(),
            communication_service_url: "http://localhost:8011".to_string(),
            asset_service_url: "http://localhost:8012".to_string(),
            network_service_url: "http://localhost:8013".to_string(),
            ai_pipeline_base_url: "http://localhost:8000".to_string(),
            exec_timeout_ms: 60_000,
            timeouts: StageTimeouts::default(),
        }
    }

    /// Enable the LLM bypass (echo tool) path.
    pub fn with_bypass_llm(mut self, enabled: bool) -> Self {
        self.bypass_llm = enabled;
        self
    }

    /// Override the model context window.
    pub fn with_max_model_len(mut self, tokens: u32) -> Self {
        self.llm_max_model_len = tokens;
        self
    }

    /// Per-request deadline as a [`Duration`].
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_timeout_defaults() {
        let t = StageTimeouts::default();
        assert_eq!(t.classify_ms, 3_000);
        assert_eq!(t.select_ms, 5_000);
        assert_eq!(t.plan_ms, 3_000);
        assert_eq!(t.respond_ms, 4_000);
        assert_eq!(t.llm_call_ms, 15_000);
    }

    #[test]
    fn test_step_timeout_clamping() {
        let t = StageTimeouts::default();
        assert_eq!(t.clamp_step_ms(None), 30_000);
        assert_eq!(t.clamp_step_ms(Some(5_000)), 5_000);
        assert_eq!(t.clamp_step_ms(Some(3_600_000)), 600_000);
    }

    #[test]
    fn test_with_keys_defaults() {
        let cfg = CoreConfig::with_keys("master", "internal");
        assert!(!cfg.bypass_llm);
        assert_eq!(cfg.llm_max_model_len, 8_192);
        assert_eq!(cfg.llm_output_reserve, 0.30);
        assert_eq!(cfg.selector_cache_ttl_sec, 300);
        assert_eq!(cfg.request_deadline(), Duration::from_millis(60_000));
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = CoreConfig::with_keys("m", "i")
            .with_bypass_llm(true)
            .with_max_model_len(4_096);
        assert!(cfg.bypass_llm);
        assert_eq!(cfg.llm_max_model_len, 4_096);
    }
}
