//! Error types for opsconductor-core.

use thiserror::Error;

use crate::pipeline::types::ParameterDescriptor;

/// Result type alias using opsconductor-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which class of caller-suppliable input is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingKind {
    /// Free parameters required by the selected tool
    Params,
    /// Credentials for the target host
    Credentials,
    /// The target asset itself could not be determined
    TargetInfo,
}

impl MissingKind {
    /// Stable user-visible code for this class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Params => "missing_params",
            Self::Credentials => "missing_credentials",
            Self::TargetInfo => "missing_target_info",
        }
    }
}

/// Errors that can occur along the request-to-execution pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// The request cannot proceed until the caller supplies more inputs.
    /// Not a failure: carries descriptors the UI renders into a prompt.
    #[error("{} ({} descriptor(s))", kind.code(), descriptors.len())]
    MissingInputs {
        kind: MissingKind,
        descriptors: Vec<ParameterDescriptor>,
    },

    /// A collaborator or backing service could not be reached
    #[error("upstream unreachable: {service} - {message}")]
    Upstream { service: String, message: String },

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Durable storage error (tool index, telemetry, credential store)
    #[error("storage error: {0}")]
    Storage(String),

    /// Credential encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Missing or invalid service-to-service token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The produced plan violates a structural invariant (e.g. a cycle)
    #[error("invalid plan: {0}")]
    PlanInvalid(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a missing-params error with descriptors.
    pub fn missing_params(descriptors: Vec<ParameterDescriptor>) -> Self {
        Self::MissingInputs {
            kind: MissingKind::Params,
            descriptors,
        }
    }

    /// Create a missing-credentials error with descriptors.
    pub fn missing_credentials(descriptors: Vec<ParameterDescriptor>) -> Self {
        Self::MissingInputs {
            kind: MissingKind::Credentials,
            descriptors,
        }
    }

    /// Create an upstream-unreachable error.
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Short stable code surfaced to callers alongside the human message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::MissingInputs { kind, .. } => kind.code(),
            Self::Upstream { .. } => "upstream_unreachable",
            Self::Timeout { .. } => "timeout",
            Self::LlmApi { .. } => "llm_error",
            Self::Storage(_) => "storage_error",
            Self::Crypto(_) => "decrypt_failed",
            Self::Unauthorized(_) => "invalid_service_token",
            Self::NotFound(_) => "not_found",
            Self::PlanInvalid(_) => "plan_invalid",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to at the ingress.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::MissingInputs { .. } => 422,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::PlanInvalid(_) => 422,
            Self::Upstream { .. } | Self::LlmApi { .. } => 502,
            Self::Timeout { .. } => 504,
            Self::Storage(_) | Self::Crypto(_) | Self::Config(_) => 500,
            Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::validation("empty input").code(), "validation");
        assert_eq!(Error::missing_params(vec![]).code(), "missing_params");
        assert_eq!(
            Error::missing_credentials(vec![]).code(),
            "missing_credentials"
        );
        assert_eq!(
            Error::upstream("automation", "connection refused").code(),
            "upstream_unreachable"
        );
        assert_eq!(Error::timeout(5000).code(), "timeout");
        assert_eq!(Error::PlanInvalid("cycle".into()).code(), "plan_invalid");
        assert_eq!(
            Error::Unauthorized("bad key".into()).code(),
            "invalid_service_token"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::validation("x").http_status(), 400);
        assert_eq!(Error::missing_params(vec![]).http_status(), 422);
        assert_eq!(Error::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::upstream("llm", "down").http_status(), 502);
        assert_eq!(Error::timeout(1).http_status(), 504);
        assert_eq!(Error::Crypto("bad tag".into()).http_status(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::upstream("asset", "refused").is_transient());
        assert!(Error::timeout(100).is_transient());
        assert!(!Error::validation("x").is_transient());
        assert!(!Error::Crypto("x".into()).is_transient());
    }
}
