//! Trace-ID generation and propagation.
//!
//! Every external ingress accepts an optional `X-Trace-Id` header; when
//! absent a UUID v4 is generated. The id rides on every downstream call and
//! is echoed in every response body and header.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the trace id in and out of every service hop.
pub const TRACE_HEADER: &str = "x-trace-id";

/// An end-to-end request trace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a fresh trace id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Use the caller-provided id when present, otherwise generate one.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => Self(v.trim().to_string()),
            _ => Self::generate(),
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
