//! # opsconductor-core
//!
//! The AI orchestration core of an IT automation platform: turns a
//! natural-language operator request into a validated, safely executed
//! multi-step plan over a heterogeneous fleet of Windows/Linux/cloud/
//! network targets.
//!
//! ## Core Components
//!
//! - **Pipeline**: the staged request path — classify, select, plan,
//!   respond, execute
//! - **Catalog**: the tool index store with vector and lexical retrieval
//!   and selector telemetry
//! - **Secrets**: the encrypted credential broker with audited reads
//! - **Assets**: the read-only inventory façade with platform
//!   normalization
//! - **Server**: the HTTP ingress with trace propagation and metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use opsconductor_core::{CoreConfig, Orchestrator, PipelineRequest, TraceId};
//!
//! let config = CoreConfig::from_env()?;
//! let orchestrator = Orchestrator::new(config, services);
//!
//! let outcome = orchestrator
//!     .handle(PipelineRequest::new("list files on 192.168.50.211", TraceId::generate()))
//!     .await?;
//! println!("{}", outcome.response_text);
//! ```

pub mod assets;
pub mod cache;
pub mod canary;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod redact;
pub mod secrets;
pub mod server;
pub mod trace;

// Re-exports for convenience
pub use assets::{
    Asset, AssetFacade, AssetFilters, ConnectionProfile, HttpAssetFacade, ServiceBinding,
    StaticAssetFacade,
};
pub use cache::{CacheKey, CacheStats, SelectorCache};
pub use canary::{BurnSeverity, GateDecision, SloGate, WindowSample};
pub use catalog::{
    CommandStrategy, ConnectionType, CostHint, ExecutionLocation, ExecutionType, FullToolSpec,
    MinimalRow, ParameterFormat, ParameterSpec, Platform, PreferenceScores, RetryPolicy,
    SearchHit, SelectorTelemetry, SqliteToolIndex, TelemetryAlert, ToolIndexEntry,
};
pub use config::{CoreConfig, StageTimeouts};
pub use embedding::{cosine_similarity, EmbeddingService};
pub use error::{Error, MissingKind, Result};
pub use llm::{
    ChatCompletionsClient, ChatMessage, ChatRole, ClientConfig, CompletionRequest,
    CompletionResponse, EmbeddingRequest, EmbeddingResponse, LlmClient, RowBudget, StopReason,
    TokenBudget, TokenUsage,
};
pub use metrics::CoreMetrics;
pub use orchestrator::{Orchestrator, PipelineOutcome, PipelineRequest, PipelineServices};
pub use pipeline::classify::{Classifier, RuleClassifier};
pub use pipeline::context::ExecutionContext;
pub use pipeline::execute::{
    CollaboratorClient, Dispatcher, DispatcherConfig, EnvelopePlan, EnvelopeRequest,
    EnvelopeResponse, EnvelopeStep, EnvelopeStepResult, HttpCollaborators,
};
pub use pipeline::plan::Planner;
pub use pipeline::respond::{Responder, ResponseStream, ResponseToken};
pub use pipeline::scoring::PreferenceMode;
pub use pipeline::select::{Selector, SelectorConfig, SelectorContext};
pub use pipeline::types::{
    Classification, Entity, EntityKind, ExecutionPlan, ExecutionResult, Intent, IntentCategory,
    NextStage, ParameterDescriptor, PlanState, PlanStep, ResponseType, RiskLevel, SelectionV1,
    StepResult, StepStatus, ToolChoice,
};
pub use redact::SecretRedactor;
pub use secrets::{ResolvedCredential, SecretsBroker};
pub use server::{build_router, serve, AppState};
pub use trace::{TraceId, TRACE_HEADER};
