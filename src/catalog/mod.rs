//! Tool catalog: minimal index entries, full specs, and the SQLite store
//! with vector, lexical, and telemetry operations.

mod schema;
mod store;
mod telemetry;
mod types;

pub use store::{SearchHit, SqliteToolIndex};
pub use telemetry::{AlertKind, SelectorTelemetry, TelemetryAlert};
pub use types::{
    CommandStrategy, ConnectionType, CostHint, ExecutionLocation, ExecutionType, FullToolSpec,
    MinimalRow, ParameterFormat, ParameterSpec, Platform, PreferenceScores, RetryPolicy,
    ToolIndexEntry, MAX_DESC_LEN, MAX_NAME_LEN, MAX_TAGS,
};
