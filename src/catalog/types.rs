//! Tool catalog types: closed enums, minimal index entries, full specs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a tool name.
pub const MAX_NAME_LEN: usize = 48;
/// Maximum length of a short description.
pub const MAX_DESC_LEN: usize = 110;
/// Maximum number of tags per entry.
pub const MAX_TAGS: usize = 6;

/// Target platform of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Windows,
    Linux,
    MultiPlatform,
    Cloud,
    Network,
    Database,
    Custom,
}

impl Platform {
    /// Whether an entry with this platform passes the given filter.
    /// Multi-platform tools pass every filter.
    pub fn passes_filter(&self, filter: Platform) -> bool {
        *self == filter || *self == Platform::MultiPlatform
    }

    /// All platform values, for query validation.
    pub fn parse(s: &str) -> Option<Platform> {
        match s.to_lowercase().as_str() {
            "windows" => Some(Self::Windows),
            "linux" => Some(Self::Linux),
            "multi-platform" | "multi_platform" => Some(Self::MultiPlatform),
            "cloud" => Some(Self::Cloud),
            "network" => Some(Self::Network),
            "database" => Some(Self::Database),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::MultiPlatform => "multi-platform",
            Self::Cloud => "cloud",
            Self::Network => "network",
            Self::Database => "database",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// Which collaborator service executes a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLocation {
    #[default]
    Automation,
    Communication,
    Asset,
    Network,
    Custom,
}

impl std::fmt::Display for ExecutionLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Automation => "automation",
            Self::Communication => "communication",
            Self::Asset => "asset",
            Self::Network => "network",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// How a tool's work is expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Command,
    Query,
    Api,
    Script,
}

/// Transport used to reach the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Powershell,
    Ssh,
    #[default]
    Local,
    Http,
    Database,
    Impacket,
}

impl ConnectionType {
    /// Credential purpose key for broker lookups over this transport.
    pub fn credential_purpose(&self) -> &'static str {
        match self {
            Self::Powershell => "winrm",
            Self::Ssh => "ssh",
            Self::Local => "local",
            Self::Http => "http",
            Self::Database => "database",
            Self::Impacket => "smb",
        }
    }
}

/// How the command string is assembled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStrategy {
    Cmdlet,
    #[default]
    Cli,
    Query,
    ApiCall,
    Script,
    Template,
}

/// Formatting convention for rendered parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterFormat {
    Powershell,
    #[default]
    Posix,
    Windows,
    Custom,
    Json,
}

/// Relative execution cost of a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostHint {
    #[default]
    Low,
    Med,
    High,
}

impl std::fmt::Display for CostHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Med => "med",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Minimal catalog entry: the searchable, LLM-visible projection of a tool.
/// Never carries secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolIndexEntry {
    /// Stable identifier
    pub id: String,
    /// Display name, truncated to [`MAX_NAME_LEN`]
    pub name: String,
    /// Short description, truncated to [`MAX_DESC_LEN`], never empty
    pub desc_short: String,
    /// Target platform
    pub platform: Platform,
    /// Up to [`MAX_TAGS`] tags
    pub tags: Vec<String>,
    /// Relative cost
    pub cost_hint: CostHint,
    /// Dense embedding; present on every stored row, omitted in search results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl ToolIndexEntry {
    /// Build an entry, applying the length invariants.
    pub fn new(
        id: impl Into<String>,
        name: &str,
        desc_short: &str,
        platform: Platform,
    ) -> Self {
        let desc = if desc_short.is_empty() { name } else { desc_short };
        Self {
            id: id.into(),
            name: truncate(name, MAX_NAME_LEN),
            desc_short: truncate(desc, MAX_DESC_LEN),
            platform,
            tags: Vec::new(),
            cost_hint: CostHint::default(),
            embedding: None,
            updated_at: Utc::now(),
        }
    }

    /// Attach tags, keeping at most [`MAX_TAGS`].
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).take(MAX_TAGS).collect();
        self
    }

    pub fn with_cost_hint(mut self, cost_hint: CostHint) -> Self {
        self.cost_hint = cost_hint;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The LLM-visible projection of this entry.
    pub fn minimal_row(&self) -> MinimalRow {
        MinimalRow {
            id: self.id.clone(),
            name: self.name.clone(),
            desc_short: self.desc_short.clone(),
            tags: self.tags.clone(),
            platform: self.platform,
            cost_hint: self.cost_hint,
        }
    }
}

/// The projection sent to the LLM during selection. Never the full spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalRow {
    pub id: String,
    pub name: String,
    pub desc_short: String,
    pub tags: Vec<String>,
    pub platform: Platform,
    pub cost_hint: CostHint,
}

/// Declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name as dispatched
    pub name: String,
    /// Value type hint ("string", "int", "bool", "list")
    pub param_type: String,
    /// Whether the tool cannot run without it
    pub required: bool,
    /// Whether the value must never be echoed back
    #[serde(default)]
    pub secret: bool,
    /// Validation regex applied before dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    /// Hint rendered to the operator when prompting for the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required: true,
            secret: false,
            validation: None,
            hint: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type)
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
}

/// Preference scores in [0, 1] used by deterministic selection scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreferenceScores {
    pub speed: f32,
    pub accuracy: f32,
    pub complexity: f32,
}

impl Default for PreferenceScores {
    fn default() -> Self {
        Self {
            speed: 0.5,
            accuracy: 0.5,
            complexity: 0.5,
        }
    }
}

impl PreferenceScores {
    pub fn new(speed: f32, accuracy: f32, complexity: f32) -> Self {
        Self {
            speed: speed.clamp(0.0, 1.0),
            accuracy: accuracy.clamp(0.0, 1.0),
            complexity: complexity.clamp(0.0, 1.0),
        }
    }
}

/// Retry policy attached to plan steps from tool metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff, doubled per attempt
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 500,
        }
    }
}

/// Full tool specification, loaded lazily for planning and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullToolSpec {
    /// The minimal entry this spec extends
    pub entry: ToolIndexEntry,
    /// Which collaborator service runs it
    pub execution_location: ExecutionLocation,
    /// Work expression
    pub execution_type: ExecutionType,
    /// Target transport
    pub connection_type: ConnectionType,
    /// Command assembly strategy
    pub command_strategy: CommandStrategy,
    /// Parameter rendering convention
    pub parameter_format: ParameterFormat,
    /// Declared parameters
    pub parameters: Vec<ParameterSpec>,
    /// Whether a human must approve before execution
    pub requires_approval: bool,
    /// Whether the executor must resolve credentials
    pub requires_credentials: bool,
    /// Tool-declared redaction patterns applied to its output
    #[serde(default)]
    pub redact_patterns: Vec<String>,
    /// Preference scores for deterministic ranking
    pub preferences: PreferenceScores,
    /// Retry policy for dispatch failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Declared step timeout; clamped by the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Catalog-declared allowlist membership: always in the candidate pool
    #[serde(default)]
    pub always_include: bool,
}

impl FullToolSpec {
    /// Spec with defaults around a minimal entry.
    pub fn new(entry: ToolIndexEntry) -> Self {
        Self {
            entry,
            execution_location: ExecutionLocation::default(),
            execution_type: ExecutionType::default(),
            connection_type: ConnectionType::default(),
            command_strategy: CommandStrategy::default(),
            parameter_format: ParameterFormat::default(),
            parameters: Vec::new(),
            requires_approval: false,
            requires_credentials: false,
            redact_patterns: Vec::new(),
            preferences: PreferenceScores::default(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            always_include: false,
        }
    }

    /// Names of parameters the tool cannot run without.
    pub fn required_inputs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|p| p.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_platform_filter_matching() {
        assert!(Platform::Windows.passes_filter(Platform::Windows));
        assert!(Platform::MultiPlatform.passes_filter(Platform::Windows));
        assert!(Platform::MultiPlatform.passes_filter(Platform::Linux));
        assert!(!Platform::Linux.passes_filter(Platform::Windows));
    }

    #[test]
    fn test_platform_parse_round_trip() {
        for p in [
            Platform::Windows,
            Platform::Linux,
            Platform::MultiPlatform,
            Platform::Cloud,
            Platform::Network,
            Platform::Database,
            Platform::Custom,
        ] {
            assert_eq!(Platform::parse(&p.to_string()), Some(p));
        }
        assert_eq!(Platform::parse("solaris"), None);
    }

    #[test]
    fn test_entry_truncation() {
        let long_name = "n".repeat(100);
        let long_desc = "d".repeat(300);
        let entry = ToolIndexEntry::new("t1", &long_name, &long_desc, Platform::Linux);
        assert_eq!(entry.name.len(), MAX_NAME_LEN);
        assert_eq!(entry.desc_short.len(), MAX_DESC_LEN);
    }

    #[test]
    fn test_empty_desc_falls_back_to_name() {
        let entry = ToolIndexEntry::new("t1", "systemctl-restart", "", Platform::Linux);
        assert_eq!(entry.desc_short, "systemctl-restart");
    }

    #[test]
    fn test_tags_capped() {
        let entry = ToolIndexEntry::new("t1", "x", "y", Platform::Linux)
            .with_tags(["a", "b", "c", "d", "e", "f", "g", "h"]);
        assert_eq!(entry.tags.len(), MAX_TAGS);
    }

    #[test]
    fn test_minimal_row_has_no_embedding() {
        let entry = ToolIndexEntry::new("t1", "x", "y", Platform::Linux)
            .with_embedding(vec![0.1, 0.2]);
        let row = serde_json::to_value(entry.minimal_row()).unwrap();
        assert!(row.get("embedding").is_none());
        assert_eq!(row["platform"], "linux");
    }

    #[test]
    fn test_preference_scores_clamped() {
        let p = PreferenceScores::new(1.5, -0.2, 0.5);
        assert_eq!(p.speed, 1.0);
        assert_eq!(p.accuracy, 0.0);
        assert_eq!(p.complexity, 0.5);
    }

    #[test]
    fn test_credential_purpose_mapping() {
        assert_eq!(ConnectionType::Powershell.credential_purpose(), "winrm");
        assert_eq!(ConnectionType::Ssh.credential_purpose(), "ssh");
        assert_eq!(ConnectionType::Database.credential_purpose(), "database");
    }
}
