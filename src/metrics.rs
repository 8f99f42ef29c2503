//! Prometheus metrics for the pipeline and selector.
//!
//! One registry per core instance, injected into the orchestrator and the
//! ingress. Families follow the published contract: counters for request
//! outcomes, histograms covering sub-second to ~10s, gauges for cache state
//! and build info. `render` emits the text exposition format with `# HELP`
//! and `# TYPE` annotations.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Histogram buckets covering sub-second to ~10s latencies.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metric families owned by a core instance.
#[derive(Clone)]
pub struct CoreMetrics {
    registry: Registry,
    ai_requests_total: IntCounterVec,
    ai_request_errors_total: IntCounterVec,
    ai_request_duration_seconds: HistogramVec,
    selector_requests_total: IntCounterVec,
    selector_request_duration_seconds: Histogram,
    selector_db_errors_total: IntCounter,
    selector_budget_truncations_total: IntCounter,
    selector_cache_entries: IntGauge,
    selector_cache_ttl_seconds: IntGauge,
    pipeline_stage_duration_seconds: HistogramVec,
}

impl CoreMetrics {
    /// Create and register all metric families.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ai_requests_total = IntCounterVec::new(
            Opts::new("ai_requests_total", "AI requests by outcome and tool"),
            &["status", "tool"],
        )
        .map_err(internal)?;

        let ai_request_errors_total = IntCounterVec::new(
            Opts::new(
                "ai_request_errors_total",
                "AI request errors by reason and tool",
            ),
            &["reason", "tool"],
        )
        .map_err(internal)?;

        let ai_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ai_request_duration_seconds",
                "End-to-end AI request duration",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["tool"],
        )
        .map_err(internal)?;

        let selector_requests_total = IntCounterVec::new(
            Opts::new(
                "selector_requests_total",
                "Selector requests by outcome and source",
            ),
            &["status", "source"],
        )
        .map_err(internal)?;

        let selector_request_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "selector_request_duration_seconds",
                "Selector request duration",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )
        .map_err(internal)?;

        let selector_db_errors_total = IntCounter::new(
            "selector_db_errors_total",
            "Tool index store errors observed by the selector",
        )
        .map_err(internal)?;

        let selector_budget_truncations_total = IntCounter::new(
            "selector_budget_truncations_total",
            "Candidate lists truncated by the token budget",
        )
        .map_err(internal)?;

        let selector_cache_entries =
            IntGauge::new("selector_cache_entries", "Live selector cache entries")
                .map_err(internal)?;

        let selector_cache_ttl_seconds = IntGauge::new(
            "selector_cache_ttl_seconds",
            "Configured selector cache TTL",
        )
        .map_err(internal)?;

        let selector_build_info = IntGaugeVec::new(
            Opts::new("selector_build_info", "Build metadata, value is always 1"),
            &["version", "git_commit", "built_at"],
        )
        .map_err(internal)?;

        let pipeline_stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_stage_duration_seconds",
                "Per-stage pipeline duration",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["stage"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(ai_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(ai_request_errors_total.clone()),
            Box::new(ai_request_duration_seconds.clone()),
            Box::new(selector_requests_total.clone()),
            Box::new(selector_request_duration_seconds.clone()),
            Box::new(selector_db_errors_total.clone()),
            Box::new(selector_budget_truncations_total.clone()),
            Box::new(selector_cache_entries.clone()),
            Box::new(selector_cache_ttl_seconds.clone()),
            Box::new(selector_build_info.clone()),
            Box::new(pipeline_stage_duration_seconds.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        selector_build_info
            .with_label_values(&[
                env!("CARGO_PKG_VERSION"),
                option_env!("GIT_COMMIT").unwrap_or("unknown"),
                option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
            ])
            .set(1);

        Ok(Self {
            registry,
            ai_requests_total,
            ai_request_errors_total,
            ai_request_duration_seconds,
            selector_requests_total,
            selector_request_duration_seconds,
            selector_db_errors_total,
            selector_budget_truncations_total,
            selector_cache_entries,
            selector_cache_ttl_seconds,
            pipeline_stage_duration_seconds,
        })
    }

    /// Record a completed AI request.
    pub fn record_ai_request(&self, status: &str, tool: &str, duration: Duration) {
        self.ai_requests_total
            .with_label_values(&[status, tool])
            .inc();
        self.ai_request_duration_seconds
            .with_label_values(&[tool])
            .observe(duration.as_secs_f64());
    }

    /// Record an AI request error by stable reason code.
    pub fn record_ai_error(&self, reason: &str, tool: &str) {
        self.ai_request_errors_total
            .with_label_values(&[reason, tool])
            .inc();
    }

    /// Record a selector request outcome.
    pub fn record_selector_request(&self, status: &str, source: &str, duration: Duration) {
        self.selector_requests_total
            .with_label_values(&[status, source])
            .inc();
        self.selector_request_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Count a tool index store error seen by the selector.
    pub fn inc_selector_db_error(&self) {
        self.selector_db_errors_total.inc();
    }

    /// Count a candidate list truncated by the token budget.
    pub fn inc_budget_truncation(&self) {
        self.selector_budget_truncations_total.inc();
    }

    /// Publish current cache state.
    pub fn set_cache_state(&self, entries: i64, ttl_seconds: i64) {
        self.selector_cache_entries.set(entries);
        self.selector_cache_ttl_seconds.set(ttl_seconds);
    }

    /// Record a pipeline stage duration.
    pub fn record_stage(&self, stage: &str, duration: Duration) {
        self.pipeline_stage_duration_seconds
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

fn internal(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_help_and_type() {
        let m = CoreMetrics::new().unwrap();
        m.record_ai_request("success", "echo", Duration::from_millis(12));
        let text = m.render();
        assert!(text.contains("# HELP ai_requests_total"));
        assert!(text.contains("# TYPE ai_requests_total counter"));
        assert!(text.contains(r#"ai_requests_total{status="success",tool="echo"} 1"#));
    }

    #[test]
    fn test_build_info_present() {
        let m = CoreMetrics::new().unwrap();
        let text = m.render();
        assert!(text.contains("selector_build_info"));
        assert!(text.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_stage_histogram_observes() {
        let m = CoreMetrics::new().unwrap();
        m.record_stage("classify", Duration::from_millis(50));
        m.record_stage("select", Duration::from_millis(120));
        let text = m.render();
        assert!(text.contains(r#"pipeline_stage_duration_seconds_count{stage="classify"} 1"#));
        assert!(text.contains(r#"pipeline_stage_duration_seconds_count{stage="select"} 1"#));
    }

    #[test]
    fn test_cache_gauges() {
        let m = CoreMetrics::new().unwrap();
        m.set_cache_state(7, 300);
        let text = m.render();
        assert!(text.contains("selector_cache_entries 7"));
        assert!(text.contains("selector_cache_ttl_seconds 300"));
    }
}
