//! Release and canary gating over rolling metric windows.
//!
//! Canary rollout splits traffic in steps and only advances while the
//! metrics gate holds: error rate under budget and tail latency under the
//! targets. Burn rate compares the observed error rate against the error
//! budget; fast burn pages, slow burn warns. Rollback is a feature-flag
//! flip, so the gate only ever reports, never mutates.

use serde::{Deserialize, Serialize};

/// Traffic percentages a canary walks through.
pub const ROLLOUT_STEPS: &[u8] = &[10, 50, 100];

/// Fast-burn multiplier: page immediately.
pub const FAST_BURN: f64 = 14.4;
/// Slow-burn multiplier: warn.
pub const SLOW_BURN: f64 = 6.0;

/// One rolling window of request observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSample {
    pub total: u64,
    pub errors: u64,
    pub p95_seconds: f64,
    pub p99_seconds: f64,
}

impl WindowSample {
    /// Observed error rate; an empty window counts as clean.
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.errors as f64 / self.total as f64
    }
}

/// Alert severity derived from the burn rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnSeverity {
    None,
    Warning,
    Critical,
}

/// Gate verdict over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub pass: bool,
    pub burn_rate: f64,
    pub severity: BurnSeverity,
    /// Human-readable reasons for a failing gate
    pub reasons: Vec<String>,
}

/// SLO thresholds enforced by the metrics gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloGate {
    /// Error budget as a rate (default 1%)
    pub error_budget: f64,
    /// p95 latency target in seconds
    pub p95_target: f64,
    /// p99 latency target in seconds
    pub p99_target: f64,
}

impl Default for SloGate {
    fn default() -> Self {
        Self {
            error_budget: 0.01,
            p95_target: 1.0,
            p99_target: 2.0,
        }
    }
}

impl SloGate {
    /// Burn rate: observed error rate as a multiple of the budget.
    pub fn burn_rate(&self, window: &WindowSample) -> f64 {
        if self.error_budget <= 0.0 {
            return 0.0;
        }
        window.error_rate() / self.error_budget
    }

    /// Severity from the burn rate thresholds.
    pub fn severity(&self, burn_rate: f64) -> BurnSeverity {
        if burn_rate >= FAST_BURN {
            BurnSeverity::Critical
        } else if burn_rate >= SLOW_BURN {
            BurnSeverity::Warning
        } else {
            BurnSeverity::None
        }
    }

    /// Evaluate one window against the gate.
    pub fn evaluate(&self, window: &WindowSample) -> GateDecision {
        let mut reasons = Vec::new();
        let error_rate = window.error_rate();
        if error_rate >= self.error_budget {
            reasons.push(format!(
                "error rate {:.3}% at or over budget {:.3}%",
                error_rate * 100.0,
                self.error_budget * 100.0
            ));
        }
        if window.p95_seconds >= self.p95_target {
            reasons.push(format!(
                "p95 {:.3}s at or over target {:.3}s",
                window.p95_seconds, self.p95_target
            ));
        }
        if window.p99_seconds >= self.p99_target {
            reasons.push(format!(
                "p99 {:.3}s at or over target {:.3}s",
                window.p99_seconds, self.p99_target
            ));
        }

        let burn_rate = self.burn_rate(window);
        GateDecision {
            pass: reasons.is_empty(),
            burn_rate,
            severity: self.severity(burn_rate),
            reasons,
        }
    }

    /// Next rollout step after `current` percent, only while the gate holds.
    pub fn next_step(&self, current: u8, window: &WindowSample) -> Option<u8> {
        if !self.evaluate(window).pass {
            return None;
        }
        ROLLOUT_STEPS.iter().copied().find(|&step| step > current)
    }
}
