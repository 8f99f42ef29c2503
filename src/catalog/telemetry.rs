//! Selector telemetry rows and the derived alert view.
//!
//! One row per selector request, written before the selection response
//! returns. Stage E fills in the executed ids afterwards, which is when
//! recall@K becomes known.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::catalog::store::SqliteToolIndex;
use crate::error::{Error, Result};

/// Alert thresholds over the telemetry stream.
const MIN_HEADROOM_PCT: f64 = 0.15;
const MIN_RECALL: f64 = 0.98;

/// One selector request's telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorTelemetry {
    /// Request id (also the trace id at the ingress)
    pub request_id: String,
    /// Catalog size at query time
    pub catalog_size: usize,
    /// Candidates found before the token budget was applied
    pub candidates_before_budget: usize,
    /// Rows actually sent to the LLM
    pub rows_sent: usize,
    /// Estimated prompt tokens spent on the index rows
    pub budget_used_tokens: u32,
    /// Fraction of the input allowance left unused
    pub headroom_left_pct: f64,
    /// The candidate pool ids (for recall computation)
    pub pool_ids: Vec<String>,
    /// Tools the selector chose
    pub selected_ids: Vec<String>,
    /// Tools Stage E actually dispatched (filled in later)
    pub executed_ids: Vec<String>,
    /// Fraction of executed tools present in the pool; `None` until executed
    pub recall_at_k: Option<f64>,
    /// Times the candidate list was truncated by the budget
    pub truncation_events: u32,
    /// Whether the computed row cap fell below the floor and was clamped
    pub budget_clamped: bool,
    /// Whether the LLM tie-break was attempted
    pub tie_break_attempted: bool,
    /// Per-stage timings in milliseconds
    pub stage_timings_ms: HashMap<String, u64>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
}

impl SelectorTelemetry {
    /// Empty row for a request id.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            catalog_size: 0,
            candidates_before_budget: 0,
            rows_sent: 0,
            budget_used_tokens: 0,
            headroom_left_pct: 1.0,
            pool_ids: Vec::new(),
            selected_ids: Vec::new(),
            executed_ids: Vec::new(),
            recall_at_k: None,
            truncation_events: 0,
            budget_clamped: false,
            tie_break_attempted: false,
            stage_timings_ms: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Kind of derived telemetry alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowHeadroom,
    LowRecall,
    BudgetTruncation,
}

/// A derived alert over one telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryAlert {
    pub request_id: String,
    pub kind: AlertKind,
    pub detail: String,
}

impl SqliteToolIndex {
    /// Append one telemetry row; replaces an existing row for the request.
    pub fn log_telemetry(&self, row: &SelectorTelemetry) -> Result<()> {
        let pool_ids = serde_json::to_string(&row.pool_ids)?;
        let selected_ids = serde_json::to_string(&row.selected_ids)?;
        let executed_ids = serde_json::to_string(&row.executed_ids)?;
        let stage_timings = serde_json::to_string(&row.stage_timings_ms)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO selector_telemetry (
                    request_id, catalog_size, candidates_before_budget, rows_sent,
                    budget_used_tokens, headroom_left_pct, pool_ids, selected_ids,
                    executed_ids, recall_at_k, truncation_events, budget_clamped,
                    tie_break_attempted, stage_timings, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.request_id,
                    row.catalog_size as i64,
                    row.candidates_before_budget as i64,
                    row.rows_sent as i64,
                    i64::from(row.budget_used_tokens),
                    row.headroom_left_pct,
                    pool_ids,
                    selected_ids,
                    executed_ids,
                    row.recall_at_k,
                    i64::from(row.truncation_events),
                    row.budget_clamped as i32,
                    row.tie_break_attempted as i32,
                    stage_timings,
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Record the tools Stage E dispatched for a request, computing recall.
    pub fn record_executed(&self, request_id: &str, executed_ids: &[String]) -> Result<()> {
        let pool_raw: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT pool_ids FROM selector_telemetry WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        let pool_raw =
            pool_raw.ok_or_else(|| Error::NotFound(format!("telemetry row {request_id}")))?;
        let pool: Vec<String> = serde_json::from_str(&pool_raw).unwrap_or_default();

        let recall = if executed_ids.is_empty() {
            1.0
        } else {
            let hit = executed_ids.iter().filter(|id| pool.contains(id)).count();
            hit as f64 / executed_ids.len() as f64
        };
        let executed = serde_json::to_string(executed_ids)?;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE selector_telemetry
                 SET executed_ids = ?2, recall_at_k = ?3
                 WHERE request_id = ?1",
                params![request_id, executed, recall],
            )?;
            Ok(())
        })
    }

    /// Derived alerts over the most recent `limit` telemetry rows.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<TelemetryAlert>> {
        let rows: Vec<(String, f64, Option<f64>, i64)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, headroom_left_pct, recall_at_k, truncation_events
                 FROM selector_telemetry ORDER BY created_at DESC LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect()
        })?;

        let mut alerts = Vec::new();
        for (request_id, headroom, recall, truncations) in rows {
            if headroom < MIN_HEADROOM_PCT {
                alerts.push(TelemetryAlert {
                    request_id: request_id.clone(),
                    kind: AlertKind::LowHeadroom,
                    detail: format!("headroom {:.1}% below {:.0}%", headroom * 100.0, MIN_HEADROOM_PCT * 100.0),
                });
            }
            if let Some(r) = recall {
                if r < MIN_RECALL {
                    alerts.push(TelemetryAlert {
                        request_id: request_id.clone(),
                        kind: AlertKind::LowRecall,
                        detail: format!("recall {r:.3} below {MIN_RECALL}"),
                    });
                }
            }
            if truncations > 0 {
                alerts.push(TelemetryAlert {
                    request_id,
                    kind: AlertKind::BudgetTruncation,
                    detail: format!("{truncations} truncation event(s)"),
                });
            }
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(id: &str) -> SelectorTelemetry {
        let mut row = SelectorTelemetry::new(id);
        row.catalog_size = 3;
        row.candidates_before_budget = 3;
        row.rows_sent = 3;
        row.budget_used_tokens = 435;
        row.headroom_left_pct = 0.92;
        row.pool_ids = vec!["a".into(), "b".into(), "c".into()];
        row.selected_ids = vec!["a".into()];
        row
    }

    #[test]
    fn test_log_and_no_alerts_when_healthy() {
        let index = SqliteToolIndex::in_memory().unwrap();
        index.log_telemetry(&row("req-1")).unwrap();
        assert!(index.recent_alerts(10).unwrap().is_empty());
    }

    #[test]
    fn test_low_headroom_alert() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let mut r = row("req-2");
        r.headroom_left_pct = 0.08;
        index.log_telemetry(&r).unwrap();
        let alerts = index.recent_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowHeadroom);
    }

    #[test]
    fn test_truncation_alert() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let mut r = row("req-3");
        r.truncation_events = 2;
        index.log_telemetry(&r).unwrap();
        let alerts = index.recent_alerts(10).unwrap();
        assert_eq!(alerts[0].kind, AlertKind::BudgetTruncation);
    }

    #[test]
    fn test_record_executed_computes_recall() {
        let index = SqliteToolIndex::in_memory().unwrap();
        index.log_telemetry(&row("req-4")).unwrap();

        // Both executed tools were in the pool
        index
            .record_executed("req-4", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert!(index.recent_alerts(10).unwrap().is_empty());

        // One of two executed tools missing from the pool: recall 0.5
        index
            .record_executed("req-4", &["a".to_string(), "zz".to_string()])
            .unwrap();
        let alerts = index.recent_alerts(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowRecall);
    }

    #[test]
    fn test_record_executed_unknown_request() {
        let index = SqliteToolIndex::in_memory().unwrap();
        let err = index.record_executed("ghost", &[]).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
