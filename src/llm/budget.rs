//! Token budgeting for LLM-visible candidate lists.
//!
//! The selector may only show the LLM as many tool index rows as fit in the
//! model's context window after the output reserve, the fixed base prompt,
//! and a safety margin. The per-row cost is an empirical estimate; telemetry
//! records actual budget use so the estimate can be re-fit offline.

use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;

/// Floor on rows shown to the LLM regardless of how tight the budget is.
pub const MIN_ROWS: usize = 10;

/// Default empirical cost of one minimal index row, in tokens.
pub const DEFAULT_PER_ROW_TOKENS: u32 = 45;

/// Default fixed cost of the base selection prompt, in tokens.
pub const DEFAULT_BASE_PROMPT_TOKENS: u32 = 300;

/// Row allowance computed from a token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBudget {
    /// Hard cap on rows that may appear in the prompt
    pub max_rows: usize,
    /// Whether the computed cap fell below the floor and was clamped up
    pub clamped: bool,
}

/// Token budget parameters for one model deployment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Model context window in tokens
    pub context_window: u32,
    /// Fraction of the window reserved for output
    pub output_reserve: f64,
    /// Fractional safety margin held back on the input side
    pub safety_margin: f64,
    /// Fixed cost of the base prompt
    pub base_prompt_tokens: u32,
    /// Estimated cost per minimal index row
    pub per_row_tokens: u32,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            context_window: 8_192,
            output_reserve: 0.30,
            safety_margin: 0.05,
            base_prompt_tokens: DEFAULT_BASE_PROMPT_TOKENS,
            per_row_tokens: DEFAULT_PER_ROW_TOKENS,
        }
    }
}

impl TokenBudget {
    /// Budget parameters from the core configuration.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            context_window: config.llm_max_model_len,
            output_reserve: config.llm_output_reserve,
            safety_margin: config.llm_safety_margin,
            ..Self::default()
        }
    }

    /// Tokens usable for the input side of the prompt.
    pub fn input_allowance(&self) -> u32 {
        let reserve = self.output_reserve.clamp(0.0, 0.9);
        (f64::from(self.context_window) * (1.0 - reserve)) as u32
    }

    /// Hard cap on index rows in the prompt, clamped to [`MIN_ROWS`].
    pub fn max_rows(&self) -> RowBudget {
        let margin = self.safety_margin.clamp(0.0, 0.5);
        let usable = f64::from(self.input_allowance().saturating_sub(self.base_prompt_tokens));
        let rows = (usable * (1.0 - margin) / f64::from(self.per_row_tokens.max(1))) as usize;
        RowBudget {
            max_rows: rows.max(MIN_ROWS),
            clamped: rows < MIN_ROWS,
        }
    }

    /// Estimated prompt tokens for a list of `rows` index rows.
    pub fn estimate_used(&self, rows: usize) -> u32 {
        self.base_prompt_tokens + self.per_row_tokens * rows as u32
    }

    /// Fraction of the input allowance still unused after spending `used`.
    pub fn headroom(&self, used: u32) -> f64 {
        let allowance = f64::from(self.input_allowance().max(1));
        (1.0 - f64::from(used) / allowance).max(0.0)
    }
}
