//! Deterministic candidate scoring and ambiguity detection.
//!
//! Retrieval finds candidates; this module ranks them from tool preference
//! scores shifted by the operator's preference mode, blended with the
//! retrieval signal. The ambiguity margin decides whether the LLM tie-break
//! runs at all.

use serde::{Deserialize, Serialize};

use crate::catalog::{FullToolSpec, PreferenceScores};

/// Score penalty applied to tools that require human approval.
const APPROVAL_PENALTY: f32 = 0.05;

/// Weight of the retrieval signal in the blended score.
const RETRIEVAL_WEIGHT: f32 = 0.5;

/// Operator preference mode shifting the scoring weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceMode {
    Fast,
    #[default]
    Balanced,
    Accurate,
}

impl PreferenceMode {
    /// (speed, accuracy, simplicity) weights; each triple sums to 1.
    fn weights(&self) -> (f32, f32, f32) {
        match self {
            Self::Fast => (0.60, 0.25, 0.15),
            Self::Balanced => (0.34, 0.33, 0.33),
            Self::Accurate => (0.15, 0.65, 0.20),
        }
    }

    /// Preference-only score of a tool in [0, 1]. Complexity counts
    /// against a tool, so the third weight applies to its complement.
    pub fn score(&self, prefs: &PreferenceScores) -> f32 {
        let (w_speed, w_accuracy, w_simplicity) = self.weights();
        w_speed * prefs.speed + w_accuracy * prefs.accuracy + w_simplicity * (1.0 - prefs.complexity)
    }
}

/// A candidate with its blended deterministic score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub tool_id: String,
    /// Blend of retrieval signal and preference score, minus policy penalties
    pub score: f32,
    /// Flagged when the tool's policy requires approval
    pub requires_approval: bool,
}

/// Score one candidate from its full spec and normalized retrieval signal.
pub fn score_candidate(
    spec: &FullToolSpec,
    retrieval_signal: f32,
    mode: PreferenceMode,
) -> ScoredCandidate {
    let preference = mode.score(&spec.preferences);
    let mut score =
        RETRIEVAL_WEIGHT * retrieval_signal.clamp(0.0, 1.0) + (1.0 - RETRIEVAL_WEIGHT) * preference;
    if spec.requires_approval {
        score -= APPROVAL_PENALTY;
    }
    ScoredCandidate {
        tool_id: spec.entry.id.clone(),
        score,
        requires_approval: spec.requires_approval,
    }
}

/// Whether the top two scores are too close to call deterministically.
/// Strict inequality: a relative gap exactly at the margin is decisive.
pub fn is_ambiguous(top: f32, second: f32, margin: f32) -> bool {
    if top <= 0.0 {
        return true;
    }
    let gap = (top - second) / top;
    gap < margin
}
