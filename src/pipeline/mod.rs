//! The five-stage request-to-execution pipeline.
//!
//! A request flows Classifier (A) → Selector (AB) → Planner (C) →
//! Responder (D), producing a classification, a selection, a plan, and a
//! streamed response; the Dispatcher (E) drives the plan over the
//! collaborator services on approval or immediately.

pub mod classify;
pub mod context;
pub mod execute;
pub mod plan;
pub mod respond;
pub mod scoring;
pub mod select;
pub mod template;
pub mod types;

/// Pull the first JSON object out of an LLM response, tolerating prose and
/// code fences around it.
pub(crate) fn extract_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::extract_json;
    use serde_json::json;

    #[test]
    fn test_extract_json_tolerates_fences_and_prose() {
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": 1}\n```"),
            Some(json!({"a": 1}))
        );
        assert_eq!(extract_json("{\"a\": 1}"), Some(json!({"a": 1})));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{broken"), None);
    }
}
