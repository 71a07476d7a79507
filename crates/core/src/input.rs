//! Submit-time validation and normalisation of job inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::job::JobKind;

/// Default upper bound on a serialised input.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Similarity threshold used when a retrieval query omits `tau`.
pub const DEFAULT_TAU: f64 = 0.3;

/// Number of results returned when a retrieval query omits `top_k`.
pub const DEFAULT_TOP_K: u32 = 5;

fn default_tau() -> f64 {
    DEFAULT_TAU
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

/// Input of a RETRIEVE_SCENEGRAPH job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub query: String,
    #[serde(default = "default_tau")]
    pub tau: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

impl RetrievalQuery {
    fn validate(&self) -> DomainResult<()> {
        if self.query.trim().is_empty() {
            return Err(DomainError::validation("query must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return Err(DomainError::validation("tau must be within [0, 1]"));
        }
        if self.top_k == 0 {
            return Err(DomainError::validation("top_k must be at least 1"));
        }
        Ok(())
    }
}

/// Validate `input` for `kind` and return the normalised payload to store.
pub fn validate_input(kind: JobKind, input: JsonValue, max_bytes: usize) -> DomainResult<JsonValue> {
    let size = serde_json::to_vec(&input)
        .map_err(|e| DomainError::validation(format!("input is not serialisable: {e}")))?
        .len();
    if size > max_bytes {
        return Err(DomainError::validation(format!(
            "input is {size} bytes, limit is {max_bytes}"
        )));
    }

    match kind {
        JobKind::MetaToSceneGraph => match &input {
            JsonValue::Object(map) if !map.is_empty() => Ok(input),
            JsonValue::Object(_) => Err(DomainError::validation("metadata must not be empty")),
            _ => Err(DomainError::validation("metadata must be a JSON object")),
        },
        JobKind::RetrieveSceneGraph => {
            let query: RetrievalQuery = serde_json::from_value(input)
                .map_err(|e| DomainError::validation(format!("invalid retrieval query: {e}")))?;
            query.validate()?;
            serde_json::to_value(query)
                .map_err(|e| DomainError::validation(format!("invalid retrieval query: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_requires_non_empty_object() {
        let ok = validate_input(JobKind::MetaToSceneGraph, json!({"meta": "X"}), DEFAULT_MAX_INPUT_BYTES);
        assert_eq!(ok.unwrap(), json!({"meta": "X"}));

        assert!(validate_input(JobKind::MetaToSceneGraph, json!({}), DEFAULT_MAX_INPUT_BYTES).is_err());
        assert!(validate_input(JobKind::MetaToSceneGraph, json!("meta"), DEFAULT_MAX_INPUT_BYTES).is_err());
        assert!(validate_input(JobKind::MetaToSceneGraph, json!(null), DEFAULT_MAX_INPUT_BYTES).is_err());
    }

    #[test]
    fn retrieval_defaults_are_filled_in() {
        let normalised =
            validate_input(JobKind::RetrieveSceneGraph, json!({"query": "a man running"}), DEFAULT_MAX_INPUT_BYTES)
                .unwrap();
        assert_eq!(
            normalised,
            json!({"query": "a man running", "tau": 0.3, "top_k": 5})
        );
    }

    #[test]
    fn retrieval_rejects_bad_parameters() {
        let cases = [
            json!({"query": ""}),
            json!({"query": "x", "tau": 1.5}),
            json!({"query": "x", "top_k": 0}),
            json!({"tau": 0.5}),
            json!({"query": 7}),
        ];
        for case in cases {
            let err = validate_input(JobKind::RetrieveSceneGraph, case.clone(), DEFAULT_MAX_INPUT_BYTES);
            assert!(matches!(err, Err(DomainError::Validation(_))), "accepted {case}");
        }
    }

    #[test]
    fn oversized_input_is_rejected() {
        let big = json!({"meta": "x".repeat(64)});
        assert!(validate_input(JobKind::MetaToSceneGraph, big, 32).is_err());
    }
}
