//! Flow, step and retry-policy definitions.
//!
//! `RetryPolicy` uses an exponential-backoff shape with a `retry_on`
//! allowlist rather than a denylist, and no jitter term. The backoff must
//! be exactly reproducible: `backoffMs = min(base * multiplier^k, maxBackoffMs)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::input::InputSelector;

/// Per-step retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(default = "RetryPolicy::default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryPolicy::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<String>>,
}

impl RetryPolicy {
    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_max_backoff_ms() -> u64 {
        60_000
    }

    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 0,
            backoff_multiplier: Self::default_multiplier(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            retry_on: None,
        }
    }

    /// Whether an error with this code should be retried at all (the
    /// allowlist check only, callers must separately check the attempt
    /// counter against `max_attempts`).
    pub fn retries(&self, error_code: Option<&str>) -> bool {
        if self.max_attempts == 0 {
            return false;
        }
        match (&self.retry_on, error_code) {
            (None, _) => true,
            (Some(allowed), Some(code)) => allowed.iter().any(|c| c == code),
            (Some(_), None) => false,
        }
    }

    /// `backoffMs = min(base * multiplier^attempt, maxBackoffMs)` for the
    /// `attempt`-th retry (0-indexed: `attempt=0` is the delay before the
    /// first retry).
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let base = self.backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);
        capped.round() as u64
    }
}

/// Which outcomes a [`Pipe`] fires on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeOn {
    #[default]
    Success,
    Failure,
    Any,
}

/// Maps a field of a step's output onto a column of an external table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeMapping {
    pub source_path: String,
    pub column_id: String,
}

/// A fire-and-forget projection of a step's output into an external table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipe {
    pub id: String,
    pub step_id: String,
    #[serde(default)]
    pub on: PipeOn,
    pub table_id: String,
    pub mappings: Vec<PipeMapping>,
    #[serde(default)]
    pub static_values: BTreeMap<String, Value>,
    #[serde(default = "Pipe::default_enabled")]
    pub enabled: bool,
}

impl Pipe {
    fn default_enabled() -> bool {
        true
    }
}

/// The set of steps a step can transition to for each outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transitions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_resume: Option<String>,
}

/// A single node in a [`Flow`] graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub r#type: String,
    #[serde(default)]
    pub config: Value,
    pub input: InputSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default)]
    pub transitions: Transitions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// An immutable flow definition, keyed by `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub version: String,
    pub initial_step_id: String,
    pub steps: BTreeMap<String, Step>,
    #[serde(default)]
    pub pipes: Vec<Pipe>,
}

impl Flow {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    pub fn pipes_for_step(&self, step_id: &str) -> impl Iterator<Item = &Pipe> {
        self.pipes.iter().filter(move |p| p.step_id == step_id && p.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_formula_matches_spec() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            retry_on: None,
        };
        assert_eq!(policy.backoff_for_attempt(0), 100);
        assert_eq!(policy.backoff_for_attempt(1), 200);
        assert_eq!(policy.backoff_for_attempt(2), 400);
        assert_eq!(policy.backoff_for_attempt(3), 800);
        // capped
        assert_eq!(policy.backoff_for_attempt(4), 1000);
    }

    #[test]
    fn retry_on_allowlist_filters_codes() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 100,
            retry_on: Some(vec!["TRANSIENT".to_string()]),
        };
        assert!(policy.retries(Some("TRANSIENT")));
        assert!(!policy.retries(Some("PERMANENT")));
        assert!(!policy.retries(None));
    }

    #[test]
    fn retry_none_never_retries() {
        assert!(!RetryPolicy::none().retries(Some("TRANSIENT")));
    }
}
