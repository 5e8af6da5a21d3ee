//! Per-turn guard over tool execution chains.
//!
//! Stops a chain on a second error for the same tool (the first error is
//! always allowed one retry, with the schema hint in the result) or on two
//! consecutive identical results (loop detection). Records are discarded
//! when the turn ends — the breaker is created per turn.

use sha2::{Digest, Sha256};

/// One recorded execution: `(tool_name, result_hash, error)`.
/// The hash is present only for successful executions.
#[derive(Debug, Clone)]
struct Record {
    tool_name: String,
    result_hash: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    records: Vec<Record>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool execution outcome.
    pub fn record_execution(&mut self, tool_name: &str, result: Option<&str>, error: Option<&str>) {
        let result_hash = match error {
            Some(_) => None,
            None => result.map(hash_result),
        };
        self.records.push(Record {
            tool_name: tool_name.to_string(),
            result_hash,
            error: error.map(|e| e.to_string()),
        });
    }

    /// Whether the tool chain may continue, with the reason.
    pub fn should_continue(&self) -> (bool, String) {
        let Some(last) = self.records.last() else {
            return (true, "First tool".into());
        };

        // Errors: allow ONE retry per tool before tripping.
        if let Some(err) = &last.error {
            let prior_errors = self.records[..self.records.len() - 1]
                .iter()
                .filter(|r| r.tool_name == last.tool_name && r.error.is_some())
                .count();
            if prior_errors > 0 {
                return (
                    false,
                    format!(
                        "Tool '{}' failed after correction attempt: {err}",
                        last.tool_name
                    ),
                );
            }
        }

        // Loop detection: two consecutive identical non-error results.
        if self.records.len() >= 2 {
            let second_last = &self.records[self.records.len() - 2];
            if last.result_hash.is_some() && last.result_hash == second_last.result_hash {
                return (false, "Repeated identical results".into());
            }
        }

        (true, "Continue".into())
    }
}

/// Stable hex digest of the stringified result.
fn hash_result(result: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(result.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_continues() {
        let cb = CircuitBreaker::new();
        let (go, reason) = cb.should_continue();
        assert!(go);
        assert_eq!(reason, "First tool");
    }

    #[test]
    fn single_error_allows_retry() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("web_tool", None, Some("External API unavailable"));
        let (go, _) = cb.should_continue();
        assert!(go);
    }

    #[test]
    fn second_error_same_tool_trips() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("web_tool", None, Some("External API unavailable"));
        cb.record_execution("web_tool", None, Some("External API unavailable"));
        let (go, reason) = cb.should_continue();
        assert!(!go);
        assert!(reason.contains("failed after correction attempt"));
        assert!(reason.contains("web_tool"));
    }

    #[test]
    fn errors_on_different_tools_do_not_trip() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("web_tool", None, Some("boom"));
        cb.record_execution("email_tool", None, Some("boom"));
        let (go, _) = cb.should_continue();
        assert!(go);
    }

    #[test]
    fn repeated_identical_results_trip() {
        let mut cb = CircuitBreaker::new();
        let result = r#"{"status":"pending","data":"X"}"#;
        cb.record_execution("poll_tool", Some(result), None);
        cb.record_execution("poll_tool", Some(result), None);
        let (go, reason) = cb.should_continue();
        assert!(!go);
        assert_eq!(reason, "Repeated identical results");
    }

    #[test]
    fn differing_results_continue() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("poll_tool", Some("a"), None);
        cb.record_execution("poll_tool", Some("b"), None);
        let (go, reason) = cb.should_continue();
        assert!(go);
        assert_eq!(reason, "Continue");
    }

    #[test]
    fn error_then_success_continues() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("web_tool", None, Some("transient"));
        cb.record_execution("web_tool", Some("ok"), None);
        let (go, _) = cb.should_continue();
        assert!(go);
    }

    #[test]
    fn error_records_never_match_as_identical_results() {
        let mut cb = CircuitBreaker::new();
        cb.record_execution("a", None, Some("e1"));
        cb.record_execution("b", None, Some("e2"));
        // Both hashes are None; None == None must not count as a loop.
        let (go, _) = cb.should_continue();
        assert!(go);
    }
}
