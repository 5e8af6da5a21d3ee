//! Request firehose for debugging.
//!
//! When `MIRA_FIREHOSE` is set, every outbound LLM request is mirrored to
//! `firehose_output.json` (overwritten per request). Never enabled in
//! normal operation.

use serde_json::Value;

pub(crate) struct Firehose {
    enabled: bool,
}

impl Firehose {
    pub fn from_env() -> Self {
        let enabled = std::env::var("MIRA_FIREHOSE").map(|v| !v.is_empty()).unwrap_or(false);
        if enabled {
            tracing::info!("firehose mode enabled - logging requests to firehose_output.json");
        }
        Self { enabled }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn record(&self, provider: &str, endpoint: &str, model: &str, body: &Value) {
        if !self.enabled {
            return;
        }
        let payload = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "provider": provider,
            "endpoint": endpoint,
            "model": model,
            "request": body,
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(raw) => {
                if let Err(e) = std::fs::write("firehose_output.json", raw) {
                    tracing::error!(error = %e, "failed to write firehose");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize firehose payload"),
        }
    }
}
