//! Bridge configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{BridgeError, BridgeResult};

/// Per-channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Channel / extension namespace name, used as the log prefix.
    pub name: String,
    /// Bound on one-shot calls, enforced by `Bridge::sweep_expired`.
    /// `None` leaves unanswered calls pending forever.
    pub call_timeout_ms: Option<u64>,
    /// Longest payload excerpt written to the log.
    pub log_payload_limit: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "extension".to_string(),
            call_timeout_ms: None,
            log_payload_limit: 200,
        }
    }
}

impl BridgeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_log_payload_limit(mut self, limit: usize) -> Self {
        self.log_payload_limit = limit;
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(text: &str) -> BridgeResult<Self> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::Config("name must not be empty".to_string()));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(BridgeError::Config(
                "call_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
