//! Orchestrator configuration read from `PHYTO_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Transport calls per operation, including the first one. Always >= 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Used when a submission does not carry its own timeout.
    pub default_timeout: Duration,
    /// Per-attempt budget; `None` splits the overall timeout evenly across attempts.
    pub attempt_timeout: Option<Duration>,
    /// How long completed results stay around for late-duplicate suppression.
    pub retention: Duration,
    /// Upper bound on retained completed results (oldest dropped first).
    pub retention_cap: usize,
    pub max_payload_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
            default_timeout: Duration::from_millis(15_000),
            attempt_timeout: None,
            retention: Duration::from_secs(300),
            retention_cap: 1024,
            max_payload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        let cfg = Self {
            max_attempts: num("PHYTO_MAX_ATTEMPTS").map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(d.max_attempts),
            base_delay: num("PHYTO_BASE_DELAY_MS").map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: num("PHYTO_MAX_DELAY_MS").map(Duration::from_millis).unwrap_or(d.max_delay),
            default_timeout: num("PHYTO_DEFAULT_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.default_timeout),
            attempt_timeout: num("PHYTO_ATTEMPT_TIMEOUT_MS").map(Duration::from_millis),
            retention: num("PHYTO_RETENTION_SECS").map(Duration::from_secs).unwrap_or(d.retention),
            retention_cap: num("PHYTO_RETENTION_CAP").map(|v| v as usize).unwrap_or(d.retention_cap),
            max_payload_bytes: num("PHYTO_MAX_PAYLOAD_BYTES").map(|v| v as usize).unwrap_or(d.max_payload_bytes),
        };
        cfg.normalized()
    }

    /// Clamp values into a usable range.
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if self.max_delay < self.base_delay { self.max_delay = self.base_delay; }
        if self.default_timeout.is_zero() { self.default_timeout = Self::default().default_timeout; }
        if self.attempt_timeout.map(|t| t.is_zero()).unwrap_or(false) { self.attempt_timeout = None; }
        self
    }

    /// Backoff after the given failed attempt: `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay.checked_mul(factor).unwrap_or(self.max_delay).min(self.max_delay)
    }

    /// Budget for a single attempt of an operation with the given overall timeout.
    pub fn attempt_budget(&self, timeout: Duration) -> Duration {
        match self.attempt_timeout {
            Some(t) => t.min(timeout),
            None => timeout / self.max_attempts.max(1),
        }
    }
}
