use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock_timeout_ms: u64,
    pub max_retries: u32,
    pub deadline_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            deadline_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retries);
        match self.deadline() {
            Some(deadline) => policy.with_deadline(deadline),
            None => policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lock_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_secs(3));
        assert_eq!(config.retry_policy().max_attempts(), 4);
        assert_eq!(config.retry_policy().deadline, None);
    }

    #[test]
    fn deadline_flows_into_retry_policy() {
        let config = EngineConfig {
            deadline_ms: Some(250),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.retry_policy().deadline,
            Some(Duration::from_millis(250))
        );
    }
}
