use std::time::Duration;

use crate::error::ValidationError;
use crate::identity::{Participant, Role};
use crate::log_throttle::DEFAULT_FAILURE_LOG_THRESHOLD;
use crate::queue_store::DEFAULT_MATCH_WINDOW;
use crate::stability::DEFAULT_CLOSE_THRESHOLD;
use crate::telemetry::DEFAULT_LOG_FILTER;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: Backend,
    pub remote_url: Option<String>,
    pub event_code: Option<String>,
    pub user_name: Option<String>,
    pub business_name: Option<String>,
    pub role: Role,
    pub poll_interval_ms: u64,
    pub close_threshold: u32,
    pub settle_delay_ms: u64,
    pub match_window_ms: u64,
    pub failure_log_threshold: u32,
    pub log_filter: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineSettings::default();
        let backend = Backend::parse(var("RAISEHAND_BACKEND").as_deref());
        let remote_url = var("RAISEHAND_REMOTE_URL").filter(|v| !v.trim().is_empty());
        let event_code = var("RAISEHAND_EVENT_CODE").filter(|v| !v.trim().is_empty());
        let user_name = var("RAISEHAND_USER_NAME").filter(|v| !v.trim().is_empty());
        let business_name = var("RAISEHAND_BUSINESS_NAME").filter(|v| !v.trim().is_empty());
        let role = var("RAISEHAND_ROLE")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let poll_interval_ms = var("RAISEHAND_POLL_INTERVAL_MS")
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(defaults.poll_interval.as_millis() as u64);
        let close_threshold = var("RAISEHAND_CLOSE_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.close_threshold);
        let settle_delay_ms = var("RAISEHAND_SETTLE_DELAY_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.settle_delay.as_millis() as u64);
        let match_window_ms = var("RAISEHAND_MATCH_WINDOW_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.match_window.as_millis() as u64);
        let failure_log_threshold = var("RAISEHAND_FAILURE_LOG_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.failure_log_threshold);
        let log_filter = var("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.into());
        Self {
            backend,
            remote_url,
            event_code,
            user_name,
            business_name,
            role,
            poll_interval_ms,
            close_threshold,
            settle_delay_ms,
            match_window_ms,
            failure_log_threshold,
            log_filter,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            close_threshold: self.close_threshold,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            match_window: Duration::from_millis(self.match_window_ms),
            failure_log_threshold: self.failure_log_threshold,
        }
    }

    /// `None` when no user name is configured.
    pub fn participant(&self) -> Option<Result<Participant, ValidationError>> {
        self.user_name
            .as_deref()
            .map(|name| Participant::new(name, self.business_name.as_deref(), self.role))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Http,
}

impl Backend {
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("http") | Some("sheet") => Backend::Http,
            _ => Backend::Memory,
        }
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub close_threshold: u32,
    /// Pause after closing a session before history is re-fetched, giving the
    /// remote time to migrate the session's rows.
    pub settle_delay: Duration,
    pub match_window: Duration,
    pub failure_log_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            close_threshold: DEFAULT_CLOSE_THRESHOLD,
            settle_delay: Duration::from_millis(1_500),
            match_window: DEFAULT_MATCH_WINDOW,
            failure_log_threshold: DEFAULT_FAILURE_LOG_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_engine_settings() {
        let cfg = config(&[]);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.role, Role::Participant);
        assert_eq!(cfg.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(cfg.settings(), EngineSettings::default());
        assert!(cfg.participant().is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("RAISEHAND_BACKEND", "HTTP"),
            ("RAISEHAND_REMOTE_URL", "https://example.test/exec"),
            ("RAISEHAND_ROLE", "admin"),
            ("RAISEHAND_USER_NAME", "Dana"),
            ("RAISEHAND_POLL_INTERVAL_MS", "500"),
            ("RAISEHAND_CLOSE_THRESHOLD", "5"),
            ("RAISEHAND_SETTLE_DELAY_MS", "0"),
        ]);
        assert_eq!(cfg.backend, Backend::Http);
        assert_eq!(cfg.remote_url.as_deref(), Some("https://example.test/exec"));
        let settings = cfg.settings();
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
        assert_eq!(settings.close_threshold, 5);
        assert_eq!(settings.settle_delay, Duration::ZERO);
        let user = cfg.participant().expect("configured").expect("valid");
        assert!(user.is_moderator());
    }

    #[test]
    fn ignores_unparseable_values() {
        let cfg = config(&[
            ("RAISEHAND_POLL_INTERVAL_MS", "soon"),
            ("RAISEHAND_ROLE", "guest"),
        ]);
        assert_eq!(cfg.settings().poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.role, Role::Participant);

        let zero = config(&[("RAISEHAND_POLL_INTERVAL_MS", "0")]);
        assert_eq!(zero.settings().poll_interval, Duration::from_secs(3));
    }
}
