use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level daemon configuration, loaded from TOML.
///
/// Every section rejects unknown keys so a typo in the config file fails at
/// load instead of being silently ignored.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Scheduling, ingestion, and planning knobs.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Scheduler period in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval: u64,
    /// How far ahead of now a plan entry may be to fire a nudge, minutes.
    #[serde(default = "default_nudge_lookahead_mins")]
    pub nudge_lookahead: i64,
    /// How far behind now a plan entry may be to still fire, minutes.
    #[serde(default = "default_nudge_grace_mins")]
    pub nudge_grace: i64,
    /// Calendar fetch window: (days back, days forward).
    #[serde(default = "default_calendar_window")]
    pub ingest_window_calendar: (i64, i64),
    /// Mail fetch window: days back.
    #[serde(default = "default_mail_window")]
    pub ingest_window_mail: i64,
    /// How many times an LLM call is retried on rate-limit/transient errors.
    #[serde(default = "default_llm_retry_budget")]
    pub llm_retry_budget: u32,
    /// Per-provider token bucket settings, keyed by provider name.
    #[serde(default)]
    pub provider_rate_limits: HashMap<String, RateLimitConfig>,
    /// Gate for email nudge delivery.
    #[serde(default)]
    pub email_enabled: bool,
    /// Fused spam score at or above which a mail item is flagged spam.
    #[serde(default = "default_spam_llm_threshold")]
    pub spam_llm_threshold: f64,
    /// Earliest/latest hour (0-23) a plan entry may be scheduled at.
    #[serde(default = "default_working_window")]
    pub working_window: (u32, u32),
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval_secs(),
            nudge_lookahead: default_nudge_lookahead_mins(),
            nudge_grace: default_nudge_grace_mins(),
            ingest_window_calendar: default_calendar_window(),
            ingest_window_mail: default_mail_window(),
            llm_retry_budget: default_llm_retry_budget(),
            provider_rate_limits: HashMap::new(),
            email_enabled: false,
            spam_llm_threshold: default_spam_llm_threshold(),
            working_window: default_working_window(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    120
}
fn default_nudge_lookahead_mins() -> i64 {
    5
}
fn default_nudge_grace_mins() -> i64 {
    1
}
fn default_calendar_window() -> (i64, i64) {
    (30, 90)
}
fn default_mail_window() -> i64 {
    7
}
fn default_llm_retry_budget() -> u32 {
    3
}
fn default_spam_llm_threshold() -> f64 {
    0.7
}
fn default_working_window() -> (u32, u32) {
    (7, 22)
}

impl CoreConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval)
    }

    /// Outer budget for one scheduler tick. Guarantees non-overlapping ticks
    /// by finishing well inside the tick period.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_secs(self.tick_interval.saturating_sub(15).max(5))
    }
}

/// Token bucket parameters for one provider.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "dayflow.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// May be the literal key or `env:VAR_NAME`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    /// May be the literal password or `env:VAR_NAME`.
    pub password: String,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.llm.api_key = resolve_secret(&config.llm.api_key)?;
        if let Some(smtp) = config.smtp.as_mut() {
            smtp.password = resolve_secret(&smtp.password)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let (earliest, latest) = self.core.working_window;
        if earliest > 23 || latest > 23 || earliest >= latest {
            anyhow::bail!(
                "working_window must be (earliest, latest) hours with earliest < latest <= 23, got ({}, {})",
                earliest,
                latest
            );
        }
        if !(0.0..=1.0).contains(&self.core.spam_llm_threshold) {
            anyhow::bail!(
                "spam_llm_threshold must be in [0, 1], got {}",
                self.core.spam_llm_threshold
            );
        }
        if self.core.tick_interval < 30 {
            anyhow::bail!("tick_interval must be at least 30 seconds");
        }
        Ok(())
    }
}

/// Resolve a `env:VAR` reference into the variable's value; literals pass
/// through unchanged.
fn resolve_secret(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("environment variable '{}' is not set", var)),
        None => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.core.tick_interval, 120);
        assert_eq!(config.core.nudge_lookahead, 5);
        assert_eq!(config.core.nudge_grace, 1);
        assert_eq!(config.core.ingest_window_calendar, (30, 90));
        assert_eq!(config.core.ingest_window_mail, 7);
        assert_eq!(config.core.spam_llm_threshold, 0.7);
        assert!(!config.core.email_enabled);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml_str = r#"
            [core]
            tick_interval = 60
            not_a_real_option = true
        "#;
        let result: Result<AppConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_section_is_rejected() {
        let toml_str = r#"
            [telemetry]
            enabled = true
        "#;
        let result: Result<AppConfig, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
            [core]
            tick_interval = 60
            email_enabled = true

            [state]
            db_path = "/tmp/test.db"
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.core.tick_interval, 60);
        assert!(config.core.email_enabled);
        assert_eq!(config.core.nudge_lookahead, 5);
        assert_eq!(config.state.db_path, "/tmp/test.db");
    }

    #[test]
    fn rate_limits_parse_per_provider() {
        let toml_str = r#"
            [core.provider_rate_limits.calendar]
            capacity = 5
            refill_per_sec = 1.0

            [core.provider_rate_limits.task_manager]
            capacity = 20
            refill_per_sec = 4.0
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.core.provider_rate_limits["calendar"].capacity, 5);
        assert_eq!(config.core.provider_rate_limits["task_manager"].capacity, 20);
    }

    #[test]
    fn working_window_validation() {
        let mut config = AppConfig::default();
        config.core.working_window = (22, 7);
        assert!(config.validate().is_err());
        config.core.working_window = (7, 22);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tick_budget_stays_inside_period() {
        let config = CoreConfig::default();
        assert!(config.tick_budget() < config.tick_interval());
    }

    #[test]
    fn resolve_secret_passthrough() {
        assert_eq!(resolve_secret("literal-key").unwrap(), "literal-key");
        assert!(resolve_secret("env:DAYFLOW_TEST_MISSING_VAR").is_err());
    }
}
