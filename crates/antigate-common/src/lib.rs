use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Command line / environment settings. CLI flags win over env vars; clap
/// applies that precedence per field.
#[derive(Debug, Clone, Parser)]
#[command(name = "antigate", version, about = "Antigravity account-pool gateway")]
pub struct CliArgs {
    /// Panel login user. Required; the process refuses to start without it.
    #[arg(long, env = "PANEL_USER")]
    pub panel_user: Option<String>,

    /// Panel login password. Required.
    #[arg(long, env = "PANEL_PASSWORD")]
    pub panel_password: Option<String>,

    /// Shared API key checked on every /v1 route. Required.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Bind host.
    #[arg(long, env = "ANTIGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "ANTIGATE_PORT", default_value_t = 8045)]
    pub port: u16,

    /// Directory holding the credential and request-log files.
    #[arg(long, env = "ANTIGATE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "ANTIGATE_PROXY")]
    pub proxy: Option<String>,

    /// Upstream request timeout in seconds.
    #[arg(long, env = "ANTIGATE_UPSTREAM_TIMEOUT", default_value_t = 180)]
    pub upstream_timeout_secs: u64,

    /// Comma-separated upstream status codes that trigger a retry.
    #[arg(long, env = "RETRY_STATUS_CODES", default_value = "429,500")]
    pub retry_status_codes: String,

    /// Maximum upstream attempts per request (first try included).
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    /// Per-credential request cap over the trailing 60 minutes.
    #[arg(long, env = "ANTIGATE_HOURLY_LIMIT", default_value_t = 60)]
    pub hourly_limit: u32,

    /// Retained request-log entries.
    #[arg(long, env = "ANTIGATE_LOG_MAX_ITEMS", default_value_t = 1000)]
    pub log_max_items: usize,

    /// Request-log retention window in days.
    #[arg(long, env = "ANTIGATE_LOG_RETENTION_DAYS", default_value_t = 7)]
    pub log_retention_days: u32,
}

/// Validated runtime configuration. All required settings are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub panel_user: String,
    pub panel_password: String,
    pub api_key: String,
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub proxy: Option<String>,
    pub upstream_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub hourly_limit: u32,
    pub log_max_items: usize,
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub status_codes: Vec<u16>,
}

impl RetryPolicy {
    pub fn should_retry(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }
}

impl GatewayConfig {
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let panel_user = require(args.panel_user, "PANEL_USER")?;
        let panel_password = require(args.panel_password, "PANEL_PASSWORD")?;
        let api_key = require(args.api_key, "API_KEY")?;

        let mut status_codes = Vec::new();
        for item in args.retry_status_codes.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let code: u16 = item.parse().map_err(|_| {
                ConfigError::InvalidValue("RETRY_STATUS_CODES", item.to_string())
            })?;
            status_codes.push(code);
        }

        Ok(Self {
            panel_user,
            panel_password,
            api_key,
            host: args.host,
            port: args.port,
            data_dir: args.data_dir,
            proxy: normalize(args.proxy),
            upstream_timeout_secs: args.upstream_timeout_secs,
            retry: RetryPolicy {
                max_attempts: args.retry_max_attempts.max(1),
                status_codes,
            },
            hourly_limit: args.hourly_limit,
            log_max_items: args.log_max_items,
            log_retention_days: args.log_retention_days,
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn credential_file(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("request_log.json")
    }
}

fn require(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingRequired(name)),
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs::parse_from([
            "antigate",
            "--panel-user",
            "ops",
            "--panel-password",
            "secret",
            "--api-key",
            "sk-test",
        ])
    }

    #[test]
    fn required_settings_enforced() {
        let mut args = base_args();
        args.api_key = None;
        let err = GatewayConfig::from_args(args).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("API_KEY")));
    }

    #[test]
    fn blank_required_setting_rejected() {
        let mut args = base_args();
        args.panel_user = Some("   ".to_string());
        let err = GatewayConfig::from_args(args).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("PANEL_USER")));
    }

    #[test]
    fn retry_codes_parsed() {
        let mut args = base_args();
        args.retry_status_codes = "429, 500,503".to_string();
        let config = GatewayConfig::from_args(args).unwrap();
        assert_eq!(config.retry.status_codes, vec![429, 500, 503]);
        assert!(config.retry.should_retry(429));
        assert!(!config.retry.should_retry(404));
    }
}
