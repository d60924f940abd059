// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::Path;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://crewdesk.db".to_string(),
            pool_max_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Operating mode of the dispatch backend. Decided once at startup and
/// sticky for the process lifetime; `Auto` probes the broker and falls back
/// to the timer-driven poller when it is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Auto,
    Broker,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    /// Worker pool size in broker mode; also bounds concurrent executions
    /// per fallback tick.
    pub worker_count: usize,
    /// Fallback poller tick interval.
    pub poll_interval_secs: u64,
    /// Base delay for exponential retry backoff in broker mode.
    pub retry_base_delay_secs: u64,
    /// Execution attempts per job before it fails terminally.
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Auto,
            worker_count: 4,
            poll_interval_secs: 30,
            retry_base_delay_secs: 30,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    /// Maximum reporting period, in days.
    pub max_range_days: i64,
    /// Directory where generated report files are stored.
    pub result_dir: String,
    /// Base URL prefixed to resolved result references.
    pub result_base_url: String,
    /// Lifetime of resolved retrieval references.
    pub result_url_ttl_secs: u64,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            max_range_days: 366,
            result_dir: "reports".to_string(),
            result_base_url: "http://127.0.0.1:7070/files".to_string(),
            result_url_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub telemetry: TelemetryConfig,
    pub dispatch: DispatchConfig,
    pub reports: ReportsConfig,
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: CREWDESK_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("CREWDESK_").split("__"));

    let config: AppConfig = figment.extract()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
