//! Service configuration: one JSON document bound at startup.
//!
//! Every field carries a serde default so a minimal document works; ranges
//! are rejected by [`Config::validate`] before the first cycle starts.

use serde::{Deserialize, Serialize};

use crate::zmap::ZmapConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregator: proxy_feed::Config,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub zmap: ZmapConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Validation mode for HTTP candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckMode {
    #[serde(rename = "connect-only")]
    ConnectOnly,
    #[default]
    #[serde(rename = "full-http")]
    FullHttp,
}

/// Validation mode for SOCKS candidates: stop after a usable tunnel, or push
/// an HTTP GET through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SocksMode {
    #[default]
    #[serde(rename = "handshake")]
    Handshake,
    #[serde(rename = "full-http")]
    FullHttp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_concurrency_total")]
    pub concurrency_total: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_test_url")]
    pub test_url: String,
    #[serde(default)]
    pub mode: CheckMode,

    #[serde(default = "default_true")]
    pub enable_adaptive_concurrency: bool,
    #[serde(default = "default_fd_percent")]
    pub max_fd_usage_percent: u32,
    #[serde(default = "default_cpu_percent")]
    pub max_cpu_usage_percent: u32,

    #[serde(default = "default_true")]
    pub enable_fast_filter: bool,
    #[serde(default = "default_fast_filter_timeout_ms")]
    pub fast_filter_timeout_ms: u64,
    #[serde(default = "default_fast_filter_concurrency")]
    pub fast_filter_concurrency: usize,

    #[serde(default = "default_true")]
    pub socks_enabled: bool,
    #[serde(default = "default_socks_timeout_ms")]
    pub socks_timeout_ms: u64,
    #[serde(default = "default_socks_test_url")]
    pub socks_test_url: String,
    #[serde(default)]
    pub socks_mode: SocksMode,
    #[serde(default = "default_socks_concurrency")]
    pub socks_concurrency: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            concurrency_total: default_concurrency_total(),
            batch_size: default_batch_size(),
            retries: default_retries(),
            test_url: default_test_url(),
            mode: CheckMode::default(),
            enable_adaptive_concurrency: true,
            max_fd_usage_percent: default_fd_percent(),
            max_cpu_usage_percent: default_cpu_percent(),
            enable_fast_filter: true,
            fast_filter_timeout_ms: default_fast_filter_timeout_ms(),
            fast_filter_concurrency: default_fast_filter_concurrency(),
            socks_enabled: true,
            socks_timeout_ms: default_socks_timeout_ms(),
            socks_test_url: default_socks_test_url(),
            socks_mode: SocksMode::default(),
            socks_concurrency: default_socks_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_addr")]
    pub addr: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub rate_limit_per_ip: u32,
    #[serde(default = "default_true")]
    pub enable_api_key_auth: bool,
    #[serde(default = "default_true")]
    pub enable_ip_rate_limit: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
            api_key_env: default_api_key_env(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_ip: 0,
            enable_api_key_auth: true,
            enable_ip_rate_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default = "default_persist_interval")]
    pub persist_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::File,
            path: default_storage_path(),
            persist_interval_seconds: default_persist_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_metrics_endpoint(),
            namespace: default_metrics_namespace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load and validate the configuration document.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let cfg: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject out-of-range values before any cycle begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.checker;
        if c.concurrency_total < 1 || c.concurrency_total > 100_000 {
            return Err(ConfigError::Invalid(
                "checker.concurrency_total must be between 1 and 100000".into(),
            ));
        }
        if c.timeout_ms < 100 || c.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid(
                "checker.timeout_ms must be between 100 and 300000".into(),
            ));
        }
        if c.socks_timeout_ms < 100 || c.socks_timeout_ms > 300_000 {
            return Err(ConfigError::Invalid(
                "checker.socks_timeout_ms must be between 100 and 300000".into(),
            ));
        }
        if url::Url::parse(&c.test_url).is_err() {
            return Err(ConfigError::Invalid("checker.test_url is not a valid URL".into()));
        }
        if url::Url::parse(&c.socks_test_url).is_err() {
            return Err(ConfigError::Invalid(
                "checker.socks_test_url is not a valid URL".into(),
            ));
        }
        if self.zmap.enabled && self.zmap.ports.is_empty() {
            return Err(ConfigError::Invalid(
                "zmap.enabled requires at least one port in zmap.ports".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_concurrency_total() -> usize {
    20_000
}

fn default_batch_size() -> usize {
    2_000
}

fn default_retries() -> u32 {
    1
}

fn default_test_url() -> String {
    "https://www.google.com/generate_204".into()
}

fn default_fd_percent() -> u32 {
    80
}

fn default_cpu_percent() -> u32 {
    80
}

fn default_fast_filter_timeout_ms() -> u64 {
    2_000
}

fn default_fast_filter_concurrency() -> usize {
    50_000
}

fn default_socks_timeout_ms() -> u64 {
    10_000
}

// Plain-scheme target: the tunneled GET variant speaks cleartext HTTP.
fn default_socks_test_url() -> String {
    "http://www.google.com/generate_204".into()
}

fn default_socks_concurrency() -> usize {
    1_000
}

fn default_api_addr() -> String {
    "0.0.0.0:8083".into()
}

fn default_api_key_env() -> String {
    "PROXY_API_KEY".into()
}

fn default_rate_limit_per_minute() -> u32 {
    1_200
}

fn default_storage_path() -> String {
    "/data/proxies.json".into()
}

fn default_persist_interval() -> u64 {
    300
}

fn default_metrics_endpoint() -> String {
    "/metrics".into()
}

fn default_metrics_namespace() -> String {
    "proxypool".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.checker.timeout_ms, 15_000);
        assert_eq!(cfg.checker.concurrency_total, 20_000);
        assert_eq!(cfg.api.rate_limit_per_minute, 1_200);
        assert_eq!(cfg.storage.kind, StorageKind::File);
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut cfg = Config::default();
        cfg.checker.concurrency_total = 0;
        assert!(cfg.validate().is_err());
        cfg.checker.concurrency_total = 200_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zmap_without_ports() {
        let mut cfg = Config::default();
        cfg.zmap.enabled = true;
        cfg.zmap.ports = Vec::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_minimal_document() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.checker.mode, CheckMode::FullHttp);
        assert_eq!(cfg.checker.socks_mode, SocksMode::Handshake);
    }

    #[test]
    fn deserializes_kebab_modes() {
        let cfg: Config = serde_json::from_str(
            r#"{"checker": {"mode": "connect-only", "socks_mode": "full-http"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.checker.mode, CheckMode::ConnectOnly);
        assert_eq!(cfg.checker.socks_mode, SocksMode::FullHttp);
    }

    #[test]
    fn unknown_storage_type_fails() {
        let res = serde_json::from_str::<Config>(r#"{"storage": {"type": "mongo"}}"#);
        assert!(res.is_err());
    }
}
