//! Application configuration
//!
//! Loaded from `config/{env}.yaml`. Every section has serde defaults, so a
//! minimal file only names what differs. `DATABASE_URL` overrides the
//! database URL from the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::risk::RiskConfig;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub reconciliation: ReconcileConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// No URL means in-memory stores (local runs only)
    pub url: Option<String>,
    pub max_connections: u32,
    pub apply_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            apply_schema: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: String,
    pub file: String,
    pub use_json: bool,
    /// hourly | daily | never
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "./logs".to_string(),
            file: "wallet_ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on a single provider call
    pub provider_timeout_ms: u64,
    /// Pause before the single retry of a failed provider call
    pub retry_backoff_ms: u64,
    /// Past transactions fed to the risk scorer
    pub history_depth: usize,
    /// Provider-local UTC offset; defines "today" for limits and risk
    pub day_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 15_000,
            retry_backoff_ms: 500,
            history_depth: 20,
            day_offset_minutes: 60,
        }
    }
}

impl EngineConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn day_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.day_offset_minutes * 60).unwrap_or(Utc.fix())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcileConfig {
    pub enabled: bool,
    /// How often the sweep runs
    pub interval_secs: u64,
    /// Pending transactions younger than this are left alone
    pub reconcile_after_secs: u64,
    /// Pending longer than this is surfaced for manual attention
    pub indeterminate_after_secs: u64,
    pub batch_size: usize,
    /// Parallel status queries per sweep
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            reconcile_after_secs: 120,
            indeterminate_after_secs: 86_400,
            batch_size: 100,
            concurrency: 8,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Overrides `engine.provider_timeout_ms` for the HTTP client when set
    pub http_timeout_ms: Option<u64>,
    pub bank: Option<BearerProviderConfig>,
    pub bills: Option<BillsProviderConfig>,
    pub card: Option<BearerProviderConfig>,
    pub gift_card: Option<GiftCardProviderConfig>,
    /// Serve classes without a configured provider from a mock (dev only)
    pub mock_unconfigured: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BearerProviderConfig {
    pub base_url: String,
    pub secret_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BillsProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GiftCardProviderConfig {
    pub base_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, EngineError> {
        Self::load_from_path(format!("config/{}.yaml", env))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.is_empty()
        {
            config.database.url = Some(url);
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| EngineError::Config(format!("invalid config yaml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if FixedOffset::east_opt(self.engine.day_offset_minutes * 60).is_none() {
            return Err(EngineError::Config(format!(
                "engine.day_offset_minutes out of range: {}",
                self.engine.day_offset_minutes
            )));
        }
        if self.engine.provider_timeout_ms == 0 {
            return Err(EngineError::Config(
                "engine.provider_timeout_ms must be positive".into(),
            ));
        }
        if self.reconciliation.concurrency == 0 || self.reconciliation.batch_size == 0 {
            return Err(EngineError::Config(
                "reconciliation concurrency and batch_size must be positive".into(),
            ));
        }
        // A row younger than one full provider call may still be owned by
        // the orchestrator; the sweep must not race it
        let call_budget_ms =
            self.engine.provider_timeout_ms * 2 + self.engine.retry_backoff_ms;
        if self.reconciliation.reconcile_after_secs * 1_000 <= call_budget_ms {
            return Err(EngineError::Config(format!(
                "reconciliation.reconcile_after_secs must exceed the provider call budget of {}ms",
                call_budget_ms
            )));
        }
        if !matches!(self.log.rotation.as_str(), "hourly" | "daily" | "never") {
            return Err(EngineError::Config(format!(
                "log.rotation must be hourly, daily or never: {}",
                self.log.rotation
            )));
        }
        self.risk.validate().map_err(EngineError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = AppConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.day_offset().local_minus_utc(), 3600);
        assert_eq!(config.risk.high_threshold, 60);
        assert!(config.database.url.is_none());
        assert!(config.providers.bank.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
engine:
  provider_timeout_ms: 2000
risk:
  weights:
    new_device: 25
providers:
  bills:
    base_url: https://sandbox.bills.example/api
    api_key: ak
    secret_key: sk
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.engine.provider_timeout(), Duration::from_secs(2));
        assert_eq!(config.engine.retry_backoff_ms, 500);
        assert_eq!(config.risk.weights.new_device, 25);
        assert_eq!(config.risk.weights.new_location, 10);
        assert_eq!(
            config.providers.bills.unwrap().base_url,
            "https://sandbox.bills.example/api"
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_yaml_str("engine:\n  day_offset_minutes: 100000\n").is_err());
        assert!(AppConfig::from_yaml_str("log:\n  rotation: weekly\n").is_err());
        assert!(AppConfig::from_yaml_str("risk:\n  weights:\n    velocity_burst: 70\n").is_err());
        // Shorter than two 15s provider calls plus backoff
        assert!(
            AppConfig::from_yaml_str("reconciliation:\n  reconcile_after_secs: 30\n").is_err()
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 9100").unwrap();
        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);

        assert!(matches!(
            AppConfig::load_from_path("/nonexistent/config.yaml"),
            Err(EngineError::Config(_))
        ));
    }
}
