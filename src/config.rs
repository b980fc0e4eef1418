use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::info;

use crate::anchor::worker::WorkerConfig;
use crate::audit::recorder::RecorderConfig;
use crate::error::{LedgerError, LedgerResult};

/// Config file read when `LEDGER_CONFIG` is not set; optional.
pub const DEFAULT_CONFIG_FILE: &str = "ledger.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub recorder: RecorderSettings,
    pub anchoring: AnchoringSettings,
    pub sink: SinkSettings,
    pub verification: VerificationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://audit-ledger.db".to_string(),
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub max_write_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_write_attempts: 5,
            retry_backoff_ms: 10,
        }
    }
}

impl RecorderSettings {
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            max_write_attempts: self.max_write_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchoringSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Use the database lease; disable only when one worker is guaranteed.
    pub use_database_lease: bool,
    pub lease_ttl_secs: u64,
    /// Lease holder name; a random one is generated when unset.
    pub instance_id: Option<String>,
    pub receipt_batch: i64,
}

impl Default for AnchoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            use_database_lease: true,
            lease_ttl_secs: 900,
            instance_id: None,
            receipt_batch: 100,
        }
    }
}

impl AnchoringSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            max_attempts: 3,
            backoff_ms: 200,
            timeout_ms: 5_000,
        }
    }
}

impl SinkSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub timeout_ms: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl VerificationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    /// Load from `LEDGER_CONFIG` (or `ledger.toml`) and `LEDGER__*` variables.
    pub fn load() -> LedgerResult<Self> {
        let path = env::var("LEDGER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> LedgerResult<Self> {
        info!("Loading configuration (file: {})", path);

        let config: AppConfig = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("LEDGER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map_err(|e| LedgerError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.server.port == 0 {
            return Err(LedgerError::Config("server.port must be non-zero".to_string()));
        }
        if self.database.url.trim().is_empty() {
            return Err(LedgerError::Config("database.url must be set".to_string()));
        }
        if self.auth.jwt_secret.len() < 16 {
            return Err(LedgerError::Config(
                "auth.jwt_secret must be at least 16 characters".to_string(),
            ));
        }
        if self.recorder.max_write_attempts == 0 {
            return Err(LedgerError::Config("recorder.max_write_attempts must be >= 1".to_string()));
        }
        if self.anchoring.enabled && self.anchoring.interval_secs == 0 {
            return Err(LedgerError::Config("anchoring.interval_secs must be >= 1".to_string()));
        }
        if self.anchoring.use_database_lease && self.anchoring.lease_ttl_secs <= self.anchoring.interval_secs {
            return Err(LedgerError::Config(
                "anchoring.lease_ttl_secs must exceed anchoring.interval_secs".to_string(),
            ));
        }
        if self.sink.enabled && self.sink.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(LedgerError::Config("sink.url is required when the sink is enabled".to_string()));
        }
        if self.sink.max_attempts == 0 {
            return Err(LedgerError::Config("sink.max_attempts must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            sink_max_attempts: self.sink.max_attempts,
            sink_backoff: Duration::from_millis(self.sink.backoff_ms),
            receipt_batch: self.anchoring.receipt_batch,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
