use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pbx_registrar_core::RegistrarConfig;

use crate::error::{CallEngineError, Result};

/// Call engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// General PBX settings
    pub general: GeneralConfig,

    /// REGISTER handling
    pub registrar: RegistrarConfig,

    /// Bounds on collaborator calls and call timers
    pub timeouts: TimeoutConfig,

    /// Background sweep settings
    pub housekeeping: HousekeepingConfig,

    /// Real-time event fan-out
    pub events: EventsConfig,

    /// Call record persistence
    pub database: DatabaseConfig,

    /// Logging output
    pub logging: LogConfig,
}

/// General PBX configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// SIP domain used for extension URIs
    pub domain: String,

    /// Host of the media application server (voicemail, IVR)
    pub app_host: String,

    /// User agent string
    pub user_agent: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            domain: "pbx.local".to_string(),
            app_host: "127.0.0.1".to_string(),
            user_agent: format!("pbx-call-engine/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on any signaling engine command (milliseconds)
    pub signaling_timeout_ms: u64,

    /// Upper bound on any media proxy command (milliseconds)
    pub media_timeout_ms: u64,

    /// Upper bound on entity and call-record store calls (milliseconds)
    pub store_timeout_ms: u64,

    /// Offered calls not answered within this end as no-answer (seconds)
    pub ring_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            signaling_timeout_ms: 5_000,
            media_timeout_ms: 2_000,
            store_timeout_ms: 2_000,
            ring_timeout_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.media_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

/// Housekeeping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Registration sweep period (seconds)
    pub sweep_interval_secs: u64,

    /// How long ended sessions stay in the live registry (seconds)
    pub ended_session_retention_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            ended_session_retention_secs: 300,
        }
    }
}

impl HousekeepingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-observer buffer; events beyond it are dropped for that observer
    pub observer_channel_capacity: usize,

    /// Bearer tokens accepted at observer connect time, mapped to a principal
    pub observer_tokens: Vec<ObserverToken>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            observer_channel_capacity: 256,
            observer_tokens: Vec::new(),
        }
    }
}

/// A static console credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverToken {
    pub token: String,
    pub principal: String,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL for call records; in-memory records when unset
    pub url: Option<String>,

    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base level (trace, debug, info, warn, error); RUST_LOG directives are added on top
    pub level: String,

    /// Emit JSON lines
    pub json: bool,

    /// Include file and line information
    pub file_info: bool,

    /// Log span enter/exit
    pub log_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing sections fall back to defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(input)
            .map_err(|e| CallEngineError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallEngineError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.general.domain.trim().is_empty() {
            return Err(CallEngineError::config("general.domain must not be empty"));
        }
        if self.general.app_host.trim().is_empty() {
            return Err(CallEngineError::config("general.app_host must not be empty"));
        }
        self.registrar
            .validate()
            .map_err(|e| CallEngineError::config(e.to_string()))?;

        if self.timeouts.signaling_timeout_ms == 0 {
            return Err(CallEngineError::config("timeouts.signaling_timeout_ms must be positive"));
        }
        if self.timeouts.media_timeout_ms == 0 {
            return Err(CallEngineError::config("timeouts.media_timeout_ms must be positive"));
        }
        if self.timeouts.store_timeout_ms == 0 {
            return Err(CallEngineError::config("timeouts.store_timeout_ms must be positive"));
        }
        if self.timeouts.ring_timeout_secs == 0 {
            return Err(CallEngineError::config("timeouts.ring_timeout_secs must be positive"));
        }
        if self.housekeeping.sweep_interval_secs == 0 {
            return Err(CallEngineError::config("housekeeping.sweep_interval_secs must be positive"));
        }
        if self.events.observer_channel_capacity == 0 {
            return Err(CallEngineError::config("events.observer_channel_capacity must be positive"));
        }
        if self.database.max_connections == 0 {
            return Err(CallEngineError::config("database.max_connections must be positive"));
        }
        crate::logging::parse_log_level(&self.logging.level)?;
        Ok(())
    }
}
