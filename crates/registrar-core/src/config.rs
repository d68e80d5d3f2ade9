//! Registrar configuration

use serde::{Deserialize, Serialize};

use crate::error::{RegistrarError, Result};

/// Registrar settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Digest realm advertised in challenges
    pub realm: String,
    /// Expiry applied when the client does not ask for one
    pub default_expires: u32,
    /// Requests below this are raised to it
    pub min_expires: u32,
    /// Requests above this are capped to it
    pub max_expires: u32,
    /// How long an issued nonce stays valid (seconds)
    pub nonce_ttl_secs: u64,
    /// Require digest credentials on REGISTER
    pub require_auth: bool,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            realm: "pbx.local".to_string(),
            default_expires: 3600,
            min_expires: 60,
            max_expires: 86400,
            nonce_ttl_secs: 300,
            require_auth: true,
        }
    }
}

impl RegistrarConfig {
    pub fn validate(&self) -> Result<()> {
        if self.realm.trim().is_empty() {
            return Err(RegistrarError::ConfigError("realm must not be empty".to_string()));
        }
        if self.min_expires == 0 {
            return Err(RegistrarError::ConfigError("min_expires must be positive".to_string()));
        }
        if self.min_expires > self.max_expires {
            return Err(RegistrarError::ConfigError(format!(
                "min_expires ({}) exceeds max_expires ({})",
                self.min_expires, self.max_expires
            )));
        }
        if self.nonce_ttl_secs == 0 {
            return Err(RegistrarError::ConfigError("nonce_ttl_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RegistrarConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_expiry_bounds_rejected() {
        let config = RegistrarConfig {
            min_expires: 7200,
            max_expires: 3600,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RegistrarError::ConfigError(_))));
    }
}
