//! Registration data types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistrarError;

/// Transport the endpoint registered over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Wss,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Wss => "wss",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = RegistrarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            "tls" => Ok(TransportKind::Tls),
            "ws" | "wss" => Ok(TransportKind::Wss),
            other => Err(RegistrarError::invalid(format!("unknown transport '{}'", other))),
        }
    }
}

/// Where an endpoint said it can be reached, as carried by a REGISTER
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactBinding {
    /// Contact header URI
    pub contact: String,
    /// Source address the request arrived from
    pub source_ip: String,
    pub port: u16,
    pub transport: TransportKind,
    pub user_agent: Option<String>,
}

impl ContactBinding {
    pub fn new(
        contact: impl Into<String>,
        source_ip: impl Into<String>,
        port: u16,
        transport: TransportKind,
    ) -> Self {
        Self {
            contact: contact.into(),
            source_ip: source_ip.into(),
            port,
            transport,
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Current reachable location of one extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub extension_id: String,
    pub contact: String,
    pub source_ip: String,
    pub port: u16,
    pub transport: TransportKind,
    pub user_agent: Option<String>,
    /// First time this binding was accepted (kept across refreshes of the same contact)
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    /// A binding whose expiry lies strictly in the past is logically absent
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Seconds left before expiry, zero once expired
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Why a registration disappeared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// REGISTER with expires=0 or an explicit unregister
    Unregister,
    /// Removed by the periodic sweep
    Expired,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Unregister => "unregister",
            RemovalReason::Expired => "expired",
        }
    }
}
