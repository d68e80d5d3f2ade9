use thiserror::Error;

use pbx_registrar_core::RegistrarError;

use crate::session::HangupCause;

/// Call engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallEngineError {
    /// Unknown extension, trunk, queue, rule or call
    #[error("Not found: {0}")]
    NotFound(String),

    /// No inbound or outbound rule matched the dialed number
    #[error("No route found: {0}")]
    NoRouteFound(String),

    /// The selected trunk is at its concurrent-call limit
    #[error("Trunk saturated: {0}")]
    TrunkSaturated(String),

    /// Signaling or media engine unreachable, failed or timed out
    #[error("Transport error: {0}")]
    Transport(String),

    /// Duplicate unique key on create
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Event for a call that already ended
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Event not legal in the call's current state
    #[error("Invalid transition: {event} not allowed in state {from}")]
    InvalidTransition { from: String, event: String },

    /// Dial pattern could not be parsed
    #[error("Invalid dial pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Malformed request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Registration directory errors
    #[error("Registrar error: {0}")]
    Registrar(#[from] RegistrarError),

    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Observer authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallEngineError {
    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new NoRouteFound error
    pub fn no_route<S: Into<String>>(msg: S) -> Self {
        Self::NoRouteFound(msg.into())
    }

    /// Create a new Transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new Conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a new InvalidState error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new InvalidInput error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Hangup cause recorded when this error stops a call from proceeding.
    ///
    /// Routing refusals, transport and media failures all end the call as
    /// `failed`; there is no separate error event for call failures.
    pub fn hangup_cause(&self) -> HangupCause {
        HangupCause::Failed
    }

    /// Whether this error came from an external engine rather than call logic
    pub fn is_transport(&self) -> bool {
        matches!(self, CallEngineError::Transport(_))
    }
}

impl From<sqlx::Error> for CallEngineError {
    fn from(err: sqlx::Error) -> Self {
        CallEngineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for CallEngineError {
    fn from(err: serde_json::Error) -> Self {
        CallEngineError::Internal(format!("serialization: {}", err))
    }
}

/// Result type for call engine operations
pub type Result<T> = std::result::Result<T, CallEngineError>;
