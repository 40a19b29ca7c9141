//! # Sync Error Types
//!
//! Error types for the terminal runtime.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Runtime Error Categories                          │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Link          │  │     HTTP                │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Registration   │  │  AllServersFailed       │ │
//! │  │  MissingDeviceId│  │  ConnectionFail │  │  BreakerOpen            │ │
//! │  │  InvalidUrl     │  │  HeartbeatTmout │  │  RateLimited            │ │
//! │  │  ServerNotConf. │  │  ConnectInProg. │  │  Business (4xx/5xx)     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Command      │  │    Internal     │  │     State               │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Core(..)       │  │  ChannelError   │  │  InvalidStateValue      │ │
//! │  │  HandlerFailed  │  │  ShuttingDown   │  │  SerializationFailed    │ │
//! │  │  RemoteAckTmout │  │  Internal       │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every variant normalizes into an [`AppError`] through
//! [`SyncError::to_app_error`].

use tandem_core::{AppError, CoreError, ErrorCategory, ErrorSeverity};
use thiserror::Error;

use crate::api::AttemptRecord;

/// Result type alias for runtime operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// No address list registered for a logical server.
    #[error("Server '{0}' is not configured")]
    ServerNotConfigured(String),

    // =========================================================================
    // Link Errors
    // =========================================================================
    /// The relay rejected `POST /register`.
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    /// Failed to establish the socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Socket closed.
    #[error("Disconnected")]
    Disconnected,

    /// Operation exceeded its deadline.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// No heartbeat within the allowed window.
    #[error("Heartbeat timeout after {elapsed_ms} ms")]
    HeartbeatTimeout { elapsed_ms: u64 },

    /// `connect()` called while another connect is in flight.
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// Every candidate address failed.
    #[error("All servers failed for {server} after {} attempts", .attempts.len())]
    AllServersFailed {
        server: String,
        attempts: Vec<AttemptRecord>,
    },

    // =========================================================================
    // HTTP Errors
    // =========================================================================
    /// Circuit breaker rejected the call.
    #[error("Circuit breaker open")]
    BreakerOpen,

    /// Request queue is full.
    #[error("Rate limited: request queue is full ({capacity} pending)")]
    RateLimited { capacity: usize },

    /// Non-retryable HTTP status from a reachable server.
    #[error("Server returned {status}: {body}")]
    Business { status: u16, body: String },

    /// Retryable HTTP status (502/503/504).
    #[error("Server unavailable: {0}")]
    Unavailable(u16),

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command model failure (scope, cycle, registry).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A handler reported failure.
    #[error("Command execution failed: {0}")]
    HandlerFailed(String),

    /// The master did not acknowledge a forwarded command in time.
    #[error("Remote command {command_id} not acknowledged within {timeout_ms} ms")]
    RemoteAckTimeout { command_id: String, timeout_ms: u64 },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// A state write that the store cannot sync.
    #[error("Invalid state value: {0}")]
    InvalidStateValue(String),

    /// Failed to serialize or parse a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Runtime is shutting down")]
    ShuttingDown,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_decode() {
            SyncError::SerializationFailed(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if another attempt (next address, next backoff step)
    /// could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocketError(_)
                | SyncError::Unavailable(_)
                | SyncError::BreakerOpen
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::ServerNotConfigured(_)
        )
    }

    /// Stable machine-readable key.
    pub fn key(&self) -> &'static str {
        match self {
            SyncError::InvalidConfig(_) => "config.invalid",
            SyncError::MissingDeviceId => "config.missing_device_id",
            SyncError::InvalidUrl(_) => "config.invalid_url",
            SyncError::ConfigLoadFailed(_) => "config.load_failed",
            SyncError::ConfigSaveFailed(_) => "config.save_failed",
            SyncError::ServerNotConfigured(_) => "system.server_not_configured",
            SyncError::RegistrationFailed(_) => "network.registration_failed",
            SyncError::ConnectionFailed(_) => "network.connection_failed",
            SyncError::Disconnected => "network.disconnected",
            SyncError::Timeout(_) => "network.timeout",
            SyncError::WebSocketError(_) => "network.websocket_failed",
            SyncError::HeartbeatTimeout { .. } => "network.heartbeat_timeout",
            SyncError::ConnectInProgress => "network.connect_in_progress",
            SyncError::AllServersFailed { .. } => "network.all_servers_failed",
            SyncError::BreakerOpen => "network.breaker_open",
            SyncError::RateLimited { .. } => "network.rate_limited",
            SyncError::Business { .. } => "business.server_error",
            SyncError::Unavailable(_) => "network.server_unavailable",
            SyncError::Core(core) => core.key(),
            SyncError::HandlerFailed(_) => "system.command_failed",
            SyncError::RemoteAckTimeout { .. } => "network.remote_ack_timeout",
            SyncError::InvalidStateValue(_) => "validation.invalid_state_value",
            SyncError::SerializationFailed(_) => "system.serialization_failed",
            SyncError::Internal(_) => "system.internal",
            SyncError::ShuttingDown => "system.shutting_down",
            SyncError::ChannelError(_) => "system.channel_closed",
        }
    }

    /// Normalizes into the record lifecycle listeners receive.
    pub fn to_app_error(&self) -> AppError {
        if let SyncError::Core(core) = self {
            return core.to_app_error();
        }

        let (category, severity) = match self {
            SyncError::Business { .. } => (ErrorCategory::Business, ErrorSeverity::Low),

            SyncError::AllServersFailed { .. } | SyncError::HeartbeatTimeout { .. } => {
                (ErrorCategory::Network, ErrorSeverity::High)
            }
            SyncError::RegistrationFailed(_)
            | SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_)
            | SyncError::ConnectInProgress
            | SyncError::BreakerOpen
            | SyncError::RateLimited { .. }
            | SyncError::Unavailable(_)
            | SyncError::RemoteAckTimeout { .. } => (ErrorCategory::Network, ErrorSeverity::Medium),

            SyncError::InvalidConfig(_)
            | SyncError::MissingDeviceId
            | SyncError::InvalidUrl(_) => (ErrorCategory::Validation, ErrorSeverity::High),
            SyncError::InvalidStateValue(_) => (ErrorCategory::Validation, ErrorSeverity::Medium),

            _ => (ErrorCategory::System, ErrorSeverity::High),
        };

        AppError::new(category, severity, self.key(), self.to_string())
    }
}
