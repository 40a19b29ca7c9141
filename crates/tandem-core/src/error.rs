//! # Error Types
//!
//! Two layers of errors live here:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  CoreError  - typed failures of pure logic (scope, cycle, registry)    │
//! │  AppError   - normalized record handed to lifecycle listeners          │
//! │                                                                         │
//! │  Flow: CoreError ─┐                                                    │
//! │        SyncError ─┼──► to_app_error() ──► AppError ──► listeners/UI    │
//! │        handler  ──┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The taxonomy is category × severity, not exception types. Presentation
//! (toasts, alerts) belongs to the view layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::command::{Command, ExecutionScope};
use crate::types::Role;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Category & Severity
// =============================================================================

/// Broad origin of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ErrorCategory {
    /// Internal failures: handler crashed, breaker missing, channel closed.
    System,
    /// Registration, socket, heartbeat, timeout, all-servers-failed.
    Network,
    /// Role/scope preconditions, cycle detection, malformed input.
    Validation,
    /// Domain errors reported by a reachable server.
    Business,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Network => write!(f, "NETWORK"),
            ErrorCategory::Validation => write!(f, "VALIDATION"),
            ErrorCategory::Business => write!(f, "BUSINESS"),
        }
    }
}

/// How loudly the view layer should surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

// =============================================================================
// App Error (normalized)
// =============================================================================

/// Normalized error record.
///
/// ## Serialization
/// ```json
/// {
///   "category": "NETWORK",
///   "severity": "HIGH",
///   "key": "network.all_servers_failed",
///   "message": "All servers failed for kernel after 3 attempts",
///   "commandId": "a1b2c3d4",
///   "requestId": "INTERNAL",
///   "sessionId": "INTERNAL"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
#[error("[{category}] {key}: {message}")]
pub struct AppError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Stable machine-readable key, e.g. `command.forbidden_scope`.
    pub key: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AppError {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AppError {
            category,
            severity,
            key: key.into(),
            message: message.into(),
            command_id: None,
            request_id: None,
            session_id: None,
        }
    }

    pub fn system(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, ErrorSeverity::High, key, message)
    }

    pub fn network(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, ErrorSeverity::Medium, key, message)
    }

    pub fn validation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, ErrorSeverity::Medium, key, message)
    }

    pub fn business(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Business, ErrorSeverity::Low, key, message)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Stamps the correlation ids of the command this error belongs to.
    pub fn for_command(mut self, command: &Command) -> Self {
        self.command_id = Some(command.id.clone());
        self.request_id = Some(command.request_id.clone());
        self.session_id = Some(command.session_id.clone());
        self
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Failures of the pure command model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Command scope does not allow execution under the current role.
    #[error("Command {command} with scope {scope} is forbidden on a {role}")]
    ForbiddenScope {
        command: String,
        scope: ExecutionScope,
        role: Role,
    },

    /// Command type already present in the inherited execution path.
    #[error("Cycle detected: {command} already appears in execution path [{path}]")]
    CycleDetected { command: String, path: String },

    /// Same command name registered twice.
    #[error("Command {0} is already registered")]
    DuplicateCommand(String),

    /// Remote peer sent a command this process never registered.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Payload does not match the command's declared payload type.
    #[error("Invalid payload for {command}: {reason}")]
    InvalidPayload { command: String, reason: String },

    /// Unrecognized role string.
    #[error("Unknown role: '{0}'. Valid options: master, slave")]
    InvalidRole(String),

    /// Wire message could not be parsed.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl CoreError {
    /// Stable key for the normalized error.
    pub fn key(&self) -> &'static str {
        match self {
            CoreError::ForbiddenScope { .. } => "command.forbidden_scope",
            CoreError::CycleDetected { .. } => "command.cycle_detected",
            CoreError::DuplicateCommand(_) => "command.duplicate_registration",
            CoreError::UnknownCommand(_) => "command.unknown",
            CoreError::InvalidPayload { .. } => "command.invalid_payload",
            CoreError::InvalidRole(_) => "config.invalid_role",
            CoreError::InvalidEnvelope(_) => "protocol.invalid_envelope",
        }
    }

    pub fn to_app_error(&self) -> AppError {
        let severity = match self {
            CoreError::DuplicateCommand(_) => ErrorSeverity::Critical,
            CoreError::CycleDetected { .. } => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        };
        AppError::new(ErrorCategory::Validation, severity, self.key(), self.to_string())
    }
}
