//! # Wire Protocol
//!
//! Everything carried over a terminal socket is a [`MessageEnvelope`]:
//!
//! ```json
//! { "from": "dev-1", "id": "a1b2c3d4", "type": "SYNC_STATE", "data": {...}, "targetDevice": "dev-2" }
//! ```
//!
//! ## Message Types
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Master Link Messages                               │
//! │                                                                         │
//! │  SYSTEM (relay → device)                                               │
//! │  ──────                                                                │
//! │  __system_slave_connected      { deviceId, deviceName }                │
//! │  __system_slave_disconnected   { deviceId, deviceName }                │
//! │  __system_heartbeat            { timestamp }                           │
//! │  __system_heartbeat_ack        (echoes heartbeat data)                 │
//! │                                                                         │
//! │  APPLICATION (device ↔ device)                                         │
//! │  ───────────                                                           │
//! │  SYNC_STATE_REQUEST       { summary, targetDevice }                    │
//! │  SYNC_STATE               { key, stateChanged, targetDevice }          │
//! │  REMOTE_COMMAND           { commandId, commandName, payload, ... }     │
//! │  REMOTE_COMMAND_EXECUTED  { commandId }                                │
//! │                                                                         │
//! │                      Kernel Link Messages                               │
//! │  UNIT_DATA_CHANGED        (opaque unit data)                           │
//! │  REMOTE_COMMAND           (same payload as above)                      │
//! │  confirmation: HTTP POST  { commandId }                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{short_id, Command};
use crate::error::{CoreError, CoreResult};
use crate::state::{BucketDiff, StateSummary};
use crate::types::{Role, SlaveContext};

/// Message type tags.
pub mod message_types {
    pub const SLAVE_CONNECTED: &str = "__system_slave_connected";
    pub const SLAVE_DISCONNECTED: &str = "__system_slave_disconnected";
    pub const HEARTBEAT: &str = "__system_heartbeat";
    pub const HEARTBEAT_ACK: &str = "__system_heartbeat_ack";

    pub const SYNC_STATE: &str = "SYNC_STATE";
    pub const SYNC_STATE_REQUEST: &str = "SYNC_STATE_REQUEST";
    pub const REMOTE_COMMAND: &str = "REMOTE_COMMAND";
    pub const REMOTE_COMMAND_EXECUTED: &str = "REMOTE_COMMAND_EXECUTED";
    pub const UNIT_DATA_CHANGED: &str = "UNIT_DATA_CHANGED";

    /// Prefix shared by relay-generated messages.
    pub const SYSTEM_PREFIX: &str = "__system_";
}

// =============================================================================
// Envelope
// =============================================================================

/// Wire unit carried over a socket link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Sender device id.
    pub from: String,
    /// Per-message id, used for inbound de-duplication.
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device: Option<String>,
}

impl MessageEnvelope {
    pub fn new(from: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        MessageEnvelope {
            from: from.into(),
            id: short_id(),
            message_type: message_type.into(),
            data,
            target_device: None,
        }
    }

    /// Builds an envelope from a typed payload.
    pub fn with_payload<T: Serialize>(
        from: impl Into<String>,
        message_type: impl Into<String>,
        payload: &T,
    ) -> CoreResult<Self> {
        let data = serde_json::to_value(payload).map_err(|e| CoreError::InvalidEnvelope(e.to_string()))?;
        Ok(Self::new(from, message_type, data))
    }

    pub fn targeting(mut self, device: impl Into<String>) -> Self {
        self.target_device = Some(device.into());
        self
    }

    /// Heartbeat ack echoing the original heartbeat payload.
    pub fn heartbeat_ack(from: impl Into<String>, heartbeat: &MessageEnvelope) -> Self {
        Self::new(from, message_types::HEARTBEAT_ACK, heartbeat.data.clone())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == message_types::HEARTBEAT || self.message_type == message_types::HEARTBEAT_ACK
    }

    pub fn is_system(&self) -> bool {
        self.message_type.starts_with(message_types::SYSTEM_PREFIX)
    }

    /// Decodes `data` as `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CoreError::InvalidEnvelope(format!("{} payload: {}", self.message_type, e))
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Data of `__system_slave_connected` / `__system_slave_disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveLifecyclePayload {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

/// Data of `__system_heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn now() -> Self {
        HeartbeatPayload {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Data of `SYNC_STATE`: one bucket's diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatePayload {
    pub key: String,
    pub state_changed: BucketDiff,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device: Option<String>,
}

/// Data of `SYNC_STATE_REQUEST`: what the sender already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateRequestPayload {
    pub summary: StateSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device: Option<String>,
}

/// Data of `REMOTE_COMMAND`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandPayload {
    pub command_id: String,
    pub command_name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_info: Option<SlaveContext>,
}

impl RemoteCommandPayload {
    /// Captures a command for relaying to the peer.
    pub fn from_command(command: &Command) -> Self {
        RemoteCommandPayload {
            command_id: command.id.clone(),
            command_name: command.name.clone(),
            payload: command.payload.clone(),
            request_id: Some(command.request_id.clone()),
            session_id: Some(command.session_id.clone()),
            slave_info: command.slave_context.clone(),
        }
    }
}

/// Data of `REMOTE_COMMAND_EXECUTED`, also the body of the kernel HTTP
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfirmation {
    pub command_id: String,
}

// =============================================================================
// Relay Registration (HTTP)
// =============================================================================

/// Body of `POST {baseURL}/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(rename = "type")]
    pub device_type: Role,
    pub device_id: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_device_id: Option<String>,
}

/// Response of `POST {baseURL}/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegisterResponse {
    pub fn ok(token: impl Into<String>) -> Self {
        RegisterResponse {
            success: true,
            token: Some(token.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        RegisterResponse {
            success: false,
            token: None,
            error: Some(error.into()),
        }
    }
}
