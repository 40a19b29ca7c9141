//! # Built-in Commands
//!
//! Commands the runtime itself raises on the bus. Feature actors observe
//! link lifecycle and kernel notifications by handling these.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Built-in Commands                                │
//! │                                                                         │
//! │  Connected / Disconnected      any link changed state                  │
//! │  SlaveConnected / Disconnected master: relay reported a slave          │
//! │  ForwardToMaster               slave: wraps a SlaveForwardsToMaster    │
//! │                                command for the master                  │
//! │  UnitDataChanged               kernel pushed new unit data             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_core::protocol::RemoteCommandPayload;
use tandem_core::{CommandKind, CommandRegistry, CoreResult, ExecutionScope};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConnectedPayload {
    /// "master" or "kernel".
    pub link: String,
    pub address_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkDisconnectedPayload {
    pub link: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlavePresencePayload {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitDataPayload {
    #[serde(default)]
    pub data: Value,
}

pub struct Connected;
impl CommandKind for Connected {
    const NAME: &'static str = "Connected";
    const SCOPE: ExecutionScope = ExecutionScope::Unrestricted;
    type Payload = LinkConnectedPayload;
}

pub struct Disconnected;
impl CommandKind for Disconnected {
    const NAME: &'static str = "Disconnected";
    const SCOPE: ExecutionScope = ExecutionScope::Unrestricted;
    type Payload = LinkDisconnectedPayload;
}

pub struct SlaveConnected;
impl CommandKind for SlaveConnected {
    const NAME: &'static str = "SlaveConnected";
    const SCOPE: ExecutionScope = ExecutionScope::MasterOnly;
    type Payload = SlavePresencePayload;
}

pub struct SlaveDisconnected;
impl CommandKind for SlaveDisconnected {
    const NAME: &'static str = "SlaveDisconnected";
    const SCOPE: ExecutionScope = ExecutionScope::MasterOnly;
    type Payload = SlavePresencePayload;
}

pub struct ForwardToMaster;
impl CommandKind for ForwardToMaster {
    const NAME: &'static str = "ForwardToMaster";
    const SCOPE: ExecutionScope = ExecutionScope::SlaveOnly;
    type Payload = RemoteCommandPayload;
}

pub struct UnitDataChanged;
impl CommandKind for UnitDataChanged {
    const NAME: &'static str = "UnitDataChanged";
    const SCOPE: ExecutionScope = ExecutionScope::Unrestricted;
    type Payload = UnitDataPayload;
}

/// Registers every built-in kind.
pub fn register_builtins(registry: &mut CommandRegistry) -> CoreResult<()> {
    registry.register::<Connected>()?;
    registry.register::<Disconnected>()?;
    registry.register::<SlaveConnected>()?;
    registry.register::<SlaveDisconnected>()?;
    registry.register::<ForwardToMaster>()?;
    registry.register::<UnitDataChanged>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_once() {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(registry.len(), 6);
        assert!(register_builtins(&mut registry).is_err());
        assert_eq!(
            registry.scope_of(ForwardToMaster::NAME),
            Some(ExecutionScope::SlaveOnly)
        );
    }
}
