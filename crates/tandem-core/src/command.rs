//! # Commands
//!
//! A [`Command`] is a typed unit of work pushed onto the actor bus exactly
//! once. Its type tag (`commandName`) is registered globally; its payload is
//! opaque JSON validated against the declaring [`CommandKind`].
//!
//! ## Provenance
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Command Provenance                                  │
//! │                                                                         │
//! │  from request   → requestId/sessionId from the caller                  │
//! │  internally     → requestId = sessionId = "INTERNAL"                   │
//! │  from parent    → ids + slaveContext copied from parent,               │
//! │                   executionPath = parent.path + [parent]               │
//! │                                                                         │
//! │  CYCLE GUARD                                                           │
//! │  ───────────                                                           │
//! │  A ─► B ─► A     rejected: "A" already in inherited path [A, B]       │
//! │  A ─► A          rejected: "A" already in inherited path [A]          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::types::{Role, SlaveContext};

/// Sentinel correlation id for commands raised by the runtime itself.
pub const INTERNAL: &str = "INTERNAL";

// =============================================================================
// Execution Scope
// =============================================================================

/// Policy tag restricting which role may run a command locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub enum ExecutionScope {
    /// Runs wherever it is dispatched.
    #[default]
    Unrestricted,
    /// Rejected on slaves.
    MasterOnly,
    /// Rejected on masters.
    SlaveOnly,
    /// On a slave with a known display, relayed to the master instead of
    /// running locally.
    SlaveForwardsToMaster,
}

impl ExecutionScope {
    /// Returns true if a command with this scope may be dispatched under `role`.
    pub fn permits(&self, role: Role) -> bool {
        !matches!(
            (self, role),
            (ExecutionScope::MasterOnly, Role::Slave) | (ExecutionScope::SlaveOnly, Role::Master)
        )
    }
}

impl std::fmt::Display for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionScope::Unrestricted => write!(f, "unrestricted"),
            ExecutionScope::MasterOnly => write!(f, "master-only"),
            ExecutionScope::SlaveOnly => write!(f, "slave-only"),
            ExecutionScope::SlaveForwardsToMaster => write!(f, "slave-forwards-to-master"),
        }
    }
}

// =============================================================================
// Command Kind (static declaration)
// =============================================================================

/// Static declaration of a command type.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tandem_core::{CommandKind, ExecutionScope};
///
/// #[derive(Serialize, Deserialize)]
/// struct OpenDrawerPayload { reason: String }
///
/// struct OpenDrawer;
/// impl CommandKind for OpenDrawer {
///     const NAME: &'static str = "OpenDrawer";
///     const SCOPE: ExecutionScope = ExecutionScope::MasterOnly;
///     type Payload = OpenDrawerPayload;
/// }
/// ```
pub trait CommandKind: Send + Sync + 'static {
    /// Globally unique type tag.
    const NAME: &'static str;
    /// Where the command may run.
    const SCOPE: ExecutionScope;
    /// Payload shape.
    type Payload: Serialize + DeserializeOwned + Send + 'static;
}

// =============================================================================
// Command
// =============================================================================

/// One hop of the forwarding chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
}

/// A dispatched unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Short random id, unique per instance.
    pub id: String,
    /// Registered type tag.
    #[serde(rename = "commandName")]
    pub name: String,
    /// Creation time (Unix millis).
    pub timestamp: i64,
    pub execution_scope: ExecutionScope,
    pub payload: Value,
    pub request_id: String,
    pub session_id: String,
    /// Ancestors of this command, oldest first. Never contains `name`.
    #[serde(default)]
    pub execution_path: Vec<PathEntry>,
    /// Present only while a command is relayed from a slave to the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_context: Option<SlaveContext>,
}

impl Command {
    /// Creates a command of kind `K` with internal provenance.
    pub fn new<K: CommandKind>(payload: K::Payload) -> CoreResult<Self> {
        let payload = serde_json::to_value(payload).map_err(|e| CoreError::InvalidPayload {
            command: K::NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_parts(K::NAME, K::SCOPE, payload))
    }

    /// Creates a command from its untyped parts.
    pub fn from_parts(name: impl Into<String>, scope: ExecutionScope, payload: Value) -> Self {
        Command {
            id: short_id(),
            name: name.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            execution_scope: scope,
            payload,
            request_id: INTERNAL.to_string(),
            session_id: INTERNAL.to_string(),
            execution_path: Vec::new(),
            slave_context: None,
        }
    }

    /// Attaches caller-supplied correlation ids.
    pub fn with_request(mut self, request_id: Option<String>, session_id: Option<String>) -> Self {
        self.request_id = request_id.unwrap_or_else(|| INTERNAL.to_string());
        self.session_id = session_id.unwrap_or_else(|| INTERNAL.to_string());
        self
    }

    /// Marks the command as raised by the runtime (sentinel ids).
    pub fn internal(self) -> Self {
        self.with_request(None, None)
    }

    /// Inherits provenance from `parent`, rejecting forwarding loops.
    pub fn with_parent(mut self, parent: &Command) -> CoreResult<Self> {
        let mut inherited = parent.execution_path.clone();
        inherited.push(PathEntry {
            id: parent.id.clone(),
            command_type: parent.name.clone(),
        });

        if inherited.iter().any(|entry| entry.command_type == self.name) {
            return Err(CoreError::CycleDetected {
                command: self.name.clone(),
                path: format_path(&inherited),
            });
        }

        self.execution_path = inherited;
        self.request_id = parent.request_id.clone();
        self.session_id = parent.session_id.clone();
        if self.slave_context.is_none() {
            self.slave_context = parent.slave_context.clone();
        }
        Ok(self)
    }

    /// Re-checks the cycle invariant on a command about to be dispatched.
    ///
    /// Catches paths that arrived pre-built (e.g. rehydrated from a peer).
    pub fn check_path(&self) -> CoreResult<()> {
        if self.execution_path.iter().any(|entry| entry.command_type == self.name) {
            return Err(CoreError::CycleDetected {
                command: self.name.clone(),
                path: format_path(&self.execution_path),
            });
        }
        Ok(())
    }

    /// Returns true if this command is of kind `K`.
    pub fn is<K: CommandKind>(&self) -> bool {
        self.name == K::NAME
    }

    /// Decodes the payload as `K`'s payload type.
    pub fn payload_as<K: CommandKind>(&self) -> CoreResult<K::Payload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| CoreError::InvalidPayload {
            command: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Returns true if the command carries real (non-sentinel) request ids.
    pub fn is_tracked(&self) -> bool {
        self.request_id != INTERNAL
    }
}

/// Generates an 8 character id.
pub fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn format_path(path: &[PathEntry]) -> String {
    path.iter()
        .map(|entry| entry.command_type.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Empty {}

    struct Checkout;
    impl CommandKind for Checkout {
        const NAME: &'static str = "Checkout";
        const SCOPE: ExecutionScope = ExecutionScope::Unrestricted;
        type Payload = Empty;
    }

    struct PrintReceipt;
    impl CommandKind for PrintReceipt {
        const NAME: &'static str = "PrintReceipt";
        const SCOPE: ExecutionScope = ExecutionScope::MasterOnly;
        type Payload = Empty;
    }

    #[test]
    fn test_new_command_is_internal() {
        let cmd = Command::new::<Checkout>(Empty {}).unwrap();
        assert_eq!(cmd.request_id, INTERNAL);
        assert_eq!(cmd.session_id, INTERNAL);
        assert_eq!(cmd.id.len(), 8);
        assert!(cmd.execution_path.is_empty());
        assert!(!cmd.is_tracked());
    }

    #[test]
    fn test_child_inherits_provenance() {
        let parent = Command::new::<Checkout>(Empty {})
            .unwrap()
            .with_request(Some("req-1".into()), Some("sess-1".into()));
        let child = Command::new::<PrintReceipt>(Empty {})
            .unwrap()
            .with_parent(&parent)
            .unwrap();

        assert_eq!(child.request_id, "req-1");
        assert_eq!(child.session_id, "sess-1");
        assert_eq!(child.execution_path.len(), 1);
        assert_eq!(child.execution_path[0].command_type, "Checkout");
        assert_eq!(child.execution_path[0].id, parent.id);
    }

    #[test]
    fn test_cycle_guard_rejects_loop() {
        let a = Command::new::<Checkout>(Empty {}).unwrap();
        let b = Command::new::<PrintReceipt>(Empty {})
            .unwrap()
            .with_parent(&a)
            .unwrap();
        let again = Command::new::<Checkout>(Empty {}).unwrap().with_parent(&b);

        assert!(matches!(again, Err(CoreError::CycleDetected { .. })));
    }

    #[test]
    fn test_cycle_guard_rejects_self_recursion() {
        let a = Command::new::<Checkout>(Empty {}).unwrap();
        assert!(Command::new::<Checkout>(Empty {}).unwrap().with_parent(&a).is_err());
    }

    #[test]
    fn test_check_path_on_prebuilt_path() {
        let mut cmd = Command::new::<Checkout>(Empty {}).unwrap();
        assert!(cmd.check_path().is_ok());
        cmd.execution_path.push(PathEntry {
            id: "x".into(),
            command_type: "Checkout".into(),
        });
        assert!(cmd.check_path().is_err());
    }

    #[test]
    fn test_scope_permits() {
        assert!(!ExecutionScope::MasterOnly.permits(Role::Slave));
        assert!(!ExecutionScope::SlaveOnly.permits(Role::Master));
        assert!(ExecutionScope::SlaveForwardsToMaster.permits(Role::Master));
        assert!(ExecutionScope::Unrestricted.permits(Role::Slave));
    }

    #[test]
    fn test_wire_field_names() {
        let cmd = Command::new::<Checkout>(Empty {}).unwrap();
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"commandName\":\"Checkout\""));
        assert!(json.contains("\"executionScope\":\"unrestricted\""));
        assert!(!json.contains("slaveContext"));
    }
}
