//! # Process Identity Types
//!
//! A terminal process runs as exactly one [`Role`]. Slaves additionally know
//! which display they drive, carried as a [`SlaveContext`].

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Role
// =============================================================================

/// The role of this terminal process.
///
/// ```text
/// MASTER ──── owns the server-facing link, may drive secondary displays
/// SLAVE  ──── mirrors a subset of master state, forwards user commands
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Role {
    #[default]
    Master,
    Slave,
}

impl Role {
    /// Returns the counterpart role on the master link.
    pub fn peer(&self) -> Role {
        match self {
            Role::Master => Role::Slave,
            Role::Slave => Role::Master,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" | "primary" => Ok(Role::Master),
            "slave" | "secondary" => Ok(Role::Slave),
            other => Err(CoreError::InvalidRole(other.to_string())),
        }
    }
}

// =============================================================================
// Display Mode
// =============================================================================

/// Which physical display a slave process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DisplayMode {
    /// Cashier-facing screen.
    #[default]
    Primary,
    /// Customer-facing screen.
    Secondary,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayMode::Primary => write!(f, "primary"),
            DisplayMode::Secondary => write!(f, "secondary"),
        }
    }
}

// =============================================================================
// Slave Context
// =============================================================================

/// Identity of a slave display, stamped onto commands relayed to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SlaveContext {
    pub slave_name: String,
    pub display_mode: DisplayMode,
}

impl SlaveContext {
    pub fn new(slave_name: impl Into<String>, display_mode: DisplayMode) -> Self {
        SlaveContext {
            slave_name: slave_name.into(),
            display_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("SLAVE".parse::<Role>().unwrap(), Role::Slave);
        assert_eq!("secondary".parse::<Role>().unwrap(), Role::Slave);
        assert!("observer".parse::<Role>().is_err());
    }

    #[test]
    fn test_slave_context_wire_format() {
        let ctx = SlaveContext::new("customer-display", DisplayMode::Secondary);
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"slaveName\":\"customer-display\""));
        assert!(json.contains("\"displayMode\":\"secondary\""));
    }
}
