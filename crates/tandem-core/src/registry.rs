//! # Command Registry
//!
//! Maps a `commandName` to what is needed to rebuild a [`Command`] from
//! `(name, payload)` when it arrives from a remote peer.
//!
//! Registration happens once per type at process start. Registering the same
//! name twice is a configuration error the caller must treat as fatal.

use std::collections::HashMap;

use serde_json::Value;

use crate::command::{Command, CommandKind, ExecutionScope};
use crate::error::{CoreError, CoreResult};

type PayloadCheck = fn(&str, &Value) -> CoreResult<()>;

#[derive(Clone, Copy)]
struct RegistryEntry {
    scope: ExecutionScope,
    check: PayloadCheck,
}

/// Table of known command types.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers command kind `K`.
    pub fn register<K: CommandKind>(&mut self) -> CoreResult<()> {
        if self.entries.contains_key(K::NAME) {
            return Err(CoreError::DuplicateCommand(K::NAME.to_string()));
        }
        self.entries.insert(
            K::NAME.to_string(),
            RegistryEntry {
                scope: K::SCOPE,
                check: check_payload::<K>,
            },
        );
        Ok(())
    }

    /// Rebuilds a command from its wire form.
    ///
    /// The scope always comes from the local declaration, never the peer.
    pub fn rehydrate(&self, name: &str, payload: Value) -> CoreResult<Command> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CoreError::UnknownCommand(name.to_string()))?;
        (entry.check)(name, &payload)?;
        Ok(Command::from_parts(name, entry.scope, payload))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn scope_of(&self, name: &str) -> Option<ExecutionScope> {
        self.entries.get(name).map(|entry| entry.scope)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry").field("commands", &names).finish()
    }
}

fn check_payload<K: CommandKind>(name: &str, payload: &Value) -> CoreResult<()> {
    serde_json::from_value::<K::Payload>(payload.clone())
        .map(|_| ())
        .map_err(|e| CoreError::InvalidPayload {
            command: name.to_string(),
            reason: e.to_string(),
        })
}
