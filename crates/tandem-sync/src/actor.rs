//! # Actor System
//!
//! Process-wide command bus with role-aware routing and lifecycle reporting.
//!
//! ## Dispatch Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Command Dispatch                                 │
//! │                                                                         │
//! │  submit / submit_internal / execute_from_parent / dispatch             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────────┐  path contains own name   ┌────────────────────────┐ │
//! │  │ cycle guard  │ ────────────────────────► │ on_error("ActorSystem")│ │
//! │  └──────┬───────┘                           │ command not executed   │ │
//! │         ▼                                   └────────────────────────┘ │
//! │  ┌──────────────┐  scope forbids role                ▲                 │
//! │  │ scope check  │ ───────────────────────────────────┘                 │
//! │  └──────┬───────┘                                                      │
//! │         ▼                                                              │
//! │  slave + display context + SlaveForwardsToMaster?                      │
//! │         │ yes ──► wrap in ForwardToMaster (slaveContext stamped)       │
//! │         ▼                                                              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ fan-out: one FIFO channel per registered actor                   │  │
//! │  │                                                                  │  │
//! │  │   actor A ──► handler? ──► on_start ──► spawn ──► on_complete    │  │
//! │  │   actor B ──► handler? ──► on_start ──► spawn ──► on_error       │  │
//! │  │   actor C ──► no handler, ignored                                │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers run as independent tasks: one actor failing (or panicking) never
//! blocks its siblings, and nobody joins on them. Errors are normalized to
//! [`AppError`] carrying the command's correlation ids and are delivered to
//! lifecycle listeners only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tandem_core::protocol::RemoteCommandPayload;
use tandem_core::{AppError, Command, CommandKind, CommandRegistry, CoreError, ExecutionScope, Role, SlaveContext};

use crate::builtin::{register_builtins, ForwardToMaster};
use crate::error::{SyncError, SyncResult};
use crate::state_store::StateStore;

/// Name reported to listeners for rejections made by the bus itself.
pub const SYSTEM_ACTOR: &str = "ActorSystem";

// =============================================================================
// Actors
// =============================================================================

/// What a handler produces: an optional result for `on_complete`.
pub type HandlerOutput = SyncResult<Option<Value>>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerOutput> + Send>>;
type Handler = Arc<dyn Fn(Command, ActorSystem) -> HandlerFuture + Send + Sync>;

/// A named bundle of command handlers, built once at construction.
///
/// ```rust,ignore
/// let actor = Actor::new("PrinterActor")
///     .on::<PrintReceipt, _, _>(|command, _system| async move {
///         let payload = command.payload_as::<PrintReceipt>()?;
///         printer.print(&payload).await?;
///         Ok(None)
///     });
/// system.register_actor(actor);
/// ```
pub struct Actor {
    name: String,
    handlers: HashMap<&'static str, Handler>,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Actor {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    /// Adds the handler for command kind `K`.
    pub fn on<K, F, Fut>(mut self, handler: F) -> Self
    where
        K: CommandKind,
        F: Fn(Command, ActorSystem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutput> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |command, system| Box::pin(handler(command, system)));
        self.handlers.insert(K::NAME, handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, command_name: &str) -> bool {
        self.handlers.contains_key(command_name)
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handled: Vec<_> = self.handlers.keys().collect();
        handled.sort();
        f.debug_struct("Actor")
            .field("name", &self.name)
            .field("handles", &handled)
            .finish()
    }
}

// =============================================================================
// Lifecycle Listeners
// =============================================================================

/// Observer of handler invocations.
pub trait LifecycleListener: Send + Sync {
    fn on_start(&self, _actor: &str, _command: &Command) {}
    fn on_complete(&self, _actor: &str, _command: &Command, _result: Option<&Value>) {}
    fn on_error(&self, _actor: &str, _command: &Command, _error: &AppError) {}
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct ListenerHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

// =============================================================================
// Actor System
// =============================================================================

struct ActorSlot {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

struct Inner {
    role: Role,
    slave_context: Option<SlaveContext>,
    registry: RwLock<CommandRegistry>,
    state: StateStore,
    actors: Mutex<Vec<ActorSlot>>,
    listeners: Mutex<Vec<(u64, Arc<dyn LifecycleListener>)>>,
    next_listener: AtomicU64,
}

/// Cheap to clone; every clone refers to the same bus.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<Inner>,
}

impl ActorSystem {
    /// Creates the bus for a process running as `role`.
    ///
    /// `slave_context` is the display this slave drives; without it a slave
    /// runs `SlaveForwardsToMaster` commands locally.
    pub fn new(role: Role, slave_context: Option<SlaveContext>, state: StateStore) -> SyncResult<Self> {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry)?;

        Ok(ActorSystem {
            inner: Arc::new(Inner {
                role,
                slave_context: match role {
                    Role::Slave => slave_context,
                    Role::Master => None,
                },
                registry: RwLock::new(registry),
                state,
                actors: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn slave_context(&self) -> Option<&SlaveContext> {
        self.inner.slave_context.as_ref()
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    /// Shorthand for `state().get_state_snapshot(key)`.
    pub fn get_state_snapshot(&self, key: &str) -> Option<tandem_core::Bucket> {
        self.inner.state.get_state_snapshot(key)
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Registers command kind `K` so peers can send it by name.
    pub fn register<K: CommandKind>(&self) -> SyncResult<()> {
        self.registry_mut().register::<K>()?;
        Ok(())
    }

    /// Rebuilds a command received by name.
    pub fn rehydrate(&self, name: &str, payload: Value) -> SyncResult<Command> {
        Ok(self.registry().rehydrate(name, payload)?)
    }

    /// Subscribes `actor` to every future dispatch.
    pub fn register_actor(&self, actor: Actor) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let name = actor.name.clone();
        let actor = Arc::new(actor);
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                ActorSystem { inner }.invoke(&actor, command);
            }
            debug!(actor = %actor.name, "Actor stopped");
        });

        debug!(actor = %name, "Actor registered");
        self.lock_actors().push(ActorSlot { name, commands: tx });
    }

    pub fn actor_names(&self) -> Vec<String> {
        self.lock_actors().iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerHandle {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, listener));
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Dispatches a command on behalf of a caller. Returns the command id.
    pub fn submit<K: CommandKind>(
        &self,
        payload: K::Payload,
        request_id: Option<String>,
        session_id: Option<String>,
    ) -> SyncResult<String> {
        let command = Command::new::<K>(payload)?.with_request(request_id, session_id);
        self.dispatch_tracked(command)
    }

    /// Dispatches with the `INTERNAL` sentinel ids.
    pub fn submit_internal<K: CommandKind>(&self, payload: K::Payload) -> SyncResult<String> {
        let command = Command::new::<K>(payload)?.internal();
        self.dispatch_tracked(command)
    }

    /// Dispatches a registered command by name (view layer entry point).
    pub fn submit_named(
        &self,
        name: &str,
        payload: Value,
        request_id: Option<String>,
        session_id: Option<String>,
    ) -> SyncResult<String> {
        let command = self.rehydrate(name, payload)?.with_request(request_id, session_id);
        self.dispatch_tracked(command)
    }

    /// Dispatches a child of `parent`, inheriting its provenance.
    pub fn execute_from_parent<K: CommandKind>(&self, parent: &Command, payload: K::Payload) -> SyncResult<String> {
        let command = Command::new::<K>(payload)?;
        let child = match command.clone().with_parent(parent) {
            Ok(child) => child,
            Err(e) => {
                let mut rejected = command;
                rejected.request_id = parent.request_id.clone();
                rejected.session_id = parent.session_id.clone();
                return Err(self.reject(&rejected, e));
            }
        };
        self.dispatch_tracked(child)
    }

    fn dispatch_tracked(&self, command: Command) -> SyncResult<String> {
        let id = command.id.clone();
        self.dispatch(command)?;
        Ok(id)
    }

    /// Routes a fully built command.
    pub fn dispatch(&self, command: Command) -> SyncResult<()> {
        if let Err(e) = command.check_path() {
            return Err(self.reject(&command, e));
        }

        let role = self.inner.role;
        if !command.execution_scope.permits(role) {
            let e = CoreError::ForbiddenScope {
                command: command.name.clone(),
                scope: command.execution_scope,
                role,
            };
            return Err(self.reject(&command, e));
        }

        let command = if self.forwards(&command) {
            match self.wrap_for_master(&command) {
                Ok(wrapper) => {
                    debug!(command = %command.name, id = %command.id, "Forwarding to master");
                    wrapper
                }
                Err(e) => return Err(self.reject(&command, e)),
            }
        } else {
            command
        };

        self.fan_out(command);
        Ok(())
    }

    fn forwards(&self, command: &Command) -> bool {
        self.inner.role == Role::Slave
            && self.inner.slave_context.is_some()
            && command.execution_scope == ExecutionScope::SlaveForwardsToMaster
    }

    fn wrap_for_master(&self, command: &Command) -> Result<Command, CoreError> {
        let mut original = command.clone();
        original.slave_context = self.inner.slave_context.clone();
        let payload = RemoteCommandPayload::from_command(&original);
        Command::new::<ForwardToMaster>(payload)?.with_parent(&original)
    }

    fn fan_out(&self, command: Command) {
        let mut actors = self.lock_actors();
        actors.retain(|slot| slot.commands.send(command.clone()).is_ok());
        if actors.is_empty() {
            debug!(command = %command.name, "No actors registered");
        }
    }

    fn reject(&self, command: &Command, error: CoreError) -> SyncError {
        let app = error.to_app_error().for_command(command);
        warn!(command = %command.name, id = %command.id, key = %app.key, "Command rejected: {}", error);
        self.notify(|listener| listener.on_error(SYSTEM_ACTOR, command, &app));
        SyncError::Core(error)
    }

    // -------------------------------------------------------------------------
    // Invocation
    // -------------------------------------------------------------------------

    fn invoke(&self, actor: &Arc<Actor>, command: Command) {
        let Some(handler) = actor.handlers.get(command.name.as_str()).cloned() else {
            return;
        };

        let actor_name = actor.name.clone();
        self.notify(|listener| listener.on_start(&actor_name, &command));

        let task = tokio::spawn(handler(command.clone(), self.clone()));
        let system = self.clone();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(result)) => {
                    system.notify(|listener| listener.on_complete(&actor_name, &command, result.as_ref()));
                }
                Ok(Err(e)) => {
                    let app = e.to_app_error().for_command(&command);
                    warn!(actor = %actor_name, command = %command.name, "Handler failed: {}", e);
                    system.notify(|listener| listener.on_error(&actor_name, &command, &app));
                }
                Err(join) => {
                    let message = if join.is_panic() {
                        format!("handler for {} panicked", command.name)
                    } else {
                        format!("handler for {} was cancelled", command.name)
                    };
                    let app = SyncError::HandlerFailed(message).to_app_error().for_command(&command);
                    warn!(actor = %actor_name, command = %command.name, "{}", app.message);
                    system.notify(|listener| listener.on_error(&actor_name, &command, &app));
                }
            }
        });
    }

    fn notify(&self, f: impl Fn(&dyn LifecycleListener)) {
        let listeners: Vec<_> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            f(listener.as_ref());
        }
    }

    fn lock_actors(&self) -> std::sync::MutexGuard<'_, Vec<ActorSlot>> {
        self.inner.actors.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, CommandRegistry> {
        self.inner.registry.read().unwrap_or_else(|p| p.into_inner())
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, CommandRegistry> {
        self.inner.registry.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSystem")
            .field("role", &self.inner.role)
            .field("actors", &self.actor_names())
            .finish()
    }
}
