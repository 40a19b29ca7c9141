//! # tandem-sync: Terminal Runtime for Tandem
//!
//! Everything a terminal process runs besides its feature actors: the
//! command bus, the master and kernel links, state sync between a master
//! and its slaves, and resilient HTTP calls.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Terminal Runtime                                 │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  TerminalAgent (Composition Root)                │  │
//! │  │                                                                  │  │
//! │  │  Built from TerminalConfig, one supervisor task per link         │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  ActorSystem   │  │ Connection     │  │  ApiManager            │    │
//! │  │                │  │ Manager        │  │                        │    │
//! │  │ Scope checks,  │  │ Register, open │  │ Address failover,      │    │
//! │  │ cycle guard,   │  │ socket, queue, │  │ circuit breakers,      │    │
//! │  │ fan-out        │  │ dedup, beats   │  │ bounded request queue  │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  StateStore    │  │ StateSync      │  │  RemoteBridge          │    │
//! │  │                │  │ Engine         │  │                        │    │
//! │  │ Buckets with   │  │ Full sync on   │  │ Slave → master forward │    │
//! │  │ updateAt stamp │  │ connect, then  │  │ with ack timeout,      │    │
//! │  │                │  │ debounced diffs│  │ kernel commands        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Command Bus
//! - [`actor`] - `ActorSystem`, actors and lifecycle listeners
//! - [`builtin`] - Commands raised by the runtime itself
//!
//! ### Links
//! - [`connection`] - `ConnectionManager` state machine
//! - [`transport`] - Relay and kernel handshakes, WebSocket plumbing
//! - [`heartbeat`] - Liveness tracking and auto-ack
//! - [`dedup`] - Bounded TTL cache of seen message ids
//!
//! ### State
//! - [`state_store`] - Local buckets
//! - [`state_sync`] - Summary/diff exchange with the peer
//! - [`remote`] - Cross-process command execution
//!
//! ### HTTP
//! - [`api`] - `ApiManager`
//! - [`breaker`] - Per-address circuit breaker
//! - [`request_queue`] - Concurrency limit with rate limiting
//!
//! ### Setup
//! - [`agent`] - `TerminalAgent`
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `SyncError`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tandem_sync::{TerminalAgent, TerminalConfig};
//!
//! let config = TerminalConfig::load(None)?;
//! let mut agent = TerminalAgent::new(config)?;
//! agent.register_actor(cart_actor());
//! agent.start();
//!
//! let status = agent.status();
//! println!("Master link: {}", status.master.state);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Command bus
pub mod actor;
pub mod builtin;

// Links
pub mod connection;
pub mod dedup;
pub mod heartbeat;
pub mod transport;

// State
pub mod remote;
pub mod state_store;
pub mod state_sync;

// HTTP
pub mod api;
pub mod breaker;
pub mod request_queue;

// Setup
pub mod agent;
pub mod config;
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use actor::{Actor, ActorSystem, HandlerOutput, LifecycleListener, ListenerHandle};
pub use agent::{LinkStatus, TerminalAgent, TerminalStatus};
pub use api::{ApiManager, ApiResponse, AttemptRecord, HttpTransport, ReqwestTransport, ServerAddress, ServerConfig};
pub use breaker::{BreakerConfig, BreakerState};
pub use config::TerminalConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, LinkConfig};
pub use error::{SyncError, SyncResult};
pub use remote::RemoteBridge;
pub use request_queue::RequestQueue;
pub use state_store::{ChangeOrigin, StateChange, StateStore};
pub use state_sync::{StateSyncConfig, StateSyncEngine};
