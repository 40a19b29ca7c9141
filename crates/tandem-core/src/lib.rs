//! # tandem-core: Pure Runtime Types for Tandem
//!
//! This crate holds everything about the terminal runtime that can be
//! expressed without I/O: the command model, the error taxonomy, the wire
//! envelope, and the state-bucket diff algorithms.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tandem Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              View layer (out of scope, TypeScript)              │   │
//! │  │     submit(command) ─── lifecycle events ─── state snapshot     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tandem-sync (tokio runtime)                     │   │
//! │  │   ActorSystem · ConnectionManager · ApiManager · StateSync      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tandem-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │  command  │  │   error   │  │ protocol  │  │   state   │   │   │
//! │  │   │  Command  │  │ AppError  │  │ Envelope  │  │  Summary  │   │   │
//! │  │   │  Registry │  │ Category  │  │ Payloads  │  │   Diff    │   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO TIMERS • NO NETWORK • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Process role, display mode, slave context
//! - [`command`] - `Command`, execution scopes, cycle guard
//! - [`registry`] - Name → constructor table used to rehydrate remote commands
//! - [`error`] - `CoreError` and the normalized `AppError`
//! - [`protocol`] - `MessageEnvelope` and its payloads
//! - [`state`] - Syncable buckets, summaries and last-writer-wins diffs

pub mod command;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod types;

pub use command::{Command, CommandKind, ExecutionScope, PathEntry, INTERNAL};
pub use error::{AppError, CoreError, CoreResult, ErrorCategory, ErrorSeverity};
pub use protocol::MessageEnvelope;
pub use registry::CommandRegistry;
pub use state::{Bucket, BucketDiff, StateDiff, StateSummary};
pub use types::{DisplayMode, Role, SlaveContext};
