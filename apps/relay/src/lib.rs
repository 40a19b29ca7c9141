//! # Tandem Relay
//!
//! WebSocket relay between one master terminal and its slave displays.
//!
//! ## Configuration
//! Environment variables:
//! - `RELAY_BIND_ADDR` - Interface to bind (default: 0.0.0.0)
//! - `RELAY_PORT` - HTTP + WebSocket port (default: 8700)
//! - `RELAY_JWT_SECRET` - Secret for socket token signing
//! - `RELAY_TOKEN_LIFETIME_SECS` - Socket token lifetime (default: 300)
//! - `RELAY_HEARTBEAT_INTERVAL_MS` - Heartbeat period per socket (default: 30000)

pub mod auth;
pub mod config;
pub mod error;
pub mod server;

// Re-exports
pub use config::RelayConfig;
pub use error::RelayError;
pub use server::{router, RelayState};
