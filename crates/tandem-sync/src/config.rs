//! # Terminal Configuration
//!
//! Configuration management for a terminal process.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TANDEM_ROLE=slave                                                  │
//! │     TANDEM_DEVICE_ID=abc-123                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tandem/terminal.toml (Linux)                             │
//! │     ~/Library/Application Support/com.tandem.terminal/terminal.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Role::Master, auto-generated device_id                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [role]
//! role = "slave"
//! master_device_id = "7c9e6679-7425-40de-944b-e07fc1f90ae7"
//! slave_name = "Customer Display"
//! display_mode = "secondary"
//!
//! [master_link]
//! server = "relay"
//! heartbeat_interval_ms = 30000
//!
//! [kernel_link]
//! enabled = true
//! server = "kernel"
//! token = "device-token"
//!
//! [sync]
//! master_to_slave = ["cart", "customer"]
//! slave_to_master = ["payment"]
//!
//! [[servers]]
//! name = "relay"
//! retry_count = 2
//!
//! [[servers.addresses]]
//! address_name = "lan"
//! base_url = "http://192.168.1.10:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_core::{DisplayMode, Role, SlaveContext};

use crate::api::{ServerAddress, ServerConfig};
use crate::breaker::BreakerConfig;
use crate::connection::LinkConfig;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::HeartbeatConfig;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Role Configuration
// =============================================================================

/// Process role and, for slaves, which master and display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub role: Role,

    /// Master this slave attaches to. Required for slaves.
    #[serde(default)]
    pub master_device_id: Option<String>,

    /// Display name reported in `slaveContext` when forwarding.
    #[serde(default)]
    pub slave_name: Option<String>,

    #[serde(default)]
    pub display_mode: DisplayMode,
}

impl RoleConfig {
    /// Display context of a slave; `None` on masters or unnamed slaves.
    pub fn slave_context(&self) -> Option<SlaveContext> {
        match (self.role, &self.slave_name) {
            (Role::Slave, Some(name)) => Some(SlaveContext::new(name.clone(), self.display_mode)),
            _ => None,
        }
    }
}

// =============================================================================
// Link Settings
// =============================================================================

/// Settings for the master-server link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterLinkSettings {
    /// Logical server (see `[[servers]]`) hosting the relay.
    #[serde(default = "default_master_server")]
    pub server: String,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Answer `__system_heartbeat` with `__system_heartbeat_ack`.
    #[serde(default = "default_true")]
    pub auto_heartbeat_response: bool,

    /// Outbound messages held while disconnected (oldest dropped first).
    #[serde(default = "default_link_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,

    /// How long a slave waits for `REMOTE_COMMAND_EXECUTED`.
    #[serde(default = "default_remote_ack_timeout")]
    pub remote_ack_timeout_ms: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_master_server() -> String {
    "relay".to_string()
}
fn default_connection_timeout() -> u64 {
    10_000
}
fn default_heartbeat_interval() -> u64 {
    30_000
}
fn default_heartbeat_timeout() -> u64 {
    60_000
}
fn default_true() -> bool {
    true
}
fn default_link_queue_capacity() -> usize {
    100
}
fn default_dedup_capacity() -> usize {
    1000
}
fn default_dedup_ttl() -> u64 {
    300
}
fn default_remote_ack_timeout() -> u64 {
    10_000
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for MasterLinkSettings {
    fn default() -> Self {
        MasterLinkSettings {
            server: default_master_server(),
            connection_timeout_ms: default_connection_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            auto_heartbeat_response: true,
            queue_capacity: default_link_queue_capacity(),
            dedup_capacity: default_dedup_capacity(),
            dedup_ttl_secs: default_dedup_ttl(),
            remote_ack_timeout_ms: default_remote_ack_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl MasterLinkSettings {
    /// Link settings for the master link; the kernel link starts from these.
    pub fn link_config(&self, name: &str) -> LinkConfig {
        LinkConfig {
            name: name.to_string(),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            queue_capacity: self.queue_capacity,
            dedup_capacity: self.dedup_capacity,
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            heartbeat: HeartbeatConfig {
                enabled: true,
                interval: Duration::from_millis(self.heartbeat_interval_ms),
                timeout: Duration::from_millis(self.heartbeat_timeout_ms),
                auto_response: self.auto_heartbeat_response,
            },
        }
    }
}

/// Settings for the terminal-to-backend (kernel) link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelLinkSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_kernel_server")]
    pub server: String,

    /// Socket path appended to the base URL.
    #[serde(default = "default_kernel_path")]
    pub path: String,

    #[serde(default)]
    pub token: String,

    /// HTTP path for `REMOTE_COMMAND` confirmations.
    #[serde(default = "default_confirm_path")]
    pub confirm_path: String,

    /// Time out the link when the kernel stops sending `__system_heartbeat`.
    /// Off by default: kernels are not required to send heartbeats.
    #[serde(default)]
    pub heartbeat_enabled: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
}

fn default_kernel_server() -> String {
    "kernel".to_string()
}
fn default_kernel_path() -> String {
    "/terminal/ws".to_string()
}
fn default_confirm_path() -> String {
    "/terminal/command/confirm".to_string()
}

impl Default for KernelLinkSettings {
    fn default() -> Self {
        KernelLinkSettings {
            enabled: false,
            server: default_kernel_server(),
            path: default_kernel_path(),
            token: String::new(),
            confirm_path: default_confirm_path(),
            heartbeat_enabled: false,
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl KernelLinkSettings {
    /// Kernel link settings: queueing and dedup from `[master_link]`,
    /// heartbeat from `[kernel_link]`.
    pub fn link_config(&self, base: &MasterLinkSettings) -> LinkConfig {
        let mut link = base.link_config("kernel");
        link.heartbeat = HeartbeatConfig {
            enabled: self.heartbeat_enabled,
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            auto_response: base.auto_heartbeat_response,
        };
        link
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// State sync behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Quiet period before an incremental diff is sent.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Buckets the master pushes to slaves.
    #[serde(default)]
    pub master_to_slave: Vec<String>,

    /// Buckets slaves push to the master.
    #[serde(default)]
    pub slave_to_master: Vec<String>,
}

fn default_debounce() -> u64 {
    200
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            debounce_ms: default_debounce(),
            master_to_slave: Vec::new(),
            slave_to_master: Vec::new(),
        }
    }
}

// =============================================================================
// API Settings
// =============================================================================

/// ApiManager limits and breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Calls waiting or in flight before new calls are rate-limited.
    #[serde(default = "default_api_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before an open breaker admits a half-open trial.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
}

fn default_api_queue_capacity() -> usize {
    64
}
fn default_max_concurrent() -> usize {
    8
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_open_timeout() -> u64 {
    30_000
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            queue_capacity: default_api_queue_capacity(),
            max_concurrent: default_max_concurrent(),
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout(),
        }
    }
}

impl ApiSettings {
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.failure_threshold,
            timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

// =============================================================================
// Server Entries
// =============================================================================

/// One physical address of a logical server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressEntry {
    pub address_name: String,
    pub base_url: String,
    #[serde(default = "default_address_timeout")]
    pub timeout_ms: u64,
}

fn default_address_timeout() -> u64 {
    10_000
}

/// A logical server with its failover addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
}

fn default_retry_interval() -> u64 {
    1_000
}

impl ServerEntry {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.name.clone(),
            addresses: self
                .addresses
                .iter()
                .map(|a| ServerAddress {
                    address_name: a.address_name.clone(),
                    base_url: a.base_url.trim_end_matches('/').to_string(),
                    timeout: Duration::from_millis(a.timeout_ms),
                })
                .collect(),
            retry_count: self.retry_count,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

// =============================================================================
// Main Terminal Configuration
// =============================================================================

/// Complete terminal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub role: RoleConfig,

    #[serde(default)]
    pub master_link: MasterLinkSettings,

    #[serde(default)]
    pub kernel_link: KernelLinkSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl TerminalConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (terminal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading terminal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load terminal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Terminal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.role.role == Role::Slave && self.role.master_device_id.is_none() {
            return Err(SyncError::InvalidConfig(
                "master_device_id is required when role = \"slave\"".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "server '{}' is declared twice",
                    server.name
                )));
            }
            for address in &server.addresses {
                let url = url::Url::parse(&address.base_url)?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(SyncError::InvalidUrl(format!(
                        "Server address must start with http:// or https://, got: {}",
                        address.base_url
                    )));
                }
            }
        }

        if self.kernel_link.enabled && !seen.contains(self.kernel_link.server.as_str()) {
            return Err(SyncError::ServerNotConfigured(self.kernel_link.server.clone()));
        }

        if self.api.max_concurrent == 0 || self.api.queue_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "api.max_concurrent and api.queue_capacity must be greater than 0".into(),
            ));
        }

        if self.api.failure_threshold == 0 {
            return Err(SyncError::InvalidConfig(
                "api.failure_threshold must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TANDEM_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("TANDEM_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(role) = std::env::var("TANDEM_ROLE") {
            match role.parse() {
                Ok(parsed) => {
                    debug!(role = %role, "Overriding role from environment");
                    self.role.role = parsed;
                }
                Err(e) => warn!(role = %role, "Ignoring TANDEM_ROLE: {}", e),
            }
        }

        if let Ok(master) = std::env::var("TANDEM_MASTER_DEVICE_ID") {
            self.role.master_device_id = Some(master);
        }

        if let Ok(url) = std::env::var("TANDEM_MASTER_URL") {
            debug!(url = %url, "Overriding master relay URL from environment");
            let server = self.master_link.server.clone();
            self.override_single_address(&server, url);
        }

        if let Ok(url) = std::env::var("TANDEM_KERNEL_URL") {
            debug!(url = %url, "Overriding kernel URL from environment");
            let server = self.kernel_link.server.clone();
            self.override_single_address(&server, url);
            self.kernel_link.enabled = true;
        }

        if let Ok(token) = std::env::var("TANDEM_KERNEL_TOKEN") {
            self.kernel_link.token = token;
        }
    }

    /// Replaces a server's address list with one address.
    fn override_single_address(&mut self, server: &str, base_url: String) {
        let address = AddressEntry {
            address_name: "env".to_string(),
            base_url,
            timeout_ms: default_address_timeout(),
        };
        match self.servers.iter_mut().find(|s| s.name == server) {
            Some(entry) => entry.addresses = vec![address],
            None => self.servers.push(ServerEntry {
                name: server.to_string(),
                retry_count: 0,
                retry_interval_ms: default_retry_interval(),
                addresses: vec![address],
            }),
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tandem", "terminal")
            .map(|dirs| dirs.config_dir().join("terminal.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn role(&self) -> Role {
        self.role.role
    }

    /// Server configs ready for `ApiManager::register_server`.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.servers.iter().map(ServerEntry::to_server_config).collect()
    }
}
