//! Read-only-after-load server configuration (§3, §6).
//!
//! Loading the values below from a file or the command line is the
//! CLI's job (`teavpn2-server`); the core only defines the shape and a
//! handful of invariants it relies on (`max_conn` range, text capacities).

use serde::{Deserialize, Serialize};

/// Maximum number of bytes a `ClientPacket`/`ServerPacket` payload may carry.
pub const PAYLOAD_MAX: usize = 4096;

/// Socket transport. UDP is an external/future variant (§1); the core
/// only implements TCP, but the field is still modeled so configuration
/// loading can reject `udp` with a clear message rather than silently
/// misbehaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SockType {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub config_path: Option<String>,
    pub data_dir: String,
    pub verbose: u8,
    pub thread: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    pub sock_type: SockType,
    pub bind_addr: String,
    pub bind_port: u16,
    /// Bounded per §3: `[1, 65535]`.
    pub max_conn: u16,
    pub backlog: i32,
    pub use_encrypt: bool,
    pub ssl_cert: Option<String>,
    pub ssl_priv_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfaceConfig {
    /// Device name, capacity 15 bytes + NUL per §3.
    pub dev: String,
    pub mtu: u16,
    pub ipv4: String,
    pub ipv4_netmask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub system: SystemConfig,
    pub socket: SocketConfig,
    pub iface: IfaceConfig,
}

/// Errors possible while validating an otherwise-parsed `Configuration`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_conn must be in 1..=65535, got {0}")]
    MaxConnOutOfRange(u32),
    #[error("interface device name {0:?} exceeds 15 bytes")]
    DevNameTooLong(String),
    #[error("socket type {0:?} is not implemented by this core; only tcp is supported")]
    UnsupportedSockType(SockType),
}

impl Configuration {
    /// Validates the handful of invariants the core actually depends on.
    /// Called once by the Lifecycle Controller before bring-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket.max_conn == 0 {
            return Err(ConfigError::MaxConnOutOfRange(self.socket.max_conn as u32));
        }
        if self.iface.dev.len() > 15 {
            return Err(ConfigError::DevNameTooLong(self.iface.dev.clone()));
        }
        if self.socket.sock_type != SockType::Tcp {
            return Err(ConfigError::UnsupportedSockType(self.socket.sock_type));
        }
        Ok(())
    }
}
