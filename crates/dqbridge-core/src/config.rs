//! # Server Configuration
//!
//! Identity, storage location, and bridge tunables for one engine instance.
//! Deserializable from JSON so hosts can keep it next to their own config.

use std::ffi::CString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::abi::LOG_BUFFER_LEN;
use crate::error::{BridgeError, BridgeResult};

/// Default bound on a single outbound dial attempt
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT.as_millis() as u64
}

fn default_log_message_limit() -> usize {
    LOG_BUFFER_LEN
}

/// Configuration for a single server instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Member identifier, unique within the cluster (non-zero)
    pub id: u64,

    /// Address advertised to peers
    pub address: String,

    /// Durable directory for the engine's log and snapshots
    pub data_dir: PathBuf,

    /// Deadline for each outbound dial, in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Maximum bytes forwarded per log line, terminator included
    #[serde(default = "default_log_message_limit")]
    pub log_message_limit: usize,
}

impl ServerConfig {
    /// Create a configuration with default tunables
    pub fn new(id: u64, address: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            address: address.into(),
            data_dir: data_dir.into(),
            dial_timeout_ms: default_dial_timeout_ms(),
            log_message_limit: default_log_message_limit(),
        }
    }

    /// Override the dial deadline
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Override the per-line log limit
    pub fn with_log_message_limit(mut self, limit: usize) -> Self {
        self.log_message_limit = limit;
        self
    }

    /// Dial deadline as a `Duration`
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Reject configurations the engine could not accept
    pub fn validate(&self) -> BridgeResult<()> {
        if self.id == 0 {
            return Err(BridgeError::InvalidConfig("id must be non-zero".into()));
        }
        if self.address.is_empty() {
            return Err(BridgeError::InvalidConfig("address must not be empty".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(BridgeError::InvalidConfig("data_dir must not be empty".into()));
        }
        if self.dial_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig("dial_timeout_ms must be positive".into()));
        }
        if self.log_message_limit < 2 {
            return Err(BridgeError::InvalidConfig(
                "log_message_limit must leave room for one byte and the terminator".into(),
            ));
        }
        self.address_cstring()?;
        self.data_dir_cstring()?;
        Ok(())
    }

    /// Address as a C string
    pub fn address_cstring(&self) -> BridgeResult<CString> {
        Ok(CString::new(self.address.as_bytes())?)
    }

    /// Data directory as a C string
    pub fn data_dir_cstring(&self) -> BridgeResult<CString> {
        use std::os::unix::ffi::OsStrExt;
        Ok(CString::new(self.data_dir.as_os_str().as_bytes())?)
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
