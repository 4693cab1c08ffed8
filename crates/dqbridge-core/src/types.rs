//! Managed-side value types exchanged across the boundary.

use std::ffi::{c_int, CStr};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::abi::{
    RawServerInfo, DQLITE_LOG_DEBUG, DQLITE_LOG_ERROR, DQLITE_LOG_INFO, DQLITE_LOG_WARN,
};

/// A cluster member: identity plus advertised address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Member identifier, unique within the cluster
    pub id: u64,
    /// Network address peers use to reach this member
    pub address: String,
}

impl ServerInfo {
    /// Create a new member description
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }

    /// Copy a member out of engine memory.
    ///
    /// A null address decodes as an empty string.
    ///
    /// # Safety
    /// `raw.address` must be null or point to a NUL-terminated string that
    /// stays valid for the duration of this call.
    pub unsafe fn from_raw(raw: &RawServerInfo) -> Self {
        let address = if raw.address.is_null() {
            String::new()
        } else {
            // SAFETY: caller guarantees a valid NUL-terminated string
            unsafe { CStr::from_ptr(raw.address) }
                .to_string_lossy()
                .into_owned()
        };

        Self {
            id: raw.id,
            address,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Severity of an engine log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Decode the engine's integer level. Unknown levels are treated as debug.
    pub fn from_raw(level: c_int) -> Self {
        match level {
            DQLITE_LOG_DEBUG => LogLevel::Debug,
            DQLITE_LOG_INFO => LogLevel::Info,
            DQLITE_LOG_WARN => LogLevel::Warn,
            DQLITE_LOG_ERROR => LogLevel::Error,
            _ => LogLevel::Debug,
        }
    }

    /// The engine's integer level
    pub fn as_raw(self) -> c_int {
        match self {
            LogLevel::Debug => DQLITE_LOG_DEBUG,
            LogLevel::Info => DQLITE_LOG_INFO,
            LogLevel::Warn => DQLITE_LOG_WARN,
            LogLevel::Error => DQLITE_LOG_ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a server handle.
///
/// `Created → Bootstrapped → Running → Stopped → Closed`. A handle with a
/// configuration persisted by an earlier process may go straight from
/// `Created` to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Created,
    Bootstrapped,
    Running,
    Stopped,
    Closed,
}

impl ServerState {
    /// Whether the engine main loop may be entered from this state
    pub fn can_run(self) -> bool {
        matches!(self, ServerState::Created | ServerState::Bootstrapped)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Created => "created",
            ServerState::Bootstrapped => "bootstrapped",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
            ServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}
