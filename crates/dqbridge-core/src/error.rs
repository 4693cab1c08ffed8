//! # Error Types & Codes
//!
//! `NativeStatus` classifies the engine's integer status codes; the raw code
//! is always carried alongside it so nothing is lost for unknown values.
//! `BridgeError` is the typed result of every managed-facing operation.

use std::ffi::c_int;
use std::fmt;
use std::io;

use crate::abi;
use crate::types::ServerState;

/// Engine status codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeStatus {
    Ok = 0,
    Error = 1,
    Misuse = 2,
    NoMem = 3,
    Proto = 4,
    Parse = 5,
    Overflow = 6,
    Eom = 7,
    Internal = 8,
    NotFound = 9,
    Stopped = 10,
    CantBootstrap = 11,
}

impl NativeStatus {
    /// Convert a raw code to its variant (lossy: unknown codes map to `Error`)
    pub fn from_code(code: c_int) -> Self {
        match code {
            abi::DQLITE_OK => NativeStatus::Ok,
            abi::DQLITE_ERROR => NativeStatus::Error,
            abi::DQLITE_MISUSE => NativeStatus::Misuse,
            abi::DQLITE_NOMEM => NativeStatus::NoMem,
            abi::DQLITE_PROTO => NativeStatus::Proto,
            abi::DQLITE_PARSE => NativeStatus::Parse,
            abi::DQLITE_OVERFLOW => NativeStatus::Overflow,
            abi::DQLITE_EOM => NativeStatus::Eom,
            abi::DQLITE_INTERNAL => NativeStatus::Internal,
            abi::DQLITE_NOTFOUND => NativeStatus::NotFound,
            abi::DQLITE_STOPPED => NativeStatus::Stopped,
            abi::DQLITE_CANTBOOTSTRAP => NativeStatus::CantBootstrap,
            _ => NativeStatus::Error,
        }
    }

    /// Human-readable description
    pub fn message(&self) -> &'static str {
        match self {
            NativeStatus::Ok => "success",
            NativeStatus::Error => "generic error",
            NativeStatus::Misuse => "library misuse",
            NativeStatus::NoMem => "out of memory",
            NativeStatus::Proto => "protocol error",
            NativeStatus::Parse => "parse error",
            NativeStatus::Overflow => "overflow",
            NativeStatus::Eom => "end of message",
            NativeStatus::Internal => "internal error",
            NativeStatus::NotFound => "not found",
            NativeStatus::Stopped => "engine stopped",
            NativeStatus::CantBootstrap => "already bootstrapped",
        }
    }

    /// Failures a caller can act on without treating the instance as broken
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NativeStatus::NotFound | NativeStatus::Stopped | NativeStatus::CantBootstrap
        )
    }

    /// Resource exhaustion inside the engine
    pub fn is_resource_error(&self) -> bool {
        matches!(self, NativeStatus::NoMem | NativeStatus::Overflow)
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.message())
    }
}

/// Failures while turning a connection into a descriptor for the engine.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The connection type has no OS descriptor behind it
    #[error("connection does not expose an OS descriptor")]
    Unsupported,

    /// The connection could not produce its descriptor
    #[error("failed to extract descriptor: {0}")]
    Extract(#[source] io::Error),

    /// `fcntl(F_DUPFD_CLOEXEC)` failed
    #[error("failed to duplicate descriptor: {0}")]
    Duplicate(#[source] io::Error),
}

/// Errors returned by bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The native library could not allocate its global state
    #[error("native library initialization failed with {status} (code {code})")]
    Init { code: c_int, status: NativeStatus },

    /// A server was created before the library was initialized
    #[error("native library is not initialized")]
    Uninitialized,

    /// The native instance could not be allocated
    #[error("failed to create server object: {status} (code {code})")]
    Create { code: c_int, status: NativeStatus },

    /// The instance already has a cluster configuration
    #[error("server already bootstrapped")]
    AlreadyBootstrapped,

    /// The operation arrived after shutdown began
    #[error("server was stopped")]
    ServerStopped,

    /// A dial attempt failed or exceeded its deadline
    #[error("no connection to {address}: {reason}")]
    NoConnection { address: String, reason: String },

    /// Descriptor extraction or duplication failed
    #[error("connection handoff failed: {0}")]
    Handoff(#[from] HandoffError),

    /// Any other non-zero engine status
    #[error("{op} failed with {status} (code {code})")]
    Native {
        op: &'static str,
        code: c_int,
        status: NativeStatus,
    },

    /// The lifecycle does not allow the operation right now
    #[error("cannot {op} while server is {state}")]
    InvalidState {
        op: &'static str,
        state: ServerState,
    },

    /// Configuration rejected before reaching the engine
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An argument cannot be represented at the boundary
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A string carried an interior NUL byte
    #[error("string contains an interior NUL byte: {0}")]
    InteriorNul(#[from] std::ffi::NulError),

    /// The run worker could not be spawned or did not finish cleanly
    #[error("run worker failure: {0}")]
    Worker(String),
}

impl BridgeError {
    /// Wrap a non-zero engine status for `op`
    pub fn native(op: &'static str, code: c_int) -> Self {
        BridgeError::Native {
            op,
            code,
            status: NativeStatus::from_code(code),
        }
    }

    /// The raw engine status, when the error came from the engine
    pub fn native_code(&self) -> Option<c_int> {
        match self {
            BridgeError::Init { code, .. }
            | BridgeError::Create { code, .. }
            | BridgeError::Native { code, .. } => Some(*code),
            BridgeError::AlreadyBootstrapped => Some(abi::DQLITE_CANTBOOTSTRAP),
            BridgeError::ServerStopped => Some(abi::DQLITE_STOPPED),
            _ => None,
        }
    }

    /// Recoverable conditions: the instance itself is still healthy
    pub fn is_recoverable(&self) -> bool {
        match self {
            BridgeError::AlreadyBootstrapped
            | BridgeError::ServerStopped
            | BridgeError::NoConnection { .. } => true,
            BridgeError::Native { status, .. } => status.is_recoverable(),
            _ => false,
        }
    }
}

/// Result alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
