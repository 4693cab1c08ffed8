//! # Native Engine ABI
//!
//! C-compatible layouts, status codes, and callback signatures exchanged
//! with the native engine. Every structure is `#[repr(C)]`.
//!
//! ## Ownership
//!
//! - `RawServerInfo::address` is borrowed for the duration of the call that
//!   produced or consumed it. The managed side copies it immediately.
//! - Arrays and buffers returned by the engine (`cluster`, `dump`) live in
//!   engine-owned memory and must be released through `NativeEngine::free`
//!   exactly once, after the copy.
//! - Descriptors passed to `handle` or written by a connect callback move to
//!   the engine on success and stay with the caller on failure.

use std::ffi::{c_char, c_int, c_void};
use std::marker::{PhantomData, PhantomPinned};

// Compile-time ABI checks. Callback handles ride in the `void *data`
// context pointer, so they need a 64-bit pointer.
const _: () = {
    const PTR_SIZE: usize = core::mem::size_of::<*const ()>();
    assert!(PTR_SIZE == 8, "callback handles require 64-bit pointers");
    assert!(core::mem::size_of::<RawServerInfo>() == 16);
    assert!(core::mem::align_of::<RawServerInfo>() == 8);
};

// ============================================================================
// STATUS CODES
// ============================================================================

/// Success.
pub const DQLITE_OK: c_int = 0;
/// Generic error.
pub const DQLITE_ERROR: c_int = 1;
/// Library used incorrectly.
pub const DQLITE_MISUSE: c_int = 2;
/// Out of memory.
pub const DQLITE_NOMEM: c_int = 3;
/// Protocol error.
pub const DQLITE_PROTO: c_int = 4;
/// Parse error.
pub const DQLITE_PARSE: c_int = 5;
/// Overflow.
pub const DQLITE_OVERFLOW: c_int = 6;
/// End of message.
pub const DQLITE_EOM: c_int = 7;
/// Internal engine error.
pub const DQLITE_INTERNAL: c_int = 8;
/// Requested object not found.
pub const DQLITE_NOTFOUND: c_int = 9;
/// The engine has been stopped.
pub const DQLITE_STOPPED: c_int = 10;
/// The instance already has a persisted configuration.
pub const DQLITE_CANTBOOTSTRAP: c_int = 11;

/// Returned by a connect callback when no connection could be established.
pub const RAFT_NOCONNECTION: c_int = 16;

// ============================================================================
// LOG LEVELS
// ============================================================================

/// Debug-level engine message.
pub const DQLITE_LOG_DEBUG: c_int = 0;
/// Info-level engine message.
pub const DQLITE_LOG_INFO: c_int = 1;
/// Warning-level engine message.
pub const DQLITE_LOG_WARN: c_int = 2;
/// Error-level engine message.
pub const DQLITE_LOG_ERROR: c_int = 3;

/// Size of the engine's emit buffer, terminator included.
pub const LOG_BUFFER_LEN: usize = 1024;

// ============================================================================
// LAYOUTS
// ============================================================================

/// Opaque native engine instance. Only ever handled behind a raw pointer.
#[repr(C)]
pub struct RawEngine {
    _data: [u8; 0],
    _marker: PhantomData<(*mut u8, PhantomPinned)>,
}

/// Cluster member as seen by the engine.
///
/// **Memory Layout (16 bytes, 8-byte aligned)**:
/// - Offset 0: `id` (u64)
/// - Offset 8: `address` (pointer to NUL-terminated string)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawServerInfo {
    /// Member identifier, unique within the cluster
    pub id: u64,
    /// NUL-terminated network address, owned by whoever filled the struct
    pub address: *const c_char,
}

impl RawServerInfo {
    /// An empty slot for the engine to fill in.
    pub const fn empty() -> Self {
        Self {
            id: 0,
            address: std::ptr::null(),
        }
    }
}

impl Default for RawServerInfo {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// CALLBACKS
// ============================================================================

/// Connect callback: dial `server` and write the connected descriptor to `fd`.
///
/// Returns `DQLITE_OK` on success (the engine now owns `*fd`) or
/// `RAFT_NOCONNECTION` on failure (`*fd` is left untouched).
pub type ConnectFn =
    unsafe extern "C" fn(data: *mut c_void, server: *const RawServerInfo, fd: *mut c_int) -> c_int;

/// Log callback: `message` is NUL-terminated and at most `LOG_BUFFER_LEN`
/// bytes long, terminator included.
pub type LogFn = unsafe extern "C" fn(data: *mut c_void, level: c_int, message: *const c_char);
