//! # dqbridge
//!
//! Bridging layer between a host process and an embedded replicated SQL
//! engine exposed through a C ABI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │   Host (Rust)            │
//! │   ServerHandle / dials   │
//! └────────────┬─────────────┘
//!              │ NativeEngine (C ABI)
//!              ▼
//! ┌──────────────────────────┐
//! │   Native engine          │
//! │   - consensus / storage  │
//! │   - calls trampolines    │
//! └──────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Move-only handles**: `ServerHandle::close` consumes the handle and
//!   `Drop` destroys an unclosed one, so the instance is destroyed once.
//! - **Opaque callback handles**: the engine holds generation-checked
//!   integers, never pointers to closures ([`registry`]).
//! - **Descriptor handoff**: connections are duplicated close-on-exec and
//!   ownership moves to the engine only on success ([`handoff`]).
//! - **Bounded dials**: every outbound dial runs under a deadline the
//!   engine thread enforces itself ([`bridge::dial`]).
//! - **`dqlite` feature**: links the native library and its hook shim.

pub mod bridge;
pub mod cluster;
pub mod handoff;
pub mod registry;
pub mod runtime;
pub mod server;

#[cfg(feature = "dqlite")]
pub mod dqlite;

pub use bridge::dial::{dial_func, tcp_dial_func, DialContext, DialFunc, DialFuture};
pub use bridge::log::{log_func, tracing_log_func, LogFunc};
pub use handoff::{handoff, HandoffConn};
pub use registry::{CallbackHandle, CallbackRegistry};
pub use runtime::{init, is_initialized};
pub use server::{RunningServer, ServerHandle};

#[cfg(feature = "dqlite")]
pub use dqlite::DqliteEngine;

// Re-export core types
pub use dqbridge_core::abi;
pub use dqbridge_core::{
    BridgeError, BridgeResult, HandoffError, LogLevel, NativeEngine, NativeStatus, ServerConfig,
    ServerInfo, ServerState,
};

/// Library version
pub const DQBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
