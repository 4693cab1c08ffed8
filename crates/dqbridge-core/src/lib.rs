//! # dqbridge Core
//!
//! Shared abstraction layer between the bridge and the native engine
//! implementations (the linked library and the in-process twin).
//! Defines the C ABI layouts, the engine contract, error codes, and
//! configuration.
//!
//! ## Module Organization
//!
//! - `abi`: C-compatible layouts, status codes, and callback signatures
//! - `config`: Per-server configuration
//! - `error`: Native status classification and bridge error taxonomy
//! - `traits`: The `NativeEngine` contract (one method per C entry point)
//! - `types`: Managed-side value types (`ServerInfo`, `LogLevel`, `ServerState`)

pub mod abi;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use abi::{ConnectFn, LogFn, RawEngine, RawServerInfo};
pub use config::ServerConfig;
pub use error::{BridgeError, BridgeResult, HandoffError, NativeStatus};
pub use traits::NativeEngine;
pub use types::{LogLevel, ServerInfo, ServerState};

/// Library version
pub const DQBRIDGE_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
