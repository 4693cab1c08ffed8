//! dqbridge Twin
//!
//! # Overview
//!
//! `dqbridge-twin` is an in-process stand-in for the native engine. It
//! implements [`NativeEngine`](dqbridge_core::NativeEngine) with the same
//! ownership rules the real library follows, so the bridge can be exercised
//! without linking it:
//!
//! - Instances are opaque pointers; `destroy` releases them and every
//!   descriptor they adopted.
//! - `cluster` and `dump` return `malloc`'d buffers that must come back
//!   through `free` exactly once. Outstanding buffers and stray frees are
//!   counted.
//! - A bootstrapped membership is persisted in the data directory, so a
//!   second bootstrap, even from a fresh instance, reports
//!   `DQLITE_CANTBOOTSTRAP`.
//! - `run` blocks until `stop`; `handle` adopts descriptors only while
//!   running and answers `DQLITE_STOPPED` afterwards.
//! - The leader is the lowest member id while running.
//!
//! # Usage
//!
//! ```rust
//! use dqbridge_twin::SimEngine;
//!
//! let engine = SimEngine::builder().fail_create(1).build();
//! assert_eq!(engine.instance_count(), 0);
//! ```

mod alloc;
pub mod engine;
mod node;

pub use engine::{SimEngine, SimEngineBuilder};
pub use node::CONFIGURATION_FILE;
