//! # Callback Trampolines
//!
//! Entry points the engine calls back into. Each receives an opaque
//! [`CallbackHandle`](crate::registry::CallbackHandle) as its context
//! pointer, resolves it through the registry, and runs the managed closure.
//! Nothing here unwinds across the C boundary: panics and lookup misses
//! become the trampoline's failure signal.

pub mod dial;
pub mod log;
