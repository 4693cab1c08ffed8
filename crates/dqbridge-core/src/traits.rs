//! # Engine Contract
//!
//! `NativeEngine` mirrors the engine's C entry points one method per
//! function. The bridge talks to the engine only through this trait, so the
//! linked library and the in-process twin are interchangeable.
//!
//! Methods take raw pointers because they *are* the boundary: each one
//! documents who owns which memory and descriptor before and after the call.

use std::ffi::{c_char, c_int, c_uint, c_void};

use crate::abi::{ConnectFn, LogFn, RawEngine, RawServerInfo};

/// Native engine entry points.
///
/// Implementations must be safe to call concurrently on one instance from
/// multiple threads; the engine synchronizes internally.
pub trait NativeEngine: Send + Sync + 'static {
    /// Allocate process-wide engine state. Returns a status code.
    fn initialize(&self) -> c_int;

    /// Allocate an instance bound to `id`, `address` and `data_dir`.
    ///
    /// # Safety
    /// `address` and `data_dir` must be NUL-terminated and valid for the
    /// call; the engine copies them. `out` must be writable.
    unsafe fn create(
        &self,
        id: u64,
        address: *const c_char,
        data_dir: *const c_char,
        out: *mut *mut RawEngine,
    ) -> c_int;

    /// Release every resource held by `engine`, including adopted descriptors.
    ///
    /// # Safety
    /// `engine` must come from `create` and must not be used afterwards.
    /// The main loop must have returned.
    unsafe fn destroy(&self, engine: *mut RawEngine);

    /// Install the initial membership. The engine copies `servers`.
    ///
    /// # Safety
    /// `servers` must point to `n` entries whose addresses stay valid for
    /// the call.
    unsafe fn bootstrap(&self, engine: *mut RawEngine, n: c_uint, servers: *const RawServerInfo)
        -> c_int;

    /// Route outbound connections through `connect`, passing `data` back
    /// verbatim on every call.
    ///
    /// # Safety
    /// `engine` must be a live instance.
    unsafe fn config_connect(&self, engine: *mut RawEngine, connect: ConnectFn, data: *mut c_void)
        -> c_int;

    /// Route log lines through `log`, passing `data` back verbatim.
    ///
    /// # Safety
    /// `engine` must be a live instance.
    unsafe fn config_logger(&self, engine: *mut RawEngine, log: LogFn, data: *mut c_void) -> c_int;

    /// Enter the main loop. Blocks until `stop` is observed.
    ///
    /// # Safety
    /// `engine` must be a live instance.
    unsafe fn run(&self, engine: *mut RawEngine) -> c_int;

    /// Whether the instance accepts connections. Never blocks.
    ///
    /// # Safety
    /// `engine` must be a live instance.
    unsafe fn ready(&self, engine: *mut RawEngine) -> bool;

    /// Ask the main loop to exit.
    ///
    /// # Safety
    /// `engine` must be a live instance.
    unsafe fn stop(&self, engine: *mut RawEngine) -> c_int;

    /// Adopt an accepted connection. On `DQLITE_OK` the engine owns `fd`;
    /// on any other status the caller still owns it.
    ///
    /// # Safety
    /// `engine` must be a live instance and `fd` an open descriptor.
    unsafe fn handle(&self, engine: *mut RawEngine, fd: c_int) -> c_int;

    /// Fill `out` with the current leader. Returns false when none is known.
    /// `out.address` points into engine memory and is only valid until the
    /// next engine call.
    ///
    /// # Safety
    /// `engine` must be a live instance and `out` writable.
    unsafe fn leader(&self, engine: *mut RawEngine, out: *mut RawServerInfo) -> bool;

    /// Return the membership as an engine-owned array of `*n` entries.
    /// The array must be released with `free`.
    ///
    /// # Safety
    /// `engine` must be a live instance; `out` and `n` writable.
    unsafe fn cluster(
        &self,
        engine: *mut RawEngine,
        out: *mut *mut RawServerInfo,
        n: *mut c_uint,
    ) -> c_int;

    /// Copy database `filename` into an engine-owned buffer of `*len` bytes.
    /// The buffer must be released with `free`.
    ///
    /// # Safety
    /// `engine` must be a live instance, `filename` NUL-terminated, `buf`
    /// and `len` writable.
    unsafe fn dump(
        &self,
        engine: *mut RawEngine,
        filename: *const c_char,
        buf: *mut *mut c_void,
        len: *mut usize,
    ) -> c_int;

    /// Release memory returned by `cluster` or `dump`.
    ///
    /// # Safety
    /// `ptr` must be null or come from this engine and not have been freed.
    unsafe fn free(&self, ptr: *mut c_void);
}
