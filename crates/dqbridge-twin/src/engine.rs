//! # Simulated Engine
//!
//! [`SimEngine`] implements the engine contract in-process. Instance
//! pointers are leaked `Arc<SimNode>`s; the engine also indexes live nodes
//! by address so tests can play the engine's side of the boundary
//! (outbound dials, log emission) against a node the bridge owns.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dqbridge_core::abi::{ConnectFn, LogFn, RawEngine, RawServerInfo, DQLITE_ERROR, DQLITE_MISUSE, DQLITE_NOMEM, DQLITE_OK};
use dqbridge_core::{LogLevel, NativeEngine, ServerInfo};
use tracing::{debug, warn};

use crate::alloc::Allocations;
use crate::node::SimNode;

/// Status codes to return instead of running an entry point
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    initialize: Option<c_int>,
    create: Option<c_int>,
    config: Option<c_int>,
    stop: Option<c_int>,
    cluster: Option<c_int>,
}

/// Builder for [`SimEngine`] with injectable failures.
#[derive(Debug, Default)]
pub struct SimEngineBuilder {
    faults: Faults,
}

impl SimEngineBuilder {
    /// `initialize` returns `code`
    pub fn fail_initialize(mut self, code: c_int) -> Self {
        self.faults.initialize = Some(code);
        self
    }

    /// `create` returns `code`
    pub fn fail_create(mut self, code: c_int) -> Self {
        self.faults.create = Some(code);
        self
    }

    /// `config_connect` and `config_logger` return `code`
    pub fn fail_config(mut self, code: c_int) -> Self {
        self.faults.config = Some(code);
        self
    }

    /// `stop` returns `code` and leaves the loop running
    pub fn fail_stop(mut self, code: c_int) -> Self {
        self.faults.stop = Some(code);
        self
    }

    /// `cluster` returns `code`
    pub fn fail_cluster(mut self, code: c_int) -> Self {
        self.faults.cluster = Some(code);
        self
    }

    pub fn build(self) -> SimEngine {
        SimEngine {
            nodes: DashMap::new(),
            allocations: Allocations::default(),
            faults: self.faults,
        }
    }
}

/// In-process engine implementing [`NativeEngine`].
pub struct SimEngine {
    nodes: DashMap<String, Arc<SimNode>>,
    allocations: Allocations,
    faults: Faults,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SimEngineBuilder {
        SimEngineBuilder::default()
    }

    /// Borrow the node behind an instance pointer.
    ///
    /// # Safety
    /// `engine` must come from `create` on this engine and not be destroyed.
    unsafe fn node<'a>(engine: *mut RawEngine) -> &'a SimNode {
        unsafe { &*engine.cast::<SimNode>().cast_const() }
    }

    fn lookup(&self, address: &str) -> Option<Arc<SimNode>> {
        self.nodes.get(address).map(|entry| Arc::clone(entry.value()))
    }

    /// Act as the node at `from_address` dialing `peer` through its
    /// installed connect hook. On success the caller owns the descriptor.
    ///
    /// # Errors
    /// The hook's status (`RAFT_NOCONNECTION` on a failed dial), or
    /// `DQLITE_MISUSE` when no such node or hook exists.
    pub fn connect(&self, from_address: &str, peer: &ServerInfo) -> Result<OwnedFd, c_int> {
        let node = self.lookup(from_address).ok_or(DQLITE_MISUSE)?;
        node.connect(peer)
    }

    /// Emit a log line from the node at `address` through its installed
    /// logger. Returns false when no such node or logger exists.
    pub fn emit_log(&self, address: &str, level: LogLevel, message: &str) -> bool {
        self.lookup(address)
            .is_some_and(|node| node.emit(level.as_raw(), message))
    }

    /// Make the running loop of the node at `address` exit on its own with
    /// `code`. Returns false when no such node is running.
    pub fn halt(&self, address: &str, code: c_int) -> bool {
        self.lookup(address).is_some_and(|node| node.halt(code))
    }

    /// Connections the node at `address` has adopted and not yet closed
    pub fn adopted_count(&self, address: &str) -> usize {
        self.lookup(address).map_or(0, |node| node.adopted_count())
    }

    /// Live nodes
    pub fn instance_count(&self) -> usize {
        self.nodes.len()
    }

    /// `cluster`/`dump` buffers not yet released through `free`
    pub fn live_allocations(&self) -> usize {
        self.allocations.live()
    }

    /// Calls to `free` with a pointer that was not live
    pub fn invalid_frees(&self) -> usize {
        self.allocations.invalid_frees()
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for SimEngine {
    fn initialize(&self) -> c_int {
        self.faults.initialize.unwrap_or(DQLITE_OK)
    }

    unsafe fn create(
        &self,
        id: u64,
        address: *const c_char,
        data_dir: *const c_char,
        out: *mut *mut RawEngine,
    ) -> c_int {
        if let Some(code) = self.faults.create {
            return code;
        }
        if address.is_null() || data_dir.is_null() || out.is_null() {
            return DQLITE_MISUSE;
        }

        let address = unsafe { CStr::from_ptr(address) }.to_string_lossy().into_owned();
        let data_dir = PathBuf::from(unsafe { CStr::from_ptr(data_dir) }.to_string_lossy().into_owned());

        let node = match SimNode::open(id, address.clone(), data_dir) {
            Ok(node) => Arc::new(node),
            Err(err) => {
                warn!(id, address, error = %err, "twin could not open data directory");
                return DQLITE_ERROR;
            }
        };

        self.nodes.insert(address.clone(), Arc::clone(&node));
        unsafe { out.write(Arc::into_raw(node).cast_mut().cast()) };
        debug!(id, address, "twin node created");
        DQLITE_OK
    }

    unsafe fn destroy(&self, engine: *mut RawEngine) {
        let node = unsafe { Arc::from_raw(engine.cast::<SimNode>().cast_const()) };
        self.nodes
            .remove_if(&node.address, |_, live| Arc::ptr_eq(live, &node));
        debug!(id = node.id, "twin node destroyed");
    }

    unsafe fn bootstrap(&self, engine: *mut RawEngine, n: c_uint, servers: *const RawServerInfo) -> c_int {
        if servers.is_null() || n == 0 {
            return DQLITE_MISUSE;
        }
        let servers = unsafe { std::slice::from_raw_parts(servers, n as usize) };
        unsafe { Self::node(engine) }.bootstrap(servers)
    }

    unsafe fn config_connect(&self, engine: *mut RawEngine, connect: ConnectFn, data: *mut c_void) -> c_int {
        if let Some(code) = self.faults.config {
            return code;
        }
        unsafe { Self::node(engine) }.set_connect(connect, data)
    }

    unsafe fn config_logger(&self, engine: *mut RawEngine, log: LogFn, data: *mut c_void) -> c_int {
        if let Some(code) = self.faults.config {
            return code;
        }
        unsafe { Self::node(engine) }.set_logger(log, data)
    }

    unsafe fn run(&self, engine: *mut RawEngine) -> c_int {
        unsafe { Self::node(engine) }.run()
    }

    unsafe fn ready(&self, engine: *mut RawEngine) -> bool {
        unsafe { Self::node(engine) }.phase() == crate::node::Phase::Running
    }

    unsafe fn stop(&self, engine: *mut RawEngine) -> c_int {
        if let Some(code) = self.faults.stop {
            return code;
        }
        unsafe { Self::node(engine) }.stop()
    }

    unsafe fn handle(&self, engine: *mut RawEngine, fd: c_int) -> c_int {
        if fd < 0 {
            return DQLITE_MISUSE;
        }
        unsafe { Self::node(engine) }.handle(fd)
    }

    unsafe fn leader(&self, engine: *mut RawEngine, out: *mut RawServerInfo) -> bool {
        let Some(leader) = unsafe { Self::node(engine) }.leader() else {
            return false;
        };
        unsafe {
            out.write(RawServerInfo {
                id: leader.id,
                address: leader.address.as_ptr(),
            })
        };
        true
    }

    unsafe fn cluster(&self, engine: *mut RawEngine, out: *mut *mut RawServerInfo, n: *mut c_uint) -> c_int {
        if let Some(code) = self.faults.cluster {
            return code;
        }

        let members = unsafe { Self::node(engine) }.members().unwrap_or(&[]);
        let Ok(count) = c_uint::try_from(members.len()) else {
            return DQLITE_MISUSE;
        };
        let array = if members.is_empty() {
            std::ptr::null_mut()
        } else {
            let array = self.allocations.members(members);
            if array.is_null() {
                return DQLITE_NOMEM;
            }
            array
        };

        unsafe {
            out.write(array);
            n.write(count);
        }
        DQLITE_OK
    }

    unsafe fn dump(
        &self,
        engine: *mut RawEngine,
        filename: *const c_char,
        buf: *mut *mut c_void,
        len: *mut usize,
    ) -> c_int {
        if filename.is_null() {
            return DQLITE_MISUSE;
        }
        let filename = unsafe { CStr::from_ptr(filename) }.to_string_lossy();

        let data = match unsafe { Self::node(engine) }.dump(&filename) {
            Ok(data) => data,
            Err(code) => return code,
        };
        let copy = self.allocations.bytes(&data);
        if copy.is_null() {
            return DQLITE_NOMEM;
        }

        unsafe {
            buf.write(copy);
            len.write(data.len());
        }
        DQLITE_OK
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        self.allocations.release(ptr);
    }
}
