//! # Native Library Binding
//!
//! [`DqliteEngine`] implements [`NativeEngine`] over the linked C library.
//! Compiled only with the `dqlite` feature, which also builds `csrc/shim.c`.
//!
//! The library's member struct carries a 32-bit id, so ids are narrowed on
//! the way in (ids above `u32::MAX` are rejected with `DQLITE_MISUSE`) and
//! widened on the way out. Hook installation goes through the shim: the
//! engine's connect hook takes the library's member struct and its logger
//! hook is variadic, so the shim adapts both and calls the exported
//! trampolines.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::mem;
use std::ptr;

use dqbridge_core::abi::{ConnectFn, LogFn, RawEngine, RawServerInfo, DQLITE_MISUSE, DQLITE_NOMEM, DQLITE_OK};
use dqbridge_core::NativeEngine;

#[repr(C)]
struct DqliteServer {
    id: c_uint,
    address: *const c_char,
}

extern "C" {
    fn dqlite_initialize() -> c_int;
    fn dqlite_create(
        id: c_uint,
        address: *const c_char,
        dir: *const c_char,
        out: *mut *mut RawEngine,
    ) -> c_int;
    fn dqlite_destroy(d: *mut RawEngine);
    fn dqlite_bootstrap(d: *mut RawEngine, n: c_uint, servers: *const DqliteServer) -> c_int;
    fn dqlite_run(d: *mut RawEngine) -> c_int;
    fn dqlite_ready(d: *mut RawEngine) -> bool;
    fn dqlite_stop(d: *mut RawEngine) -> c_int;
    fn dqlite_handle(d: *mut RawEngine, fd: c_int) -> c_int;
    fn dqlite_leader(d: *mut RawEngine, server: *mut DqliteServer) -> bool;
    fn dqlite_cluster(d: *mut RawEngine, servers: *mut *mut DqliteServer, n: *mut c_uint) -> c_int;
    fn dqlite_dump(
        d: *mut RawEngine,
        filename: *const c_char,
        buf: *mut *mut c_void,
        len: *mut usize,
    ) -> c_int;

    fn sqlite3_malloc64(n: u64) -> *mut c_void;
    fn sqlite3_free(p: *mut c_void);

    // csrc/shim.c
    fn dqbridge_config_connect(d: *mut RawEngine, data: *mut c_void) -> c_int;
    fn dqbridge_config_logger(d: *mut RawEngine, data: *mut c_void) -> c_int;
}

/// The linked native engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct DqliteEngine;

impl DqliteEngine {
    pub fn new() -> Self {
        Self
    }
}

/// Copy the library's member array into one `sqlite3_malloc64` block laid
/// out as `[RawServerInfo; n]` followed by the address strings, so a single
/// `sqlite3_free` releases it.
unsafe fn widen_members(servers: *const DqliteServer, n: usize) -> *mut RawServerInfo {
    let source = unsafe { std::slice::from_raw_parts(servers, n) };
    let addresses: Vec<&[u8]> = source
        .iter()
        .map(|s| {
            if s.address.is_null() {
                &b"\0"[..]
            } else {
                unsafe { CStr::from_ptr(s.address) }.to_bytes_with_nul()
            }
        })
        .collect();

    let header = n * mem::size_of::<RawServerInfo>();
    let strings: usize = addresses.iter().map(|a| a.len()).sum();
    let block = unsafe { sqlite3_malloc64((header + strings) as u64) }.cast::<u8>();
    if block.is_null() {
        return ptr::null_mut();
    }

    let entries = block.cast::<RawServerInfo>();
    let mut cursor = unsafe { block.add(header) };
    for (i, (server, address)) in source.iter().zip(&addresses).enumerate() {
        unsafe {
            ptr::copy_nonoverlapping(address.as_ptr(), cursor, address.len());
            entries.add(i).write(RawServerInfo {
                id: u64::from(server.id),
                address: cursor.cast::<c_char>(),
            });
            cursor = cursor.add(address.len());
        }
    }
    entries
}

impl NativeEngine for DqliteEngine {
    fn initialize(&self) -> c_int {
        unsafe { dqlite_initialize() }
    }

    unsafe fn create(
        &self,
        id: u64,
        address: *const c_char,
        data_dir: *const c_char,
        out: *mut *mut RawEngine,
    ) -> c_int {
        let Ok(id) = c_uint::try_from(id) else {
            return DQLITE_MISUSE;
        };
        unsafe { dqlite_create(id, address, data_dir, out) }
    }

    unsafe fn destroy(&self, engine: *mut RawEngine) {
        unsafe { dqlite_destroy(engine) }
    }

    unsafe fn bootstrap(&self, engine: *mut RawEngine, n: c_uint, servers: *const RawServerInfo) -> c_int {
        let members = unsafe { std::slice::from_raw_parts(servers, n as usize) };
        let mut narrowed = Vec::with_capacity(members.len());
        for member in members {
            let Ok(id) = c_uint::try_from(member.id) else {
                return DQLITE_MISUSE;
            };
            narrowed.push(DqliteServer {
                id,
                address: member.address,
            });
        }
        unsafe { dqlite_bootstrap(engine, n, narrowed.as_ptr()) }
    }

    unsafe fn config_connect(&self, engine: *mut RawEngine, _connect: ConnectFn, data: *mut c_void) -> c_int {
        // The shim's hook always calls the exported connect trampoline
        unsafe { dqbridge_config_connect(engine, data) }
    }

    unsafe fn config_logger(&self, engine: *mut RawEngine, _log: LogFn, data: *mut c_void) -> c_int {
        unsafe { dqbridge_config_logger(engine, data) }
    }

    unsafe fn run(&self, engine: *mut RawEngine) -> c_int {
        unsafe { dqlite_run(engine) }
    }

    unsafe fn ready(&self, engine: *mut RawEngine) -> bool {
        unsafe { dqlite_ready(engine) }
    }

    unsafe fn stop(&self, engine: *mut RawEngine) -> c_int {
        unsafe { dqlite_stop(engine) }
    }

    unsafe fn handle(&self, engine: *mut RawEngine, fd: c_int) -> c_int {
        unsafe { dqlite_handle(engine, fd) }
    }

    unsafe fn leader(&self, engine: *mut RawEngine, out: *mut RawServerInfo) -> bool {
        let mut server = DqliteServer {
            id: 0,
            address: ptr::null(),
        };
        if !unsafe { dqlite_leader(engine, &mut server) } {
            return false;
        }
        unsafe {
            out.write(RawServerInfo {
                id: u64::from(server.id),
                address: server.address,
            })
        };
        true
    }

    unsafe fn cluster(&self, engine: *mut RawEngine, out: *mut *mut RawServerInfo, n: *mut c_uint) -> c_int {
        let mut servers: *mut DqliteServer = ptr::null_mut();
        let mut count: c_uint = 0;

        let rc = unsafe { dqlite_cluster(engine, &mut servers, &mut count) };
        if rc != DQLITE_OK {
            return rc;
        }

        let widened = if servers.is_null() || count == 0 {
            ptr::null_mut()
        } else {
            unsafe { widen_members(servers, count as usize) }
        };
        unsafe { sqlite3_free(servers.cast()) };

        if widened.is_null() && count != 0 {
            return DQLITE_NOMEM;
        }
        unsafe {
            out.write(widened);
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
        unsafe { dqlite_dump(engine, filename, buf, len) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        unsafe { sqlite3_free(ptr) }
    }
}
