//! # Cluster Directory
//!
//! Leader and membership queries plus database dumps. Every reply that
//! lives in engine memory is copied out first and released exactly once
//! afterwards; no pointer into it outlives the call.

use std::ffi::{c_uint, c_void, CString};
use std::ptr;
use std::slice;

use dqbridge_core::abi::{RawServerInfo, DQLITE_OK};
use dqbridge_core::{BridgeError, BridgeResult, NativeEngine, ServerInfo};
use tracing::debug;

use crate::server::ServerHandle;

/// Engine-owned allocation, released through the engine on drop.
struct NativeAlloc<'a> {
    engine: &'a dyn NativeEngine,
    ptr: *mut c_void,
}

impl<'a> NativeAlloc<'a> {
    fn new(engine: &'a dyn NativeEngine, ptr: *mut c_void) -> Self {
        Self { engine, ptr }
    }
}

impl Drop for NativeAlloc<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: `ptr` came from this engine and is released only here
            unsafe { self.engine.free(self.ptr) };
        }
    }
}

impl ServerHandle {
    /// The currently known leader, if any.
    pub fn leader(&self) -> BridgeResult<Option<ServerInfo>> {
        let mut raw = RawServerInfo::empty();

        // SAFETY: live instance and a writable slot
        let found = unsafe { self.engine.leader(self.raw.0, &mut raw) };
        if !found || raw.id == 0 {
            return Ok(None);
        }

        // SAFETY: the address stays valid until the next engine call
        Ok(Some(unsafe { ServerInfo::from_raw(&raw) }))
    }

    /// The current membership.
    ///
    /// # Errors
    /// `Native` if the engine cannot produce the list; nothing is copied.
    pub fn cluster(&self) -> BridgeResult<Vec<ServerInfo>> {
        let mut servers: *mut RawServerInfo = ptr::null_mut();
        let mut n: c_uint = 0;

        // SAFETY: live instance, writable out-parameters
        let code = unsafe { self.engine.cluster(self.raw.0, &mut servers, &mut n) };
        if code != DQLITE_OK {
            return Err(BridgeError::native("cluster", code));
        }

        let _alloc = NativeAlloc::new(self.engine.as_ref(), servers.cast());
        if servers.is_null() || n == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: the engine returned `n` initialized entries
        let entries = unsafe { slice::from_raw_parts(servers, n as usize) };
        let members = entries
            .iter()
            // SAFETY: entry addresses live as long as the array
            .map(|entry| unsafe { ServerInfo::from_raw(entry) })
            .collect();

        Ok(members)
    }

    /// Copy database `filename` out of the engine.
    ///
    /// # Errors
    /// - `InteriorNul`: `filename` cannot be passed to the engine
    /// - `Native`: the engine could not produce the dump
    pub fn dump(&self, filename: &str) -> BridgeResult<Vec<u8>> {
        let cfilename = CString::new(filename)?;
        let mut buf: *mut c_void = ptr::null_mut();
        let mut len: usize = 0;

        // SAFETY: live instance, terminated name, writable out-parameters
        let code = unsafe { self.engine.dump(self.raw.0, cfilename.as_ptr(), &mut buf, &mut len) };
        if code != DQLITE_OK {
            return Err(BridgeError::native("dump", code));
        }

        let _alloc = NativeAlloc::new(self.engine.as_ref(), buf);
        if buf.is_null() || len == 0 {
            return Ok(Vec::new());
        }

        // SAFETY: the engine returned `len` readable bytes
        let data = unsafe { slice::from_raw_parts(buf.cast::<u8>(), len) }.to_vec();
        debug!(id = self.id(), filename, bytes = data.len(), "database dumped");
        Ok(data)
    }
}
