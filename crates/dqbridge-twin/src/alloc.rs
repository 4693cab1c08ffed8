//! Native-style heap allocations with leak and double-free accounting.
//!
//! Buffers handed across the boundary come from `libc::malloc`, as the
//! real engine's do, and must come back through `release` exactly once.

use std::collections::HashSet;
use std::ffi::{c_char, c_void};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dqbridge_core::RawServerInfo;
use parking_lot::Mutex;
use tracing::error;

use crate::node::SimMember;

#[derive(Default)]
pub(crate) struct Allocations {
    live: Mutex<HashSet<usize>>,
    invalid_frees: AtomicUsize,
}

impl Allocations {
    fn malloc(&self, len: usize) -> *mut u8 {
        // SAFETY: plain allocation; a zero-length request still gets a
        // unique pointer
        let ptr = unsafe { libc::malloc(len.max(1)) }.cast::<u8>();
        if !ptr.is_null() {
            self.live.lock().insert(ptr as usize);
        }
        ptr
    }

    /// Copy `data` into a fresh buffer
    pub(crate) fn bytes(&self, data: &[u8]) -> *mut c_void {
        let ptr = self.malloc(data.len());
        if !ptr.is_null() {
            // SAFETY: `ptr` has room for `data.len()` bytes
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        }
        ptr.cast()
    }

    /// Lay out `members` as `[RawServerInfo; n]` followed by their address
    /// strings, in a single block.
    pub(crate) fn members(&self, members: &[SimMember]) -> *mut RawServerInfo {
        let header = members.len() * mem::size_of::<RawServerInfo>();
        let strings: usize = members
            .iter()
            .map(|m| m.address.as_bytes_with_nul().len())
            .sum();

        let block = self.malloc(header + strings);
        if block.is_null() {
            return ptr::null_mut();
        }

        let entries = block.cast::<RawServerInfo>();
        // SAFETY: every write below stays inside the block sized above, and
        // malloc's alignment covers RawServerInfo
        unsafe {
            let mut cursor = block.add(header);
            for (i, member) in members.iter().enumerate() {
                let address = member.address.as_bytes_with_nul();
                ptr::copy_nonoverlapping(address.as_ptr(), cursor, address.len());
                entries.add(i).write(RawServerInfo {
                    id: member.id,
                    address: cursor.cast::<c_char>(),
                });
                cursor = cursor.add(address.len());
            }
        }
        entries
    }

    /// Free a pointer from `bytes` or `members`. Unknown pointers, including
    /// second frees, are counted and ignored.
    pub(crate) fn release(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        if !self.live.lock().remove(&(ptr as usize)) {
            self.invalid_frees.fetch_add(1, Ordering::SeqCst);
            error!(ptr = ptr as usize, "free of unknown or already freed pointer");
            return;
        }
        // SAFETY: `ptr` came from malloc and was live until just now
        unsafe { libc::free(ptr) };
    }

    pub(crate) fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn invalid_frees(&self) -> usize {
        self.invalid_frees.load(Ordering::SeqCst)
    }
}

impl Drop for Allocations {
    fn drop(&mut self) {
        for ptr in self.live.get_mut().drain() {
            // SAFETY: still-live malloc'd pointers
            unsafe { libc::free(ptr as *mut c_void) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::{CStr, CString};

    #[test]
    fn test_bytes_round_trip_and_release() {
        let allocs = Allocations::default();
        let ptr = allocs.bytes(b"snapshot");
        assert_eq!(allocs.live(), 1);

        let copied = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), 8) };
        assert_eq!(copied, b"snapshot");

        allocs.release(ptr);
        assert_eq!(allocs.live(), 0);
        assert_eq!(allocs.invalid_frees(), 0);
    }

    #[test]
    fn test_second_free_is_counted() {
        let allocs = Allocations::default();
        let ptr = allocs.bytes(b"x");
        allocs.release(ptr);
        allocs.release(ptr);
        assert_eq!(allocs.invalid_frees(), 1);
    }

    #[test]
    fn test_member_block_layout() {
        let allocs = Allocations::default();
        let members = vec![
            SimMember {
                id: 1,
                address: CString::new("a").unwrap(),
            },
            SimMember {
                id: 2,
                address: CString::new("bb:9001").unwrap(),
            },
        ];

        let block = allocs.members(&members);
        let entries = unsafe { std::slice::from_raw_parts(block, 2) };
        assert_eq!(entries[0].id, 1);
        assert_eq!(unsafe { CStr::from_ptr(entries[0].address) }.to_str().unwrap(), "a");
        assert_eq!(entries[1].id, 2);
        assert_eq!(unsafe { CStr::from_ptr(entries[1].address) }.to_str().unwrap(), "bb:9001");

        allocs.release(block.cast());
        assert_eq!(allocs.live(), 0);
    }
}
