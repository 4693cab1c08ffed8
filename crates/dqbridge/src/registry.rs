//! # Callback Registry
//!
//! Process-wide table mapping opaque handles to managed closures. The engine
//! only ever sees a handle, carried in its `void *data` context pointer, and
//! hands it back to a trampoline which resolves it here.
//!
//! Handles pack a slot index (low 32 bits) and a generation (high 32 bits).
//! Freed slots are recycled with a bumped generation, so a stale handle never
//! resolves to a newer closure. A slot whose generation is exhausted is
//! retired instead of recycled.

use std::ffi::c_void;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::RwLock;

use crate::bridge::dial::DialFunc;
use crate::bridge::log::LogFunc;

// ============================================================================
// HANDLES
// ============================================================================

// Handles travel through `void *` unchanged
const _: () = assert!(std::mem::size_of::<*mut c_void>() == std::mem::size_of::<u64>());

/// Opaque key for a registered callback. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    fn new(slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    fn slot(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw integer value
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value. Zero is never a valid handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Encode the handle as the engine's opaque context pointer.
    pub fn into_data(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    /// Decode a context pointer produced by [`CallbackHandle::into_data`].
    pub fn from_data(data: *mut c_void) -> Option<Self> {
        Self::from_raw(data as usize as u64)
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot(), self.generation())
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// A registered dial closure and the deadline applied to each attempt.
#[derive(Clone)]
pub struct DialEntry {
    pub func: DialFunc,
    pub timeout: Duration,
}

/// A registered log sink and the maximum bytes forwarded per line,
/// terminator included.
#[derive(Clone)]
pub struct LogEntry {
    pub func: LogFunc,
    pub limit: usize,
}

enum Callback {
    Dial(DialEntry),
    Log(LogEntry),
}

struct Slot {
    generation: u32,
    callback: Option<Callback>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Slots {
    fn insert(&mut self, callback: Callback) -> CallbackHandle {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.callback = Some(callback);
            return CallbackHandle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            callback: Some(callback),
        });
        CallbackHandle::new(index, 1)
    }

    fn get(&self, handle: CallbackHandle) -> Option<&Callback> {
        let slot = self.slots.get(handle.slot())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.callback.as_ref()
    }

    fn remove(&mut self, handle: CallbackHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.slot()) else {
            return false;
        };
        if slot.generation != handle.generation() || slot.callback.is_none() {
            return false;
        }

        slot.callback = None;
        self.live -= 1;

        if slot.generation < u32::MAX {
            slot.generation += 1;
            self.free.push(handle.slot() as u32);
        }
        true
    }
}

// ============================================================================
// CALLBACK REGISTRY
// ============================================================================

/// Thread-safe generational handle table for dial and log callbacks.
///
/// Registration happens on host threads; lookups happen on engine threads
/// inside trampolines. Every access takes the lock, and lookups clone the
/// closure out so it runs without the lock held.
pub struct CallbackRegistry {
    inner: RwLock<Slots>,
}

impl CallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots::default()),
        }
    }

    /// Register a dial closure
    ///
    /// # Arguments
    /// * `func` - Closure producing outbound connections
    /// * `timeout` - Deadline applied to every attempt made through this handle
    ///
    /// # Returns
    /// A handle never handed out before in this process
    pub fn register_dial(&self, func: DialFunc, timeout: Duration) -> CallbackHandle {
        self.inner
            .write()
            .insert(Callback::Dial(DialEntry { func, timeout }))
    }

    /// Register a log sink
    ///
    /// # Arguments
    /// * `func` - Sink receiving engine log lines
    /// * `limit` - Maximum bytes forwarded per line, terminator included
    pub fn register_log(&self, func: LogFunc, limit: usize) -> CallbackHandle {
        self.inner
            .write()
            .insert(Callback::Log(LogEntry { func, limit }))
    }

    /// Resolve a dial handle. Returns `None` for unknown, stale, or log handles.
    pub fn dial(&self, handle: CallbackHandle) -> Option<DialEntry> {
        match self.inner.read().get(handle)? {
            Callback::Dial(entry) => Some(entry.clone()),
            Callback::Log(_) => None,
        }
    }

    /// Resolve a log handle. Returns `None` for unknown, stale, or dial handles.
    pub fn log(&self, handle: CallbackHandle) -> Option<LogEntry> {
        match self.inner.read().get(handle)? {
            Callback::Log(entry) => Some(entry.clone()),
            Callback::Dial(_) => None,
        }
    }

    /// Remove a callback. Returns false if the handle was not live.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        self.inner.write().remove(handle)
    }

    /// Whether `handle` currently resolves to a callback
    pub fn contains(&self, handle: CallbackHandle) -> bool {
        self.inner.read().get(handle).is_some()
    }

    /// Number of live callbacks
    pub fn count(&self) -> usize {
        self.inner.read().live
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry shared by every server in the process
static REGISTRY: LazyLock<CallbackRegistry> = LazyLock::new(CallbackRegistry::new);

/// The process-wide registry used by the trampolines
pub fn global() -> &'static CallbackRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::dial::dial_func;
    use crate::bridge::log::log_func;
    use dqbridge_core::LogLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn noop_log() -> LogFunc {
        log_func(|_, _| {})
    }

    fn refusing_dial() -> DialFunc {
        dial_func(|_, _| async {
            Err::<std::net::TcpStream, _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
        })
    }

    #[test]
    fn test_handles_are_never_zero() {
        let registry = CallbackRegistry::new();
        let handle = registry.register_log(noop_log(), 1024);
        assert_ne!(handle.as_raw(), 0);
        assert!(!handle.into_data().is_null());
        assert_eq!(CallbackHandle::from_data(handle.into_data()), Some(handle));
        assert_eq!(CallbackHandle::from_data(std::ptr::null_mut()), None);
    }

    #[test]
    fn test_register_resolves_to_same_closure() {
        let registry = CallbackRegistry::new();
        let hits: Vec<Arc<AtomicUsize>> = (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let handles: Vec<CallbackHandle> = hits
            .iter()
            .map(|counter| {
                let counter = Arc::clone(counter);
                registry.register_log(
                    log_func(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                    64,
                )
            })
            .collect();

        for (i, handle) in handles.iter().enumerate() {
            let entry = registry.log(*handle).expect("registered");
            for _ in 0..=i {
                (entry.func)(LogLevel::Info, "line");
            }
        }

        for (i, counter) in hits.iter().enumerate() {
            assert_eq!(counter.load(Ordering::SeqCst), i + 1);
        }
    }

    #[test]
    fn test_dial_and_log_handles_do_not_cross() {
        let registry = CallbackRegistry::new();
        let dial = registry.register_dial(refusing_dial(), Duration::from_secs(1));
        let log = registry.register_log(noop_log(), 1024);

        assert!(registry.dial(dial).is_some());
        assert!(registry.log(dial).is_none());
        assert!(registry.log(log).is_some());
        assert!(registry.dial(log).is_none());
        assert_eq!(registry.dial(dial).map(|e| e.timeout), Some(Duration::from_secs(1)));
        assert_eq!(registry.log(log).map(|e| e.limit), Some(1024));
    }

    #[test]
    fn test_unregister_and_stale_generation() {
        let registry = CallbackRegistry::new();
        let first = registry.register_log(noop_log(), 16);
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert_eq!(registry.count(), 0);
        assert!(!registry.contains(first));

        // Same slot, new generation
        let second = registry.register_log(noop_log(), 16);
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first, second);
        assert!(registry.log(first).is_none());
        assert!(registry.log(second).is_some());
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let registry = CallbackRegistry::new();
        {
            let mut slots = registry.inner.write();
            slots.slots.push(Slot {
                generation: u32::MAX,
                callback: None,
            });
            slots.free.push(0);
        }

        let last = registry.register_log(noop_log(), 16);
        assert_eq!(last.generation(), u32::MAX);
        assert!(registry.unregister(last));

        let next = registry.register_log(noop_log(), 16);
        assert_ne!(next.slot(), last.slot());
        assert!(registry.log(last).is_none());
    }

    #[test]
    fn test_unknown_handles_miss() {
        let registry = CallbackRegistry::new();
        let bogus = CallbackHandle::new(42, 1);
        assert!(registry.dial(bogus).is_none());
        assert!(registry.log(bogus).is_none());
        assert!(!registry.unregister(bogus));
    }

    #[test]
    fn test_concurrent_registration_unique_handles() {
        let registry = Arc::new(CallbackRegistry::new());
        let mut workers = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            workers.push(thread::spawn(move || {
                let mut handles = Vec::new();
                for _ in 0..200 {
                    let handle = registry.register_log(noop_log(), 1024);
                    assert!(registry.log(handle).is_some());
                    handles.push(handle);
                }
                // Free half so other threads recycle slots
                for handle in handles.iter().step_by(2) {
                    assert!(registry.unregister(*handle));
                }
                handles
            }));
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.join().unwrap());
        }

        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "handle values must never repeat");
        assert_eq!(registry.count(), total / 2);
    }
}
