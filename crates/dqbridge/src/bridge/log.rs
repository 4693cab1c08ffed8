//! Log bridge: engine diagnostics forwarded to a managed sink.
//!
//! Runs on engine threads, possibly on hot paths. The message is read with
//! a bounded scan, truncated to the registered limit, and forwarded without
//! blocking: servers install their sink behind [`forwarding`], a bounded
//! queue drained by its own thread, so a slow sink drops lines instead of
//! stalling the engine.

use std::borrow::Cow;
use std::ffi::{c_char, c_int, c_void};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread;

use dqbridge_core::LogLevel;
use tracing::{debug, error, info, trace, warn};

use crate::registry::{self, CallbackHandle};

/// Managed log sink: `(level, message)`
pub type LogFunc = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Wrap a closure as a [`LogFunc`]
pub fn log_func<F>(f: F) -> LogFunc
where
    F: Fn(LogLevel, &str) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Forward engine lines into `tracing` under the `dqbridge::engine` target.
pub fn tracing_log_func() -> LogFunc {
    log_func(|level, message| match level {
        LogLevel::Debug => debug!(target: "dqbridge::engine", "{message}"),
        LogLevel::Info => info!(target: "dqbridge::engine", "{message}"),
        LogLevel::Warn => warn!(target: "dqbridge::engine", "{message}"),
        LogLevel::Error => error!(target: "dqbridge::engine", "{message}"),
    })
}

/// Lines a forwarding sink buffers before it starts dropping
pub const LOG_QUEUE_DEPTH: usize = 256;

/// Put `sink` behind a bounded queue drained by a dedicated thread.
///
/// The returned function never waits on `sink`: when the queue is full the
/// line is dropped and counted. The drain thread exits once every copy of
/// the returned function is gone, after delivering what was queued.
pub fn forwarding(sink: LogFunc, name: impl Into<String>) -> io::Result<LogFunc> {
    let (tx, rx) = mpsc::sync_channel::<(LogLevel, String)>(LOG_QUEUE_DEPTH);
    let name = name.into();

    thread::Builder::new().name(name.clone()).spawn(move || {
        for (level, message) in rx {
            let _ = catch_unwind(AssertUnwindSafe(|| sink(level, &message)));
        }
    })?;

    let dropped = AtomicU64::new(0);
    Ok(log_func(move |level, message| {
        match tx.try_send((level, message.to_owned())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(sink = %name, dropped = total, "log queue full, line dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(sink = %name, "log drain thread gone, line dropped");
            }
        }
    }))
}

/// Read at most `limit - 1` bytes of `message`.
///
/// # Safety
/// `message` must point to memory readable up to its NUL terminator or
/// `limit - 1` bytes, whichever comes first.
unsafe fn bounded_message<'a>(message: *const c_char, limit: usize) -> Cow<'a, str> {
    let max = limit.saturating_sub(1);
    // SAFETY: strnlen reads no further than `max` bytes
    let len = unsafe { libc::strnlen(message, max) };
    // SAFETY: the first `len` bytes were just scanned
    let bytes = unsafe { std::slice::from_raw_parts(message.cast::<u8>(), len) };
    String::from_utf8_lossy(bytes)
}

/// Logger callback installed into the engine.
///
/// # Arguments
/// * `data` - Encoded [`CallbackHandle`] of a log registration
/// * `level` - Engine log level
/// * `message` - NUL-terminated, already formatted line
///
/// # Safety
/// `message` must be null or NUL-terminated within the engine's emit buffer.
#[export_name = "dqbridge_log_trampoline"]
pub unsafe extern "C" fn log_trampoline(data: *mut c_void, level: c_int, message: *const c_char) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if message.is_null() {
            return;
        }

        let Some(handle) = CallbackHandle::from_data(data) else {
            error!("log trampoline called without a callback handle");
            return;
        };

        let Some(entry) = registry::global().log(handle) else {
            error!(%handle, "log callback not registered");
            return;
        };

        let decoded = LogLevel::from_raw(level);
        if decoded.as_raw() != level {
            trace!(raw_level = level, "unknown engine log level, forwarding as debug");
        }

        // SAFETY: caller guarantees a terminated message
        let text = unsafe { bounded_message(message, entry.limit) };
        (entry.func)(decoded, &text[..]);
    }));

    if result.is_err() {
        error!("panic in log sink");
    }
}
