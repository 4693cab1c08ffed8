//! Dial bridge: outbound connections the engine asks for.
//!
//! The engine calls [`connect_trampoline`] from one of its own threads when
//! it needs a connection to a peer. The registered closure runs on the dial
//! runtime's blocking pool under a deadline; the engine thread waits for the
//! outcome with the same deadline plus a small slack, so a closure that never
//! yields, or blocks its thread outright, cannot hold the engine past it or
//! starve dials made by other servers.

use std::ffi::{c_int, c_void};
use std::future::Future;
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dqbridge_core::abi::{RawServerInfo, DQLITE_OK, RAFT_NOCONNECTION};
use dqbridge_core::{BridgeError, BridgeResult, ServerInfo};
use tracing::{debug, error, warn};

use crate::handoff::{handoff, HandoffConn};
use crate::registry::{self, CallbackHandle, DialEntry};
use crate::runtime;

/// Extra time the engine thread waits past the dial deadline before giving up
/// on the attempt.
pub const DIAL_SLACK: Duration = Duration::from_millis(250);

/// Deadline information handed to a dial closure.
#[derive(Debug, Clone, Copy)]
pub struct DialContext {
    peer_id: u64,
    timeout: Duration,
    deadline: Instant,
}

impl DialContext {
    pub fn new(peer_id: u64, timeout: Duration) -> Self {
        Self {
            peer_id,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Identifier of the peer being dialed
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// The full deadline configured for this attempt
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the attempt is abandoned
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Connection produced by a dial closure
pub type DialConn = Box<dyn HandoffConn>;

/// Future returned by a dial closure
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<DialConn>> + Send + 'static>>;

/// Managed dial closure: `(context, address) -> connection`
pub type DialFunc = Arc<dyn Fn(DialContext, String) -> DialFuture + Send + Sync>;

/// Wrap an async closure returning any [`HandoffConn`] as a [`DialFunc`].
pub fn dial_func<F, Fut, C>(f: F) -> DialFunc
where
    F: Fn(DialContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
    C: HandoffConn + 'static,
{
    Arc::new(move |ctx: DialContext, address: String| -> DialFuture {
        let fut = f(ctx, address);
        Box::pin(async move { fut.await.map(|conn| Box::new(conn) as DialConn) })
    })
}

/// Dial over TCP with tokio.
pub fn tcp_dial_func() -> DialFunc {
    dial_func(|_ctx, address: String| tokio::net::TcpStream::connect(address))
}

/// Run one dial attempt for `server` and hand off the resulting connection.
///
/// # Returns
/// The close-on-exec duplicate of the dialed connection's descriptor, still
/// owned by the caller.
///
/// # Errors
/// - `NoConnection`: the closure failed, panicked, or missed the deadline
/// - `Handoff`: the connection's descriptor could not be extracted or
///   duplicated (the connection has been closed)
pub fn dial_and_handoff(entry: &DialEntry, server: &ServerInfo) -> BridgeResult<OwnedFd> {
    let no_connection = |reason: String| BridgeError::NoConnection {
        address: server.address.clone(),
        reason,
    };

    let runtime = runtime::dial_runtime()
        .map_err(|err| no_connection(format!("dial runtime unavailable: {err}")))?;

    let timeout = entry.timeout;
    let func = Arc::clone(&entry.func);
    let ctx = DialContext::new(server.id, timeout);
    let address = server.address.clone();
    let (tx, rx) = mpsc::sync_channel::<BridgeResult<OwnedFd>>(1);

    // The closure body may block before it yields a future, so both the
    // call and the poll happen on a blocking-pool thread. A stuck closure
    // then pins one elastic blocking thread, never a core worker.
    let driver = runtime.handle().clone();
    runtime.spawn_blocking(move || {
        let reason_address = address.clone();
        let attempt = func(ctx, address);
        let bounded = async move { tokio::time::timeout(ctx.remaining(), attempt).await };
        let outcome = match driver.block_on(bounded) {
            Ok(Ok(conn)) => handoff(conn).map_err(BridgeError::from),
            Ok(Err(err)) => Err(BridgeError::NoConnection {
                address: reason_address,
                reason: err.to_string(),
            }),
            Err(_) => Err(BridgeError::NoConnection {
                address: reason_address,
                reason: format!("dial deadline of {timeout:?} exceeded"),
            }),
        };
        // A late outcome is dropped here, closing any descriptor it carries
        let _ = tx.send(outcome);
    });

    match rx.recv_timeout(timeout + DIAL_SLACK) {
        Ok(outcome) => outcome,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(no_connection(format!(
            "dial closure did not yield within {timeout:?}"
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(no_connection("dial closure panicked".into()))
        }
    }
}

/// Connect callback installed into the engine.
///
/// # Arguments
/// * `data` - Encoded [`CallbackHandle`] of a dial registration
/// * `server` - Peer to dial; its address is copied before use
/// * `fd` - Receives the connected descriptor on success
///
/// # Returns
/// `DQLITE_OK` with ownership of `*fd` moved to the engine, or
/// `RAFT_NOCONNECTION` with `*fd` untouched.
///
/// # Safety
/// `server` must be null or point to a valid member whose address is
/// NUL-terminated; `fd` must be null or writable.
#[export_name = "dqbridge_connect_trampoline"]
pub unsafe extern "C" fn connect_trampoline(
    data: *mut c_void,
    server: *const RawServerInfo,
    fd: *mut c_int,
) -> c_int {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if server.is_null() || fd.is_null() {
            error!("connect trampoline called with a null argument");
            return RAFT_NOCONNECTION;
        }

        let Some(handle) = CallbackHandle::from_data(data) else {
            error!("connect trampoline called without a callback handle");
            return RAFT_NOCONNECTION;
        };

        let Some(entry) = registry::global().dial(handle) else {
            error!(%handle, "dial callback not registered");
            return RAFT_NOCONNECTION;
        };

        // SAFETY: caller guarantees `server` is valid for this call
        let peer = unsafe { ServerInfo::from_raw(&*server) };

        match dial_and_handoff(&entry, &peer) {
            Ok(conn) => {
                let raw = conn.into_raw_fd();
                debug!(peer_id = peer.id, address = %peer.address, fd = raw, "dialed peer");
                // SAFETY: `fd` checked non-null above
                unsafe { *fd = raw };
                DQLITE_OK
            }
            Err(err) => {
                warn!(peer_id = peer.id, address = %peer.address, error = %err, "dial failed");
                RAFT_NOCONNECTION
            }
        }
    }));

    result.unwrap_or_else(|_| {
        error!("panic in connect trampoline");
        RAFT_NOCONNECTION
    })
}
