//! # Server Handle
//!
//! Owns exactly one native engine instance and drives its lifecycle:
//! `Created → Bootstrapped → Running → Stopped → Closed`.
//!
//! `close` consumes the handle, and dropping an unclosed handle destroys the
//! instance, so destroy runs exactly once and nothing can touch the instance
//! afterwards. [`RunningServer`] owns the dedicated run thread and hands the
//! handle back only after that thread has returned.

use std::ffi::{c_uint, CString};
use std::fmt;
use std::ops::Deref;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dqbridge_core::abi::{RawEngine, RawServerInfo, DQLITE_CANTBOOTSTRAP, DQLITE_OK, DQLITE_STOPPED};
use dqbridge_core::{
    BridgeError, BridgeResult, NativeEngine, NativeStatus, ServerConfig, ServerInfo, ServerState,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bridge::dial::{connect_trampoline, DialFunc};
use crate::bridge::log::{forwarding, log_trampoline, LogFunc};
use crate::handoff::{handoff, HandoffConn};
use crate::registry::{self, CallbackHandle};
use crate::runtime;

/// Raw instance pointer. The engine synchronizes access internally.
#[derive(Clone, Copy)]
pub(crate) struct EnginePtr(pub(crate) *mut RawEngine);

// SAFETY: the engine's entry points are safe to call concurrently from any
// thread on one instance; the pointer itself carries no thread affinity.
unsafe impl Send for EnginePtr {}
unsafe impl Sync for EnginePtr {}

#[derive(Default)]
struct Callbacks {
    dial: Option<CallbackHandle>,
    log: Option<CallbackHandle>,
}

/// Owner of one native engine instance.
pub struct ServerHandle {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) raw: EnginePtr,
    config: ServerConfig,
    state: Mutex<ServerState>,
    callbacks: Mutex<Callbacks>,
    released: bool,
}

impl ServerHandle {
    /// Allocate an engine instance for `config`.
    ///
    /// # Errors
    /// - `Uninitialized`: [`crate::init`] has not succeeded
    /// - `InvalidConfig` / `InteriorNul`: the configuration was rejected
    /// - `Create`: the engine could not allocate the instance
    pub fn new(engine: Arc<dyn NativeEngine>, config: ServerConfig) -> BridgeResult<Self> {
        if !runtime::is_initialized() {
            return Err(BridgeError::Uninitialized);
        }
        config.validate()?;

        let address = config.address_cstring()?;
        let data_dir = config.data_dir_cstring()?;
        let mut raw: *mut RawEngine = std::ptr::null_mut();

        // SAFETY: both strings outlive the call and `raw` is writable
        let code = unsafe { engine.create(config.id, address.as_ptr(), data_dir.as_ptr(), &mut raw) };
        if code != DQLITE_OK || raw.is_null() {
            // Success without an instance is still a failed create
            let status = match code {
                DQLITE_OK => NativeStatus::Error,
                code => NativeStatus::from_code(code),
            };
            error!(id = config.id, address = %config.address, code, %status, "failed to create server");
            return Err(BridgeError::Create { code, status });
        }

        info!(id = config.id, address = %config.address, "server created");
        Ok(Self {
            engine,
            raw: EnginePtr(raw),
            config,
            state: Mutex::new(ServerState::Created),
            callbacks: Mutex::new(Callbacks::default()),
            released: false,
        })
    }

    /// Configuration this instance was created with
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Member identifier
    pub fn id(&self) -> u64 {
        self.config.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Registry handle of the installed dial function
    pub fn dial_handle(&self) -> Option<CallbackHandle> {
        self.callbacks.lock().dial
    }

    /// Registry handle of the installed log function
    pub fn log_handle(&self) -> Option<CallbackHandle> {
        self.callbacks.lock().log
    }

    /// Install the initial cluster membership.
    ///
    /// # Errors
    /// - `AlreadyBootstrapped`: this handle, or an earlier process on the same
    ///   data directory, already installed a configuration. State is unchanged.
    /// - `InvalidState`: the server is running or stopped
    /// - `InvalidArgument`: `members` is empty or too long
    pub fn bootstrap(&self, members: &[ServerInfo]) -> BridgeResult<()> {
        let mut state = self.state.lock();
        match *state {
            ServerState::Created => {}
            ServerState::Bootstrapped => return Err(BridgeError::AlreadyBootstrapped),
            other => {
                return Err(BridgeError::InvalidState {
                    op: "bootstrap",
                    state: other,
                })
            }
        }

        if members.is_empty() {
            return Err(BridgeError::InvalidArgument("bootstrap needs at least one member".into()));
        }
        let n = c_uint::try_from(members.len())
            .map_err(|_| BridgeError::InvalidArgument("too many members".into()))?;

        let addresses = members
            .iter()
            .map(|m| CString::new(m.address.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let servers: Vec<RawServerInfo> = members
            .iter()
            .zip(&addresses)
            .map(|(member, address)| RawServerInfo {
                id: member.id,
                address: address.as_ptr(),
            })
            .collect();

        // SAFETY: `servers` and the strings it points to live until return
        let code = unsafe { self.engine.bootstrap(self.raw.0, n, servers.as_ptr()) };
        match code {
            DQLITE_OK => {
                *state = ServerState::Bootstrapped;
                info!(id = self.id(), members = members.len(), "server bootstrapped");
                Ok(())
            }
            DQLITE_CANTBOOTSTRAP => {
                debug!(id = self.id(), "server already has a configuration");
                Err(BridgeError::AlreadyBootstrapped)
            }
            code => Err(BridgeError::native("bootstrap", code)),
        }
    }

    /// Route the engine's outbound connections through `func`.
    ///
    /// Replaces any earlier dial function; its handle is released. Only
    /// allowed before the server runs.
    pub fn set_dial_func(&self, func: DialFunc) -> BridgeResult<()> {
        let state = self.state.lock();
        if !state.can_run() {
            return Err(BridgeError::InvalidState {
                op: "set dial function",
                state: *state,
            });
        }

        let registry = registry::global();
        let handle = registry.register_dial(func, self.config.dial_timeout());

        // SAFETY: live instance; the handle stays registered while installed
        let code = unsafe {
            self.engine
                .config_connect(self.raw.0, connect_trampoline, handle.into_data())
        };
        if code != DQLITE_OK {
            registry.unregister(handle);
            return Err(BridgeError::native("set dial function", code));
        }

        if let Some(previous) = self.callbacks.lock().dial.replace(handle) {
            registry.unregister(previous);
        }
        debug!(id = self.id(), %handle, "dial function installed");
        Ok(())
    }

    /// Route the engine's log lines to `func`.
    ///
    /// `func` runs on a drain thread owned by this registration, never on an
    /// engine thread; lines arriving while it lags are dropped. Replaces any
    /// earlier log function; its handle is released. Only allowed before the
    /// server runs.
    pub fn set_log_func(&self, func: LogFunc) -> BridgeResult<()> {
        let state = self.state.lock();
        if !state.can_run() {
            return Err(BridgeError::InvalidState {
                op: "set log function",
                state: *state,
            });
        }

        let func = forwarding(func, format!("dqbridge-log-{}", self.id()))
            .map_err(|err| BridgeError::Worker(format!("failed to spawn log thread: {err}")))?;
        let registry = registry::global();
        let handle = registry.register_log(func, self.config.log_message_limit);

        // SAFETY: live instance; the handle stays registered while installed
        let code = unsafe {
            self.engine
                .config_logger(self.raw.0, log_trampoline, handle.into_data())
        };
        if code != DQLITE_OK {
            registry.unregister(handle);
            return Err(BridgeError::native("set log function", code));
        }

        if let Some(previous) = self.callbacks.lock().log.replace(handle) {
            registry.unregister(previous);
        }
        debug!(id = self.id(), %handle, "log function installed");
        Ok(())
    }

    /// Run the engine main loop on the calling thread.
    ///
    /// Blocks until [`ServerHandle::stop`] is observed. Prefer
    /// [`ServerHandle::start`], which gives the loop its own thread.
    pub fn run(&self) -> BridgeResult<()> {
        self.enter_running("run")?;
        self.run_loop()
    }

    fn enter_running(&self, op: &'static str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if !state.can_run() {
            return Err(BridgeError::InvalidState { op, state: *state });
        }
        *state = ServerState::Running;
        Ok(())
    }

    fn run_loop(&self) -> BridgeResult<()> {
        info!(id = self.id(), "server running");
        // SAFETY: live instance; close cannot run while `self` is borrowed
        let code = unsafe { self.engine.run(self.raw.0) };
        *self.state.lock() = ServerState::Stopped;

        if code != DQLITE_OK {
            let err = BridgeError::native("run", code);
            error!(id = self.id(), error = %err, "server main loop failed");
            return Err(err);
        }
        info!(id = self.id(), "server main loop returned");
        Ok(())
    }

    /// Whether the instance accepts connections. Never blocks.
    pub fn ready(&self) -> bool {
        // SAFETY: live instance
        unsafe { self.engine.ready(self.raw.0) }
    }

    /// Ask the main loop to exit. A no-op unless the server is running.
    pub fn stop(&self) -> BridgeResult<()> {
        if self.state() != ServerState::Running {
            return Ok(());
        }

        // SAFETY: live instance
        let code = unsafe { self.engine.stop(self.raw.0) };
        if code != DQLITE_OK {
            return Err(BridgeError::native("stop", code));
        }
        debug!(id = self.id(), "stop requested");
        Ok(())
    }

    /// Hand an accepted inbound connection to the engine.
    ///
    /// The connection is closed in every case. Its duplicate either moves to
    /// the engine or is closed here.
    ///
    /// # Errors
    /// - `Handoff`: no descriptor could be obtained from `conn`
    /// - `ServerStopped`: the engine is shutting down or has stopped
    /// - `Native`: any other engine failure
    pub fn handle<C: HandoffConn>(&self, conn: C) -> BridgeResult<()> {
        let fd = handoff(conn)?;
        let raw = fd.as_raw_fd();

        // SAFETY: live instance and an open descriptor
        let code = unsafe { self.engine.handle(self.raw.0, raw) };
        match code {
            DQLITE_OK => {
                // The engine owns the descriptor now
                let _ = fd.into_raw_fd();
                debug!(id = self.id(), fd = raw, "connection handed to engine");
                Ok(())
            }
            DQLITE_STOPPED => {
                drop(fd);
                debug!(id = self.id(), "connection refused, server stopped");
                Err(BridgeError::ServerStopped)
            }
            code => {
                drop(fd);
                let err = BridgeError::native("handle", code);
                warn!(id = self.id(), error = %err, "engine refused connection");
                Err(err)
            }
        }
    }

    /// Spawn the main loop on a dedicated thread.
    ///
    /// On failure the handle is dropped, which destroys the instance.
    pub fn start(self) -> BridgeResult<RunningServer> {
        self.enter_running("start")?;

        let server = Arc::new(self);
        let worker = Arc::clone(&server);
        let name = format!("dqbridge-run-{}", server.id());

        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run_loop())
            .map_err(|err| BridgeError::Worker(format!("failed to spawn run thread: {err}")))?;

        Ok(RunningServer {
            server,
            worker: Some(join),
        })
    }

    /// Release the native instance and this handle's callbacks.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // SAFETY: the main loop is not running: `run` borrows `self` and the
        // run thread holds an `Arc` that has been joined and dropped.
        unsafe { self.engine.destroy(self.raw.0) };

        let callbacks = std::mem::take(self.callbacks.get_mut());
        let registry = registry::global();
        for handle in [callbacks.dial, callbacks.log].into_iter().flatten() {
            registry.unregister(handle);
        }

        *self.state.get_mut() = ServerState::Closed;
        info!(id = self.id(), "server closed");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("id", &self.config.id)
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// RUNNING SERVER
// ============================================================================

/// A server whose main loop runs on its own thread.
///
/// Dereferences to [`ServerHandle`] for the operations that are safe while
/// running. Dropping it stops the loop and joins the thread.
pub struct RunningServer {
    server: Arc<ServerHandle>,
    worker: Option<JoinHandle<BridgeResult<()>>>,
}

impl RunningServer {
    /// Stop the main loop, wait for the run thread, and return the handle.
    ///
    /// # Errors
    /// A failing native stop or a failed main loop. The handle is dropped,
    /// destroying the instance once the run thread lets go of it.
    pub fn stop(mut self) -> BridgeResult<ServerHandle> {
        self.shutdown()?;

        let server = Arc::clone(&self.server);
        drop(self);
        Arc::try_unwrap(server)
            .map_err(|_| BridgeError::Worker("server still shared after run thread exit".into()))
    }

    /// Whether the run thread has returned
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn shutdown(&mut self) -> BridgeResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        // A loop that already returned needs no stop; its outcome is what the
        // caller gets. Otherwise, without a successful stop the loop may never
        // return, so the thread is left detached holding its own reference.
        if !worker.is_finished() {
            if let Err(err) = self.server.stop() {
                if !worker.is_finished() {
                    return Err(err);
                }
                debug!(id = self.server.id(), error = %err, "stop failed after the loop returned");
            }
        }

        match worker.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Worker("run thread panicked".into())),
        }
    }
}

impl Deref for RunningServer {
    type Target = ServerHandle;

    fn deref(&self) -> &ServerHandle {
        &self.server
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "server shutdown on drop failed");
        }
    }
}

impl fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningServer")
            .field("server", &self.server)
            .field("finished", &self.is_finished())
            .finish()
    }
}
