//! Process-wide state: the library init gate and the dial runtime.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use dqbridge_core::abi::DQLITE_OK;
use dqbridge_core::{BridgeError, BridgeResult, NativeEngine, NativeStatus};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{error, info};

// ============================================================================
// INIT GATE
// ============================================================================

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Initialize the native library's global state.
///
/// Must succeed before any server is created. Calls after the first success
/// return `Ok(())` without reaching the engine; a failed call may be retried.
///
/// # Errors
/// `BridgeError::Init` carrying the engine status
pub fn init(engine: &dyn NativeEngine) -> BridgeResult<()> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let _guard = INIT_LOCK.lock();
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let code = engine.initialize();
    if code != DQLITE_OK {
        let status = NativeStatus::from_code(code);
        error!(code, %status, "native library initialization failed");
        return Err(BridgeError::Init { code, status });
    }

    INITIALIZED.store(true, Ordering::Release);
    info!("native library initialized");
    Ok(())
}

/// Whether [`init`] has succeeded in this process
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

// ============================================================================
// DIAL RUNTIME
// ============================================================================

/// Runtime that drives dial futures. Engine threads block on a channel while
/// the attempt runs here, so the deadline holds even when the caller is
/// itself inside another runtime.
static DIAL_RUNTIME: LazyLock<io::Result<Runtime>> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("dqbridge-dial")
        .enable_all()
        .build()
});

pub(crate) fn dial_runtime() -> Result<&'static Runtime, &'static io::Error> {
    DIAL_RUNTIME.as_ref()
}
