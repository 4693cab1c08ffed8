//! The init gate is process-wide, so this binary holds a single test that
//! walks it from closed to open.

use std::sync::Arc;

use anyhow::Result;
use dqbridge::abi::DQLITE_NOMEM;
use dqbridge::{BridgeError, NativeEngine, NativeStatus, ServerConfig, ServerHandle};
use dqbridge_twin::SimEngine;
use tempfile::TempDir;

#[test]
fn test_init_gate() -> Result<()> {
    let dir = TempDir::new()?;
    let engine: Arc<dyn NativeEngine> = Arc::new(SimEngine::new());
    let config = ServerConfig::new(1, "a", dir.path());

    assert!(!dqbridge::is_initialized());
    assert!(matches!(
        ServerHandle::new(Arc::clone(&engine), config.clone()),
        Err(BridgeError::Uninitialized)
    ));

    let failing = SimEngine::builder().fail_initialize(DQLITE_NOMEM).build();
    match dqbridge::init(&failing) {
        Err(BridgeError::Init { code, status }) => {
            assert_eq!(code, DQLITE_NOMEM);
            assert_eq!(status, NativeStatus::NoMem);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!dqbridge::is_initialized());

    dqbridge::init(engine.as_ref())?;
    assert!(dqbridge::is_initialized());

    // Later calls never reach the engine again
    dqbridge::init(&failing)?;

    let server = ServerHandle::new(engine, config)?;
    server.close();
    Ok(())
}
