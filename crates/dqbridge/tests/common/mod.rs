#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use dqbridge::{NativeEngine, ServerConfig, ServerHandle};
use dqbridge_twin::SimEngine;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh twin engine, with the process-wide library gate opened.
pub fn engine() -> Result<Arc<SimEngine>> {
    engine_with(SimEngine::new())
}

pub fn engine_with(engine: SimEngine) -> Result<Arc<SimEngine>> {
    init_tracing();
    dqbridge::init(&SimEngine::new())?;
    Ok(Arc::new(engine))
}

pub fn config(id: u64, address: &str, dir: &Path) -> ServerConfig {
    ServerConfig::new(id, address, dir)
}

pub fn new_server(engine: &Arc<SimEngine>, config: ServerConfig) -> Result<ServerHandle> {
    let native: Arc<dyn NativeEngine> = engine.clone();
    Ok(ServerHandle::new(native, config)?)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Open descriptors in this process
pub fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}
