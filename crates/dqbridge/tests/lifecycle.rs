mod common;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use dqbridge::abi::{DQLITE_ERROR, DQLITE_INTERNAL, DQLITE_MISUSE, DQLITE_NOMEM, DQLITE_OK};
use dqbridge::registry;
use dqbridge::{log_func, tcp_dial_func, BridgeError, NativeStatus, ServerInfo, ServerState};
use dqbridge_twin::SimEngine;
use tempfile::TempDir;

use common::{config, engine, engine_with, new_server, wait_for};

fn members() -> Vec<ServerInfo> {
    vec![ServerInfo::new(1, "a"), ServerInfo::new(2, "b")]
}

#[test]
fn test_create_rejects_invalid_config() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;

    let err = new_server(&engine, config(0, "a", dir.path())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::InvalidConfig(_))
    ));
    assert_eq!(engine.instance_count(), 0);
    Ok(())
}

#[test]
fn test_create_failure_carries_status() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_create(DQLITE_NOMEM).build())?;
    let dir = TempDir::new()?;

    let err = new_server(&engine, config(1, "a", dir.path())).unwrap_err();
    match err.downcast_ref::<BridgeError>() {
        Some(BridgeError::Create { code, status }) => {
            assert_eq!(*code, DQLITE_NOMEM);
            assert_eq!(*status, NativeStatus::NoMem);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_bootstrap_twice_keeps_membership() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;

    server.bootstrap(&members())?;
    assert_eq!(server.state(), ServerState::Bootstrapped);

    let err = server.bootstrap(&[ServerInfo::new(9, "z")]).unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyBootstrapped));
    assert!(err.is_recoverable());
    assert_eq!(server.state(), ServerState::Bootstrapped);

    let mut cluster = server.cluster()?;
    cluster.sort();
    assert_eq!(cluster, members());
    Ok(())
}

#[test]
fn test_bootstrap_on_configured_directory() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;

    new_server(&engine, config(1, "a", dir.path()))?.bootstrap(&members())?;

    // A new instance over the same directory finds the persisted configuration
    let server = new_server(&engine, config(1, "a", dir.path()))?;
    let err = server.bootstrap(&members()).unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyBootstrapped));
    assert_eq!(server.state(), ServerState::Created);

    // and can still run with it
    let running = server.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));
    running.stop()?.close();
    Ok(())
}

#[test]
fn test_bootstrap_rejects_empty_membership() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;

    assert!(matches!(
        server.bootstrap(&[]),
        Err(BridgeError::InvalidArgument(_))
    ));
    assert_eq!(server.state(), ServerState::Created);
    Ok(())
}

#[test]
fn test_start_ready_stop_close() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;
    server.bootstrap(&members())?;
    assert!(!server.ready());

    let running = server.start()?;
    assert_eq!(running.state(), ServerState::Running);
    assert!(wait_for(Duration::from_secs(2), || running.ready()));

    let server = running.stop()?;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(!server.ready());
    assert_eq!(engine.instance_count(), 1);

    server.close();
    assert_eq!(engine.instance_count(), 0);
    Ok(())
}

#[test]
fn test_run_on_caller_thread() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;
    server.bootstrap(&members())?;

    thread::scope(|scope| -> Result<()> {
        let runner = scope.spawn(|| server.run());

        assert!(wait_for(Duration::from_secs(2), || server.ready()));
        // Queries are served while the loop runs
        assert_eq!(server.cluster()?.len(), 2);

        server.stop()?;
        runner.join().expect("run thread panicked")?;
        Ok(())
    })?;

    assert_eq!(server.state(), ServerState::Stopped);
    Ok(())
}

#[test]
fn test_stop_when_not_running_is_noop() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;

    server.stop()?;
    server.stop()?;
    assert_eq!(server.state(), ServerState::Created);

    let running = server.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));
    let stopped = running.stop()?;
    stopped.stop()?;
    assert_eq!(stopped.state(), ServerState::Stopped);
    Ok(())
}

#[test]
fn test_stop_immediately_after_start() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;

    // The stop may land before the run thread reaches the engine
    let server = server.start()?.stop()?;
    assert_eq!(server.state(), ServerState::Stopped);
    Ok(())
}

#[test]
fn test_stopped_server_cannot_restart_or_bootstrap() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;
    let server = server.start()?.stop()?;

    assert!(matches!(
        server.bootstrap(&members()),
        Err(BridgeError::InvalidState {
            state: ServerState::Stopped,
            ..
        })
    ));
    assert!(matches!(
        server.run(),
        Err(BridgeError::InvalidState { .. })
    ));

    let err = server.start().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState { .. }));
    // A failed start drops the handle
    assert_eq!(engine.instance_count(), 0);
    Ok(())
}

#[test]
fn test_callbacks_rejected_while_running() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let running = new_server(&engine, config(1, "a", dir.path()))?.start()?;

    assert!(matches!(
        running.set_dial_func(tcp_dial_func()),
        Err(BridgeError::InvalidState {
            state: ServerState::Running,
            ..
        })
    ));
    assert!(matches!(
        running.set_log_func(log_func(|_, _| {})),
        Err(BridgeError::InvalidState { .. })
    ));
    assert!(running.dial_handle().is_none());
    Ok(())
}

#[test]
fn test_create_without_instance_is_an_error() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_create(DQLITE_OK).build())?;
    let dir = TempDir::new()?;

    let err = new_server(&engine, config(1, "a", dir.path())).unwrap_err();
    match err.downcast_ref::<BridgeError>() {
        Some(BridgeError::Create { code, status }) => {
            assert_eq!(*code, DQLITE_OK);
            assert_eq!(*status, NativeStatus::Error);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_loop_that_returned_is_joined_without_stop() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_stop(DQLITE_ERROR).build())?;
    let dir = TempDir::new()?;
    let running = new_server(&engine, config(1, "node1", dir.path()))?.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));

    assert!(engine.halt("node1", DQLITE_OK));
    assert!(wait_for(Duration::from_secs(2), || running.is_finished()));

    // The failing native stop is never reached
    let server = running.stop()?;
    assert_eq!(server.state(), ServerState::Stopped);
    server.close();
    assert_eq!(engine.instance_count(), 0);
    Ok(())
}

#[test]
fn test_loop_failure_reaches_caller_of_stop() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_stop(DQLITE_ERROR).build())?;
    let dir = TempDir::new()?;
    let running = new_server(&engine, config(1, "node1", dir.path()))?.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));

    assert!(engine.halt("node1", DQLITE_INTERNAL));
    assert!(wait_for(Duration::from_secs(2), || running.is_finished()));

    match running.stop().unwrap_err() {
        BridgeError::Native { op, code, status } => {
            assert_eq!(op, "run");
            assert_eq!(code, DQLITE_INTERNAL);
            assert_eq!(status, NativeStatus::Internal);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(wait_for(Duration::from_secs(2), || engine.instance_count() == 0));
    Ok(())
}

#[test]
fn test_failed_stop_leaves_loop_running() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_stop(DQLITE_ERROR).build())?;
    let dir = TempDir::new()?;
    let running = new_server(&engine, config(1, "node1", dir.path()))?.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));

    match running.stop().unwrap_err() {
        BridgeError::Native { op, code, .. } => {
            assert_eq!(op, "stop");
            assert_eq!(code, DQLITE_ERROR);
        }
        other => panic!("unexpected error: {other}"),
    }

    // The detached run thread still owns the instance until its loop ends
    assert_eq!(engine.instance_count(), 1);
    assert!(engine.halt("node1", DQLITE_OK));
    assert!(wait_for(Duration::from_secs(2), || engine.instance_count() == 0));
    Ok(())
}

#[test]
fn test_replaced_callbacks_are_released() -> Result<()> {
    let engine = engine()?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;
    let registry = registry::global();

    server.set_dial_func(tcp_dial_func())?;
    let first_dial = server.dial_handle().expect("dial handle");
    server.set_dial_func(tcp_dial_func())?;
    let second_dial = server.dial_handle().expect("dial handle");
    assert_ne!(first_dial, second_dial);
    assert!(!registry.contains(first_dial));
    assert!(registry.contains(second_dial));

    server.set_log_func(log_func(|_, _| {}))?;
    let log = server.log_handle().expect("log handle");
    assert!(registry.contains(log));

    server.close();
    assert!(!registry.contains(second_dial));
    assert!(!registry.contains(log));
    Ok(())
}

#[test]
fn test_failed_callback_install_is_not_kept() -> Result<()> {
    let engine = engine_with(SimEngine::builder().fail_config(DQLITE_MISUSE).build())?;
    let dir = TempDir::new()?;
    let server = new_server(&engine, config(1, "a", dir.path()))?;

    let err = server.set_dial_func(tcp_dial_func()).unwrap_err();
    assert_eq!(err.native_code(), Some(DQLITE_MISUSE));
    assert!(server.dial_handle().is_none());

    assert!(server.set_log_func(log_func(|_, _| {})).is_err());
    assert!(server.log_handle().is_none());
    Ok(())
}

#[test]
fn test_dropping_handles_destroys_instances() -> Result<()> {
    let engine = engine()?;
    let dir_a = TempDir::new()?;
    let dir_b = TempDir::new()?;

    let idle = new_server(&engine, config(1, "a", dir_a.path()))?;
    let running = new_server(&engine, config(2, "b", dir_b.path()))?.start()?;
    assert!(wait_for(Duration::from_secs(2), || running.ready()));
    assert_eq!(engine.instance_count(), 2);

    drop(idle);
    assert_eq!(engine.instance_count(), 1);

    // Dropping a running server stops and joins the loop first
    drop(running);
    assert_eq!(engine.instance_count(), 0);
    Ok(())
}
