//! One simulated engine instance.

use std::ffi::{c_int, c_void, CString};
use std::fs;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dqbridge_core::abi::{
    ConnectFn, LogFn, RawServerInfo, DQLITE_CANTBOOTSTRAP, DQLITE_ERROR, DQLITE_MISUSE,
    DQLITE_NOTFOUND, DQLITE_OK, DQLITE_STOPPED, LOG_BUFFER_LEN,
};
use dqbridge_core::ServerInfo;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// File in the data directory holding the bootstrapped membership
pub const CONFIGURATION_FILE: &str = "twin-configuration.json";

/// A member as the engine stores it: the address owned in C form.
#[derive(Debug, Clone)]
pub(crate) struct SimMember {
    pub(crate) id: u64,
    pub(crate) address: CString,
}

#[derive(Serialize, Deserialize)]
struct PersistedConfiguration {
    members: Vec<ServerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    StopRequested,
    Stopped,
}

#[derive(Clone, Copy)]
struct Hook<F> {
    func: F,
    data: usize,
}

pub(crate) struct SimNode {
    pub(crate) id: u64,
    pub(crate) address: String,
    data_dir: PathBuf,
    members: OnceLock<Vec<SimMember>>,
    phase: Mutex<Phase>,
    phase_changed: Condvar,
    exit_code: Mutex<c_int>,
    connect: Mutex<Option<Hook<ConnectFn>>>,
    logger: Mutex<Option<Hook<LogFn>>>,
    adopted: Mutex<Vec<OwnedFd>>,
}

impl SimNode {
    /// Open (or create) the data directory and load any persisted membership.
    pub(crate) fn open(id: u64, address: String, data_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&data_dir)?;

        let members = OnceLock::new();
        if let Some(persisted) = load_configuration(&data_dir)? {
            let _ = members.set(persisted);
        }

        Ok(Self {
            id,
            address,
            data_dir,
            members,
            phase: Mutex::new(Phase::Idle),
            phase_changed: Condvar::new(),
            exit_code: Mutex::new(DQLITE_OK),
            connect: Mutex::new(None),
            logger: Mutex::new(None),
            adopted: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub(crate) fn members(&self) -> Option<&[SimMember]> {
        self.members.get().map(Vec::as_slice)
    }

    pub(crate) fn bootstrap(&self, servers: &[RawServerInfo]) -> c_int {
        if self.members.get().is_some() {
            return DQLITE_CANTBOOTSTRAP;
        }

        let mut members = Vec::with_capacity(servers.len());
        for server in servers {
            // SAFETY: the caller passes NUL-terminated addresses
            let info = unsafe { ServerInfo::from_raw(server) };
            let Ok(address) = CString::new(info.address) else {
                return DQLITE_MISUSE;
            };
            members.push(SimMember {
                id: info.id,
                address,
            });
        }

        if let Err(err) = store_configuration(&self.data_dir, &members) {
            warn!(id = self.id, error = %err, "failed to persist configuration");
            return DQLITE_ERROR;
        }
        if self.members.set(members).is_err() {
            return DQLITE_CANTBOOTSTRAP;
        }
        debug!(id = self.id, "twin bootstrapped");
        DQLITE_OK
    }

    pub(crate) fn set_connect(&self, func: ConnectFn, data: *mut c_void) -> c_int {
        if self.phase() != Phase::Idle {
            return DQLITE_MISUSE;
        }
        *self.connect.lock() = Some(Hook {
            func,
            data: data as usize,
        });
        DQLITE_OK
    }

    pub(crate) fn set_logger(&self, func: LogFn, data: *mut c_void) -> c_int {
        if self.phase() != Phase::Idle {
            return DQLITE_MISUSE;
        }
        *self.logger.lock() = Some(Hook {
            func,
            data: data as usize,
        });
        DQLITE_OK
    }

    /// Block until a stop request arrives.
    pub(crate) fn run(&self) -> c_int {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Idle => *phase = Phase::Running,
                Phase::StopRequested => {
                    *phase = Phase::Stopped;
                    return DQLITE_OK;
                }
                Phase::Running | Phase::Stopped => return DQLITE_MISUSE,
            }
            self.phase_changed.notify_all();
        }

        self.emit(1, &format!("node {} running at {}", self.id, self.address));

        let mut phase = self.phase.lock();
        while *phase == Phase::Running {
            self.phase_changed.wait(&mut phase);
        }
        *phase = Phase::Stopped;
        drop(phase);

        // Adopted connections close with the loop
        self.adopted.lock().clear();
        self.emit(1, &format!("node {} stopped", self.id));
        *self.exit_code.lock()
    }

    /// End a running loop from inside, as a fatal internal error would.
    /// `run` returns `code`. False unless the loop was running.
    pub(crate) fn halt(&self, code: c_int) -> bool {
        let mut phase = self.phase.lock();
        if *phase != Phase::Running {
            return false;
        }
        *self.exit_code.lock() = code;
        *phase = Phase::StopRequested;
        self.phase_changed.notify_all();
        true
    }

    pub(crate) fn stop(&self) -> c_int {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Idle | Phase::Running => {
                *phase = Phase::StopRequested;
                self.phase_changed.notify_all();
            }
            Phase::StopRequested | Phase::Stopped => {}
        }
        DQLITE_OK
    }

    /// Adopt `fd` if running. Ownership moves only on `DQLITE_OK`.
    pub(crate) fn handle(&self, fd: RawFd) -> c_int {
        let phase = self.phase.lock();
        match *phase {
            Phase::Running => {
                // SAFETY: the caller hands over an open descriptor on success
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                self.adopted.lock().push(owned);
                DQLITE_OK
            }
            Phase::StopRequested | Phase::Stopped => DQLITE_STOPPED,
            Phase::Idle => DQLITE_MISUSE,
        }
    }

    pub(crate) fn adopted_count(&self) -> usize {
        self.adopted.lock().len()
    }

    /// Lowest member id, once running with a configuration
    pub(crate) fn leader(&self) -> Option<&SimMember> {
        if self.phase() != Phase::Running {
            return None;
        }
        self.members()?.iter().min_by_key(|m| m.id)
    }

    pub(crate) fn dump(&self, filename: &str) -> Result<Vec<u8>, c_int> {
        if filename.is_empty() || filename.contains('/') {
            return Err(DQLITE_MISUSE);
        }
        match fs::read(self.data_dir.join(filename)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(DQLITE_NOTFOUND),
            Err(err) => {
                warn!(id = self.id, filename, error = %err, "dump read failed");
                Err(DQLITE_ERROR)
            }
        }
    }

    /// Ask the installed connect hook for a connection to `peer`.
    pub(crate) fn connect(&self, peer: &ServerInfo) -> Result<OwnedFd, c_int> {
        let Some(hook) = *self.connect.lock() else {
            return Err(DQLITE_MISUSE);
        };
        let address = CString::new(peer.address.as_str()).map_err(|_| DQLITE_MISUSE)?;
        let raw = RawServerInfo {
            id: peer.id,
            address: address.as_ptr(),
        };

        let mut fd: c_int = -1;
        // SAFETY: the hook was installed through the engine contract
        let rc = unsafe { (hook.func)(hook.data as *mut c_void, &raw, &mut fd) };
        if rc != DQLITE_OK {
            return Err(rc);
        }
        if fd < 0 {
            return Err(DQLITE_ERROR);
        }
        // SAFETY: on success the hook transferred `fd` to us
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Format and emit a line through the installed logger, bounded like the
    /// engine's emit buffer. Returns false without a logger.
    pub(crate) fn emit(&self, level: c_int, message: &str) -> bool {
        let Some(hook) = *self.logger.lock() else {
            return false;
        };

        let mut bytes: Vec<u8> = message.bytes().filter(|b| *b != 0).collect();
        bytes.truncate(LOG_BUFFER_LEN - 1);
        let Ok(line) = CString::new(bytes) else {
            return false;
        };

        // SAFETY: the hook was installed through the engine contract
        unsafe { (hook.func)(hook.data as *mut c_void, level, line.as_ptr()) };
        true
    }
}

fn load_configuration(data_dir: &Path) -> io::Result<Option<Vec<SimMember>>> {
    let bytes = match fs::read(data_dir.join(CONFIGURATION_FILE)) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let persisted: PersistedConfiguration = serde_json::from_slice(&bytes)?;
    persisted
        .members
        .into_iter()
        .map(|m| {
            let address = CString::new(m.address)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            Ok(SimMember { id: m.id, address })
        })
        .collect::<io::Result<Vec<_>>>()
        .map(Some)
}

fn store_configuration(data_dir: &Path, members: &[SimMember]) -> io::Result<()> {
    let persisted = PersistedConfiguration {
        members: members
            .iter()
            .map(|m| ServerInfo::new(m.id, m.address.to_string_lossy()))
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&persisted)?;
    fs::write(data_dir.join(CONFIGURATION_FILE), bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn raw_members(members: &[(u64, &CString)]) -> Vec<RawServerInfo> {
        members
            .iter()
            .map(|(id, address)| RawServerInfo {
                id: *id,
                address: address.as_ptr(),
            })
            .collect()
    }

    #[test]
    fn test_bootstrap_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let a = CString::new("a").unwrap();
        let b = CString::new("b").unwrap();

        let node = SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap();
        assert_eq!(node.bootstrap(&raw_members(&[(1, &a), (2, &b)])), DQLITE_OK);
        assert_eq!(node.bootstrap(&raw_members(&[(3, &a)])), DQLITE_CANTBOOTSTRAP);
        assert_eq!(node.members().map(<[SimMember]>::len), Some(2));

        let reopened = SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.bootstrap(&raw_members(&[(1, &a)])), DQLITE_CANTBOOTSTRAP);
        assert_eq!(reopened.members().map(<[SimMember]>::len), Some(2));
    }

    #[test]
    fn test_stop_before_run_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let node = SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap();
        assert_eq!(node.stop(), DQLITE_OK);
        assert_eq!(node.run(), DQLITE_OK);
        assert_eq!(node.phase(), Phase::Stopped);
    }

    #[test]
    fn test_run_blocks_until_stop() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap());

        let runner = Arc::clone(&node);
        let worker = thread::spawn(move || runner.run());

        while node.phase() != Phase::Running {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!worker.is_finished());

        assert_eq!(node.stop(), DQLITE_OK);
        assert_eq!(worker.join().unwrap(), DQLITE_OK);
        assert_eq!(node.phase(), Phase::Stopped);
    }

    #[test]
    fn test_halt_ends_loop_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap());
        assert!(!node.halt(DQLITE_ERROR));

        let runner = Arc::clone(&node);
        let worker = thread::spawn(move || runner.run());
        while node.phase() != Phase::Running {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(node.halt(DQLITE_ERROR));
        assert_eq!(worker.join().unwrap(), DQLITE_ERROR);
        assert_eq!(node.phase(), Phase::Stopped);
    }

    #[test]
    fn test_dump_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let node = SimNode::open(1, "a".into(), dir.path().to_path_buf()).unwrap();
        assert_eq!(node.dump("absent.db"), Err(DQLITE_NOTFOUND));
        assert_eq!(node.dump("../escape"), Err(DQLITE_MISUSE));

        fs::write(dir.path().join("app.db"), b"pages").unwrap();
        assert_eq!(node.dump("app.db"), Ok(b"pages".to_vec()));
    }
}
