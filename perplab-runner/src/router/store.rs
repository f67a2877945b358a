//! Single-writer state persistence.
//!
//! Opening a store creates `<state>.lock` with `create_new`, so a second
//! writer fails with [`RouterError::Locked`] instead of racing. The lock file
//! is removed when the store is dropped. Saves write `<state>.tmp` and rename
//! it over the state file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::state::RouterState;
use super::RouterError;

/// What `StateStore::load` found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum StateLoad {
    /// No state file yet.
    Fresh,
    Loaded(RouterState),
    /// The file existed but could not be parsed; it was moved aside.
    Recovered { error: String, backup: PathBuf },
}

/// Load outcome without the state, kept by the router for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Fresh,
    Loaded,
    Recovered,
}

impl StateLoad {
    pub fn status(&self) -> LoadStatus {
        match self {
            StateLoad::Fresh => LoadStatus::Fresh,
            StateLoad::Loaded(_) => LoadStatus::Loaded,
            StateLoad::Recovered { .. } => LoadStatus::Recovered,
        }
    }
}

#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RouterError + '_ {
    move |source| RouterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    _lock: LockGuard,
}

impl StateStore {
    /// Acquire exclusive ownership of the state file at `path`.
    pub fn open(path: &Path) -> Result<Self, RouterError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let lock_path = sibling(path, ".lock");
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RouterError::Locked { path: lock_path });
            }
            Err(e) => return Err(io_err(&lock_path)(e)),
        };
        let guard = LockGuard { path: lock_path };
        writeln!(file, "{}", std::process::id()).map_err(io_err(&guard.path))?;
        debug!(path = %guard.path.display(), "state lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StateLoad, RouterError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateLoad::Fresh),
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        match serde_json::from_str::<RouterState>(&text) {
            Ok(state) => Ok(StateLoad::Loaded(state)),
            Err(e) => {
                let backup = sibling(&self.path, ".corrupt");
                fs::rename(&self.path, &backup).map_err(io_err(&self.path))?;
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "state file unreadable, starting over"
                );
                Ok(StateLoad::Recovered {
                    error: e.to_string(),
                    backup,
                })
            }
        }
    }

    pub fn save(&self, state: &RouterState) -> Result<(), RouterError> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, json).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        Ok(())
    }
}
