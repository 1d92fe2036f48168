//! `~/.kubefwd.pid`, the marker of a running headless instance.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::home_dir;
use crate::ports::{kill_process, PortError};

const PID_FILE: &str = ".kubefwd.pid";

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("kubefwd is already running (PID {0}); use `kubefwd stop` first")]
    AlreadyRunning(u32),
    #[error("no running kubefwd instance found")]
    NotRunning,
    #[error("malformed PID file {}", .0.display())]
    Malformed(PathBuf),
    #[error("failed to access PID file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Signal(#[from] PortError),
}

/// `~/.kubefwd.pid`, when a home directory is known.
pub fn default_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(PID_FILE))
}

/// PID recorded in `path`, or `None` when there is no file.
pub fn read(path: &Path) -> Result<Option<u32>, PidFileError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PidFileError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    data.trim()
        .parse()
        .map(Some)
        .map_err(|_| PidFileError::Malformed(path.to_path_buf()))
}

/// Refuses when another live instance owns `path`; clears stale or malformed files.
pub fn ensure_vacant(path: &Path) -> Result<(), PidFileError> {
    match read(path) {
        Ok(Some(pid)) if is_alive(pid) => Err(PidFileError::AlreadyRunning(pid)),
        Ok(Some(pid)) => {
            warn!(pid, path = %path.display(), "removing stale PID file");
            remove(path)
        }
        Ok(None) => Ok(()),
        Err(PidFileError::Malformed(_)) => {
            warn!(path = %path.display(), "removing malformed PID file");
            remove(path)
        }
        Err(err) => Err(err),
    }
}

pub fn write(path: &Path, pid: u32) -> Result<(), PidFileError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    fs::write(path, format!("{}\n", pid)).map_err(|source| PidFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(pid, path = %path.display(), "wrote PID file");
    Ok(())
}

pub fn remove(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PidFileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Sends SIGTERM to the instance recorded in `path` and returns its PID.
pub fn stop_running(path: &Path) -> Result<u32, PidFileError> {
    let pid = read(path)?.ok_or(PidFileError::NotRunning)?;
    if !is_alive(pid) {
        remove(path)?;
        return Err(PidFileError::NotRunning);
    }
    kill_process(i64::from(pid))?;
    info!(pid, "sent SIGTERM to running instance");
    Ok(pid)
}

#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const DEAD_PID: u32 = 4_194_399;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kubefwd.pid");
        assert_eq!(read(&path).unwrap(), None);
        write(&path, 4242).unwrap();
        assert_eq!(read(&path).unwrap(), Some(4242));
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn live_instance_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubefwd.pid");
        write(&path, std::process::id()).unwrap();
        let err = ensure_vacant(&path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning(pid) if pid == std::process::id()));
        assert!(path.exists());
    }

    #[test]
    fn stale_and_malformed_files_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubefwd.pid");

        write(&path, DEAD_PID).unwrap();
        ensure_vacant(&path).unwrap();
        assert!(!path.exists());

        fs::write(&path, "not a pid").unwrap();
        assert!(matches!(read(&path), Err(PidFileError::Malformed(_))));
        ensure_vacant(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn stop_without_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubefwd.pid");
        assert!(matches!(stop_running(&path), Err(PidFileError::NotRunning)));

        write(&path, DEAD_PID).unwrap();
        assert!(matches!(stop_running(&path), Err(PidFileError::NotRunning)));
        assert!(!path.exists());
    }

    #[test]
    fn stop_signals_recorded_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubefwd.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        write(&path, child.id()).unwrap();
        assert!(is_alive(child.id()));

        assert_eq!(stop_running(&path).unwrap(), child.id());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
