//! Local port inspection.
//!
//! Before a forward binds its local port the supervisor asks a `PortInspector`
//! whether something else already holds it. The system implementation checks
//! the port by binding it and identifies the owner through `lsof` and `ps`.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::service::ConflictInfo;

/// Longest process description shown in `ports` output.
const MAX_DESCRIPTION: usize = 60;

/// Answers "who holds this local port?".
pub trait PortInspector: Send + Sync {
    fn inspect(&self, port: u16) -> ConflictInfo;
}

/// Inspector backed by test binds, `lsof` and `ps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

impl PortInspector for SystemInspector {
    fn inspect(&self, port: u16) -> ConflictInfo {
        if is_port_available(port) {
            return ConflictInfo::free();
        }
        let pid = owner_pid(port);
        let command = pid.and_then(process_command);
        let is_forward = command.as_deref().map(is_port_forward).unwrap_or(false);
        ConflictInfo {
            has_conflict: true,
            pid,
            command,
            is_forward,
            is_managed: false,
        }
    }
}

/// True when the port can be bound on both loopback families.
///
/// Only `AddrInUse` counts as occupied. Hosts without IPv6 fail the `[::1]`
/// bind with other errors, which must not read as a conflict.
pub fn is_port_available(port: u16) -> bool {
    let addrs = [
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    ];
    for addr in addrs {
        match TcpListener::bind(addr) {
            Ok(listener) => drop(listener),
            Err(err) if err.kind() == ErrorKind::AddrInUse => return false,
            Err(err) => debug!(%addr, "test bind skipped: {}", err),
        }
    }
    true
}

fn is_port_forward(command: &str) -> bool {
    command.contains("kubectl") && command.contains("port-forward")
}

fn owner_pid(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .arg("-i")
        .arg(format!(":{}", port))
        .arg("-t")
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

fn process_command(pid: u32) -> Option<String> {
    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output()
        .ok()?;
    let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if command.is_empty() {
        None
    } else {
        Some(command)
    }
}

/// Listener information for the `ports` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortUsage {
    pub port: u16,
    pub in_use: bool,
    pub pid: Option<u32>,
    /// `name (PID n)` or the owner's command line, truncated.
    pub description: String,
}

impl PortUsage {
    fn free(port: u16) -> Self {
        Self {
            port,
            in_use: false,
            pid: None,
            description: String::new(),
        }
    }
}

/// Looks up the TCP listener on `port`.
///
/// `lsof` exiting with status 1 means nothing listens. A missing `lsof`
/// reports the port as free as well.
pub fn port_usage(port: u16) -> PortUsage {
    let output = match Command::new("lsof")
        .args(["-i", &format!(":{}", port), "-P", "-n", "-sTCP:LISTEN"])
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            debug!(port, "lsof unavailable: {}", err);
            return PortUsage::free(port);
        }
    };
    if !output.status.success() {
        return PortUsage::free(port);
    }
    parse_lsof_listen(port, &String::from_utf8_lossy(&output.stdout))
}

fn lsof_row() -> Option<&'static Regex> {
    static ROW: OnceLock<Option<Regex>> = OnceLock::new();
    ROW.get_or_init(|| Regex::new(r"^(\S+)\s+(\d+)\s").ok()).as_ref()
}

/// Parses `lsof -sTCP:LISTEN` output; the first data row names the owner.
pub fn parse_lsof_listen(port: u16, text: &str) -> PortUsage {
    let row = text
        .lines()
        .skip_while(|line| line.starts_with("COMMAND"))
        .find_map(|line| lsof_row()?.captures(line));
    let Some(row) = row else {
        return PortUsage::free(port);
    };
    let name = row[1].to_string();
    let pid: Option<u32> = row[2].parse().ok();
    let description = match pid.and_then(process_command) {
        Some(command) => truncate(&command, MAX_DESCRIPTION),
        None => match pid {
            Some(pid) => format!("{} (PID {})", name, pid),
            None => name,
        },
    };
    PortUsage {
        port,
        in_use: true,
        pid,
        description,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("invalid PID {0}")]
    InvalidPid(i64),
    #[error("failed to signal PID {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Sends SIGTERM to `pid`.
#[cfg(unix)]
pub fn kill_process(pid: i64) -> Result<(), PortError> {
    if pid <= 0 || pid > i64::from(i32::MAX) {
        return Err(PortError::InvalidPid(pid));
    }
    let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if rc != 0 {
        return Err(PortError::Signal {
            pid: pid as u32,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_process(pid: i64) -> Result<(), PortError> {
    Err(PortError::InvalidPid(pid))
}
