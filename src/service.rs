//! Data structures describing forwarded services and their observable state.
//!
//! This module defines the immutable specification of a forward (`ServiceSpec`),
//! the optional SQL tap layered on top of it (`TapSpec`), and the status views
//! (`ForwardStatus`, `RetryInfo`, `ConflictInfo`) that supervisors expose to
//! whatever layer polls them.

use std::fmt;

/// Sentinel for "retry forever".
pub const UNLIMITED_RETRIES: i32 = -1;

/// What a forward tunnels to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A named service inside the cluster.
    Direct {
        /// Kubernetes service name.
        service_name: String,
        /// Port exposed by the service.
        remote_port: u16,
    },
    /// An arbitrary host reachable only from inside the cluster, relayed via the shared pod.
    Proxy {
        /// Host the relay connects to.
        target_host: String,
        /// Port the relay connects to.
        target_port: u16,
    },
}

/// Database protocol spoken through a SQL tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapDriver {
    Postgres,
    Mysql,
}

impl TapDriver {
    /// Parses the driver name used in configuration files.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "postgres" => Some(TapDriver::Postgres),
            "mysql" => Some(TapDriver::Mysql),
            _ => None,
        }
    }

    /// Flag value passed to `sql-tapd --driver=`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TapDriver::Postgres => "postgres",
            TapDriver::Mysql => "mysql",
        }
    }

    /// Connection string pointing at the forwarded upstream port.
    pub fn dsn(&self, upstream_port: u16) -> String {
        match self {
            TapDriver::Postgres => format!("postgresql://127.0.0.1:{}", upstream_port),
            TapDriver::Mysql => format!("mysql://127.0.0.1:{}", upstream_port),
        }
    }
}

impl fmt::Display for TapDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of the SQL tap daemon attached to a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapSpec {
    /// Protocol driver.
    pub driver: TapDriver,
    /// User-facing port the tap listens on.
    pub listen_port: u16,
    /// gRPC inspection port.
    pub grpc_port: u16,
    /// Explicit connection string, overriding the one derived from the driver.
    pub database_url: Option<String>,
}

/// Specification for one forwarded connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Logical name, unique per kind.
    pub name: String,
    /// Remote endpoint.
    pub target: Target,
    /// Local port the forward binds.
    pub local_port: u16,
    /// Effective cluster context.
    pub context: String,
    /// Effective namespace.
    pub namespace: String,
    /// Effective retry ceiling (`-1` unlimited, `0` disabled).
    pub max_retries: i32,
    /// Started by `--default` / `--default-proxy`.
    pub selected_by_default: bool,
    /// Optional SQL tap.
    pub tap: Option<TapSpec>,
}

impl ServiceSpec {
    pub fn is_proxy(&self) -> bool {
        matches!(self.target, Target::Proxy { .. })
    }

    /// Human label for the kind of forward.
    pub fn kind(&self) -> &'static str {
        if self.is_proxy() {
            "Proxy"
        } else {
            "Direct"
        }
    }
}

/// Per-spec value wins over the global default when it is set and non-empty.
pub fn resolve_str(value: Option<&str>, global: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => global.to_string(),
    }
}

/// Per-spec retry ceiling wins over the global one when present.
pub fn resolve_retries(value: Option<i32>, global: i32) -> i32 {
    value.unwrap_or(global)
}

/// Lifecycle status of a forward or tap as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ForwardStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ForwardStatus::Running | ForwardStatus::Starting)
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ForwardStatus::Stopped => "stopped",
            ForwardStatus::Starting => "starting",
            ForwardStatus::Running => "running",
            ForwardStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Retry telemetry for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryInfo {
    /// Waiting out a backoff delay.
    pub retrying: bool,
    /// Retries consumed so far.
    pub attempt: u32,
    /// Configured ceiling (`-1` unlimited).
    pub max: i32,
}

/// Occupancy of a local port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictInfo {
    /// Something already holds the port.
    pub has_conflict: bool,
    /// Owning process, when it could be identified.
    pub pid: Option<u32>,
    /// Command line of the owner.
    pub command: Option<String>,
    /// The owner looks like a `kubectl port-forward`.
    pub is_forward: bool,
    /// The owner is a subprocess supervised by this registry.
    pub is_managed: bool,
}

impl ConflictInfo {
    pub fn free() -> Self {
        Self::default()
    }

    /// Operator-facing description of the conflict.
    pub fn message(&self) -> String {
        match (self.pid, self.is_forward) {
            (Some(pid), true) => format!(
                "Port already in use by kubectl port-forward (PID: {}). Kill it to continue.",
                pid
            ),
            (Some(pid), false) => {
                format!("Port already in use by PID {}. Kill it to continue.", pid)
            }
            (None, _) => "Port already in use by another process".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_globals() {
        assert_eq!(resolve_str(Some("staging"), "prod"), "staging");
        assert_eq!(resolve_str(Some(""), "prod"), "prod");
        assert_eq!(resolve_str(None, "prod"), "prod");
        assert_eq!(resolve_retries(Some(0), -1), 0);
        assert_eq!(resolve_retries(None, 4), 4);
    }

    #[test]
    fn dsn_points_at_loopback_upstream() {
        assert_eq!(TapDriver::Postgres.dsn(5433), "postgresql://127.0.0.1:5433");
        assert_eq!(TapDriver::Mysql.dsn(3307), "mysql://127.0.0.1:3307");
        assert_eq!(TapDriver::parse("mysql"), Some(TapDriver::Mysql));
        assert_eq!(TapDriver::parse("sqlite"), None);
    }

    #[test]
    fn conflict_message_names_the_owner() {
        let info = ConflictInfo {
            has_conflict: true,
            pid: Some(42),
            command: Some("kubectl port-forward svc/db 5432:5432".into()),
            is_forward: true,
            is_managed: false,
        };
        assert!(info.message().contains("kubectl port-forward (PID: 42)"));
        let unknown = ConflictInfo {
            has_conflict: true,
            ..ConflictInfo::default()
        };
        assert_eq!(unknown.message(), "Port already in use by another process");
    }
}
