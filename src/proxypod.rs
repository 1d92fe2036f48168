//! The shared proxy pod.
//!
//! Proxy services reach hosts that only the cluster can see. One pod runs a
//! `socat` relay per selected service, each on its own pod port starting at
//! `RELAY_PORT_BASE`, and every proxy forward port-forwards to its relay.
//! Changing the selection always deletes and recreates the pod.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::kubectl::{ClusterClient, ClusterError, DeleteMode, PodIdentity, PodPhase};
use crate::service::{ServiceSpec, Target};

/// First relay port inside the pod.
pub const RELAY_PORT_BASE: u16 = 10000;

/// Consecutive failed `get pod` checks after which deletion skips to the forced delete.
const MAX_FAILED_CHECKS: u32 = 3;

/// Poll intervals and deadlines of pod operations.
#[derive(Debug, Clone, Copy)]
pub struct PodTimings {
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub delete_timeout: Duration,
    pub delete_poll: Duration,
    /// Pause between a failed create (pod still exists) and the retry.
    pub recreate_pause: Duration,
    /// Pause after the final forced delete.
    pub force_settle: Duration,
}

impl Default for PodTimings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            ready_poll: Duration::from_secs(2),
            delete_timeout: Duration::from_secs(30),
            delete_poll: Duration::from_secs(1),
            recreate_pause: Duration::from_secs(3),
            force_settle: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of the shared proxy pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStatus {
    NotCreated,
    Creating,
    Ready,
    Error,
}

impl std::fmt::Display for PodStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PodStatus::NotCreated => "not created",
            PodStatus::Creating => "creating",
            PodStatus::Ready => "ready",
            PodStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Failures creating or deleting the proxy pod.
#[derive(Debug, Error)]
pub enum PodError {
    #[error("{0} is not a proxy service")]
    NotProxy(String),
    #[error("too many proxy services for the relay port range")]
    TooManyServices,
    #[error("Failed to create pod: {0}")]
    Create(#[source] ClusterError),
    #[error("Pod failed to become ready: {reason}")]
    NotReady { reason: String, diagnostics: String },
}

#[derive(Debug)]
struct PodState {
    status: PodStatus,
    error: String,
    active: Vec<String>,
    relay_ports: BTreeMap<String, u16>,
}

impl PodState {
    fn empty(status: PodStatus) -> Self {
        Self {
            status,
            error: String::new(),
            active: Vec::new(),
            relay_ports: BTreeMap::new(),
        }
    }
}

/// Owns the proxy pod and the service → relay port map.
pub struct ProxyPodManager {
    identity: PodIdentity,
    cluster: Arc<dyn ClusterClient>,
    timings: PodTimings,
    /// Serialises create and delete; held across `kubectl` calls.
    ops: tokio::sync::Mutex<()>,
    state: Mutex<PodState>,
}

/// Relay ports in selection order.
pub fn assign_relay_ports(selected: &[ServiceSpec]) -> Result<Vec<(String, u16)>, PodError> {
    selected
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let offset = u16::try_from(i).map_err(|_| PodError::TooManyServices)?;
            let port = RELAY_PORT_BASE
                .checked_add(offset)
                .ok_or(PodError::TooManyServices)?;
            Ok((spec.name.clone(), port))
        })
        .collect()
}

/// `socat` relays in the background, then `wait` to keep the container alive.
pub fn relay_command(selected: &[ServiceSpec], ports: &[(String, u16)]) -> Result<String, PodError> {
    let mut parts = Vec::with_capacity(selected.len() + 1);
    for (spec, (_, port)) in selected.iter().zip(ports) {
        let Target::Proxy {
            target_host,
            target_port,
        } = &spec.target
        else {
            return Err(PodError::NotProxy(spec.name.clone()));
        };
        parts.push(format!(
            "socat TCP-LISTEN:{},fork,reuseaddr TCP:{}:{} &",
            port, target_host, target_port
        ));
    }
    parts.push("wait".to_string());
    Ok(parts.join(" "))
}

impl ProxyPodManager {
    /// A manager for `identity`; no pod exists until the first selection.
    pub fn new(identity: PodIdentity, cluster: Arc<dyn ClusterClient>, timings: PodTimings) -> Self {
        Self {
            identity,
            cluster,
            timings,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(PodState::empty(PodStatus::NotCreated)),
        }
    }

    /// Name, image, context and namespace of the pod.
    pub fn identity(&self) -> &PodIdentity {
        &self.identity
    }

    /// Deletes the current pod and creates one relaying exactly `selected`.
    ///
    /// An empty selection only deletes.
    pub async fn create_pod_with_services(&self, selected: &[ServiceSpec]) -> Result<(), PodError> {
        let _op = self.ops.lock().await;
        *self.state.lock() = PodState::empty(PodStatus::Creating);

        self.delete_unlocked().await;

        if selected.is_empty() {
            *self.state.lock() = PodState::empty(PodStatus::NotCreated);
            info!(pod = %self.identity.name, "no proxy services selected, pod removed");
            return Ok(());
        }

        let result = self.create_unlocked(selected).await;
        let mut state = self.state.lock();
        match &result {
            Ok(ports) => {
                state.status = PodStatus::Ready;
                state.error.clear();
                state.active = selected.iter().map(|s| s.name.clone()).collect();
                state.relay_ports = ports.iter().cloned().collect();
                info!(pod = %self.identity.name, services = state.active.len(), "proxy pod ready");
            }
            Err(err) => {
                state.status = PodStatus::Error;
                state.error = err.to_string();
                state.active.clear();
                state.relay_ports.clear();
                match err {
                    PodError::NotReady { diagnostics, .. } => {
                        error!(pod = %self.identity.name, "{}\n{}", err, diagnostics);
                        state.error = format!("{} | {}", err, diagnostics.replace('\n', " | "));
                    }
                    _ => error!(pod = %self.identity.name, "{}", err),
                }
            }
        }
        result.map(|_| ())
    }

    async fn create_unlocked(&self, selected: &[ServiceSpec]) -> Result<Vec<(String, u16)>, PodError> {
        let ports = assign_relay_ports(selected)?;
        let command = relay_command(selected, &ports)?;
        debug!(pod = %self.identity.name, command = %command, "creating proxy pod");

        match self.cluster.run_pod(&self.identity, &command).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists(_)) => {
                warn!(pod = %self.identity.name, "pod still exists after deletion, retrying once");
                self.delete_unlocked().await;
                tokio::time::sleep(self.timings.recreate_pause).await;
                self.cluster
                    .run_pod(&self.identity, &command)
                    .await
                    .map_err(PodError::Create)?;
            }
            Err(err) => return Err(PodError::Create(err)),
        }

        if let Err(reason) = self.wait_ready().await {
            let diagnostics = self.cluster.diagnostics(&self.identity).await;
            return Err(PodError::NotReady {
                reason,
                diagnostics,
            });
        }
        Ok(ports)
    }

    async fn wait_ready(&self) -> Result<(), String> {
        let deadline = Instant::now() + self.timings.ready_timeout;
        loop {
            match self.cluster.pod_phase(&self.identity).await {
                Ok(PodPhase::Ready) => return Ok(()),
                Ok(phase) => debug!(pod = %self.identity.name, ?phase, "waiting for pod"),
                Err(err) => return Err(err.to_string()),
            }
            if Instant::now() + self.timings.ready_poll > deadline {
                return Err("timeout waiting for pod to become ready".to_string());
            }
            tokio::time::sleep(self.timings.ready_poll).await;
        }
    }

    /// Best-effort deletion; the manager ends up `NotCreated` either way.
    pub async fn delete_pod(&self) {
        let _op = self.ops.lock().await;
        self.delete_unlocked().await;
        *self.state.lock() = PodState::empty(PodStatus::NotCreated);
    }

    async fn delete_unlocked(&self) {
        let pod = &self.identity;
        if let Err(err) = self.cluster.delete_pod(pod, DeleteMode::Graceful).await {
            warn!(pod = %pod.name, "delete failed: {}", err);
        }

        let deadline = Instant::now() + self.timings.delete_timeout;
        let mut failed_checks = 0;
        while Instant::now() < deadline {
            match self.cluster.pod_listed(pod).await {
                Ok(false) => {
                    debug!(pod = %pod.name, "pod deleted");
                    return;
                }
                Ok(true) => {
                    failed_checks = 0;
                    debug!(pod = %pod.name, "waiting for pod deletion");
                }
                Err(err) => {
                    failed_checks += 1;
                    debug!(pod = %pod.name, "deletion check failed: {}", err);
                    if failed_checks >= MAX_FAILED_CHECKS {
                        warn!(pod = %pod.name, "cannot list pods: {}", err);
                        break;
                    }
                }
            }
            tokio::time::sleep(self.timings.delete_poll).await;
        }

        warn!(pod = %pod.name, "deletion not confirmed, forcing");
        if let Err(err) = self.cluster.delete_pod(pod, DeleteMode::Force).await {
            warn!(pod = %pod.name, "forced delete failed: {}", err);
        }
        tokio::time::sleep(self.timings.force_settle).await;
    }

    /// Status, error text and number of relayed services.
    pub fn status(&self) -> (PodStatus, String, usize) {
        let state = self.state.lock();
        (state.status, state.error.clone(), state.active.len())
    }

    /// Relay port of an active service inside the pod.
    pub fn relay_port(&self, name: &str) -> Option<u16> {
        self.state.lock().relay_ports.get(name).copied()
    }

    /// Services the current pod relays, in selection order.
    pub fn active_service_names(&self) -> Vec<String> {
        self.state.lock().active.clone()
    }

    /// True when the current pod relays `name`.
    pub fn is_service_active(&self, name: &str) -> bool {
        self.state.lock().active.iter().any(|n| n == name)
    }
}
