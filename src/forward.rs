//! Supervision of one `kubectl port-forward` subprocess.
//!
//! A `ForwardSupervisor` owns the state machine of a single forward: it checks
//! the local port, spawns `kubectl`, watches the process from a monitor task
//! and relaunches it with exponential backoff when the connection drops. If
//! the service has a SQL tap, the tap is started once the forward is up and
//! stopped before the forward goes down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::lifecycle::{Decision, Launch, LaunchRejected, Lifecycle};
use crate::ports::PortInspector;
use crate::proxypod::ProxyPodManager;
use crate::runner::{self, CommandLine, RunningProcess};
use crate::service::{ConflictInfo, ForwardStatus, RetryInfo, ServiceSpec, Target};
use crate::sqltap::{TapError, TapSupervisor};

/// Why a forward could not be started.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} was stopped while starting")]
    Superseded(String),
    #[error("{message}")]
    PortInUse { port: u16, message: String },
    #[error("Service not found in proxy pod")]
    NotInPod,
    #[error("{0} is a proxy service but no proxy pod is configured")]
    NoProxyPod(String),
    #[error("Failed to start: {source} | Command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sql-tap failed: {0}")]
    Tap(#[source] TapError),
}

struct ForwardState {
    life: Lifecycle,
    conflict: ConflictInfo,
}

/// Supervises one forward and its optional tap.
pub struct ForwardSupervisor {
    spec: ServiceSpec,
    settings: Arc<Settings>,
    inspector: Arc<dyn PortInspector>,
    pods: Option<Arc<ProxyPodManager>>,
    tap: Option<Arc<TapSupervisor>>,
    state: Mutex<ForwardState>,
}

impl ForwardSupervisor {
    /// `pods` is required for proxy services and ignored for direct ones.
    pub fn new(
        spec: ServiceSpec,
        settings: Arc<Settings>,
        inspector: Arc<dyn PortInspector>,
        pods: Option<Arc<ProxyPodManager>>,
    ) -> Arc<Self> {
        let tap = spec
            .tap
            .clone()
            .map(|tap| TapSupervisor::new(&spec.name, tap, spec.local_port, Arc::clone(&settings)));
        let life = Lifecycle::new(spec.max_retries, "Connection lost");
        Arc::new(Self {
            spec,
            settings,
            inspector,
            pods,
            tap,
            state: Mutex::new(ForwardState {
                life,
                conflict: ConflictInfo::free(),
            }),
        })
    }

    /// Resolved configuration of this forward.
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Service name, unique per kind.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The `kubectl port-forward` invocation for the current target.
    ///
    /// Proxy forwards resolve their relay port from the pod manager each time.
    pub fn command(&self) -> Result<CommandLine, ForwardError> {
        let spec = &self.spec;
        let (context, namespace, resource, remote) = match &spec.target {
            Target::Direct {
                service_name,
                remote_port,
            } => (
                spec.context.clone(),
                spec.namespace.clone(),
                format!("service/{}", service_name),
                *remote_port,
            ),
            Target::Proxy { .. } => {
                let pods = self
                    .pods
                    .as_ref()
                    .ok_or_else(|| ForwardError::NoProxyPod(spec.name.clone()))?;
                let relay = pods.relay_port(&spec.name).ok_or(ForwardError::NotInPod)?;
                let pod = pods.identity();
                (
                    pod.context.clone(),
                    pod.namespace.clone(),
                    format!("pod/{}", pod.name),
                    relay,
                )
            }
        };
        Ok(CommandLine::new(
            &self.settings.kubectl,
            vec![
                format!("--context={}", context),
                "-n".to_string(),
                namespace,
                "port-forward".to_string(),
                resource,
                format!("{}:{}", spec.local_port, remote),
            ],
        ))
    }

    /// Starts the forward. A user start resets the retry budget.
    pub async fn start(self: &Arc<Self>) -> Result<(), ForwardError> {
        self.launch(Launch::Fresh).await
    }

    async fn launch(self: &Arc<Self>, launch: Launch) -> Result<(), ForwardError> {
        let begun = self.state.lock().life.begin(launch);
        let id = match begun {
            Ok(id) => id,
            Err(LaunchRejected::Active) => return Err(ForwardError::AlreadyRunning(self.spec.name.clone())),
            Err(LaunchRejected::Superseded) => return Err(ForwardError::Superseded(self.spec.name.clone())),
        };

        let command = match self.command() {
            Ok(command) => command,
            Err(err) => {
                self.state.lock().life.fail_permanently(id, err.to_string());
                warn!(service = %self.spec.name, "{}", err);
                return Err(err);
            }
        };

        let conflict = self.inspect_port().await;
        if conflict.has_conflict {
            let message = conflict.message();
            {
                let mut state = self.state.lock();
                state.life.set_command(command.to_string());
                state.life.fail_permanently(id, message.clone());
                state.conflict = conflict;
            }
            warn!(service = %self.spec.name, port = self.spec.local_port, "{}", message);
            return Err(ForwardError::PortInUse {
                port: self.spec.local_port,
                message,
            });
        }

        let cancel = CancellationToken::new();
        let spawned = {
            let mut state = self.state.lock();
            if !state.life.is_current(id) {
                return Err(ForwardError::Superseded(self.spec.name.clone()));
            }
            state.conflict = ConflictInfo::free();
            state.life.set_command(command.to_string());
            match runner::spawn(&command) {
                Ok(process) => {
                    state.life.running(id, process.pid, cancel.clone());
                    Ok(process)
                }
                Err(source) => {
                    let cause = format!("Failed to start: {}", source);
                    Err((state.life.spawn_failed(id, launch, cause), source))
                }
            }
        };
        let process = match spawned {
            Ok(process) => process,
            Err((decision, source)) => {
                error!(service = %self.spec.name, command = %command, "failed to start: {}", source);
                if let Decision::Retry { id, delay } = decision {
                    self.schedule_retry(id, delay);
                }
                return Err(ForwardError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        if self.settings.debug {
            info!(service = %self.spec.name, command = %command, "forward started");
        } else {
            info!(service = %self.spec.name, local_port = self.spec.local_port, pid = ?process.pid, "forward started");
        }
        tokio::spawn(Arc::clone(self).monitor(id, process, cancel));

        if let Some(tap) = &self.tap {
            self.attach_tap(id, tap).await?;
        }
        Ok(())
    }

    async fn inspect_port(&self) -> ConflictInfo {
        let inspector = Arc::clone(&self.inspector);
        let port = self.spec.local_port;
        match tokio::task::spawn_blocking(move || inspector.inspect(port)).await {
            Ok(info) => info,
            Err(err) => {
                warn!(port, "port inspection failed: {}", err);
                ConflictInfo::free()
            }
        }
    }

    async fn attach_tap(&self, id: u64, tap: &Arc<TapSupervisor>) -> Result<(), ForwardError> {
        tokio::time::sleep(self.settings.tap_settle).await;
        if !self.state.lock().life.is_current(id) {
            // Stopped or dropped during the settle window; a relaunch starts the tap again.
            return Ok(());
        }
        if let Err(err) = tap.start() {
            let message = format!("sql-tap failed: {}", err);
            let cancel = self.state.lock().life.fail_permanently(id, message.clone());
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            error!(service = %self.spec.name, "{}", message);
            return Err(ForwardError::Tap(err));
        }
        if !self.state.lock().life.is_current(id) {
            tap.stop();
        }
        Ok(())
    }

    async fn monitor(self: Arc<Self>, id: u64, mut process: RunningProcess, cancel: CancellationToken) {
        let started = Instant::now();
        let exit = process
            .wait_then(&cancel, self.settings.shutdown, self.tap_exited())
            .await;
        let stderr = process.stderr.text();
        let decision = self
            .state
            .lock()
            .life
            .exited(id, &exit, stderr.as_deref(), started.elapsed());

        if decision != Decision::Ignore {
            if let Some(tap) = &self.tap {
                tap.stop();
            }
        }

        match decision {
            Decision::Ignore => debug!(service = %self.spec.name, %exit, "forward ended"),
            Decision::Stopped => info!(service = %self.spec.name, "forward exited"),
            Decision::Retry { id, delay } => {
                warn!(service = %self.spec.name, %exit, stderr = ?stderr, ?delay, "connection lost, retrying");
                self.schedule_retry(id, delay);
            }
            Decision::Failed => {
                let (_, message) = self.status();
                error!(service = %self.spec.name, "{}", message);
            }
        }
    }

    /// Resolves once the tap's process is gone, so a stopped forward outlives its tap.
    fn tap_exited(&self) -> impl Future<Output = ()> + Send + 'static {
        let tap = self.tap.clone();
        let name = self.spec.name.clone();
        // SIGTERM grace plus headroom for the SIGKILL that may follow.
        let limit = self.settings.shutdown.sigterm_timeout() + Duration::from_secs(1);
        async move {
            let Some(tap) = tap else { return };
            if tokio::time::timeout(limit, tap.wait_exited()).await.is_err() {
                warn!(service = %name, "sql-tapd still running, stopping the forward anyway");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: u64, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.relaunch(id).await;
        });
    }

    // Boxed so the retry task does not make `launch` a recursive opaque type.
    fn relaunch(self: Arc<Self>, id: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            match self.launch(Launch::Retry(id)).await {
                Ok(()) => info!(service = %self.spec.name, "reconnected"),
                Err(ForwardError::Superseded(_)) => {}
                Err(err) => warn!(service = %self.spec.name, "retry failed: {}", err),
            }
        })
    }

    /// Stops the forward, its tap and any pending retry.
    ///
    /// No-op when stopped or in terminal error.
    pub fn stop(&self) {
        if !self.state.lock().life.is_stoppable() {
            return;
        }
        if let Some(tap) = &self.tap {
            tap.stop();
        }
        let stopped = self.state.lock().life.stop();
        if let Some(cancel) = stopped {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            info!(service = %self.spec.name, "forward stopped");
        }
    }

    /// Current status and its error text (empty unless `Error`).
    pub fn status(&self) -> (ForwardStatus, String) {
        self.state.lock().life.status()
    }

    /// Retry telemetry for display.
    pub fn retry_info(&self) -> RetryInfo {
        self.state.lock().life.retry_info()
    }

    /// True once `kubectl` has been spawned and not yet exited.
    pub fn is_running(&self) -> bool {
        self.status().0 == ForwardStatus::Running
    }

    /// Conflict found by the last port inspection.
    pub fn conflict_info(&self) -> ConflictInfo {
        self.state.lock().conflict.clone()
    }

    /// PID of the running `kubectl`, if any.
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().life.pid()
    }

    /// PIDs of the forward and its tap.
    pub fn pids(&self) -> Vec<u32> {
        self.pid()
            .into_iter()
            .chain(self.tap.as_ref().and_then(|tap| tap.pid()))
            .collect()
    }

    /// The last command line launched, for error reports.
    pub fn command_line(&self) -> Option<String> {
        self.state.lock().life.command().map(str::to_string)
    }

    /// The SQL tap layered on this forward, if configured.
    pub fn tap(&self) -> Option<&Arc<TapSupervisor>> {
        self.tap.as_ref()
    }

    /// Re-inspects the local port of an idle forward.
    ///
    /// A new conflict becomes the forward's error; a cleared one resets it.
    pub async fn refresh_conflict(&self) {
        if self.is_busy() {
            return;
        }
        let conflict = self.inspect_port().await;
        let mut state = self.state.lock();
        let (status, _) = state.life.status();
        if status.is_active() || state.life.retry_info().retrying {
            return;
        }
        if conflict.has_conflict {
            if status == ForwardStatus::Stopped || state.conflict.has_conflict {
                state.life.fail_idle(conflict.message());
            }
            state.conflict = conflict;
        } else if state.conflict.has_conflict {
            state.conflict = ConflictInfo::free();
            state.life.reset_failed();
        }
    }

    /// Forgets a conflict after its owner was killed.
    pub fn clear_conflict(&self) {
        let mut state = self.state.lock();
        if state.conflict.has_conflict {
            state.conflict = ConflictInfo::free();
            state.life.reset_failed();
        }
    }

    fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.life.status().0.is_active() || state.life.retry_info().retrying
    }
}
