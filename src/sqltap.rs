//! The `sql-tapd` daemon layered on top of a running forward.
//!
//! A tap listens on its own port, relays to the forward's local port and
//! exposes captured queries over gRPC. It only lives while its parent forward
//! runs: the forward starts it after spawning and stops it before cancelling
//! its own subprocess.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::lifecycle::{Decision, Launch, LaunchRejected, Lifecycle};
use crate::runner::{self, find_program, CommandLine, RunningProcess};
use crate::service::{ForwardStatus, RetryInfo, TapSpec, UNLIMITED_RETRIES};

/// Environment variable `sql-tapd` reads its connection string from.
pub const DSN_ENV: &str = "DATABASE_URL";

const INSTALL_HINT: &str = "install: brew install --cask mickamy/tap/sql-tap";

/// Why a tap could not be started.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("sql-tap daemon already running")]
    AlreadyRunning,
    #[error("sql-tap start was superseded")]
    Superseded,
    #[error("{program} not found ({hint})")]
    NotInstalled { program: String, hint: &'static str },
    #[error("Failed to start: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

/// Supervises one `sql-tapd` process.
pub struct TapSupervisor {
    service: String,
    spec: TapSpec,
    upstream_port: u16,
    settings: Arc<Settings>,
    life: Mutex<Lifecycle>,
    /// Number of `sql-tapd` processes whose monitor has not seen them exit.
    live: watch::Sender<usize>,
}

impl TapSupervisor {
    /// A tap for `service` relaying to the forward's local `upstream_port`.
    pub fn new(service: &str, spec: TapSpec, upstream_port: u16, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            service: service.to_string(),
            spec,
            upstream_port,
            settings,
            life: Mutex::new(Lifecycle::new(UNLIMITED_RETRIES, "sql-tapd crashed")),
            live: watch::channel(0).0,
        })
    }

    /// The `sql-tapd` invocation, with `DATABASE_URL` set.
    pub fn command(&self) -> CommandLine {
        let args = vec![
            format!("--driver={}", self.spec.driver),
            format!("--listen=:{}", self.spec.listen_port),
            format!("--upstream=localhost:{}", self.upstream_port),
            format!("--grpc=:{}", self.spec.grpc_port),
            format!("--dsn-env={}", DSN_ENV),
        ];
        let dsn = self
            .spec
            .database_url
            .clone()
            .unwrap_or_else(|| self.spec.driver.dsn(self.upstream_port));
        CommandLine::new(&self.settings.sql_tapd, args).with_env(DSN_ENV, dsn)
    }

    /// Starts the daemon. Errors are also recorded as the tap's status.
    pub fn start(self: &Arc<Self>) -> Result<(), TapError> {
        self.launch(Launch::Fresh)
    }

    fn launch(self: &Arc<Self>, launch: Launch) -> Result<(), TapError> {
        let mut life = self.life.lock();
        let id = life.begin(launch).map_err(|rejected| match rejected {
            LaunchRejected::Active => TapError::AlreadyRunning,
            LaunchRejected::Superseded => TapError::Superseded,
        })?;

        let command = self.command();
        life.set_command(command.to_string());

        if find_program(&command.program).is_none() {
            let err = TapError::NotInstalled {
                program: command.program.clone(),
                hint: INSTALL_HINT,
            };
            life.fail_permanently(id, err.to_string());
            return Err(err);
        }

        let process = match runner::spawn(&command) {
            Ok(process) => process,
            Err(source) => {
                let decision = life.spawn_failed(id, launch, format!("Failed to start: {}", source));
                drop(life);
                if let Decision::Retry { id, delay } = decision {
                    self.schedule_retry(id, delay);
                }
                return Err(TapError::Spawn { source });
            }
        };

        let cancel = CancellationToken::new();
        life.running(id, process.pid, cancel.clone());
        self.live.send_modify(|n| *n += 1);
        drop(life);

        if self.settings.debug {
            info!(service = %self.service, command = %command, "sql-tapd started");
        } else {
            info!(service = %self.service, pid = ?process.pid, grpc = self.spec.grpc_port, "sql-tapd started");
        }
        tokio::spawn(Arc::clone(self).monitor(id, process, cancel));
        Ok(())
    }

    async fn monitor(self: Arc<Self>, id: u64, mut process: RunningProcess, cancel: CancellationToken) {
        let started = Instant::now();
        let exit = process.wait(&cancel, self.settings.shutdown).await;
        self.live.send_modify(|n| *n = n.saturating_sub(1));
        let stderr = process.stderr.text();
        let decision = self
            .life
            .lock()
            .exited(id, &exit, stderr.as_deref(), started.elapsed());

        match decision {
            Decision::Ignore => debug!(service = %self.service, %exit, "sql-tapd ended"),
            Decision::Stopped => info!(service = %self.service, "sql-tapd exited"),
            Decision::Retry { id, delay } => {
                warn!(service = %self.service, %exit, ?delay, "sql-tapd crashed, retrying");
                self.schedule_retry(id, delay);
            }
            Decision::Failed => error!(service = %self.service, %exit, "sql-tapd failed"),
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: u64, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.launch(Launch::Retry(id)) {
                Ok(()) | Err(TapError::Superseded) => {}
                Err(err) => warn!(service = %this.service, "sql-tapd restart failed: {}", err),
            }
        });
    }

    /// Stops the daemon and any pending restart. No-op when already stopped.
    pub fn stop(&self) {
        let stopped = self.life.lock().stop();
        if let Some(cancel) = stopped {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            debug!(service = %self.service, "sql-tapd stopped");
        }
    }

    /// Resolves once every spawned `sql-tapd` process has exited.
    pub async fn wait_exited(&self) {
        let mut live = self.live.subscribe();
        let _ = live.wait_for(|n| *n == 0).await;
    }

    /// Current status and its error text.
    pub fn status(&self) -> (ForwardStatus, String) {
        self.life.lock().status()
    }

    pub fn retry_info(&self) -> RetryInfo {
        self.life.lock().retry_info()
    }

    pub fn is_running(&self) -> bool {
        self.status().0 == ForwardStatus::Running
    }

    /// PID of the running daemon, if any.
    pub fn pid(&self) -> Option<u32> {
        self.life.lock().pid()
    }

    pub fn listen_port(&self) -> u16 {
        self.spec.listen_port
    }

    pub fn grpc_port(&self) -> u16 {
        self.spec.grpc_port
    }
}
