//! The set of forwards built from one configuration.
//!
//! The `Registry` owns a supervisor per direct service, the shared proxy pod
//! and a supervisor per proxy service currently relayed by that pod. Bulk
//! operations never stop at the first failure: every item is attempted and
//! the outcome collected in a `BatchReport`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, Settings};
use crate::forward::{ForwardError, ForwardSupervisor};
use crate::kubectl::ClusterClient;
use crate::ports::{kill_process, PortError, PortInspector};
use crate::proxypod::{PodError, PodStatus, ProxyPodManager};
use crate::service::{ConflictInfo, ForwardStatus, RetryInfo, ServiceSpec};

const SETTLE_POLL: Duration = Duration::from_millis(250);

/// Failures of registry operations addressed by service name.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("proxy service {0} is not selected")]
    NotSelected(String),
    #[error("unknown proxy service {0}")]
    UnknownProxyService(String),
    #[error("unknown preset {0}")]
    UnknownPreset(String),
    #[error("unknown context {0}")]
    UnknownContext(String),
    #[error("no proxy services configured")]
    NoProxyServices,
    #[error("port {0} is not in use")]
    PortFree(u16),
    #[error("could not identify the process holding port {0}")]
    OwnerUnknown(u16),
    #[error("PID {0} is a forward managed by kubefwd; stop the service instead")]
    ManagedPid(u32),
    #[error("{pending} of {total} forwards still starting after {waited:?}")]
    NotSettled {
        pending: usize,
        total: usize,
        waited: Duration,
    },
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Pod(#[from] PodError),
    #[error(transparent)]
    Kill(#[from] PortError),
}

/// Outcome of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    fn record(&mut self, name: String, result: Result<(), ForwardError>) {
        match result {
            Ok(()) => self.started.push(name),
            Err(err) => {
                warn!(service = %name, "start failed: {}", err);
                self.failed.push((name, err.to_string()));
            }
        }
    }

    /// Appends the outcomes of another batch.
    pub fn merge(&mut self, other: BatchReport) {
        self.started.extend(other.started);
        self.failed.extend(other.failed);
    }

    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tap part of a `ForwardView`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapView {
    pub listen_port: u16,
    pub grpc_port: u16,
    pub status: ForwardStatus,
    pub error: String,
}

/// Point-in-time view of one forward for a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardView {
    pub name: String,
    pub kind: &'static str,
    pub local_port: u16,
    pub status: ForwardStatus,
    pub error: String,
    pub retry: RetryInfo,
    pub pid: Option<u32>,
    /// Last command line launched, once the forward has been started.
    pub command: Option<String>,
    pub tap: Option<TapView>,
}

/// Which configured port a local port number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Forward,
    Tap,
    Grpc,
}

/// A local port claimed by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredPort {
    pub port: u16,
    pub service: String,
    pub kind: &'static str,
    pub role: PortRole,
}

/// Counts once no forward is still starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub running: usize,
    pub failed: usize,
}

/// Owner of every forward, tap and the proxy pod for one cluster context.
pub struct Registry {
    config: Config,
    settings: Arc<Settings>,
    inspector: Arc<dyn PortInspector>,
    cluster: Arc<dyn ClusterClient>,
    direct: Vec<Arc<ForwardSupervisor>>,
    proxies: BTreeMap<String, Arc<ForwardSupervisor>>,
    pods: Option<Arc<ProxyPodManager>>,
}

impl Registry {
    /// Builds supervisors for every direct service and, if proxies are configured, the pod manager.
    pub fn new(
        config: Config,
        settings: Arc<Settings>,
        inspector: Arc<dyn PortInspector>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let mut registry = Self {
            config,
            settings,
            inspector,
            cluster,
            direct: Vec::new(),
            proxies: BTreeMap::new(),
            pods: None,
        };
        registry.rebuild();
        registry
    }

    fn rebuild(&mut self) {
        self.direct = self
            .config
            .direct_specs()
            .into_iter()
            .map(|spec| {
                ForwardSupervisor::new(
                    spec,
                    Arc::clone(&self.settings),
                    Arc::clone(&self.inspector),
                    None,
                )
            })
            .collect();
        self.proxies.clear();
        self.pods = if self.config.proxy_services.is_empty() {
            None
        } else {
            Some(Arc::new(ProxyPodManager::new(
                self.config.pod_identity(),
                Arc::clone(&self.cluster),
                self.settings.pod_timings,
            )))
        };
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct forwards in name order.
    pub fn direct(&self) -> &[Arc<ForwardSupervisor>] {
        &self.direct
    }

    /// A proxy forward, present only while its service is selected.
    pub fn proxy(&self, name: &str) -> Option<&Arc<ForwardSupervisor>> {
        self.proxies.get(name)
    }

    /// The proxy pod manager, when proxy services are configured.
    pub fn pods(&self) -> Option<&Arc<ProxyPodManager>> {
        self.pods.as_ref()
    }

    /// Status, error text and relay count of the proxy pod, if proxies are configured.
    pub fn pod_status(&self) -> Option<(PodStatus, String, usize)> {
        self.pods.as_ref().map(|pods| pods.status())
    }

    fn forwards(&self) -> impl Iterator<Item = &Arc<ForwardSupervisor>> {
        self.direct.iter().chain(self.proxies.values())
    }

    fn find(&self, name: &str) -> Result<&Arc<ForwardSupervisor>, RegistryError> {
        if let Some(forward) = self.forwards().find(|f| f.name() == name) {
            return Ok(forward);
        }
        if self.config.proxy_services.iter().any(|p| p.name == name) {
            return Err(RegistryError::NotSelected(name.to_string()));
        }
        Err(RegistryError::UnknownService(name.to_string()))
    }

    /// Starts one forward by name.
    pub async fn start(&self, name: &str) -> Result<(), RegistryError> {
        let forward = Arc::clone(self.find(name)?);
        forward.start().await?;
        Ok(())
    }

    /// Stops one forward by name. Stopping a stopped forward is a no-op.
    pub fn stop(&self, name: &str) -> Result<(), RegistryError> {
        self.find(name)?.stop();
        Ok(())
    }

    /// Starts every direct forward.
    pub async fn start_all(&self) -> BatchReport {
        start_each(self.direct.iter().cloned().collect()).await
    }

    /// Starts the direct forwards marked `selected_by_default`.
    pub async fn start_defaults(&self) -> BatchReport {
        let defaults = self
            .direct
            .iter()
            .filter(|f| f.spec().selected_by_default)
            .cloned()
            .collect();
        start_each(defaults).await
    }

    /// Selects the proxy services marked `selected_by_default`.
    pub async fn start_default_proxies(&mut self) -> Result<BatchReport, RegistryError> {
        let names: Vec<String> = self
            .config
            .proxy_specs()
            .into_iter()
            .filter(|s| s.selected_by_default)
            .map(|s| s.name)
            .collect();
        if names.is_empty() {
            return Ok(BatchReport::default());
        }
        self.apply_proxy_selection(&names).await
    }

    /// Stops every forward and deletes the proxy pod if one was created.
    pub async fn stop_all(&mut self) {
        for forward in self.forwards() {
            forward.stop();
        }
        self.proxies.clear();
        if let Some(pods) = &self.pods {
            if pods.status().0 != PodStatus::NotCreated {
                pods.delete_pod().await;
            }
        }
        info!("all forwards stopped");
    }

    /// Rebuilds the proxy pod for exactly `names` and starts a forward per service.
    pub async fn apply_proxy_selection(&mut self, names: &[String]) -> Result<BatchReport, RegistryError> {
        let Some(pods) = self.pods.clone() else {
            if names.is_empty() {
                return Ok(BatchReport::default());
            }
            return Err(RegistryError::NoProxyServices);
        };

        let available = self.config.proxy_specs();
        let mut selected: Vec<ServiceSpec> = Vec::new();
        for name in names {
            if selected.iter().any(|s| &s.name == name) {
                continue;
            }
            let spec = available
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| RegistryError::UnknownProxyService(name.clone()))?;
            selected.push(spec.clone());
        }

        for forward in self.proxies.values() {
            forward.stop();
        }
        self.proxies.clear();

        pods.create_pod_with_services(&selected).await?;

        let mut fresh = Vec::with_capacity(selected.len());
        for spec in selected {
            let forward = ForwardSupervisor::new(
                spec,
                Arc::clone(&self.settings),
                Arc::clone(&self.inspector),
                Some(Arc::clone(&pods)),
            );
            self.proxies.insert(forward.name().to_string(), Arc::clone(&forward));
            fresh.push(forward);
        }
        Ok(start_each(fresh).await)
    }

    /// Stops the direct forwards and starts the ones the preset names.
    pub async fn apply_preset(&self, name: &str) -> Result<BatchReport, RegistryError> {
        let preset = self
            .config
            .preset(name)
            .ok_or_else(|| RegistryError::UnknownPreset(name.to_string()))?;
        for forward in &self.direct {
            forward.stop();
        }
        let mut report = BatchReport::default();
        let mut chosen = Vec::new();
        for service in &preset.services {
            match self.direct.iter().find(|f| f.name() == service) {
                Some(forward) => chosen.push(Arc::clone(forward)),
                None => report
                    .failed
                    .push((service.clone(), RegistryError::UnknownService(service.clone()).to_string())),
            }
        }
        report.merge(start_each(chosen).await);
        Ok(report)
    }

    /// Swaps in a new configuration, restarting what was running and still exists.
    pub async fn reload(&mut self, config: Config) -> BatchReport {
        let running: Vec<String> = self
            .direct
            .iter()
            .filter(|f| f.status().0.is_active() || f.retry_info().retrying)
            .map(|f| f.name().to_string())
            .collect();
        let active_proxies = self
            .pods
            .as_ref()
            .map(|pods| pods.active_service_names())
            .unwrap_or_default();

        self.stop_all().await;
        self.config = config;
        self.rebuild();

        let survivors = self
            .direct
            .iter()
            .filter(|f| running.iter().any(|n| n == f.name()))
            .cloned()
            .collect();
        let mut report = start_each(survivors).await;

        let proxy_names: Vec<String> = active_proxies
            .into_iter()
            .filter(|name| self.config.proxy_services.iter().any(|p| &p.name == name))
            .collect();
        if !proxy_names.is_empty() {
            match self.apply_proxy_selection(&proxy_names).await {
                Ok(proxies) => report.merge(proxies),
                Err(err) => report.failed.push(("proxy pod".to_string(), err.to_string())),
            }
        }
        info!(restarted = report.started.len(), failed = report.failed.len(), "configuration reloaded");
        report
    }

    /// Stops everything and points the registry at an alternative cluster.
    // The headless binary applies `--context` before building the registry.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn switch_context(&mut self, name: &str) -> Result<(), RegistryError> {
        if self.config.alternative_context(name).is_none() {
            return Err(RegistryError::UnknownContext(name.to_string()));
        }
        self.stop_all().await;
        self.config.use_alternative_context(name);
        self.rebuild();
        info!(context = %self.config.cluster_context, alias = name, "switched cluster context");
        Ok(())
    }

    /// Inspects `port`, flagging owners that are our own subprocesses.
    ///
    /// Runs `lsof`/`ps` on the calling thread.
    pub fn conflict_info(&self, port: u16) -> ConflictInfo {
        let mut info = self.inspector.inspect(port);
        info.is_managed = info.pid.map(|pid| self.is_managed_pid(pid)).unwrap_or(false);
        info
    }

    /// Sends SIGTERM to the foreign process holding `port` and returns its PID.
    pub fn kill_port_owner(&self, port: u16) -> Result<u32, RegistryError> {
        let info = self.conflict_info(port);
        if !info.has_conflict {
            return Err(RegistryError::PortFree(port));
        }
        let pid = info.pid.ok_or(RegistryError::OwnerUnknown(port))?;
        if info.is_managed {
            return Err(RegistryError::ManagedPid(pid));
        }
        kill_process(i64::from(pid))?;
        info!(port, pid, "sent SIGTERM to port owner");
        for forward in self.forwards().filter(|f| f.spec().local_port == port) {
            forward.clear_conflict();
        }
        Ok(pid)
    }

    /// PIDs of every running forward and tap.
    pub fn managed_pids(&self) -> Vec<u32> {
        self.forwards().flat_map(|f| f.pids()).collect()
    }

    /// True when `pid` is one of our own subprocesses.
    pub fn is_managed_pid(&self, pid: u32) -> bool {
        self.forwards().any(|f| f.pids().contains(&pid))
    }

    /// Every local port the configuration claims, sorted by port.
    pub fn configured_ports(&self) -> Vec<ConfiguredPort> {
        let specs = self
            .config
            .direct_specs()
            .into_iter()
            .chain(self.config.proxy_specs());
        let mut ports = Vec::new();
        for spec in specs {
            ports.push(ConfiguredPort {
                port: spec.local_port,
                service: spec.name.clone(),
                kind: spec.kind(),
                role: PortRole::Forward,
            });
            if let Some(tap) = &spec.tap {
                ports.push(ConfiguredPort {
                    port: tap.listen_port,
                    service: spec.name.clone(),
                    kind: spec.kind(),
                    role: PortRole::Tap,
                });
                ports.push(ConfiguredPort {
                    port: tap.grpc_port,
                    service: spec.name.clone(),
                    kind: spec.kind(),
                    role: PortRole::Grpc,
                });
            }
        }
        ports.sort_by_key(|p| p.port);
        ports
    }

    /// Direct forwards in name order, then the selected proxy forwards.
    pub fn snapshot(&self) -> Vec<ForwardView> {
        self.forwards()
            .map(|forward| {
                let (status, error) = forward.status();
                let tap = forward.tap().map(|tap| {
                    let (status, error) = tap.status();
                    TapView {
                        listen_port: tap.listen_port(),
                        grpc_port: tap.grpc_port(),
                        status,
                        error,
                    }
                });
                ForwardView {
                    name: forward.name().to_string(),
                    kind: forward.spec().kind(),
                    local_port: forward.spec().local_port,
                    status,
                    error,
                    retry: forward.retry_info(),
                    pid: forward.pid(),
                    command: forward.command_line(),
                    tap,
                }
            })
            .collect()
    }

    /// Waits until no started forward is still `Starting`.
    pub async fn wait_until_settled(&self, timeout: Duration) -> Result<Settled, RegistryError> {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses: Vec<ForwardStatus> = self
                .forwards()
                .map(|f| f.status().0)
                .filter(|s| *s != ForwardStatus::Stopped)
                .collect();
            let pending = statuses.iter().filter(|s| **s == ForwardStatus::Starting).count();
            if pending == 0 {
                return Ok(Settled {
                    running: statuses.iter().filter(|s| **s == ForwardStatus::Running).count(),
                    failed: statuses.iter().filter(|s| **s == ForwardStatus::Error).count(),
                });
            }
            if Instant::now() >= deadline {
                return Err(RegistryError::NotSettled {
                    pending,
                    total: statuses.len(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }
}

async fn start_each(forwards: Vec<Arc<ForwardSupervisor>>) -> BatchReport {
    let mut tasks = JoinSet::new();
    for forward in forwards {
        tasks.spawn(async move {
            let result = forward.start().await;
            (forward.name().to_string(), result)
        });
    }
    let mut report = BatchReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, result)) => report.record(name, result),
            Err(err) => warn!("start task failed: {}", err),
        }
    }
    report.started.sort();
    report.failed.sort();
    report
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::parse_config;
    use crate::kubectl::fake::FakeCluster;
    use crate::proxypod::tests::quick_timings;
    use crate::runner::scripts::write_script;
    use crate::runner::ShutdownConfig;

    struct FreePorts;

    impl PortInspector for FreePorts {
        fn inspect(&self, _port: u16) -> ConflictInfo {
            ConflictInfo::free()
        }
    }

    /// Reports every port as held by one PID.
    struct HeldBy(u32);

    impl PortInspector for HeldBy {
        fn inspect(&self, _port: u16) -> ConflictInfo {
            ConflictInfo {
                has_conflict: true,
                pid: Some(self.0),
                command: Some("kubectl port-forward".into()),
                is_forward: true,
                is_managed: false,
            }
        }
    }

    fn config_text(kubectl: &str) -> String {
        format!(
            r#"
cluster_context = "prod"
namespace = "default"

[tools]
kubectl = "{kubectl}"

[[alternative_contexts]]
name = "Staging"
context = "staging"

[[presets]]
name = "backend"
services = ["api", "missing"]

[[services]]
name = "api"
service_name = "api"
remote_port = 80
local_port = 18080
selected_by_default = true

[[services]]
name = "db"
service_name = "postgres"
remote_port = 5432
local_port = 15433
sql_tap_port = 15432
sql_tap_driver = "postgres"

[[proxy_services]]
name = "a"
target_host = "10.0.0.1"
target_port = 5432
local_port = 16001
selected_by_default = true

[[proxy_services]]
name = "b"
target_host = "10.0.0.2"
target_port = 5432
local_port = 16002

[[proxy_services]]
name = "c"
target_host = "10.0.0.3"
target_port = 6379
local_port = 16003
"#
        )
    }

    fn sleeping_kubectl(dir: &Path) -> String {
        write_script(dir, "kubectl", "exec sleep 30")
    }

    fn registry_with(
        config: &str,
        inspector: Arc<dyn PortInspector>,
        cluster: Arc<FakeCluster>,
    ) -> Registry {
        let config = parse_config(config).unwrap();
        let settings = Settings {
            tap_settle: Duration::from_millis(50),
            shutdown: ShutdownConfig::new(200),
            pod_timings: quick_timings(),
            ..Settings::from_config(&config, false)
        };
        Registry::new(config, Arc::new(settings), inspector, cluster)
    }

    fn running_names(registry: &Registry) -> Vec<String> {
        registry
            .snapshot()
            .into_iter()
            .filter(|v| v.status == ForwardStatus::Running)
            .map(|v| v.name)
            .collect()
    }

    #[tokio::test]
    async fn start_defaults_and_stop_all() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let cluster = Arc::new(FakeCluster::default());
        let mut registry = registry_with(&config_text(&kubectl), Arc::new(FreePorts), cluster.clone());

        let report = registry.start_defaults().await;
        assert_eq!(report.started, vec!["api"]);
        assert!(report.is_clean());
        let proxies = registry.start_default_proxies().await.unwrap();
        assert_eq!(proxies.started, vec!["a"]);
        assert_eq!(running_names(&registry), vec!["api", "a"]);
        let api = registry.snapshot().into_iter().find(|v| v.name == "api").unwrap();
        assert!(api.command.unwrap().contains("port-forward"));

        let pids = registry.managed_pids();
        assert_eq!(pids.len(), 2);
        assert!(registry.is_managed_pid(pids[0]));
        assert!(!registry.is_managed_pid(1));

        let settled = registry.wait_until_settled(Duration::from_secs(1)).await.unwrap();
        assert_eq!(settled, Settled { running: 2, failed: 0 });

        registry.stop_all().await;
        assert!(running_names(&registry).is_empty());
        assert!(registry.proxy("a").is_none());
        assert_eq!(registry.pod_status().unwrap().0, PodStatus::NotCreated);
        assert!(cluster.state.lock().pod.is_none());
    }

    #[tokio::test]
    async fn single_service_operations() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let registry = registry_with(
            &config_text(&kubectl),
            Arc::new(FreePorts),
            Arc::new(FakeCluster::default()),
        );

        registry.start("api").await.unwrap();
        assert!(matches!(
            registry.start("api").await,
            Err(RegistryError::Forward(ForwardError::AlreadyRunning(_)))
        ));
        assert!(matches!(registry.start("nope").await, Err(RegistryError::UnknownService(_))));
        assert!(matches!(registry.start("b").await, Err(RegistryError::NotSelected(_))));
        registry.stop("api").unwrap();
        registry.stop("api").unwrap();
        assert!(running_names(&registry).is_empty());
    }

    #[tokio::test]
    async fn proxy_selection_rebuilds_the_pod() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let cluster = Arc::new(FakeCluster::default());
        let mut registry = registry_with(&config_text(&kubectl), Arc::new(FreePorts), cluster.clone());

        registry
            .apply_proxy_selection(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let report = registry
            .apply_proxy_selection(&["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(report.started, vec!["a", "c"]);
        let pods = registry.pods().unwrap();
        assert_eq!(pods.active_service_names(), vec!["a", "c"]);
        assert_eq!(pods.relay_port("c"), Some(10001));
        assert!(registry.proxy("b").is_none());
        assert_eq!(
            registry.proxy("c").unwrap().command_line().unwrap(),
            format!("{} --context=prod -n default port-forward pod/kubefwd-proxy 16003:10001", kubectl)
        );
        assert_eq!(cluster.runs().len(), 2);

        assert!(matches!(
            registry.apply_proxy_selection(&["zzz".to_string()]).await,
            Err(RegistryError::UnknownProxyService(_))
        ));

        registry.apply_proxy_selection(&[]).await.unwrap();
        assert_eq!(registry.pod_status().unwrap().0, PodStatus::NotCreated);
        assert!(registry.proxy("a").is_none());
        assert!(cluster.state.lock().pod.is_none());
    }

    #[tokio::test]
    async fn preset_replaces_running_direct_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let mut text = config_text(&kubectl);
        text = text.replace("sql_tap_port = 15432\nsql_tap_driver = \"postgres\"\n", "");
        let registry = registry_with(&text, Arc::new(FreePorts), Arc::new(FakeCluster::default()));

        registry.start("db").await.unwrap();
        let report = registry.apply_preset("backend").await.unwrap();
        assert_eq!(report.started, vec!["api"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "missing");
        assert_eq!(running_names(&registry), vec!["api"]);
        assert!(matches!(
            registry.apply_preset("frontend").await,
            Err(RegistryError::UnknownPreset(_))
        ));
        registry.stop("api").unwrap();
    }

    #[tokio::test]
    async fn reload_restarts_surviving_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let mut registry = registry_with(
            &config_text(&kubectl),
            Arc::new(FreePorts),
            Arc::new(FakeCluster::default()),
        );
        registry.start("api").await.unwrap();
        registry
            .apply_proxy_selection(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let trimmed = config_text(&kubectl).replace(
            "[[proxy_services]]\nname = \"b\"\ntarget_host = \"10.0.0.2\"\ntarget_port = 5432\nlocal_port = 16002\n",
            "",
        );
        let report = registry.reload(parse_config(&trimmed).unwrap()).await;
        assert_eq!(report.started, vec!["api", "a"]);
        assert_eq!(running_names(&registry), vec!["api", "a"]);
        assert_eq!(registry.pods().unwrap().active_service_names(), vec!["a"]);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn context_switch_rebuilds_against_new_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let cluster = Arc::new(FakeCluster::default());
        let mut registry = registry_with(&config_text(&kubectl), Arc::new(FreePorts), cluster.clone());
        registry.start("api").await.unwrap();

        registry.switch_context("Staging").await.unwrap();
        assert!(running_names(&registry).is_empty());
        assert!(cluster.state.lock().deletes.is_empty());
        assert_eq!(registry.config().display_name(), "Staging");
        assert_eq!(registry.direct()[0].spec().context, "staging");
        assert_eq!(registry.pods().unwrap().identity().context, "staging");
        assert!(matches!(
            registry.switch_context("Nope").await,
            Err(RegistryError::UnknownContext(_))
        ));
    }

    #[tokio::test]
    async fn only_a_created_pod_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let cluster = Arc::new(FakeCluster::default());
        let mut registry = registry_with(&config_text(&kubectl), Arc::new(FreePorts), cluster.clone());

        registry.stop_all().await;
        assert!(cluster.state.lock().deletes.is_empty());

        registry.apply_proxy_selection(&["a".to_string()]).await.unwrap();
        let before = cluster.state.lock().deletes.len();
        registry.switch_context("Staging").await.unwrap();
        assert!(cluster.state.lock().deletes.len() > before);
        assert!(cluster.state.lock().pod.is_none());

        let after = cluster.state.lock().deletes.len();
        registry.switch_context("Staging").await.unwrap();
        assert_eq!(cluster.state.lock().deletes.len(), after);
    }

    #[tokio::test]
    async fn managed_owners_are_not_killed() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = sleeping_kubectl(dir.path());
        let registry = registry_with(
            &config_text(&kubectl),
            Arc::new(FreePorts),
            Arc::new(FakeCluster::default()),
        );
        registry.start("api").await.unwrap();
        let pid = registry.direct()[0].pid().unwrap();

        let inspecting = registry_with(
            &config_text(&kubectl),
            Arc::new(HeldBy(pid)),
            Arc::new(FakeCluster::default()),
        );
        assert!(!inspecting.conflict_info(18080).is_managed);

        let info = Registry {
            inspector: Arc::new(HeldBy(pid)),
            ..registry
        };
        assert!(info.conflict_info(18080).is_managed);
        assert!(matches!(info.kill_port_owner(18080), Err(RegistryError::ManagedPid(p)) if p == pid));
        info.stop("api").unwrap();

        let free = registry_with(
            &config_text(&kubectl),
            Arc::new(FreePorts),
            Arc::new(FakeCluster::default()),
        );
        assert!(matches!(free.kill_port_owner(18080), Err(RegistryError::PortFree(18080))));
    }

    #[tokio::test]
    async fn configured_ports_include_taps() {
        let registry = registry_with(
            &config_text("kubectl"),
            Arc::new(FreePorts),
            Arc::new(FakeCluster::default()),
        );
        let ports: Vec<(u16, PortRole)> = registry
            .configured_ports()
            .into_iter()
            .map(|p| (p.port, p.role))
            .collect();
        assert_eq!(
            ports,
            vec![
                (9091, PortRole::Grpc),
                (15432, PortRole::Tap),
                (15433, PortRole::Forward),
                (16001, PortRole::Forward),
                (16002, PortRole::Forward),
                (16003, PortRole::Forward),
                (18080, PortRole::Forward),
            ]
        );
    }
}
