//! Configuration management for kubefwd.
//!
//! This module defines the structure of the `~/.kubefwd.toml` configuration
//! file, loads and validates it, and turns its records into `ServiceSpec`s
//! with every per-service override resolved.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::kubectl::PodIdentity;
use crate::proxypod::PodTimings;
use crate::runner::ShutdownConfig;
use crate::service::{
    resolve_retries, resolve_str, ServiceSpec, TapDriver, TapSpec, Target, UNLIMITED_RETRIES,
};

const CONFIG_FILE: &str = ".kubefwd.toml";
const DEFAULT_POD_NAME: &str = "kubefwd-proxy";
const DEFAULT_POD_IMAGE: &str = "alpine/socat:latest";
const FIRST_GRPC_PORT: u16 = 9091;

/// Top-level configuration structure corresponding to `~/.kubefwd.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// Default kubectl context.
    #[serde(default)]
    pub cluster_context: String,
    /// Display name of the cluster.
    pub cluster_name: Option<String>,
    /// Default namespace.
    #[serde(default)]
    pub namespace: String,
    /// Global retry ceiling (`-1` unlimited, `0` disabled); unlimited when absent.
    pub max_retries: Option<i32>,
    pub proxy_pod_name: Option<String>,
    pub proxy_pod_image: Option<String>,
    /// Context of the proxy pod; follows `cluster_context` when absent.
    pub proxy_pod_context: Option<String>,
    /// Namespace of the proxy pod; follows `namespace` when absent.
    pub proxy_pod_namespace: Option<String>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub alternative_contexts: Vec<AlternativeContext>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub proxy_services: Vec<ProxyServiceConfig>,
}

/// Paths of the external programs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ToolsConfig {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default = "default_sql_tapd")]
    pub sql_tapd: String,
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_sql_tapd() -> String {
    "sql-tapd".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            sql_tapd: default_sql_tapd(),
        }
    }
}

/// Another cluster the operator can switch to.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AlternativeContext {
    pub name: String,
    pub context: String,
}

/// A named set of direct services started together.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub services: Vec<String>,
}

/// A Kubernetes service forwarded with `kubectl port-forward service/...`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub selected_by_default: bool,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub max_retries: Option<i32>,
    #[serde(flatten)]
    pub tap: TapConfig,
}

/// A host reachable from inside the cluster, relayed through the proxy pod.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxyServiceConfig {
    pub name: String,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub selected_by_default: bool,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub max_retries: Option<i32>,
    #[serde(flatten)]
    pub tap: TapConfig,
}

/// Optional SQL tap in front of a forward.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TapConfig {
    pub sql_tap_port: Option<u16>,
    pub sql_tap_driver: Option<String>,
    pub sql_tap_grpc_port: Option<u16>,
    pub sql_tap_database_url: Option<String>,
}

impl TapConfig {
    fn validate(&self, label: &str, local_port: u16) -> Result<()> {
        let Some(port) = self.sql_tap_port else {
            return Ok(());
        };
        if port == 0 {
            bail!("{}: invalid sql_tap_port", label);
        }
        if port == local_port {
            bail!("{}: sql_tap_port cannot be the same as local_port", label);
        }
        match self.sql_tap_driver.as_deref() {
            None | Some("") => bail!("{}: sql_tap_driver is required when sql_tap_port is set", label),
            Some(driver) if TapDriver::parse(driver).is_none() => {
                bail!("{}: sql_tap_driver must be 'postgres' or 'mysql'", label)
            }
            Some(_) => {}
        }
        if self.sql_tap_grpc_port == Some(0) {
            bail!("{}: invalid sql_tap_grpc_port", label);
        }
        Ok(())
    }

    fn spec(&self) -> Option<TapSpec> {
        let listen_port = self.sql_tap_port?;
        let driver = TapDriver::parse(self.sql_tap_driver.as_deref()?)?;
        Some(TapSpec {
            driver,
            listen_port,
            grpc_port: self.sql_tap_grpc_port?,
            database_url: self.sql_tap_database_url.clone().filter(|u| !u.is_empty()),
        })
    }
}

/// Runtime knobs shared by every supervisor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kubectl: String,
    pub sql_tapd: String,
    /// Logs every spawned command line at info level.
    pub debug: bool,
    /// Delay between a forward's spawn and its tap's start.
    pub tap_settle: Duration,
    pub shutdown: ShutdownConfig,
    pub pod_timings: PodTimings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            sql_tapd: default_sql_tapd(),
            debug: false,
            tap_settle: Duration::from_secs(2),
            shutdown: ShutdownConfig::default(),
            pod_timings: PodTimings::default(),
        }
    }
}

impl Settings {
    pub fn from_config(config: &Config, debug: bool) -> Self {
        Self {
            kubectl: config.tools.kubectl.clone(),
            sql_tapd: config.tools.sql_tapd.clone(),
            debug,
            ..Self::default()
        }
    }
}

/// `$HOME`, or `%USERPROFILE%` on Windows.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// `~/.kubefwd.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(CONFIG_FILE))
}

/// Loads, validates and normalises the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parses and normalises configuration text.
pub fn parse_config(raw: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(raw).context("failed to parse config")?;
    config.validate()?;
    config.services.sort_by(|a, b| a.name.cmp(&b.name));
    config.proxy_services.sort_by(|a, b| a.name.cmp(&b.name));
    config.assign_grpc_ports();
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.cluster_context.is_empty() {
            bail!("cluster_context is required");
        }
        if self.namespace.is_empty() {
            bail!("namespace is required");
        }
        if self.services.is_empty() && self.proxy_services.is_empty() {
            bail!("at least one service or proxy service must be defined");
        }

        let mut names = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            if svc.name.is_empty() {
                bail!("service {}: name is required", i);
            }
            let label = format!("service {} ({})", i, svc.name);
            if !names.insert(svc.name.as_str()) {
                bail!("{}: duplicate service name", label);
            }
            if svc.service_name.is_empty() {
                bail!("{}: service_name is required", label);
            }
            if svc.remote_port == 0 {
                bail!("{}: invalid remote_port", label);
            }
            if svc.local_port == 0 {
                bail!("{}: invalid local_port", label);
            }
            svc.tap.validate(&label, svc.local_port)?;
        }

        let mut names = HashSet::new();
        for (i, svc) in self.proxy_services.iter().enumerate() {
            if svc.name.is_empty() {
                bail!("proxy_service {}: name is required", i);
            }
            let label = format!("proxy_service {} ({})", i, svc.name);
            if !names.insert(svc.name.as_str()) {
                bail!("{}: duplicate proxy service name", label);
            }
            if svc.target_host.is_empty() {
                bail!("{}: target_host is required", label);
            }
            if svc.target_port == 0 {
                bail!("{}: invalid target_port", label);
            }
            if svc.local_port == 0 {
                bail!("{}: invalid local_port", label);
            }
            svc.tap.validate(&label, svc.local_port)?;
        }

        for preset in &self.presets {
            if preset.name.is_empty() {
                bail!("preset name is required");
            }
        }
        for alt in &self.alternative_contexts {
            if alt.name.is_empty() || alt.context.is_empty() {
                bail!("alternative_contexts entries need a name and a context");
            }
        }
        Ok(())
    }

    /// Gives every tapped service without an explicit gRPC port the next free one.
    fn assign_grpc_ports(&mut self) {
        let mut next = FIRST_GRPC_PORT;
        let taps = self
            .services
            .iter_mut()
            .map(|s| &mut s.tap)
            .chain(self.proxy_services.iter_mut().map(|s| &mut s.tap));
        for tap in taps.filter(|t| t.sql_tap_port.is_some()) {
            match tap.sql_tap_grpc_port {
                Some(port) if port >= next => next = port.saturating_add(1),
                Some(_) => {}
                None => {
                    tap.sql_tap_grpc_port = Some(next);
                    next = next.saturating_add(1);
                }
            }
        }
    }

    pub fn effective_max_retries(&self) -> i32 {
        self.max_retries.unwrap_or(UNLIMITED_RETRIES)
    }

    pub fn display_name(&self) -> &str {
        self.cluster_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.cluster_context)
    }

    pub fn pod_identity(&self) -> PodIdentity {
        PodIdentity {
            name: resolve_str(self.proxy_pod_name.as_deref(), DEFAULT_POD_NAME),
            image: resolve_str(self.proxy_pod_image.as_deref(), DEFAULT_POD_IMAGE),
            context: resolve_str(self.proxy_pod_context.as_deref(), &self.cluster_context),
            namespace: resolve_str(self.proxy_pod_namespace.as_deref(), &self.namespace),
        }
    }

    pub fn direct_specs(&self) -> Vec<ServiceSpec> {
        let retries = self.effective_max_retries();
        self.services
            .iter()
            .map(|svc| ServiceSpec {
                name: svc.name.clone(),
                target: Target::Direct {
                    service_name: svc.service_name.clone(),
                    remote_port: svc.remote_port,
                },
                local_port: svc.local_port,
                context: resolve_str(svc.context.as_deref(), &self.cluster_context),
                namespace: resolve_str(svc.namespace.as_deref(), &self.namespace),
                max_retries: resolve_retries(svc.max_retries, retries),
                selected_by_default: svc.selected_by_default,
                tap: svc.tap.spec(),
            })
            .collect()
    }

    pub fn proxy_specs(&self) -> Vec<ServiceSpec> {
        let retries = self.effective_max_retries();
        self.proxy_services
            .iter()
            .map(|svc| ServiceSpec {
                name: svc.name.clone(),
                target: Target::Proxy {
                    target_host: svc.target_host.clone(),
                    target_port: svc.target_port,
                },
                local_port: svc.local_port,
                context: resolve_str(svc.context.as_deref(), &self.cluster_context),
                namespace: resolve_str(svc.namespace.as_deref(), &self.namespace),
                max_retries: resolve_retries(svc.max_retries, retries),
                selected_by_default: svc.selected_by_default,
                tap: svc.tap.spec(),
            })
            .collect()
    }

    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }

    pub fn alternative_context(&self, name: &str) -> Option<&AlternativeContext> {
        self.alternative_contexts.iter().find(|c| c.name == name)
    }

    /// Points the cluster context and name at an alternative context.
    ///
    /// Returns `false` and leaves the configuration untouched when `name` is unknown.
    pub fn use_alternative_context(&mut self, name: &str) -> bool {
        let Some(alternative) = self.alternative_context(name).cloned() else {
            return false;
        };
        self.cluster_context = alternative.context;
        self.cluster_name = Some(alternative.name);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cluster_context = "prod"
cluster_name = "Production"
namespace = "default"
max_retries = 5

[tools]
kubectl = "/usr/local/bin/kubectl"

[[alternative_contexts]]
name = "Staging"
context = "staging"

[[presets]]
name = "backend"
services = ["db", "api"]

[[services]]
name = "db"
service_name = "postgres"
remote_port = 5432
local_port = 5433
selected_by_default = true
namespace = "data"
max_retries = 0
sql_tap_port = 5432
sql_tap_driver = "postgres"

[[services]]
name = "api"
service_name = "api"
remote_port = 80
local_port = 8080
context = "prod-eu"

[[proxy_services]]
name = "mysql"
target_host = "10.0.0.7"
target_port = 3306
local_port = 3307
sql_tap_port = 3306
sql_tap_driver = "mysql"
sql_tap_grpc_port = 9200

[[proxy_services]]
name = "cloudsql"
target_host = "10.0.0.5"
target_port = 5432
local_port = 6543
sql_tap_port = 6544
sql_tap_driver = "postgres"
"#;

    #[test]
    fn parses_and_resolves_overrides() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.display_name(), "Production");
        assert_eq!(config.tools.kubectl, "/usr/local/bin/kubectl");
        assert_eq!(config.tools.sql_tapd, "sql-tapd");

        let direct = config.direct_specs();
        let names: Vec<_> = direct.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db"]);
        assert_eq!(direct[0].context, "prod-eu");
        assert_eq!(direct[0].namespace, "default");
        assert_eq!(direct[0].max_retries, 5);
        assert!(direct[0].tap.is_none());
        assert_eq!(direct[1].namespace, "data");
        assert_eq!(direct[1].max_retries, 0);
        assert!(direct[1].selected_by_default);

        let identity = config.pod_identity();
        assert_eq!(identity.name, "kubefwd-proxy");
        assert_eq!(identity.image, "alpine/socat:latest");
        assert_eq!(identity.context, "prod");
        assert_eq!(identity.namespace, "default");
    }

    #[test]
    fn grpc_ports_skip_past_explicit_ones() {
        let config = parse_config(SAMPLE).unwrap();
        let direct = config.direct_specs();
        let db_tap = direct[1].tap.as_ref().unwrap();
        assert_eq!(db_tap.grpc_port, 9091);
        assert_eq!(db_tap.driver, TapDriver::Postgres);

        // Sorted: cloudsql (auto) comes before mysql (explicit 9200).
        let proxies = config.proxy_specs();
        assert_eq!(proxies[0].name, "cloudsql");
        assert_eq!(proxies[0].tap.as_ref().unwrap().grpc_port, 9092);
        assert_eq!(proxies[1].tap.as_ref().unwrap().grpc_port, 9200);
    }

    #[test]
    fn missing_retries_means_unlimited() {
        let config = parse_config(
            r#"
cluster_context = "prod"
namespace = "default"
[[proxy_services]]
name = "cloudsql"
target_host = "10.0.0.5"
target_port = 5432
local_port = 6543
"#,
        )
        .unwrap();
        assert_eq!(config.effective_max_retries(), -1);
        assert_eq!(config.proxy_specs()[0].max_retries, -1);
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            ("namespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 1", "cluster_context is required"),
            ("cluster_context = \"c\"\nnamespace = \"x\"", "at least one service"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nremote_port = 1\nlocal_port = 1", "service_name is required"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 0", "invalid local_port"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 5\nsql_tap_port = 5\nsql_tap_driver = \"postgres\"", "cannot be the same as local_port"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 5\nsql_tap_port = 6", "sql_tap_driver is required"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 5\nsql_tap_port = 6\nsql_tap_driver = \"sqlite\"", "must be 'postgres' or 'mysql'"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[proxy_services]]\nname = \"p\"\ntarget_port = 1\nlocal_port = 2", "target_host is required"),
            ("cluster_context = \"c\"\nnamespace = \"x\"\n[[services]]\nname = \"a\"\nservice_name = \"a\"\nremote_port = 1\nlocal_port = 2\n[[services]]\nname = \"a\"\nservice_name = \"b\"\nremote_port = 1\nlocal_port = 3", "duplicate service name"),
        ];
        for (raw, expected) in cases {
            let err = parse_config(raw).unwrap_err();
            assert!(
                format!("{:#}", err).contains(expected),
                "{:?} did not mention {:?}",
                err,
                expected
            );
        }
    }

    #[test]
    fn load_config_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubefwd.toml");
        std::fs::write(&path, "cluster_context = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("kubefwd.toml"));

        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.preset("backend").unwrap().services, vec!["db", "api"]);
        assert_eq!(config.alternative_context("Staging").unwrap().context, "staging");
    }

    #[test]
    fn alternative_context_replaces_the_default_cluster() {
        let mut config = parse_config(SAMPLE).unwrap();
        assert!(!config.use_alternative_context("Nope"));
        assert_eq!(config.cluster_context, "prod");

        assert!(config.use_alternative_context("Staging"));
        assert_eq!(config.display_name(), "Staging");
        assert_eq!(config.pod_identity().context, "staging");
        let contexts: Vec<String> = config.direct_specs().into_iter().map(|s| s.context).collect();
        assert_eq!(contexts, vec!["prod-eu", "staging"]);
    }
}
