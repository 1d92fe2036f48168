//! kubefwd: keeps a set of `kubectl port-forward` sessions alive.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads `~/.kubefwd.toml`, starts the selected forwards and then
//! runs headless, logging state changes until it receives SIGINT or SIGTERM.
//! SIGHUP reloads the configuration file.

mod config;
mod forward;
mod kubectl;
mod lifecycle;
mod output;
mod pidfile;
mod ports;
mod proxypod;
mod registry;
mod runner;
mod service;
mod sqltap;

use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{default_config_path, load_config, Config, Settings};
use crate::kubectl::Kubectl;
use crate::ports::{port_usage, SystemInspector};
use crate::proxypod::PodStatus;
use crate::registry::{BatchReport, ForwardView, PortRole, Registry};
use crate::service::ForwardStatus;

/// How long start-up waits for every forward to leave `Starting`.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "kubefwd",
    version,
    about = "Supervised kubectl port-forwards with a shared proxy pod",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the configuration file (default: ~/.kubefwd.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log every spawned command line.
    #[arg(long, global = true)]
    debug: bool,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Also append logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Start the direct services marked selected_by_default.
    #[arg(long)]
    default: bool,
    /// Select the proxy services marked selected_by_default.
    #[arg(long)]
    default_proxy: bool,
    /// Start every direct service.
    #[arg(long, conflicts_with_all = ["default", "preset"])]
    all: bool,
    /// Start the direct services listed by a preset.
    #[arg(long, conflicts_with = "default")]
    preset: Option<String>,
    /// Start a direct service by name (repeatable).
    #[arg(short, long = "service", value_name = "NAME")]
    services: Vec<String>,
    /// Select a proxy service by name (repeatable).
    #[arg(short, long = "proxy", value_name = "NAME", conflicts_with = "default_proxy")]
    proxies: Vec<String>,
    /// Switch to one of the configured alternative contexts first.
    #[arg(long, value_name = "NAME")]
    context: Option<String>,
}

impl Cli {
    fn has_selection(&self) -> bool {
        self.default
            || self.default_proxy
            || self.all
            || self.preset.is_some()
            || !self.services.is_empty()
            || !self.proxies.is_empty()
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show every configured local port and what currently listens on it.
    Ports,
    /// Stop the running headless instance.
    Stop,
    /// Send SIGTERM to the foreign process holding a local port.
    Kill {
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    match cli.command {
        Some(Commands::Ports) => show_ports(&cli).await,
        Some(Commands::Stop) => stop_instance(),
        Some(Commands::Kill { port }) => kill_port(&cli, port),
        None => run(&cli).await,
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let level = match (cli.verbose, cli.debug) {
        (0, false) => "kubefwd=info",
        (0, true) | (1, _) => "kubefwd=debug",
        _ => "kubefwd=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => default_config_path().context("could not determine the home directory"),
    }
}

fn build_registry(config: Config, debug: bool) -> Registry {
    let settings = Settings::from_config(&config, debug);
    let cluster = Arc::new(Kubectl::new(settings.kubectl.clone()));
    Registry::new(config, Arc::new(settings), Arc::new(SystemInspector), cluster)
}

/// Runs the start-up checks against every context the forwards will use.
async fn preflight(registry: &Registry, program: &str) -> Result<()> {
    kubectl::check_available(program)
        .await
        .with_context(|| format!("{} is not usable", program))?;
    let config = registry.config();
    let mut contexts: BTreeSet<String> = config
        .direct_specs()
        .into_iter()
        .map(|spec| spec.context)
        .collect();
    contexts.insert(config.cluster_context.clone());
    if !config.proxy_services.is_empty() {
        contexts.insert(config.pod_identity().context);
    }
    for context in contexts {
        kubectl::validate_context(program, &context)
            .await
            .with_context(|| format!("context {} is not available", context))?;
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let path = config_path(cli)?;
    let mut config = load_config(&path)?;
    if let Some(name) = &cli.context {
        if !config.use_alternative_context(name) {
            bail!("unknown context {} (see alternative_contexts in {})", name, path.display());
        }
    }
    let kubectl = config.tools.kubectl.clone();

    let pid_path = pidfile::default_path().context("could not determine the home directory")?;
    pidfile::ensure_vacant(&pid_path)?;

    let mut signals = SignalListener::new()?;
    let mut registry = build_registry(config, cli.debug);
    preflight(&registry, &kubectl).await?;
    info!(
        cluster = %registry.config().display_name(),
        config = %path.display(),
        "starting forwards"
    );

    let report = start_selected(&mut registry, cli).await;
    for (name, reason) in &report.failed {
        error!(service = %name, "{}", reason);
    }
    if report.started.is_empty() {
        registry.stop_all().await;
        bail!("no forwards started");
    }

    match registry.wait_until_settled(SETTLE_TIMEOUT).await {
        Ok(settled) => info!(running = settled.running, failed = settled.failed, "forwards settled"),
        Err(err) => warn!("{}", err),
    }
    pidfile::write(&pid_path, std::process::id())?;

    let mut seen = StateLog::default();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => seen.record(&registry),
            control = signals.next() => match control {
                Control::Shutdown(signal) => {
                    info!(signal, "shutting down");
                    break;
                }
                Control::Reload => reload(&mut registry, &path, cli.context.as_deref()).await,
            },
        }
    }

    registry.stop_all().await;
    pidfile::remove(&pid_path)?;
    Ok(())
}

async fn start_selected(registry: &mut Registry, cli: &Cli) -> BatchReport {
    let mut report = BatchReport::default();
    let defaults = !cli.has_selection();

    if cli.all {
        report.merge(registry.start_all().await);
    }
    if cli.default || defaults {
        report.merge(registry.start_defaults().await);
    }
    if let Some(preset) = &cli.preset {
        match registry.apply_preset(preset).await {
            Ok(batch) => report.merge(batch),
            Err(err) => report.failed.push((preset.clone(), err.to_string())),
        }
    }
    for name in &cli.services {
        match registry.start(name).await {
            Ok(()) => report.started.push(name.clone()),
            Err(err) => report.failed.push((name.clone(), err.to_string())),
        }
    }

    let proxies = if cli.default_proxy || defaults {
        registry.start_default_proxies().await
    } else if !cli.proxies.is_empty() {
        registry.apply_proxy_selection(&cli.proxies).await
    } else {
        Ok(BatchReport::default())
    };
    match proxies {
        Ok(batch) => report.merge(batch),
        Err(err) => report.failed.push(("proxy pod".to_string(), err.to_string())),
    }
    report
}

/// Re-reads the configuration, keeping the `--context` choice made at start-up.
async fn reload(registry: &mut Registry, path: &Path, context: Option<&str>) {
    let mut config = match load_config(path) {
        Ok(config) => config,
        Err(err) => {
            error!("reload skipped: {:#}", err);
            return;
        }
    };
    if let Some(name) = context {
        if !config.use_alternative_context(name) {
            error!("reload skipped: context {} no longer configured", name);
            return;
        }
    }
    let report = registry.reload(config).await;
    for (name, reason) in &report.failed {
        error!(service = %name, "{}", reason);
    }
}

async fn show_ports(cli: &Cli) -> Result<()> {
    let config = load_config(&config_path(cli)?)?;
    let registry = build_registry(config, cli.debug);
    let configured = registry.configured_ports();
    if configured.is_empty() {
        println!("no ports configured");
        return Ok(());
    }

    let usage = tokio::task::spawn_blocking({
        let ports: Vec<u16> = configured.iter().map(|p| p.port).collect();
        move || ports.into_iter().map(port_usage).collect::<Vec<_>>()
    })
    .await
    .context("port inspection panicked")?;

    let width = configured
        .iter()
        .map(|p| p.service.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    println!(
        "{:<6} {:<width$} {:<7} {:<8} STATUS",
        "PORT",
        "SERVICE",
        "KIND",
        "ROLE",
        width = width
    );
    for (entry, usage) in configured.iter().zip(usage) {
        let status = if usage.in_use {
            format!("in use: {}", usage.description)
        } else {
            "free".to_string()
        };
        println!(
            "{:<6} {:<width$} {:<7} {:<8} {}",
            entry.port,
            entry.service,
            entry.kind,
            role_label(entry.role),
            status,
            width = width
        );
    }
    Ok(())
}

fn role_label(role: PortRole) -> &'static str {
    match role {
        PortRole::Forward => "forward",
        PortRole::Tap => "sql-tap",
        PortRole::Grpc => "grpc",
    }
}

fn kill_port(cli: &Cli, port: u16) -> Result<()> {
    let config = load_config(&config_path(cli)?)?;
    let registry = build_registry(config, cli.debug);
    let info = registry.conflict_info(port);
    if let Some(command) = &info.command {
        println!("port {} is held by: {}", port, command);
    }
    let pid = registry.kill_port_owner(port)?;
    println!("sent SIGTERM to PID {}", pid);
    Ok(())
}

fn stop_instance() -> Result<()> {
    let path = pidfile::default_path().context("could not determine the home directory")?;
    let pid = pidfile::stop_running(&path)?;
    println!("sent SIGTERM to kubefwd (PID {})", pid);
    Ok(())
}

enum Control {
    Shutdown(&'static str),
    Reload,
}

/// Signal streams registered before any subprocess is spawned.
struct SignalListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl SignalListener {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?,
            hangup: signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.interrupt.recv() => Control::Shutdown("SIGINT"),
            _ = self.terminate.recv() => Control::Shutdown("SIGTERM"),
            _ = self.hangup.recv() => Control::Reload,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> Control {
        let _ = tokio::signal::ctrl_c().await;
        Control::Shutdown("Ctrl-C")
    }
}

/// Last logged state per forward, so each poll only reports changes.
#[derive(Default)]
struct StateLog {
    forwards: HashMap<String, ForwardView>,
    pod: Option<(PodStatus, String)>,
}

impl StateLog {
    fn record(&mut self, registry: &Registry) {
        for view in registry.snapshot() {
            if self.forwards.get(&view.name).map_or(true, |old| changed(old, &view)) {
                if view.status == ForwardStatus::Error {
                    warn!("{}", describe(&view));
                    if let Some(command) = &view.command {
                        debug!(service = %view.name, "command: {}", command);
                    }
                } else {
                    info!("{}", describe(&view));
                }
            }
            self.forwards.insert(view.name.clone(), view);
        }
        if let Some((status, message, relays)) = registry.pod_status() {
            let current = Some((status, message));
            if current != self.pod {
                match &current {
                    Some((PodStatus::Error, message)) => warn!(relays, "proxy pod error: {}", message),
                    Some((status, _)) => info!(relays, "proxy pod {}", status),
                    None => {}
                }
                self.pod = current;
            }
        }
    }
}

fn changed(old: &ForwardView, new: &ForwardView) -> bool {
    old.status != new.status
        || old.error != new.error
        || old.tap.as_ref().map(|t| (t.status, &t.error)) != new.tap.as_ref().map(|t| (t.status, &t.error))
}

/// One log line for a forward, e.g. `db (Direct) localhost:5433 running pid=812`.
fn describe(view: &ForwardView) -> String {
    let mut line = format!(
        "{} ({}) localhost:{} {}",
        view.name, view.kind, view.local_port, view.status
    );
    if let Some(pid) = view.pid {
        line.push_str(&format!(" pid={}", pid));
    }
    if !view.error.is_empty() {
        line.push_str(&format!(": {}", view.error));
    }
    if let Some(tap) = &view.tap {
        line.push_str(&format!(
            " | sql-tap :{} grpc :{} {}",
            tap.listen_port, tap.grpc_port, tap.status
        ));
        if !tap.error.is_empty() {
            line.push_str(&format!(": {}", tap.error));
        }
    }
    line
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TapView;
    use crate::service::RetryInfo;

    fn view(status: ForwardStatus, error: &str) -> ForwardView {
        ForwardView {
            name: "db".to_string(),
            kind: "Direct",
            local_port: 5433,
            status,
            error: error.to_string(),
            retry: RetryInfo {
                retrying: false,
                attempt: 0,
                max: -1,
            },
            pid: None,
            command: None,
            tap: None,
        }
    }

    #[test]
    fn cli_defaults_to_selected_services() {
        let cli = Cli::try_parse_from(["kubefwd"]).unwrap();
        assert!(!cli.has_selection());
        let cli = Cli::try_parse_from(["kubefwd", "-s", "api", "--service", "db", "-p", "cloudsql"]).unwrap();
        assert_eq!(cli.services, vec!["api", "db"]);
        assert_eq!(cli.proxies, vec!["cloudsql"]);
        assert!(cli.has_selection());
    }

    #[test]
    fn cli_rejects_conflicting_selection() {
        assert!(Cli::try_parse_from(["kubefwd", "--all", "--default"]).is_err());
        assert!(Cli::try_parse_from(["kubefwd", "--default-proxy", "-p", "a"]).is_err());
        let cli = Cli::try_parse_from(["kubefwd", "ports", "--config", "/tmp/k.toml", "-vv"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Ports)));
        assert_eq!(cli.verbose, 2);
        let cli = Cli::try_parse_from(["kubefwd", "kill", "5433"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Kill { port: 5433 })));
    }

    #[test]
    fn describe_includes_pid_error_and_tap() {
        let mut running = view(ForwardStatus::Running, "");
        running.pid = Some(812);
        running.tap = Some(TapView {
            listen_port: 5432,
            grpc_port: 9091,
            status: ForwardStatus::Running,
            error: String::new(),
        });
        assert_eq!(
            describe(&running),
            "db (Direct) localhost:5433 running pid=812 | sql-tap :5432 grpc :9091 running"
        );

        let failed = view(ForwardStatus::Error, "Service not found in proxy pod");
        assert_eq!(
            describe(&failed),
            "db (Direct) localhost:5433 error: Service not found in proxy pod"
        );
    }

    #[test]
    fn only_visible_changes_are_logged() {
        let mut a = view(ForwardStatus::Running, "");
        let mut b = a.clone();
        b.pid = Some(10);
        assert!(!changed(&a, &b));
        b.error = "Connection lost, retrying in 1s (attempt 1/3)...".to_string();
        assert!(changed(&a, &b));
        a.tap = Some(TapView {
            listen_port: 5432,
            grpc_port: 9091,
            status: ForwardStatus::Running,
            error: String::new(),
        });
        let mut c = a.clone();
        c.tap.as_mut().unwrap().status = ForwardStatus::Error;
        assert!(changed(&a, &c));
    }
}
