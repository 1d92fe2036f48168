//! The `kubectl` calls behind the proxy pod and the start-up checks.
//!
//! Pod management goes through the `ClusterClient` trait so the pod manager
//! can be driven by an in-memory cluster in tests. `Kubectl` is the real
//! implementation and shells out with `tokio::process`.

use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::output::sanitize_text;

/// Where the shared proxy pod lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    pub name: String,
    pub image: String,
    pub context: String,
    pub namespace: String,
}

/// Lifecycle phase of the pod as far as readiness goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Missing,
    Pending,
    Ready,
}

/// Graceful deletion returns immediately; forced deletion skips the grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Graceful,
    Force,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("pod {0} already exists")]
    AlreadyExists(String),
    #[error("kubectl {action} failed: {status} | {output}")]
    Command {
        action: &'static str,
        status: String,
        output: String,
    },
    #[error("failed to run kubectl: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse pod JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("context \"{0}\" not found in kubeconfig")]
    UnknownContext(String),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates the pod running `sh -c <shell_command>`.
    async fn run_pod(&self, pod: &PodIdentity, shell_command: &str) -> Result<(), ClusterError>;

    async fn pod_phase(&self, pod: &PodIdentity) -> Result<PodPhase, ClusterError>;

    /// Requests deletion. A missing pod is not an error.
    async fn delete_pod(&self, pod: &PodIdentity, mode: DeleteMode) -> Result<(), ClusterError>;

    /// True while the API server still lists the pod, terminating or not.
    async fn pod_listed(&self, pod: &PodIdentity) -> Result<bool, ClusterError>;

    /// `describe` and `logs` output, for error reports.
    async fn diagnostics(&self, pod: &PodIdentity) -> String;
}

/// `ClusterClient` backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    program: String,
}

impl Kubectl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> std::io::Result<Output> {
        debug!(program = %self.program, args = ?args, "kubectl");
        Command::new(&self.program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
    }

    fn scoped(pod: &PodIdentity, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            format!("--context={}", pod.context),
            "-n".to_string(),
            pod.namespace.clone(),
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    sanitize_text(text.trim())
}

fn command_error(action: &'static str, output: &Output) -> ClusterError {
    ClusterError::Command {
        action,
        status: output.status.to_string(),
        output: combined(output),
    }
}

#[async_trait]
impl ClusterClient for Kubectl {
    async fn run_pod(&self, pod: &PodIdentity, shell_command: &str) -> Result<(), ClusterError> {
        let args = vec![
            format!("--context={}", pod.context),
            "run".to_string(),
            "-n".to_string(),
            pod.namespace.clone(),
            pod.name.clone(),
            format!("--image={}", pod.image),
            "--restart=Never".to_string(),
            "--command".to_string(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            shell_command.to_string(),
        ];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        if combined(&output).contains("AlreadyExists") {
            return Err(ClusterError::AlreadyExists(pod.name.clone()));
        }
        Err(command_error("run", &output))
    }

    async fn pod_phase(&self, pod: &PodIdentity) -> Result<PodPhase, ClusterError> {
        let output = self
            .run(&Self::scoped(pod, &["get", "pod", &pod.name, "-o", "json"]))
            .await?;
        if !output.status.success() {
            if combined(&output).contains("NotFound") {
                return Ok(PodPhase::Missing);
            }
            return Err(command_error("get pod", &output));
        }
        Ok(parse_pod_phase(&String::from_utf8_lossy(&output.stdout))?)
    }

    async fn delete_pod(&self, pod: &PodIdentity, mode: DeleteMode) -> Result<(), ClusterError> {
        let flags: &[&str] = match mode {
            DeleteMode::Graceful => &["--ignore-not-found=true", "--wait=false", "--force"],
            DeleteMode::Force => &["--grace-period=0", "--force", "--ignore-not-found=true"],
        };
        let mut rest = vec!["delete", "pod", pod.name.as_str()];
        rest.extend_from_slice(flags);
        let output = self.run(&Self::scoped(pod, &rest)).await?;
        if output.status.success() || combined(&output).contains("NotFound") {
            Ok(())
        } else {
            Err(command_error("delete pod", &output))
        }
    }

    async fn pod_listed(&self, pod: &PodIdentity) -> Result<bool, ClusterError> {
        let output = self
            .run(&Self::scoped(
                pod,
                &["get", "pod", &pod.name, "--ignore-not-found=true", "--no-headers"],
            ))
            .await?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn diagnostics(&self, pod: &PodIdentity) -> String {
        let describe = self
            .run(&Self::scoped(pod, &["describe", "pod", &pod.name]))
            .await
            .map(|o| combined(&o))
            .unwrap_or_else(|err| format!("describe failed: {}", err));
        let logs = self
            .run(&Self::scoped(pod, &["logs", &pod.name, "--all-containers=true"]))
            .await
            .map(|o| combined(&o))
            .unwrap_or_else(|err| format!("logs failed: {}", err));
        format!("describe: {}\nlogs: {}", describe, logs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PodDocument {
    #[serde(default)]
    status: PodStatusDocument,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatusDocument {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Ready means phase `Running` with condition `Ready=True`.
pub fn parse_pod_phase(json: &str) -> Result<PodPhase, serde_json::Error> {
    let doc: PodDocument = serde_json::from_str(json)?;
    let ready = doc.status.phase == "Running"
        && doc
            .status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True");
    Ok(if ready {
        PodPhase::Ready
    } else {
        PodPhase::Pending
    })
}

/// Fails when `kubectl version --client` cannot run.
pub async fn check_available(program: &str) -> Result<(), ClusterError> {
    let output = Command::new(program)
        .args(["version", "--client"])
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(command_error("version", &output))
    }
}

/// Fails unless `context` is listed by `kubectl config get-contexts -o name`.
pub async fn validate_context(program: &str, context: &str) -> Result<(), ClusterError> {
    let output = Command::new(program)
        .args(["config", "get-contexts", "-o", "name"])
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(command_error("config get-contexts", &output));
    }
    let listed = String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == context);
    if listed {
        Ok(())
    } else {
        Err(ClusterError::UnknownContext(context.to_string()))
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory cluster used by the pod manager and registry tests.

    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub pod: Option<String>,
        pub runs: Vec<String>,
        pub deletes: Vec<DeleteMode>,
        /// Errors returned by upcoming `run_pod` calls, front first.
        pub run_failures: VecDeque<ClusterError>,
        /// Pods never report ready.
        pub never_ready: bool,
        /// `pod_listed` keeps answering true after deletion.
        pub stuck_terminating: bool,
        /// `pod_listed` fails as if the API server were unreachable.
        pub listing_fails: bool,
    }

    #[derive(Debug, Default)]
    pub struct FakeCluster {
        pub state: Mutex<FakeState>,
    }

    impl FakeCluster {
        pub fn runs(&self) -> Vec<String> {
            self.state.lock().runs.clone()
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn run_pod(&self, pod: &PodIdentity, shell_command: &str) -> Result<(), ClusterError> {
            let mut state = self.state.lock();
            state.runs.push(shell_command.to_string());
            if let Some(err) = state.run_failures.pop_front() {
                return Err(err);
            }
            state.pod = Some(pod.name.clone());
            Ok(())
        }

        async fn pod_phase(&self, _pod: &PodIdentity) -> Result<PodPhase, ClusterError> {
            let state = self.state.lock();
            Ok(match (&state.pod, state.never_ready) {
                (None, _) => PodPhase::Missing,
                (Some(_), true) => PodPhase::Pending,
                (Some(_), false) => PodPhase::Ready,
            })
        }

        async fn delete_pod(&self, _pod: &PodIdentity, mode: DeleteMode) -> Result<(), ClusterError> {
            let mut state = self.state.lock();
            state.deletes.push(mode);
            state.pod = None;
            Ok(())
        }

        async fn pod_listed(&self, _pod: &PodIdentity) -> Result<bool, ClusterError> {
            let state = self.state.lock();
            if state.listing_fails {
                return Err(ClusterError::Command {
                    action: "get pod",
                    status: "exit status: 1".to_string(),
                    output: "Unable to connect to the server".to_string(),
                });
            }
            Ok(state.pod.is_some() || state.stuck_terminating)
        }

        async fn diagnostics(&self, pod: &PodIdentity) -> String {
            format!("describe: pod {} ContainerCreating", pod.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_needs_running_phase_and_condition() {
        let ready = r#"{"status":{"phase":"Running","conditions":[{"type":"Initialized","status":"True"},{"type":"Ready","status":"True"}]}}"#;
        assert_eq!(parse_pod_phase(ready).unwrap(), PodPhase::Ready);

        let not_ready = r#"{"status":{"phase":"Running","conditions":[{"type":"Ready","status":"False"}]}}"#;
        assert_eq!(parse_pod_phase(not_ready).unwrap(), PodPhase::Pending);

        let pending = r#"{"status":{"phase":"Pending"}}"#;
        assert_eq!(parse_pod_phase(pending).unwrap(), PodPhase::Pending);

        assert!(parse_pod_phase("not json").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn context_validation_reads_listed_contexts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubectl");
        std::fs::write(&path, "#!/bin/sh\nprintf 'dev\\nprod\\n'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let program = path.to_string_lossy().into_owned();

        check_available(&program).await.unwrap();
        validate_context(&program, "prod").await.unwrap();
        assert!(matches!(
            validate_context(&program, "staging").await,
            Err(ClusterError::UnknownContext(ctx)) if ctx == "staging"
        ));
    }
}
