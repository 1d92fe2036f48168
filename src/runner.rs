//! Subprocess execution for supervised forwards.
//!
//! This module spawns the external forwarding tools in their own process group,
//! captures their stderr, and waits for them to exit or be cancelled. Cancelling
//! goes through a staged shutdown: SIGTERM to the whole group, then SIGKILL once
//! the grace period runs out.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::output::{StderrTail, DEFAULT_TAIL_LINES};

/// How long the stderr reader may lag behind the process exit.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// A fully resolved command: program, arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        let rendered: Vec<Cow<'_, str>> = words.map(render_word).collect();
        f.write_str(&rendered.join(" "))
    }
}

// Flags like `--context=prod` stay readable; only words a shell would split get quoted.
fn render_word(word: &str) -> Cow<'_, str> {
    let plain = !word.is_empty()
        && !word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`' | ';' | '&' | '|'));
    if plain {
        Cow::Borrowed(word)
    } else {
        shell_words::quote(word)
    }
}

/// Resolves `program` the way `execvp` would: paths as given, bare names through `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Staged shutdown timing.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    sigterm_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigterm_ms: u64) -> Self {
        Self { sigterm_ms }
    }

    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(3000)
    }
}

/// A spawned subprocess and its captured stderr.
pub struct RunningProcess {
    child: Child,
    pub pid: Option<u32>,
    pub stderr: StderrTail,
    readers: Vec<JoinHandle<()>>,
}

/// How a supervised subprocess ended.
#[derive(Debug)]
pub enum Exit {
    /// The process exited on its own.
    Exited(ExitStatus),
    /// The cancellation token fired and the process was terminated.
    Cancelled,
    /// Waiting on the child failed.
    WaitFailed(std::io::Error),
}

impl Exit {
    pub fn success(&self) -> bool {
        matches!(self, Exit::Exited(status) if status.success())
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Exited(status) => write!(f, "{}", status),
            Exit::Cancelled => f.write_str("cancelled"),
            Exit::WaitFailed(err) => write!(f, "wait failed: {}", err),
        }
    }
}

/// Spawns `command` in a new process group with stdout and stderr captured.
///
/// Must be called from within a tokio runtime.
pub fn spawn(command: &CommandLine) -> std::io::Result<RunningProcess> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let stderr_tail = StderrTail::new(DEFAULT_TAIL_LINES);
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        let program = command.program.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(program = %program, "{}", line);
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let tail = stderr_tail.clone();
        let program = command.program.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(program = %program, "stderr: {}", line);
                tail.push_line(&line);
            }
        }));
    }

    Ok(RunningProcess {
        child,
        pid,
        stderr: stderr_tail,
        readers,
    })
}

impl RunningProcess {
    /// Waits for the process to exit, or terminates it once `cancel` fires.
    ///
    /// Holds no locks; callers run this in the monitor task.
    pub async fn wait(&mut self, cancel: &CancellationToken, shutdown: ShutdownConfig) -> Exit {
        self.wait_then(cancel, shutdown, std::future::ready(())).await
    }

    /// Like `wait`, but a cancelled process is only signalled once `before_terminate` completes.
    pub async fn wait_then<F>(
        &mut self,
        cancel: &CancellationToken,
        shutdown: ShutdownConfig,
        before_terminate: F,
    ) -> Exit
    where
        F: Future<Output = ()>,
    {
        let waited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let exit = match waited {
            Some(Ok(status)) => Exit::Exited(status),
            Some(Err(err)) => Exit::WaitFailed(err),
            None => {
                before_terminate.await;
                self.terminate(shutdown).await;
                Exit::Cancelled
            }
        };
        self.drain_readers().await;
        exit
    }

    async fn terminate(&mut self, shutdown: ShutdownConfig) {
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
        match wait_for_exit(&mut self.child, shutdown.sigterm_timeout()).await {
            Ok(Some(_)) => return,
            Ok(None) => debug!(pid = ?self.pid, "process ignored SIGTERM, killing"),
            Err(err) => warn!(pid = ?self.pid, "waiting after SIGTERM failed: {}", err),
        }
        let _ = self.child.kill().await;
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(STDERR_DRAIN, reader).await.is_err() {
                trace!(pid = ?self.pid, "output reader still open after exit");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // The child leads its own process group, so this reaches kubectl's helpers too.
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

#[cfg(all(test, unix))]
pub(crate) mod scripts {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Writes an executable `sh` script and returns its path.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Lines of a file the scripts append to, empty when it does not exist yet.
    pub fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn command_line_renders_shell_quoted() {
        let cmd = CommandLine::new(
            "kubectl",
            vec!["--context=prod".into(), "-n".into(), "my ns".into()],
        );
        assert_eq!(cmd.to_string(), "kubectl --context=prod -n 'my ns'");
    }

    #[test]
    fn finds_programs_on_path_and_by_path() {
        assert!(find_program("sh").is_some());
        assert!(find_program("/bin/sh").is_some());
        assert!(find_program("/nonexistent/sql-tapd").is_none());
        assert!(find_program("definitely-not-installed-kubefwd").is_none());
    }

    #[tokio::test]
    async fn captures_stderr_of_failed_process() {
        let mut process = spawn(&sh("echo 'bind: address already in use' >&2; exit 3")).unwrap();
        let exit = process
            .wait(&CancellationToken::new(), ShutdownConfig::default())
            .await;
        match exit {
            Exit::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(
            process.stderr.text().as_deref(),
            Some("bind: address already in use")
        );
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let mut process = spawn(&sh("sleep 30")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exit = process.wait(&cancel, ShutdownConfig::new(200)).await;
        assert!(matches!(exit, Exit::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_process_waits_for_the_hook() {
        let mut process = spawn(&sh("sleep 30")).unwrap();
        let pid = process.pid.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let exit = process
            .wait_then(&cancel, ShutdownConfig::new(200), async {
                // Still alive while the hook runs.
                assert_eq!(unsafe { libc::kill(pid as i32, 0) }, 0);
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await;
        assert!(matches!(exit, Exit::Cancelled));
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let cmd = sh("test \"$DATABASE_URL\" = postgresql://127.0.0.1:1").with_env(
            "DATABASE_URL",
            "postgresql://127.0.0.1:1",
        );
        let mut process = spawn(&cmd).unwrap();
        let exit = process
            .wait(&CancellationToken::new(), ShutdownConfig::default())
            .await;
        assert!(exit.success());
    }
}
