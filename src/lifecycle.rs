//! Lifecycle state machine shared by forward and tap supervisors.
//!
//! A `Lifecycle` records the phase of one supervised subprocess, its retry
//! budget and the `manual_stop` flag. Supervisors keep it behind their state
//! lock and feed it the outcome of every launch attempt; it answers with what
//! to do next (nothing, stop, retry after a delay, or give up).
//!
//! Every launch gets an attempt id. A monitor or backoff task only mutates the
//! phase while its id is still the current one, so a task left over from a
//! stopped or restarted attempt cannot clobber newer state.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::runner::Exit;
use crate::service::{ForwardStatus, RetryInfo, UNLIMITED_RETRIES};

/// Upper bound of the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A run that lasts this long resets the retry counter.
pub const STABLE_RUN: Duration = Duration::from_secs(60);

/// Retry delay for the given number of retries already consumed: `min(2^n, 60)` seconds.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exp = retry_count.min(6);
    let secs = 1_u64 << exp;
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Why a launch is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Requested by the operator or the registry.
    Fresh,
    /// Scheduled by the backoff timer of the given attempt.
    Retry(u64),
}

/// A live subprocess.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub id: u64,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
enum Phase {
    Stopped,
    Starting { id: u64 },
    Running(Attempt),
    Backoff { id: u64, message: String },
    Failed { message: String },
}

/// What the supervisor should do after an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt is stale or was stopped on purpose.
    Ignore,
    /// Clean exit; the forward is now stopped.
    Stopped,
    /// Relaunch attempt `id` after `delay`.
    Retry { id: u64, delay: Duration },
    /// Retries exhausted or disabled; the forward is in terminal error.
    Failed,
}

/// Rejection of a launch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRejected {
    /// A subprocess is already starting or running.
    Active,
    /// The retry was superseded by a stop or a newer start.
    Superseded,
}

/// Phase, retry budget and stop flag of one supervised subprocess.
#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
    retry_count: u32,
    max_retries: i32,
    manual_stop: bool,
    next_id: u64,
    command: Option<String>,
    crash_label: &'static str,
}

impl Lifecycle {
    /// `crash_label` prefixes the backoff message ("Connection lost", "sql-tapd crashed").
    pub fn new(max_retries: i32, crash_label: &'static str) -> Self {
        Self {
            phase: Phase::Stopped,
            retry_count: 0,
            max_retries,
            manual_stop: false,
            next_id: 0,
            command: None,
            crash_label,
        }
    }

    /// Moves to `Starting` and returns the id of the new attempt.
    pub fn begin(&mut self, launch: Launch) -> Result<u64, LaunchRejected> {
        match (&self.phase, launch) {
            (Phase::Starting { .. } | Phase::Running(_), _) => return Err(LaunchRejected::Active),
            (Phase::Backoff { id, .. }, Launch::Retry(retry)) if *id == retry => {}
            (_, Launch::Retry(_)) => return Err(LaunchRejected::Superseded),
            (_, Launch::Fresh) => {
                self.retry_count = 0;
            }
        }
        self.manual_stop = false;
        self.next_id += 1;
        let id = self.next_id;
        self.phase = Phase::Starting { id };
        Ok(id)
    }

    /// True while attempt `id` is starting or running.
    pub fn is_current(&self, id: u64) -> bool {
        match &self.phase {
            Phase::Starting { id: current } => *current == id,
            Phase::Running(attempt) => attempt.id == id,
            _ => false,
        }
    }

    pub fn set_command(&mut self, command: String) {
        self.command = Some(command);
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Records a successful spawn of attempt `id`.
    pub fn running(&mut self, id: u64, pid: Option<u32>, cancel: CancellationToken) {
        if self.is_current(id) {
            self.phase = Phase::Running(Attempt { id, pid, cancel });
        }
    }

    /// Terminal error that must not be retried (port conflict, missing binary, ...).
    ///
    /// Returns the cancellation token of the attempt when it had already spawned.
    pub fn fail_permanently(&mut self, id: u64, message: String) -> Option<CancellationToken> {
        if !self.is_current(id) {
            return None;
        }
        let cancel = match &self.phase {
            Phase::Running(attempt) => Some(attempt.cancel.clone()),
            _ => None,
        };
        self.manual_stop = true;
        self.phase = Phase::Failed { message };
        cancel
    }

    /// The subprocess of attempt `id` could not be spawned.
    ///
    /// A first launch fails outright; a failed relaunch keeps consuming the retry budget.
    pub fn spawn_failed(&mut self, id: u64, launch: Launch, cause: String) -> Decision {
        if !self.is_current(id) {
            return Decision::Ignore;
        }
        match launch {
            Launch::Fresh => {
                let message = self.terminal_message(cause, None);
                self.phase = Phase::Failed { message };
                Decision::Failed
            }
            Launch::Retry(_) => self.failure(cause, None, Duration::ZERO),
        }
    }

    /// Decides what follows the exit of attempt `id`.
    pub fn exited(&mut self, id: u64, exit: &Exit, stderr: Option<&str>, ran_for: Duration) -> Decision {
        let current = matches!(&self.phase, Phase::Running(attempt) if attempt.id == id);
        if !current || self.manual_stop {
            return Decision::Ignore;
        }
        if exit.success() {
            self.phase = Phase::Stopped;
            return Decision::Stopped;
        }
        self.failure(format!("Process exited: {}", exit), stderr, ran_for)
    }

    fn failure(&mut self, cause: String, stderr: Option<&str>, ran_for: Duration) -> Decision {
        if ran_for >= STABLE_RUN {
            self.retry_count = 0;
        }
        if self.should_retry() {
            let delay = backoff_delay(self.retry_count);
            self.retry_count += 1;
            self.next_id += 1;
            let id = self.next_id;
            let message = self.retry_message(delay);
            self.phase = Phase::Backoff { id, message };
            Decision::Retry { id, delay }
        } else {
            let message = self.terminal_message(cause, stderr);
            self.phase = Phase::Failed { message };
            Decision::Failed
        }
    }

    fn should_retry(&self) -> bool {
        !self.manual_stop
            && (self.max_retries == UNLIMITED_RETRIES
                || (self.max_retries > 0 && self.retry_count < self.max_retries as u32))
    }

    fn retry_message(&self, delay: Duration) -> String {
        if self.max_retries == UNLIMITED_RETRIES {
            format!(
                "{}, retrying in {}s (attempt {})...",
                self.crash_label,
                delay.as_secs(),
                self.retry_count
            )
        } else {
            format!(
                "{}, retrying in {}s (attempt {}/{})...",
                self.crash_label,
                delay.as_secs(),
                self.retry_count,
                self.max_retries
            )
        }
    }

    fn terminal_message(&self, cause: String, stderr: Option<&str>) -> String {
        let mut message = cause;
        if let Some(stderr) = stderr {
            message.push_str(&format!(" | stderr: {}", stderr));
        }
        if self.retry_count > 0 {
            message.push_str(&format!(" | Failed after {} retries", self.retry_count));
        }
        if let Some(command) = &self.command {
            message.push_str(&format!(" | Command: {}", command));
        }
        message
    }

    /// Whether `stop` would change anything.
    pub fn is_stoppable(&self) -> bool {
        matches!(
            self.phase,
            Phase::Starting { .. } | Phase::Running(_) | Phase::Backoff { .. }
        )
    }

    /// Stops the subprocess or pending retry.
    ///
    /// Returns `None` when there was nothing to stop, otherwise the cancellation
    /// token of the live attempt (if one had spawned).
    pub fn stop(&mut self) -> Option<Option<CancellationToken>> {
        if !self.is_stoppable() {
            return None;
        }
        let cancel = match &self.phase {
            Phase::Running(attempt) => Some(attempt.cancel.clone()),
            _ => None,
        };
        self.phase = Phase::Stopped;
        self.manual_stop = true;
        Some(cancel)
    }

    /// Puts an idle supervisor into terminal error without a launch.
    pub fn fail_idle(&mut self, message: String) {
        if matches!(self.phase, Phase::Stopped | Phase::Failed { .. }) {
            self.manual_stop = true;
            self.phase = Phase::Failed { message };
        }
    }

    /// Forces the phase back to `Stopped` after an operator resolved a terminal error.
    pub fn reset_failed(&mut self) {
        if matches!(self.phase, Phase::Failed { .. }) {
            self.phase = Phase::Stopped;
        }
    }

    pub fn status(&self) -> (ForwardStatus, String) {
        match &self.phase {
            Phase::Stopped => (ForwardStatus::Stopped, String::new()),
            Phase::Starting { .. } => (ForwardStatus::Starting, String::new()),
            Phase::Running(_) => (ForwardStatus::Running, String::new()),
            Phase::Backoff { message, .. } | Phase::Failed { message } => {
                (ForwardStatus::Error, message.clone())
            }
        }
    }

    pub fn retry_info(&self) -> RetryInfo {
        RetryInfo {
            retrying: matches!(self.phase, Phase::Backoff { .. }),
            attempt: self.retry_count,
            max: self.max_retries,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.phase {
            Phase::Running(attempt) => attempt.pid,
            _ => None,
        }
    }

    pub fn manual_stop(&self) -> bool {
        self.manual_stop
    }
}
