//! Lease expiry through the system `at(1)` queue.
//!
//! Arming is destructive-then-create: every pending job is cancelled before
//! the single new termination job is submitted.

use blueprint_sdk::{info, warn};
use chrono::{DateTime, Local};
use lease_runtime::error::{LeaseError, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::clock::Clock;

/// Time format accepted by `at`.
pub const AT_TIME_FORMAT: &str = "%H:%M %m/%d/%Y";

const SECS_PER_DAY: f64 = 86_400.0;

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Ids of every pending job.
    async fn pending(&self) -> Result<Vec<String>>;

    async fn cancel(&self, job_id: &str) -> Result<()>;

    /// Queue `command` to run at `fire_at`; returns the new job id.
    async fn submit(&self, fire_at: DateTime<Local>, command: &str) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub fire_at: DateTime<Local>,
}

/// Convert a lease length in days into a duration. Rejects non-positive and
/// non-finite values.
pub fn lease_duration(days: f64) -> Result<Duration> {
    if !days.is_finite() || days <= 0.0 {
        return Err(LeaseError::Validation(format!(
            "lease duration must be a positive number of days, got {days}"
        )));
    }
    Duration::try_from_secs_f64(days * SECS_PER_DAY)
        .map_err(|err| LeaseError::Validation(format!("lease duration out of range: {err}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// at(1)
// ─────────────────────────────────────────────────────────────────────────────

/// Parse `atq` output: one job per line, id in the first column.
pub fn parse_atq(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Extract the id from `at`'s `job <id> at <date>` confirmation.
pub fn parse_at_job_id(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some("job"), Some(id)) => Some(id.to_string()),
            _ => None,
        }
    })
}

/// `at` job queue driven through the `atq`, `atrm` and `at` commands.
///
/// Each command is a program plus leading arguments, so wrappers such as
/// `sudo at` are expressible.
#[derive(Clone, Debug)]
pub struct AtJobQueue {
    pub atq: Vec<String>,
    pub atrm: Vec<String>,
    pub at: Vec<String>,
}

impl Default for AtJobQueue {
    fn default() -> Self {
        Self {
            atq: vec!["atq".to_string()],
            atrm: vec!["atrm".to_string()],
            at: vec!["at".to_string()],
        }
    }
}

struct CommandOutput {
    stdout: String,
    stderr: String,
}

async fn run_command(command: &[String], extra: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| LeaseError::Scheduling("empty job queue command".into()))?;

    let mut child = Command::new(program)
        .args(args)
        .args(extra)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| LeaseError::Scheduling(format!("Failed to spawn {program}: {err}")))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|err| LeaseError::Scheduling(format!("Failed to write to {program}: {err}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| LeaseError::Scheduling(format!("Failed to wait for {program}: {err}")))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(LeaseError::Scheduling(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(CommandOutput { stdout, stderr })
}

#[async_trait::async_trait]
impl JobQueue for AtJobQueue {
    async fn pending(&self) -> Result<Vec<String>> {
        let output = run_command(&self.atq, &[], None).await?;
        Ok(parse_atq(&output.stdout))
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        run_command(&self.atrm, &[job_id], None).await?;
        Ok(())
    }

    async fn submit(&self, fire_at: DateTime<Local>, command: &str) -> Result<String> {
        let when = fire_at.format(AT_TIME_FORMAT).to_string();
        let output = run_command(&self.at, &[when.as_str()], Some(&format!("{command}\n"))).await?;
        parse_at_job_id(&output.stderr)
            .or_else(|| parse_at_job_id(&output.stdout))
            .ok_or_else(|| {
                LeaseError::Scheduling(format!(
                    "at did not report a job id: {}",
                    output.stderr.trim()
                ))
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Shell command the expiry job runs.
    pub terminate_command: String,
    pub queue: AtJobQueue,
}

impl SchedulerConfig {
    /// `LEASE_TERMINATE_COMMAND` overrides the job action; the default runs
    /// this executable's `terminate` mode. `LEASE_AT_PREFIX` (e.g. `sudo`) is
    /// prepended to every queue command.
    pub fn from_env() -> Self {
        let terminate_command = std::env::var("LEASE_TERMINATE_COMMAND")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| {
                std::env::current_exe()
                    .map(|exe| format!("{} terminate", shell_quote(&exe.display().to_string())))
                    .unwrap_or_else(|_| "lease-node terminate".to_string())
            });

        let prefix: Vec<String> = std::env::var("LEASE_AT_PREFIX")
            .ok()
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let with_prefix = |program: &str| {
            let mut command = prefix.clone();
            command.push(program.to_string());
            command
        };

        Self {
            terminate_command,
            queue: AtJobQueue {
                atq: with_prefix("atq"),
                atrm: with_prefix("atrm"),
                at: with_prefix("at"),
            },
        }
    }
}

/// Single-quote `value` for `/bin/sh`, the shell `at` runs jobs with.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub struct LeaseScheduler {
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    command: String,
}

impl LeaseScheduler {
    pub fn new(queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, command: impl Into<String>) -> Self {
        Self {
            queue,
            clock,
            command: command.into(),
        }
    }

    /// Cancel every pending job, then queue exactly one termination at
    /// `now + duration`. Cleanup failures are logged and ignored; a failed
    /// submit is returned.
    pub async fn arm(&self, duration: Duration) -> Result<ScheduledJob> {
        let delta = chrono::Duration::from_std(duration)
            .map_err(|err| LeaseError::Validation(format!("lease duration out of range: {err}")))?;
        let fire_at = (self.clock.now() + delta).with_timezone(&Local);

        if let Err(err) = self.cancel_pending().await {
            warn!("scheduler: failed to list pending jobs: {err}");
        }

        let job_id = self.queue.submit(fire_at, &self.command).await?;
        info!(
            "scheduler: lease expiry job {job_id} armed for {}",
            fire_at.format(AT_TIME_FORMAT)
        );
        Ok(ScheduledJob { job_id, fire_at })
    }

    /// Cancel every pending job. A failed listing is returned; individual
    /// cancel failures are logged and left out of the count.
    pub async fn disarm(&self) -> Result<usize> {
        let cancelled = self.cancel_pending().await?;
        if cancelled > 0 {
            info!("scheduler: disarmed {cancelled} pending expiry jobs");
        }
        Ok(cancelled)
    }

    async fn cancel_pending(&self) -> Result<usize> {
        let mut cancelled = 0;
        for job_id in self.queue.pending().await? {
            match self.queue.cancel(&job_id).await {
                Ok(()) => cancelled += 1,
                Err(err) => warn!("scheduler: failed to cancel stale job {job_id}: {err}"),
            }
        }
        Ok(cancelled)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// In-memory job queue. `jobs` holds `(id, fire_at, command)` for every
    /// pending job.
    pub struct MockJobQueue {
        pub jobs: Mutex<Vec<(String, DateTime<Local>, String)>>,
        next_id: AtomicU64,
        pub fail_list: AtomicBool,
        pub fail_cancel: AtomicBool,
        pub fail_submit: AtomicBool,
    }

    impl Default for MockJobQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockJobQueue {
        pub fn new() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                fail_list: AtomicBool::new(false),
                fail_cancel: AtomicBool::new(false),
                fail_submit: AtomicBool::new(false),
            }
        }

        pub fn failing() -> Self {
            let mock = Self::new();
            mock.fail_submit.store(true, Ordering::Relaxed);
            mock
        }

        pub fn pending_ids(&self) -> Vec<String> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _, _)| id.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl JobQueue for MockJobQueue {
        async fn pending(&self) -> Result<Vec<String>> {
            if self.fail_list.load(Ordering::Relaxed) {
                return Err(LeaseError::Scheduling("mock atq failure".into()));
            }
            Ok(self.pending_ids())
        }

        async fn cancel(&self, job_id: &str) -> Result<()> {
            if self.fail_cancel.load(Ordering::Relaxed) {
                return Err(LeaseError::Scheduling("mock atrm failure".into()));
            }
            self.jobs.lock().unwrap().retain(|(id, _, _)| id != job_id);
            Ok(())
        }

        async fn submit(&self, fire_at: DateTime<Local>, command: &str) -> Result<String> {
            if self.fail_submit.load(Ordering::Relaxed) {
                return Err(LeaseError::Scheduling("mock at failure".into()));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            self.jobs
                .lock()
                .unwrap()
                .push((id.clone(), fire_at, command.to_string()));
            Ok(id)
        }
    }
}
