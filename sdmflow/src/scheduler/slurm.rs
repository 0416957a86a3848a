//! Slurm adapter.

use super::process::{run_command, shell_quote, CommandOutput};
use super::{JobScheduler, SubmissionOutcome, SubmissionRequest, WaitMode};
use crate::core::TerminalState;
use crate::errors::SchedulerError;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACCOUNTING_FIELDS: &str =
    "JobID,JobName%30,State,ExitCode,Elapsed,AllocCPUS,ReqMem,MaxRSS,NodeList";

/// `sacct` queries made while task states are still settling.
const SETTLE_ATTEMPTS: u32 = 6;
/// First pause between those queries; doubled after each one.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Submits through `sbatch` and reads terminal states from `sacct`.
///
/// Blocking submissions use `sbatch --wait`, which returns only after every
/// task of the array has finished. Accounting may lag behind; `sacct` is
/// re-queried with a doubling pause until no task reports a transient state.
///
/// Job environment is handed to `sbatch` through its own process
/// environment and forwarded with `--export=ALL`, so values may contain
/// commas.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
    extra_args: Vec<String>,
    settle_attempts: u32,
    settle_delay: Duration,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            extra_args: Vec::new(),
            settle_attempts: SETTLE_ATTEMPTS,
            settle_delay: SETTLE_DELAY,
        }
    }
}

impl SlurmScheduler {
    /// Creates an adapter using `sbatch` and `sacct` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the client binaries.
    #[must_use]
    pub fn with_binaries(mut self, sbatch: impl Into<String>, sacct: impl Into<String>) -> Self {
        self.sbatch = sbatch.into();
        self.sacct = sacct.into();
        self
    }

    /// Adds arguments passed to every `sbatch` call (account, partition).
    #[must_use]
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Sets how often `sacct` is asked for final task states, and the first
    /// pause between attempts.
    #[must_use]
    pub fn with_settle_policy(mut self, attempts: u32, initial_delay: Duration) -> Self {
        self.settle_attempts = attempts.max(1);
        self.settle_delay = initial_delay;
        self
    }

    /// Builds the `sbatch` argument list for a request.
    #[must_use]
    pub fn sbatch_args(&self, request: &SubmissionRequest) -> Vec<String> {
        let scheme = request.log_scheme();
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", request.stage_name),
            format!("--mem-per-cpu={}", request.profile.memory_per_core),
            format!("--time={}", request.profile.wall_time),
            format!("--cpus-per-task={}", request.profile.cores),
            format!("--output={}", scheme.stdout_pattern().display()),
            format!("--error={}", scheme.stderr_pattern().display()),
        ];
        if request.array {
            args.push(format!("--array=1-{}", request.extent));
        }
        if request.wait == WaitMode::Blocking {
            args.push("--wait".to_string());
        }
        if !request.env.is_empty() {
            args.push("--export=ALL".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(format!("--wrap={}", wrap_command(request)));
        args
    }

    /// Terminal state of every task of a job, or `None` while any task
    /// still reports a transient state.
    async fn task_states(
        &self,
        job_id: &str,
    ) -> Result<Option<Vec<TerminalState>>, SchedulerError> {
        let output = run_command(
            &self.sacct,
            ["-j", job_id, "-X", "-n", "-P", "-o", "State"],
            &[],
        )
        .await?
        .into_result()?;

        let rows: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if rows.is_empty() {
            return Err(SchedulerError::InvalidResponse(format!(
                "sacct returned no records for job {job_id}"
            )));
        }
        if rows.iter().any(|row| TerminalState::is_transient_slurm(row)) {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(TerminalState::from_slurm).collect()))
    }

    /// Queries `sacct` until every task has a final state or the attempts
    /// run out.
    async fn settled_states(
        &self,
        job_id: &str,
    ) -> Result<Option<Vec<TerminalState>>, SchedulerError> {
        let mut delay = self.settle_delay;
        for attempt in 1..=self.settle_attempts {
            if let Some(states) = self.task_states(job_id).await? {
                return Ok(Some(states));
            }
            if attempt < self.settle_attempts {
                debug!(job_id, attempt, ?delay, "Task states not final yet");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        Ok(None)
    }
}

/// The shell line a job runs: the command, its arguments and, for arrays,
/// the task index.
fn wrap_command(request: &SubmissionRequest) -> String {
    let mut words = vec![shell_quote(&request.command.to_string_lossy())];
    words.extend(request.args.iter().map(|arg| shell_quote(arg)));
    if request.array {
        words.push("\"$SLURM_ARRAY_TASK_ID\"".to_string());
    }
    words.join(" ")
}

/// State implied by the exit status of `sbatch --wait`.
fn exit_status_state(output: &CommandOutput) -> TerminalState {
    if output.success() {
        TerminalState::Completed
    } else {
        TerminalState::Failed
    }
}

/// Extracts the job id from `sbatch --parsable` output (`id` or `id;cluster`).
pub(crate) fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

#[async_trait]
impl JobScheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(
        &self,
        request: &SubmissionRequest,
    ) -> Result<SubmissionOutcome, SchedulerError> {
        let started = Instant::now();
        let args = self.sbatch_args(request);
        debug!(stage = %request.stage_name, ?args, "Submitting to Slurm");

        let output = run_command(&self.sbatch, &args, &request.env).await?;
        let Some(job_id) = parse_job_id(&output.stdout) else {
            return Err(if output.success() {
                SchedulerError::InvalidResponse(output.stdout.trim().to_string())
            } else {
                SchedulerError::Rejected {
                    code: output.code,
                    stderr: output.stderr.trim().to_string(),
                }
            });
        };

        info!(
            stage = %request.stage_name,
            job_id = %job_id,
            extent = request.extent.get(),
            "Job accepted"
        );

        if request.wait == WaitMode::Detached {
            return Ok(SubmissionOutcome {
                succeeded: true,
                terminal_state: TerminalState::Unknown("PENDING".to_string()),
                log_paths: request.log_scheme().resolve(&job_id, request.extent),
                job_id: Some(job_id),
                elapsed: started.elapsed(),
            });
        }

        let terminal_state = match self.settled_states(&job_id).await {
            Ok(Some(states)) => TerminalState::combine(&states),
            Ok(None) => {
                warn!(job_id = %job_id, "sacct never reported final states; using sbatch exit code");
                exit_status_state(&output)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "sacct unavailable; using sbatch exit code");
                exit_status_state(&output)
            }
        };

        Ok(SubmissionOutcome::from_state(terminal_state, Some(job_id.clone()))
            .with_log_paths(request.log_scheme().resolve(&job_id, request.extent))
            .with_elapsed(started.elapsed()))
    }

    async fn accounting(&self, job_ids: &[String]) -> Result<String, SchedulerError> {
        if job_ids.is_empty() {
            return Ok(String::new());
        }
        let jobs = job_ids.join(",");
        let format = format!("--format={ACCOUNTING_FIELDS}");
        let output = run_command(&self.sacct, ["-j", jobs.as_str(), "-P", format.as_str()], &[])
            .await?
            .into_result()?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceProfile, WallTime};
    use std::num::NonZeroU32;

    fn fit_request() -> SubmissionRequest {
        SubmissionRequest::new(
            "global_fit",
            ResourceProfile::new("8G", WallTime::from_hours(12), 2),
            "/opt/pipeline/global_fit.sh",
            "/scratch/logs/global_fit",
        )
        .with_array(NonZeroU32::new(48).unwrap())
        .with_env("SDMFLOW_BATCH_INDEX", "2")
    }

    #[test]
    fn test_sbatch_args_for_blocking_array() {
        let args = SlurmScheduler::new()
            .with_extra_args(vec!["--account=proj".into()])
            .sbatch_args(&fit_request());
        assert_eq!(
            args,
            vec![
                "--parsable",
                "--job-name=global_fit",
                "--mem-per-cpu=8G",
                "--time=12:00:00",
                "--cpus-per-task=2",
                "--output=/scratch/logs/global_fit/global_fit_%A_%a.out",
                "--error=/scratch/logs/global_fit/global_fit_%A_%a.err",
                "--array=1-48",
                "--wait",
                "--export=ALL",
                "--account=proj",
                "--wrap=/opt/pipeline/global_fit.sh \"$SLURM_ARRAY_TASK_ID\"",
            ]
        );
    }

    #[test]
    fn test_detached_scalar_has_no_array_or_wait() {
        let request = SubmissionRequest::new(
            "aggregate_north",
            ResourceProfile::new("4G", WallTime::from_hours(1), 1),
            "/opt/aggregate.sh",
            "/logs",
        )
        .with_args(vec!["groups/north.txt".into(), "SSP1 SSP5".into()])
        .with_wait(WaitMode::Detached);
        let args = SlurmScheduler::new().sbatch_args(&request);
        assert!(!args.iter().any(|a| a.starts_with("--array") || a == "--wait"));
        assert_eq!(
            args.last().unwrap(),
            "--wrap=/opt/aggregate.sh groups/north.txt 'SSP1 SSP5'"
        );
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("12345\n"), Some("12345".into()));
        assert_eq!(parse_job_id("12345;cluster\n"), Some("12345".into()));
        assert_eq!(parse_job_id(""), None);
        assert_eq!(parse_job_id("sbatch: error\n"), None);
    }

    #[tokio::test]
    async fn test_submit_with_fake_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        let sacct = dir.path().join("sacct");
        std::fs::write(&sbatch, "#!/bin/sh\necho '777;cluster'\nexit 0\n").unwrap();
        std::fs::write(&sacct, "#!/bin/sh\nprintf 'COMPLETED\\nTIMEOUT\\n'\n").unwrap();
        for file in [&sbatch, &sacct] {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let scheduler = SlurmScheduler::new()
            .with_binaries(sbatch.display().to_string(), sacct.display().to_string());
        let outcome = scheduler.submit(&fit_request()).await.unwrap();

        assert_eq!(outcome.job_id.as_deref(), Some("777"));
        assert_eq!(outcome.terminal_state, TerminalState::TimedOut);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.log_paths.len(), 48);
    }

    fn fake_binary(path: &std::path::Path, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, script).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_completing_tasks_fall_back_to_sbatch_status() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        let sacct = dir.path().join("sacct");
        fake_binary(&sbatch, "#!/bin/sh\necho 4242\nexit 0\n");
        fake_binary(&sacct, "#!/bin/sh\nprintf 'COMPLETED\\nCOMPLETING\\n'\n");

        let scheduler = SlurmScheduler::new()
            .with_binaries(sbatch.display().to_string(), sacct.display().to_string())
            .with_settle_policy(3, Duration::ZERO);
        let outcome = scheduler.submit(&fit_request()).await.unwrap();

        assert_eq!(outcome.terminal_state, TerminalState::Completed);
        assert!(outcome.succeeded);
    }

    #[tokio::test]
    async fn test_sacct_is_queried_until_states_settle() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        let sacct = dir.path().join("sacct");
        let seen = dir.path().join("seen");
        fake_binary(&sbatch, "#!/bin/sh\necho 4243\nexit 0\n");
        fake_binary(
            &sacct,
            &format!(
                "#!/bin/sh\nif [ -f '{seen}' ]; then printf 'COMPLETED\\nFAILED\\n'; \
                 else touch '{seen}'; printf 'RUNNING\\nCOMPLETING\\n'; fi\n",
                seen = seen.display()
            ),
        );

        let scheduler = SlurmScheduler::new()
            .with_binaries(sbatch.display().to_string(), sacct.display().to_string())
            .with_settle_policy(3, Duration::ZERO);
        let outcome = scheduler.submit(&fit_request()).await.unwrap();

        assert!(seen.exists());
        assert_eq!(outcome.terminal_state, TerminalState::Failed);
        assert!(!outcome.succeeded);
    }

    #[tokio::test]
    async fn test_job_env_reaches_sbatch_with_commas_intact() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        let captured = dir.path().join("env.txt");
        fake_binary(
            &sbatch,
            &format!(
                "#!/bin/sh\nprintf '%s' \"$SDMFLOW_STATE_DIR\" > '{}'\necho 4244\n",
                captured.display()
            ),
        );

        let request = SubmissionRequest::new(
            "prepare",
            ResourceProfile::new("4G", WallTime::from_hours(1), 1),
            "/opt/prepare.sh",
            "/logs/prepare",
        )
        .with_env("SDMFLOW_STATE_DIR", "/scratch/a,b/state")
        .with_wait(WaitMode::Detached);
        let scheduler = SlurmScheduler::new().with_binaries(sbatch.display().to_string(), "sacct");
        scheduler.submit(&request).await.unwrap();

        assert_eq!(std::fs::read_to_string(&captured).unwrap(), "/scratch/a,b/state");
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let dir = tempfile::tempdir().unwrap();
        let sbatch = dir.path().join("sbatch");
        std::fs::write(&sbatch, "#!/bin/sh\necho 'invalid partition' >&2\nexit 1\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&sbatch, std::fs::Permissions::from_mode(0o755)).unwrap();

        let scheduler =
            SlurmScheduler::new().with_binaries(sbatch.display().to_string(), "sacct");
        let err = scheduler.submit(&fit_request()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected { code: Some(1), .. }));
    }
}
