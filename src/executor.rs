//! The batch execution boundary. The engine doesn't know how tests are run,
//! only that an executor takes a batch and reports which jobs passed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::claim::Batch;
use crate::types::job::JobId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Passed,
    Failed,
}

/// Per-job results of running a batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutcome {
    verdicts: HashMap<JobId, Verdict>,
}

impl BatchOutcome {
    /// The same verdict for every job in the batch.
    pub fn uniform(batch: &Batch, verdict: Verdict) -> Self {
        Self {
            verdicts: batch.ids().into_iter().map(|id| (id, verdict)).collect(),
        }
    }

    pub fn with(mut self, id: JobId, verdict: Verdict) -> Self {
        self.verdicts.insert(id, verdict);
        self
    }

    /// Jobs the executor didn't report on count as failed.
    pub fn verdict(&self, id: &JobId) -> Verdict {
        self.verdicts.get(id).copied().unwrap_or(Verdict::Failed)
    }
}

#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Sets up once for `batch.key`, runs every job's test, and reports. Runs
    /// as long as it needs to; there's no timeout around it.
    async fn execute(&self, batch: &Batch) -> BatchOutcome;
}

/// Pretends to install the app and run each test, then passes or fails the
/// whole batch at random.
#[derive(Clone, Debug)]
pub struct SimulatedExecutor {
    pub setup: Duration,
    pub per_test: Duration,
    /// Chance in `0.0..=1.0` that a batch fails.
    pub failure_rate: f64,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            setup: Duration::from_secs(10),
            per_test: Duration::from_secs(5),
            failure_rate: 0.5,
        }
    }
}

#[async_trait]
impl BatchExecutor for SimulatedExecutor {
    async fn execute(&self, batch: &Batch) -> BatchOutcome {
        info!(key = %batch.key, batch_size = batch.len(), "installing app");
        tokio::time::sleep(self.setup).await;

        for job in &batch.jobs {
            info!(job_id = %job.id, test = %job.spec.test_path, "running test");
            tokio::time::sleep(self.per_test).await;
        }

        // NaN would make `gen_bool` panic; treat it as never failing.
        let rate = match self.failure_rate {
            rate if rate.is_nan() => 0.0,
            rate => rate.clamp(0.0, 1.0),
        };
        let failed = rand::thread_rng().gen_bool(rate);
        let verdict = if failed { Verdict::Failed } else { Verdict::Passed };
        info!(key = %batch.key, ?verdict, "batch finished");
        BatchOutcome::uniform(batch, verdict)
    }
}

/// Runs an external program once per batch:
///
/// `<program> [args..] <app_version_id> <target> <job_id>=<test_path>..`
///
/// The exit status is the verdict for the whole batch, unless the program
/// prints `PASS <job_id>` or `FAIL <job_id>` lines, which override it for the
/// jobs they name.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl BatchExecutor for CommandExecutor {
    async fn execute(&self, batch: &Batch) -> BatchOutcome {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&batch.key.app_version_id)
            .arg(batch.key.target.as_str())
            .args(
                batch
                    .jobs
                    .iter()
                    .map(|j| format!("{}={}", j.id, j.spec.test_path)),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                error!(%error, program = %self.program.display(), "failed to run executor");
                return BatchOutcome::uniform(batch, Verdict::Failed);
            },
        };

        let overall = if output.status.success() {
            Verdict::Passed
        } else {
            warn!(status = %output.status, key = %batch.key, "executor exited unsuccessfully");
            Verdict::Failed
        };
        parse_report(batch, overall, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Applies `PASS <id>` / `FAIL <id>` lines over a batch-wide verdict. Lines
/// naming jobs outside the batch are ignored.
fn parse_report(batch: &Batch, overall: Verdict, stdout: &str) -> BatchOutcome {
    let ids = batch.ids();
    let mut outcome = BatchOutcome::uniform(batch, overall);
    for line in stdout.lines() {
        let (verdict, rest) = match line.trim().split_once(' ') {
            Some(("PASS", rest)) => (Verdict::Passed, rest),
            Some(("FAIL", rest)) => (Verdict::Failed, rest),
            _ => continue,
        };
        match rest.trim().parse::<JobId>() {
            Ok(id) if ids.contains(&id) => outcome = outcome.with(id, verdict),
            _ => continue,
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::job::{Job, JobSpec, Priority, Target};
    use crate::types::states::JobStatus;

    fn batch(n: usize) -> Batch {
        let spec = JobSpec {
            org_id: "org".into(),
            app_version_id: "v1".into(),
            test_path: "tests/a.spec.js".into(),
            priority: Priority::default(),
            target: Target::Emulator,
            max_retries: 0,
        };
        let jobs = (0..n)
            .map(|_| Job {
                id: JobId::generate(),
                status: JobStatus::Running,
                spec: spec.clone(),
                queue: "q".into(),
                retries_done: 0,
                max_retries: 0,
                worker: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect();
        Batch {
            key: spec.group_key(),
            jobs,
        }
    }

    #[test]
    fn test_missing_verdicts_count_as_failed() {
        let b = batch(2);
        let outcome = BatchOutcome::default().with(b.jobs[0].id, Verdict::Passed);
        assert_eq!(outcome.verdict(&b.jobs[0].id), Verdict::Passed);
        assert_eq!(outcome.verdict(&b.jobs[1].id), Verdict::Failed);
    }

    #[test]
    fn test_parse_report_overrides() {
        let b = batch(3);
        let stranger = JobId::generate();
        let stdout = format!(
            "installing...\nFAIL {}\n PASS {} \nPASS {stranger}\nFAIL nonsense\n",
            b.jobs[1].id, b.jobs[2].id
        );

        let outcome = parse_report(&b, Verdict::Passed, &stdout);
        assert_eq!(outcome.verdict(&b.jobs[0].id), Verdict::Passed);
        assert_eq!(outcome.verdict(&b.jobs[1].id), Verdict::Failed);
        assert_eq!(outcome.verdict(&b.jobs[2].id), Verdict::Passed);

        let outcome = parse_report(&b, Verdict::Failed, "");
        assert!(b.ids().iter().all(|id| outcome.verdict(id) == Verdict::Failed));
    }

    #[tokio::test]
    async fn test_simulated_executor_extremes() {
        let b = batch(2);
        let always = |failure_rate| SimulatedExecutor {
            setup: Duration::ZERO,
            per_test: Duration::ZERO,
            failure_rate,
        };

        let outcome = always(0.0).execute(&b).await;
        assert!(b.ids().iter().all(|id| outcome.verdict(id) == Verdict::Passed));
        let outcome = always(1.0).execute(&b).await;
        assert!(b.ids().iter().all(|id| outcome.verdict(id) == Verdict::Failed));
        let outcome = always(f64::NAN).execute(&b).await;
        assert!(b.ids().iter().all(|id| outcome.verdict(id) == Verdict::Passed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_exit_status() {
        let b = batch(1);
        let ok = CommandExecutor::new("true", Vec::new()).execute(&b).await;
        assert_eq!(ok.verdict(&b.jobs[0].id), Verdict::Passed);
        let bad = CommandExecutor::new("false", Vec::new()).execute(&b).await;
        assert_eq!(bad.verdict(&b.jobs[0].id), Verdict::Failed);
        let missing = CommandExecutor::new("/nonexistent/batchq-runner", Vec::new())
            .execute(&b)
            .await;
        assert_eq!(missing.verdict(&b.jobs[0].id), Verdict::Failed);
    }
}
