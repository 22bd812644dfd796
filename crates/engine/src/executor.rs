//! Ordered, resumable step execution.
//!
//! The executor walks a fixed list of steps top to bottom. A step whose
//! checkpoint flag is already set in the ledger is skipped; otherwise its
//! prerequisites are checked, its action runs, and on success the flag is
//! persisted before the next step starts. The first failure ends the run.
//! Order is exactly the declaration order; no dependency graph is inferred.

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ledger::{Ledger, LedgerError};

/// One idempotent unit of provisioning work.
#[async_trait]
pub trait Step: Send + Sync {
    /// Human-readable step name used in logs and reports.
    fn name(&self) -> &str;

    /// Ledger flag that marks this step complete. Unique within a run.
    fn checkpoint(&self) -> &str;

    /// Ledger keys produced by earlier steps that must exist before
    /// [`Step::run`] may be called.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    /// What the step would do, logged in dry-run mode.
    fn describe(&self) -> String {
        self.name().to_string()
    }

    /// Perform the work. Secrets produced along the way are stored and
    /// persisted by the step itself; the checkpoint flag is set by the executor.
    async fn run(&self, ledger: &mut Ledger) -> anyhow::Result<()>;
}

/// Lifecycle of a step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    /// Checkpoint already set by an earlier run.
    Skipped,
    Running,
    Completed,
    /// Intent logged, nothing executed or recorded.
    DryRun,
    Failed,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Skipped => write!(f, "skipped"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::DryRun => write!(f, "dry-run"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Two steps in the list claim the same checkpoint.
    #[error("steps '{first}' and '{second}' share checkpoint '{checkpoint}'")]
    DuplicateCheckpoint {
        checkpoint: String,
        first: String,
        second: String,
    },

    /// A step's prerequisite was never produced.
    #[error("step '{step}' requires '{key}', which no earlier step has produced")]
    MissingPrerequisite { step: String, key: String },

    /// The step's action failed.
    #[error("step '{step}' failed: {source:#}")]
    StepFailed {
        step: String,
        source: anyhow::Error,
    },

    /// The step succeeded but its completion could not be recorded.
    #[error("step '{step}' completed but its checkpoint could not be saved: {source}")]
    Persist { step: String, source: LedgerError },

    /// Cancellation was requested before the step started.
    #[error("run cancelled before step '{step}'")]
    Cancelled { step: String },
}

impl ExecutorError {
    /// Name of the step the run stopped at.
    #[must_use]
    pub fn step(&self) -> &str {
        match self {
            Self::DuplicateCheckpoint { second, .. } => second,
            Self::MissingPrerequisite { step, .. }
            | Self::StepFailed { step, .. }
            | Self::Persist { step, .. }
            | Self::Cancelled { step } => step,
        }
    }
}

/// Final state of every step in a run, in declaration order.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub steps: Vec<(String, StepState)>,
}

impl RunReport {
    fn record(&mut self, name: &str, state: StepState) {
        if let Some(entry) = self.steps.iter_mut().find(|(n, _)| n == name) {
            entry.1 = state;
        } else {
            self.steps.push((name.to_string(), state));
        }
    }

    fn count(&self, state: StepState) -> usize {
        self.steps.iter().filter(|(_, s)| *s == state).count()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(StepState::Completed)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(StepState::Skipped)
    }

    #[must_use]
    pub fn dry_run(&self) -> usize {
        self.count(StepState::DryRun)
    }

    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<StepState> {
        self.steps
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

/// Drives an ordered step list against a ledger.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    dry_run: bool,
    cancel: Option<CancellationToken>,
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log each pending step's intent instead of running it.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Stop before the next step once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run `steps` in order.
    ///
    /// # Errors
    ///
    /// Returns the first error that ends the run. Steps completed before it
    /// stay marked in the ledger; re-running resumes at the failed step.
    pub async fn run(
        &self,
        steps: &[Box<dyn Step>],
        ledger: &mut Ledger,
    ) -> Result<RunReport, ExecutorError> {
        check_unique_checkpoints(steps)?;

        let mut report = RunReport::default();
        for step in steps {
            report.record(step.name(), StepState::Pending);
        }

        for step in steps {
            let name = step.name();

            if self
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                warn!(step = %name, "Run cancelled");
                return Err(ExecutorError::Cancelled {
                    step: name.to_string(),
                });
            }

            if ledger.flag(step.checkpoint()) {
                info!(step = %name, checkpoint = %step.checkpoint(), "Skipping: already complete");
                report.record(name, StepState::Skipped);
                continue;
            }

            let missing = step
                .requires()
                .into_iter()
                .find(|key| !ledger.contains(key));

            if self.dry_run {
                if let Some(key) = &missing {
                    warn!(step = %name, key = %key, "[dry-run] prerequisite not yet produced");
                }
                info!(step = %name, "[dry-run] {}", step.describe());
                report.record(name, StepState::DryRun);
                continue;
            }

            if let Some(key) = missing {
                error!(step = %name, key = %key, "Missing prerequisite");
                return Err(ExecutorError::MissingPrerequisite {
                    step: name.to_string(),
                    key,
                });
            }

            info!(step = %name, "Executing");
            report.record(name, StepState::Running);

            if let Err(source) = step.run(ledger).await {
                error!(step = %name, error = %format!("{source:#}"), "Step failed");
                report.record(name, StepState::Failed);
                return Err(ExecutorError::StepFailed {
                    step: name.to_string(),
                    source,
                });
            }

            ledger
                .mark_complete(step.checkpoint())
                .map_err(|source| ExecutorError::Persist {
                    step: name.to_string(),
                    source,
                })?;

            info!(step = %name, checkpoint = %step.checkpoint(), "Completed");
            report.record(name, StepState::Completed);
        }

        Ok(report)
    }
}

fn check_unique_checkpoints(steps: &[Box<dyn Step>]) -> Result<(), ExecutorError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        if !seen.insert(step.checkpoint()) {
            let first = steps[..i]
                .iter()
                .find(|s| s.checkpoint() == step.checkpoint())
                .map(|s| s.name().to_string())
                .unwrap_or_default();
            return Err(ExecutorError::DuplicateCheckpoint {
                checkpoint: step.checkpoint().to_string(),
                first,
                second: step.name().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeStep {
        name: String,
        checkpoint: String,
        requires: Vec<String>,
        produces: Option<(String, String)>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeStep {
        fn new(name: &str, checkpoint: &str) -> Self {
            Self {
                name: name.into(),
                checkpoint: checkpoint.into(),
                requires: Vec::new(),
                produces: None,
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn requiring(mut self, key: &str) -> Self {
            self.requires.push(key.into());
            self
        }

        fn producing(mut self, key: &str, value: &str) -> Self {
            self.produces = Some((key.into(), value.into()));
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl Step for FakeStep {
        fn name(&self) -> &str {
            &self.name
        }

        fn checkpoint(&self) -> &str {
            &self.checkpoint
        }

        fn requires(&self) -> Vec<String> {
            self.requires.clone()
        }

        async fn run(&self, ledger: &mut Ledger) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("terraform exited with status 1");
            }
            if let Some((key, value)) = &self.produces {
                ledger.set_and_persist(key.as_str(), value.as_str())?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_preset_flag_skips_step() {
        let a = FakeStep::new("a", "f1");
        let b = FakeStep::new("b", "f2");
        let (a_calls, b_calls) = (a.counter(), b.counter());

        let mut ledger = Ledger::in_memory();
        ledger.set("f1", true);

        let steps: Vec<Box<dyn Step>> = vec![Box::new(a), Box::new(b)];
        let report = Executor::new().run(&steps, &mut ledger).await.unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert!(ledger.flag("f1"));
        assert!(ledger.flag("f2"));
        assert_eq!(report.state_of("a"), Some(StepState::Skipped));
        assert_eq!(report.state_of("b"), Some(StepState::Completed));
    }

    #[tokio::test]
    async fn test_failure_stops_run_and_leaves_later_steps_pending() {
        let a = FakeStep::new("a", "f1");
        let b = FakeStep::new("b", "f2").failing();
        let c = FakeStep::new("c", "f3");
        let c_calls = c.counter();

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a), Box::new(b), Box::new(c)];
        let err = Executor::new().run(&steps, &mut ledger).await.unwrap_err();

        assert_eq!(err.step(), "b");
        assert!(err.to_string().contains("terraform exited with status 1"));
        assert!(ledger.flag("f1"));
        assert!(!ledger.flag("f2"));
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_aborts_before_action() {
        let a = FakeStep::new("configure vault", "create.terraformapplied.vault")
            .requiring("gitlab.token");
        let calls = a.counter();

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a)];
        let err = Executor::new().run(&steps, &mut ledger).await.unwrap_err();

        assert!(matches!(
            err,
            ExecutorError::MissingPrerequisite { ref key, .. } if key == "gitlab.token"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!ledger.flag("create.terraformapplied.vault"));
    }

    #[tokio::test]
    async fn test_prerequisite_produced_by_earlier_step() {
        let producer = FakeStep::new("tokens", "create.gitlab.tokens")
            .producing("gitlab.token", "glpat-123");
        let consumer =
            FakeStep::new("vault", "create.terraformapplied.vault").requiring("gitlab.token");
        let consumer_calls = consumer.counter();

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(producer), Box::new(consumer)];
        Executor::new().run(&steps, &mut ledger).await.unwrap();

        assert_eq!(consumer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dry_run_executes_and_records_nothing() {
        let a = FakeStep::new("a", "f1");
        let b = FakeStep::new("b", "f2").requiring("never.produced");
        let (a_calls, b_calls) = (a.counter(), b.counter());

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a), Box::new(b)];
        let report = Executor::new()
            .dry_run(true)
            .run(&steps, &mut ledger)
            .await
            .unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert!(ledger.is_empty());
        assert_eq!(report.dry_run(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_checkpoints_rejected() {
        let a = FakeStep::new("apply base", "create.terraformapplied");
        let b = FakeStep::new("apply gitlab", "create.terraformapplied");
        let a_calls = a.counter();

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a), Box::new(b)];
        let err = Executor::new().run(&steps, &mut ledger).await.unwrap_err();

        assert!(matches!(err, ExecutorError::DuplicateCheckpoint { .. }));
        assert!(err.to_string().contains("apply base"));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let a = FakeStep::new("a", "f1");
        let calls = a.counter();
        let token = CancellationToken::new();
        token.cancel();

        let mut ledger = Ledger::in_memory();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a)];
        let err = Executor::new()
            .with_cancellation(token)
            .run(&steps, &mut ledger)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_stops_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let a = FakeStep::new("apply base", "f1");
        let b = FakeStep::new("apply gitlab", "f2");
        let (a_calls, b_calls) = (a.counter(), b.counter());

        // The parent of the ledger file is a regular file, so no write can land.
        let mut ledger = Ledger::load(blocker.join("state.json")).unwrap();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(a), Box::new(b)];
        let err = Executor::new().run(&steps, &mut ledger).await.unwrap_err();

        assert!(matches!(err, ExecutorError::Persist { .. }));
        assert_eq!(err.step(), "apply base");
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert!(!ledger.flag("f1"));
    }
}
