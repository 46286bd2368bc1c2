// src/orchestrator/mod.rs

//! The per-(subject, stage) state machine.
//!
//! For every requested stage, in dependency order, every subject goes
//! through: skip check, readiness check, lease, workspace, staging, tools,
//! promotion, checkpoint, teardown. Failures are contained per subject and
//! the [`FailurePolicy`](crate::config::FailurePolicy) decides whether the
//! batch goes on.

pub mod startup;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::ConfigFile;
use crate::errors::{ErrorKind, Result, StepError};
use crate::eta::EtaTracker;
use crate::exec::ToolInvoker;
use crate::fs::FileSystem;
use crate::notify::Notifier;
use crate::stages::graph::order_stages;
use crate::stages::{runner_for, StageContext, StageRunner, StageSpec};
use crate::status_log::{StatusLog, ALL, INIT};
use crate::subject::SubjectId;
use crate::types::{FailureAction, StageKind};
use crate::workspace::lease::default_owner;
use crate::workspace::{StagedInput, SubjectLease, WorkspaceManager};

pub use startup::{run_startup, Startup};

/// How one subject ended for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectOutcome {
    Completed,
    /// Checkpoint already complete.
    Skipped,
    NotReady(String),
    Failed(StepError),
}

impl SubjectOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SubjectOutcome::Completed => "completed",
            SubjectOutcome::Skipped => "skipped",
            SubjectOutcome::NotReady(_) => "not ready",
            SubjectOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: StageKind,
    pub outcomes: Vec<(SubjectId, SubjectOutcome)>,
    /// The failure policy stopped the batch.
    pub aborted: bool,
    pub elapsed: Duration,
}

impl StageReport {
    fn count(&self, pred: impl Fn(&SubjectOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Completed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Skipped))
    }

    pub fn not_ready(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::NotReady(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, SubjectOutcome::Failed(_)))
    }

    pub fn outcome(&self, subject: &SubjectId) -> Option<&SubjectOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == subject)
            .map(|(_, o)| o)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} completed, {} skipped, {} not ready, {} failed{}",
            self.stage,
            self.completed(),
            self.skipped(),
            self.not_ready(),
            self.failed(),
            if self.aborted { " (aborted)" } else { "" }
        )
    }
}

pub struct Orchestrator {
    config: Arc<ConfigFile>,
    fs: Arc<dyn FileSystem>,
    invoker: Arc<dyn ToolInvoker>,
    log: Arc<StatusLog>,
    notifier: Arc<dyn Notifier>,
    workspace: WorkspaceManager,
    checkpoints: CheckpointStore,
    owner: String,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ConfigFile>,
        fs: Arc<dyn FileSystem>,
        invoker: Arc<dyn ToolInvoker>,
        log: Arc<StatusLog>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let workspace = WorkspaceManager::new(fs.clone(), config.paths.workspace_root.clone());
        let checkpoints = CheckpointStore::new(
            fs.clone(),
            config.paths.dataout.clone(),
            config.checkpoint.verify_digests,
        );
        let owner = config.lease.owner.clone().unwrap_or_else(default_owner);
        Self {
            config,
            fs,
            invoker,
            log,
            notifier,
            workspace,
            checkpoints,
            owner,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run `stages` (in dependency order) over `subjects`.
    ///
    /// Stops after the first stage whose batch was aborted.
    pub async fn run(
        &self,
        stages: &[StageKind],
        subjects: &[SubjectId],
    ) -> Result<Vec<StageReport>> {
        let ordered = order_stages(stages)?;
        info!(stages = ?ordered, subjects = subjects.len(), "starting run");

        let mut reports = Vec::with_capacity(ordered.len());
        for stage in ordered {
            let report = self.run_stage(stage, subjects).await;
            let aborted = report.aborted;
            reports.push(report);
            if aborted {
                warn!(stage = %stage, "batch aborted, remaining stages not run");
                break;
            }
        }
        Ok(reports)
    }

    pub async fn run_stage(&self, stage: StageKind, subjects: &[SubjectId]) -> StageReport {
        let runner = runner_for(stage, self.config.clone());
        let total = subjects.len();

        self.log.info(
            INIT,
            format!(
                "{total} subjects to process for {stage}, task name: {}",
                self.config.run.task
            ),
        );
        if let Err(err) = self.log.dump_subjects(subjects) {
            self.log.warning(INIT, format!("could not write subject list: {err:#}"));
        }
        self.log.task_start();

        let mut eta = EtaTracker::new(self.config.pipeline.eta, total);
        let mut outcomes = Vec::with_capacity(total);
        let mut aborted = false;

        for (i, sub) in subjects.iter().enumerate() {
            let outcome = self.process_subject(runner.as_ref(), sub, &mut eta).await;
            println!("[{}/{}] {} {}: {}", i + 1, total, stage, sub, outcome.label());

            let abort = match &outcome {
                SubjectOutcome::Failed(err) => {
                    self.config.policy.decide(stage, err.kind) == FailureAction::Abort
                }
                _ => false,
            };
            outcomes.push((sub.clone(), outcome));

            if abort {
                let remaining = total - i - 1;
                self.log.error(
                    ALL,
                    format!("{stage}: failure policy aborted the batch, {remaining} subject(s) not processed"),
                );
                aborted = true;
                break;
            }
        }

        let elapsed = self.log.task_end(stage.name());
        let report = StageReport {
            stage,
            outcomes,
            aborted,
            elapsed,
        };
        self.log.ok(ALL, report.summary());

        let message = format!("{stage} finished for {total} subjects. {}", report.summary());
        if let Err(err) = self.notifier.notify(&message).await {
            self.log.warning(ALL, format!("notification failed: {err:#}"));
        }

        report
    }

    async fn process_subject(
        &self,
        runner: &dyn StageRunner,
        sub: &SubjectId,
        eta: &mut EtaTracker,
    ) -> SubjectOutcome {
        let stage = runner.kind();

        if self.config.run.skip_processed
            && self.checkpoints.is_complete(sub, stage, &runner.markers(sub))
        {
            self.log.ok(sub.as_str(), format!("{stage}: already processed, skipping"));
            return SubjectOutcome::Skipped;
        }

        let spec = match runner.plan(sub, self.fs.as_ref()) {
            Ok(spec) => spec,
            Err(err) => return self.not_processed(sub, stage, err),
        };
        let inputs = match spec.check_ready(self.fs.as_ref()) {
            Ok(inputs) => inputs,
            Err(err) => return self.not_processed(sub, stage, err),
        };

        self.log.subject_start(sub.as_str(), stage.name());
        self.log.info(sub.as_str(), eta.update(Local::now()));

        let outcome = match self.take_lease(sub) {
            // Another worker may have finished the subject while it held the lease.
            Ok(lease)
                if self.config.run.skip_processed
                    && self.checkpoints.is_complete(sub, stage, &runner.markers(sub)) =>
            {
                drop(lease);
                self.log.ok(sub.as_str(), format!("{stage}: processed by another worker, skipping"));
                SubjectOutcome::Skipped
            }
            Ok(lease) => {
                let result = self.execute(runner, sub, &spec, &inputs).await;
                let outcome = self.finish(sub, stage, result);
                drop(lease);
                outcome
            }
            Err(err) => self.fail(sub, stage, err, false),
        };

        self.log.subject_end(sub.as_str(), stage.name());
        outcome
    }

    /// Skip-check, plan or readiness failure before any work started.
    fn not_processed(&self, sub: &SubjectId, stage: StageKind, err: StepError) -> SubjectOutcome {
        if err.is_not_ready() {
            self.log.warning(sub.as_str(), format!("{stage}: not ready: {}", err.message));
            SubjectOutcome::NotReady(err.message)
        } else {
            self.fail(sub, stage, err, false)
        }
    }

    fn take_lease(&self, sub: &SubjectId) -> std::result::Result<SubjectLease, StepError> {
        let ttl = chrono::Duration::hours(self.config.lease.ttl_hours as i64);
        match self.workspace.lease(sub, &self.owner, ttl, Utc::now()) {
            Ok((lease, stale)) => {
                if let Some(stale) = stale {
                    self.log.warning(sub.as_str(), format!("broke stale lease: {stale}"));
                }
                Ok(lease)
            }
            Err(err) => Err(StepError::new(ErrorKind::Lease, "lease", err.to_string())),
        }
    }

    /// Everything that happens while the lease is held, up to promotion.
    async fn execute(
        &self,
        runner: &dyn StageRunner,
        sub: &SubjectId,
        spec: &StageSpec,
        inputs: &[StagedInput],
    ) -> std::result::Result<(), StepError> {
        let stage = runner.kind();
        let copy = self.config.run.copy;

        if copy {
            self.checkpoints
                .mark(sub, stage, CheckpointState::InProgress, None)
                .map_err(|e| StepError::checkpoint("checkpoint", format!("{e:#}")))?;
        }

        let dir = self
            .workspace
            .acquire(sub, &spec.workspace_dirs)
            .map_err(|e| StepError::workspace("acquire", format!("{e:#}")))?;
        self.workspace.stage_inputs(sub, inputs)?;
        debug!(subject = %sub, stage = %stage, inputs = inputs.len(), "inputs staged");

        let ctx = StageContext::new(
            runner,
            sub.clone(),
            dir,
            self.config.clone(),
            self.fs.clone(),
            self.invoker.clone(),
            self.log.clone(),
        );
        runner.run(&ctx).await?;

        if copy {
            let dest: PathBuf = self.checkpoints.subject_dir(sub);
            let promoted = self.workspace.promote_outputs(sub, &spec.outputs, &dest)?;
            self.log.ok(
                sub.as_str(),
                format!("{stage}: {} file(s) copied to {}", promoted.len(), dest.display()),
            );
            self.checkpoints
                .mark_done(sub, stage, &spec.markers)
                .map_err(|e| StepError::checkpoint("checkpoint", format!("{e:#}")))?;
        }

        Ok(())
    }

    /// Tear down the workspace and turn the execution result into an outcome.
    fn finish(
        &self,
        sub: &SubjectId,
        stage: StageKind,
        result: std::result::Result<(), StepError>,
    ) -> SubjectOutcome {
        let keep = !self.config.run.clean;
        let cleanup = self
            .workspace
            .release(sub, keep)
            .map_err(|e| StepError::new(ErrorKind::Cleanup, "release", format!("{e:#}")));

        match (result, cleanup) {
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    self.log.error(sub.as_str(), format!("{stage}: {cleanup_err}"));
                }
                self.fail(sub, stage, err, self.config.run.copy)
            }
            (Ok(()), Err(cleanup_err)) => {
                // The checkpoint stays done; only the workspace leaked.
                self.log.error(sub.as_str(), format!("{stage}: {cleanup_err}"));
                SubjectOutcome::Failed(cleanup_err)
            }
            (Ok(()), Ok(_)) => {
                self.log.ok(sub.as_str(), format!("{stage} for {sub} completed successfully"));
                SubjectOutcome::Completed
            }
        }
    }

    fn fail(&self, sub: &SubjectId, stage: StageKind, err: StepError, mark: bool) -> SubjectOutcome {
        self.log.error(sub.as_str(), format!("{stage}: {err}"));
        if mark {
            if let Err(e) = self
                .checkpoints
                .mark(sub, stage, CheckpointState::Failed, Some(err.to_string()))
            {
                self.log.warning(sub.as_str(), format!("{stage}: could not record failure: {e:#}"));
            }
        }
        SubjectOutcome::Failed(err)
    }
}
