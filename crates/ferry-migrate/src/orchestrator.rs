//! Drives a migration run end to end.
//!
//! A run goes through preflight, inventory collection, naming, identity
//! mapping, existence checks and dispatch. Every unit ends in a terminal
//! state in the returned [`MigrationReport`], including units that were never
//! dispatched because the run was cancelled or aborted.

use crate::bitbucket::BitbucketServerClient;
use crate::config::MigrationConfig;
use crate::dispatch::{DispatchJob, DispatchOutcome, DispatchSettings, ImportDispatcher, CANCELLED_BEFORE_DISPATCH};
use crate::error::{MigrationError, Result};
use crate::gitlab::GitLabClient;
use crate::identity::IdentityMapper;
use crate::inventory::InventoryCollector;
use crate::naming::{MappingFailure, NamespaceMapper};
use crate::platform::{SourcePlatform, TargetPlatform};
use crate::progress::{MigrationPhase, MigrationProgress};
use crate::resume::{Decision, ResumeController};
use crate::tracker::StatusTracker;
use crate::types::{MigrationReport, MigrationUnit, UnitState};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Planned mapping of a run, produced without touching the target.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// Number of source projects listed.
    pub projects: usize,
    /// Units that would be imported, in dispatch order.
    pub units: Vec<MigrationUnit>,
    /// Repositories that cannot be mapped.
    pub failures: Vec<MappingFailure>,
}

impl MigrationPlan {
    /// Print the plan to stdout.
    pub fn print(&self) {
        println!("\n=== Migration Plan ===\n");
        for unit in &self.units {
            println!("  {} -> {}", unit.source_display(), unit.target);
        }
        if !self.failures.is_empty() {
            println!("\nUnmappable repositories:");
            for failure in &self.failures {
                println!("  ✗ {}: {}", failure.source, failure.error);
            }
        }
        println!();
        println!("Projects:     {}", self.projects);
        println!("Repositories: {}", self.units.len() + self.failures.len());
        println!("Mappable:     {}", self.units.len());
    }
}

/// Runs migrations from a source platform into a target platform.
pub struct Orchestrator {
    config: MigrationConfig,
    source: Arc<dyn SourcePlatform>,
    target: Arc<dyn TargetPlatform>,
    previous: Option<MigrationReport>,
    progress: Arc<MigrationProgress>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Validate `config` and connect to Bitbucket Server and GitLab.
    pub fn connect(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        let source = BitbucketServerClient::new(&config.source)?;
        let target = GitLabClient::new(&config.target, &config.source)?;
        Ok(Self::with_platforms(config, Arc::new(source), Arc::new(target)))
    }

    /// Use the given platforms instead of the HTTP clients.
    pub fn with_platforms(
        config: MigrationConfig,
        source: Arc<dyn SourcePlatform>,
        target: Arc<dyn TargetPlatform>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            previous: None,
            progress: Arc::new(MigrationProgress::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Resume from an earlier report.
    pub fn with_previous_report(mut self, report: MigrationReport) -> Self {
        self.previous = Some(report);
        self
    }

    /// Report progress through `progress`.
    pub fn with_progress(mut self, progress: Arc<MigrationProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop dispatching when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The configuration of this orchestrator.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Check both sets of credentials.
    pub async fn preflight(&self) -> Result<()> {
        self.progress.begin(MigrationPhase::Authenticating, 2);
        self.source.verify_credentials().await?;
        self.progress.advance("source", true);
        self.target.verify_credentials().await?;
        self.progress.advance("target", true);
        tracing::info!("Credentials accepted by both platforms");
        Ok(())
    }

    /// Collect and map the inventory without querying or writing the target.
    pub async fn plan(&self) -> Result<MigrationPlan> {
        self.preflight().await?;

        self.progress.begin(MigrationPhase::CollectingInventory, 0);
        let inventory = InventoryCollector::new(self.source.clone()).collect().await?;

        let outcome = NamespaceMapper::new(&self.config.options.group_prefix)
            .map_inventory(&inventory.projects);
        self.progress.begin(MigrationPhase::Complete, 0);

        Ok(MigrationPlan {
            projects: inventory.projects.len(),
            units: outcome.units,
            failures: outcome.failures,
        })
    }

    /// Run the migration.
    ///
    /// Returns the report when every unit reached a terminal state, including
    /// after cancellation. Credential failures return
    /// [`MigrationError::Aborted`] carrying the partial report; preflight and
    /// collection failures return the error before anything is dispatched.
    pub async fn run(&self) -> Result<MigrationReport> {
        let options = &self.config.options;
        options.validate()?;

        let tracker = Arc::new(StatusTracker::new());
        let abort = |e: MigrationError| -> MigrationError {
            if !e.is_auth() {
                return e;
            }
            let reason = e.to_string();
            tracker.finalize_pending(&format!("run aborted: {reason}"));
            MigrationError::Aborted {
                reason,
                report: Box::new(tracker.finish()),
            }
        };

        tracing::info!(
            prefix = %options.group_prefix,
            parallel_imports = options.parallel_imports,
            skip_existing = options.skip_existing,
            "Starting migration run"
        );

        let collected = self
            .unless_cancelled(async {
                self.preflight().await?;
                self.progress.begin(MigrationPhase::CollectingInventory, 0);
                InventoryCollector::new(self.source.clone()).collect().await
            })
            .await;
        let inventory = match collected {
            Some(collected) => collected.map_err(abort)?,
            None => return Ok(self.cancelled(&tracker)),
        };

        let outcome = NamespaceMapper::new(&options.group_prefix).map_inventory(&inventory.projects);
        for unit in &outcome.units {
            tracker.register(unit);
        }
        for failure in &outcome.failures {
            let target = failure
                .target
                .as_ref()
                .map(|t| t.full_path())
                .unwrap_or_default();
            tracker.register_entry(failure.id.clone(), failure.source.clone(), target);
            let _ = tracker.record(&failure.id, UnitState::Failed, Some(failure.error.to_string()));
        }

        if options.map_identities {
            self.progress.begin(MigrationPhase::MappingIdentities, 0);
            let mapper = IdentityMapper::new(self.source.clone(), self.target.clone());
            match self.unless_cancelled(mapper.map()).await {
                Some(Ok(identities)) => tracker.set_identities(identities),
                Some(Err(e)) => tracing::warn!(error = %e, "Identity mapping failed, continuing"),
                None => return Ok(self.cancelled(&tracker)),
            }
        }

        self.progress
            .begin(MigrationPhase::CheckingTargets, outcome.units.len() as u64);
        let mut controller = ResumeController::new(self.target.clone(), options);
        if let Some(previous) = &self.previous {
            controller = controller.with_previous_report(previous);
        }

        let decisions = match self.unless_cancelled(controller.decide_all(outcome.units)).await {
            Some(decided) => decided.map_err(abort)?,
            None => return Ok(self.cancelled(&tracker)),
        };

        let mut jobs = Vec::new();
        for (unit, decision) in decisions {
            match decision {
                Decision::Skip(detail) => {
                    let _ = tracker.record(&unit.id, UnitState::Skipped, Some(detail));
                    self.progress.advance(unit.id.as_str(), true);
                }
                Decision::Fail(detail) => {
                    let _ = tracker.record(&unit.id, UnitState::Failed, Some(detail));
                    self.progress.advance(unit.id.as_str(), false);
                }
                Decision::Proceed { replace } => jobs.push(DispatchJob { unit, replace }),
            }
        }

        self.progress
            .begin(MigrationPhase::Importing, jobs.len() as u64);
        let dispatcher = ImportDispatcher::new(
            self.target.clone(),
            tracker.clone(),
            DispatchSettings::from(options),
        )
        .with_cancellation(self.cancel.clone())
        .with_progress(self.progress.clone());

        match dispatcher.run(jobs).await {
            DispatchOutcome::Finished => {}
            DispatchOutcome::Cancelled => return Ok(self.cancelled(&tracker)),
            DispatchOutcome::Aborted(e) => return Err(abort(e)),
        }

        let orphaned = tracker.finalize_pending("import worker stopped unexpectedly");
        if orphaned > 0 {
            tracing::error!(units = orphaned, "Units left without an outcome");
        }

        let report = tracker.finish();
        self.progress.begin(MigrationPhase::Complete, 0);
        let summary = report.summary();
        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Migration run finished"
        );
        Ok(report)
    }

    /// Drive `phase` to completion unless the run is cancelled first.
    async fn unless_cancelled<T>(&self, phase: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = phase => Some(out),
        }
    }

    fn cancelled(&self, tracker: &StatusTracker) -> MigrationReport {
        let undispatched = tracker.finalize_pending(CANCELLED_BEFORE_DISPATCH);
        tracing::warn!(units = undispatched, "Run cancelled");
        tracker.mark_cancelled();
        self.progress.begin(MigrationPhase::Complete, 0);
        tracker.finish()
    }
}
