//! Bounded-concurrency import dispatcher.
//!
//! Every unit runs in its own task holding a semaphore permit from submission
//! until the import reaches a terminal status, so at most
//! `parallel_imports` jobs are outstanding on the target. Submissions follow
//! input order: each task waits for its predecessor to finish submitting.

use crate::config::MigrationOptions;
use crate::error::MigrationError;
use crate::platform::{ExistingProject, ImportRequest, ImportStatus, JobHandle, TargetPlatform};
use crate::progress::MigrationProgress;
use crate::retry::RetryPolicy;
use crate::tracker::StatusTracker;
use crate::types::{MigrationUnit, UnitId, UnitState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Detail of units left behind by a cancelled run.
pub const CANCELLED_BEFORE_DISPATCH: &str = "run cancelled before dispatch";

/// Detail of units whose import did not finish in time.
pub const TIMEOUT: &str = "timeout";

/// One unit ready for import.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub unit: MigrationUnit,
    /// Existing project to delete before importing.
    pub replace: Option<ExistingProject>,
}

impl From<MigrationUnit> for DispatchJob {
    fn from(unit: MigrationUnit) -> Self {
        Self {
            unit,
            replace: None,
        }
    }
}

/// Dispatcher knobs, taken from [`MigrationOptions`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub parallel_imports: usize,
    pub poll_interval: Duration,
    pub import_timeout: Duration,
    pub retry_submissions: bool,
    pub retry: RetryPolicy,
}

impl From<&MigrationOptions> for DispatchSettings {
    fn from(options: &MigrationOptions) -> Self {
        Self {
            parallel_imports: options.parallel_imports.max(1),
            poll_interval: options.poll_interval,
            import_timeout: options.import_timeout,
            retry_submissions: options.retry_submissions,
            retry: options.retry.clone(),
        }
    }
}

/// How a dispatch pass ended.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every job was dispatched and finished.
    Finished,
    /// The run was cancelled; some jobs may not have been dispatched.
    Cancelled,
    /// A credential failure stopped the pass.
    Aborted(MigrationError),
}

/// Runs imports against the target platform.
pub struct ImportDispatcher {
    target: Arc<dyn TargetPlatform>,
    tracker: Arc<StatusTracker>,
    settings: DispatchSettings,
    cancel: CancellationToken,
    progress: Option<Arc<MigrationProgress>>,
}

impl ImportDispatcher {
    /// Create a dispatcher recording into `tracker`.
    pub fn new(
        target: Arc<dyn TargetPlatform>,
        tracker: Arc<StatusTracker>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            target,
            tracker,
            settings,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Stop dispatching new units once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report finished units to `progress`.
    pub fn with_progress(mut self, progress: Arc<MigrationProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Dispatch `jobs` in order and wait for every dispatched unit to finish.
    ///
    /// Units are marked `Dispatched` when they take a permit. Units never
    /// dispatched are left `Pending` for the caller to finalize.
    pub async fn run(&self, jobs: Vec<DispatchJob>) -> DispatchOutcome {
        let worker = Arc::new(Worker {
            target: self.target.clone(),
            tracker: self.tracker.clone(),
            settings: self.settings.clone(),
            stop: self.cancel.child_token(),
            abort: Mutex::new(None),
            progress: self.progress.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.settings.parallel_imports));
        let mut tasks = JoinSet::new();
        let mut predecessor: Option<oneshot::Receiver<()>> = None;

        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = worker.stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                tracing::error!("Import semaphore closed unexpectedly");
                break;
            };

            if worker.tracker.mark_dispatched(&job.unit.id).is_err() {
                continue;
            }

            let (submitted, next) = oneshot::channel();
            let wait_for = predecessor.replace(next);
            tasks.spawn(worker.clone().run_unit(job, wait_for, submitted, permit));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Import worker stopped unexpectedly");
            }
        }

        let aborted = worker.abort.lock().take();
        if let Some(e) = aborted {
            DispatchOutcome::Aborted(e)
        } else if self.cancel.is_cancelled() {
            DispatchOutcome::Cancelled
        } else {
            DispatchOutcome::Finished
        }
    }
}

enum UnitFailure {
    /// Credentials were refused; the whole run stops.
    Abort(MigrationError),
    Failed(String),
}

impl UnitFailure {
    fn classify(stage: &str, e: MigrationError) -> Self {
        if e.is_auth() {
            Self::Abort(e)
        } else {
            Self::Failed(format!("{stage}: {e}"))
        }
    }
}

enum Polled {
    Succeeded,
    Failed(String),
    TimedOut,
}

struct Worker {
    target: Arc<dyn TargetPlatform>,
    tracker: Arc<StatusTracker>,
    settings: DispatchSettings,
    stop: CancellationToken,
    abort: Mutex<Option<MigrationError>>,
    progress: Option<Arc<MigrationProgress>>,
}

impl Worker {
    async fn run_unit(
        self: Arc<Self>,
        job: DispatchJob,
        predecessor: Option<oneshot::Receiver<()>>,
        submitted: oneshot::Sender<()>,
        _permit: OwnedSemaphorePermit,
    ) {
        // A dropped sender also releases us.
        if let Some(rx) = predecessor {
            let _ = rx.await;
        }

        let id = job.unit.id.clone();
        if self.stop.is_cancelled() {
            let _ = submitted.send(());
            let detail = self.stop_detail();
            self.finish(&id, UnitState::Failed, Some(detail));
            return;
        }

        let deadline = Instant::now() + self.settings.import_timeout;
        let submission = self.submit(&job).await;
        let _ = submitted.send(());

        let handle = match submission {
            Ok(handle) => handle,
            Err(failure) => return self.fail(&id, failure),
        };
        tracing::info!(unit = %id, job = %handle.id, target = %handle.target, "Import submitted");

        match self.await_terminal(&handle, deadline).await {
            Ok(Polled::Succeeded) => self.finish(&id, UnitState::Succeeded, None),
            Ok(Polled::Failed(detail)) => self.finish(&id, UnitState::Failed, Some(detail)),
            Ok(Polled::TimedOut) => {
                self.finish(&id, UnitState::Failed, Some(TIMEOUT.to_string()));
                if !self.cancel_job(&id, &handle).await {
                    // The job still counts against the limit until it ends.
                    self.drain(&id, &handle).await;
                }
            }
            Err(failure) => self.fail(&id, failure),
        }
    }

    async fn submit(&self, job: &DispatchJob) -> Result<JobHandle, UnitFailure> {
        let unit = &job.unit;
        let retry = &self.settings.retry;

        retry
            .execute(|| {
                self.target
                    .ensure_namespace(&unit.target.namespace, &unit.namespace_title)
            })
            .await
            .map_err(|e| UnitFailure::classify("namespace creation failed", e))?;

        if let Some(existing) = &job.replace {
            self.target
                .delete_project(existing)
                .await
                .map_err(|e| UnitFailure::classify("could not replace existing target", e))?;
            tracing::info!(unit = %unit.id, target = %unit.target, "Deleted existing target project");
        }

        let request = ImportRequest {
            unit: unit.id.clone(),
            project_key: unit.repo.project_key.clone(),
            repo_slug: unit.repo.slug.clone(),
            target: unit.target.clone(),
            project_name: unit.repo.name.clone(),
        };

        let submitted = if self.settings.retry_submissions {
            retry.execute(|| self.target.submit_import(&request)).await
        } else {
            self.target.submit_import(&request).await
        };
        submitted.map_err(|e| UnitFailure::classify("submission failed", e))
    }

    async fn await_terminal(
        &self,
        job: &JobHandle,
        deadline: Instant,
    ) -> Result<Polled, UnitFailure> {
        let retry = &self.settings.retry;
        let mut first = true;

        loop {
            if !first {
                let next = Instant::now() + self.settings.poll_interval;
                if next >= deadline {
                    tokio::time::sleep_until(deadline).await;
                    return self.read_at_deadline(job).await;
                }
                tokio::time::sleep_until(next).await;
            }
            first = false;

            let read = tokio::time::timeout_at(
                deadline,
                retry.execute_until(Some(deadline), || self.target.import_status(job)),
            )
            .await;

            match read {
                Err(_) => return Ok(Polled::TimedOut),
                Ok(Ok(ImportStatus::Succeeded)) => return Ok(Polled::Succeeded),
                Ok(Ok(ImportStatus::Failed(detail))) => return Ok(Polled::Failed(detail)),
                Ok(Ok(status)) => {
                    tracing::debug!(job = %job.id, status = ?status, "Import in progress");
                }
                Ok(Err(e)) if e.is_auth() => return Err(UnitFailure::Abort(e)),
                Ok(Err(e)) if e.is_transient() => {
                    tracing::warn!(job = %job.id, error = %e, "Status check failed, will poll again");
                }
                Ok(Err(e)) => {
                    return Err(UnitFailure::Failed(format!("status check failed: {e}")));
                }
            }
        }
    }

    /// One last status read once the deadline has passed.
    async fn read_at_deadline(&self, job: &JobHandle) -> Result<Polled, UnitFailure> {
        let read =
            tokio::time::timeout(self.settings.poll_interval, self.target.import_status(job)).await;
        match read {
            Ok(Ok(ImportStatus::Succeeded)) => Ok(Polled::Succeeded),
            Ok(Ok(ImportStatus::Failed(detail))) => Ok(Polled::Failed(detail)),
            Ok(Err(e)) if e.is_auth() => Err(UnitFailure::Abort(e)),
            _ => Ok(Polled::TimedOut),
        }
    }

    /// Returns whether the target stopped the job.
    async fn cancel_job(&self, id: &UnitId, job: &JobHandle) -> bool {
        match self.target.cancel_import(job).await {
            Ok(true) => {
                tracing::info!(unit = %id, job = %job.id, "Cancelled timed out import");
                true
            }
            Ok(false) => {
                tracing::debug!(unit = %id, job = %job.id, "Target cannot cancel imports");
                false
            }
            Err(e) => {
                tracing::warn!(unit = %id, job = %job.id, error = %e, "Failed to cancel import");
                false
            }
        }
    }

    /// Poll a timed out job that kept running until it ends on the target.
    ///
    /// Stops early when the run is cancelled or the job can no longer be read.
    async fn drain(&self, id: &UnitId, job: &JobHandle) {
        tracing::warn!(
            unit = %id,
            job = %job.id,
            "Timed out import is still running, holding its slot until it ends"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    tracing::warn!(unit = %id, job = %job.id, "Run stopped, leaving timed out import running");
                    return;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            match self.target.import_status(job).await {
                Ok(status) if status.is_terminal() => {
                    tracing::info!(unit = %id, job = %job.id, status = ?status, "Timed out import ended");
                    return;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    tracing::debug!(job = %job.id, error = %e, "Status check failed, will poll again");
                }
                Err(e) => {
                    tracing::warn!(unit = %id, job = %job.id, error = %e, "Lost track of timed out import");
                    return;
                }
            }
        }
    }

    fn fail(&self, id: &UnitId, failure: UnitFailure) {
        let detail = match failure {
            UnitFailure::Failed(detail) => detail,
            UnitFailure::Abort(e) => {
                let detail = e.to_string();
                let mut slot = self.abort.lock();
                if slot.is_none() {
                    tracing::error!(unit = %id, error = %e, "Credentials rejected, stopping dispatch");
                    *slot = Some(e);
                }
                self.stop.cancel();
                detail
            }
        };
        self.finish(id, UnitState::Failed, Some(detail));
    }

    fn stop_detail(&self) -> String {
        match self.abort.lock().as_ref() {
            Some(e) => format!("run aborted: {e}"),
            None => CANCELLED_BEFORE_DISPATCH.to_string(),
        }
    }

    fn finish(&self, id: &UnitId, state: UnitState, detail: Option<String>) {
        // Conflicts are logged by the tracker.
        let _ = self.tracker.record(id, state, detail);
        if let Some(progress) = &self.progress {
            progress.advance(id.as_str(), state != UnitState::Failed);
        }
    }
}
