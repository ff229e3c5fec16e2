//! Decides, per unit, whether an import is needed.
//!
//! A unit whose target project already exists is either skipped, failed or
//! replaced depending on [`MigrationOptions`]. A previous report lets a
//! resumed run skip finished units without asking the target.

use crate::config::{ExistingTargetPolicy, MigrationOptions};
use crate::error::{MigrationError, Result};
use crate::platform::{ExistingProject, TargetPlatform};
use crate::retry::RetryPolicy;
use crate::types::{MigrationReport, MigrationUnit, UnitId, UnitState};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;

/// Detail recorded for a unit whose target project is already present.
pub const TARGET_EXISTS: &str = "target already exists";

/// Detail recorded for a unit finished by an earlier run.
pub const COMPLETED_EARLIER: &str = "completed in a previous run";

/// What to do with one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Already migrated; never dispatched.
    Skip(String),
    /// Import it. `replace` is deleted first.
    Proceed { replace: Option<ExistingProject> },
    /// Do not import; the unit fails with this detail.
    Fail(String),
}

/// Existence checks against the target.
pub struct ResumeController {
    target: Arc<dyn TargetPlatform>,
    skip_existing: bool,
    on_existing: ExistingTargetPolicy,
    retry: RetryPolicy,
    concurrency: usize,
    completed: HashSet<UnitId>,
}

impl ResumeController {
    /// Create a controller using the run options.
    pub fn new(target: Arc<dyn TargetPlatform>, options: &MigrationOptions) -> Self {
        Self {
            target,
            skip_existing: options.skip_existing,
            on_existing: options.on_existing,
            retry: options.retry.clone(),
            concurrency: options.check_concurrency(),
            completed: HashSet::new(),
        }
    }

    /// Treat units that succeeded or were skipped in `report` as done.
    ///
    /// Only honoured in skip mode.
    pub fn with_previous_report(mut self, report: &MigrationReport) -> Self {
        self.completed = report
            .units
            .iter()
            .filter(|(_, record)| {
                matches!(record.state, UnitState::Succeeded | UnitState::Skipped)
            })
            .map(|(id, _)| id.clone())
            .collect();
        self
    }

    /// Decide for one unit.
    ///
    /// Only authentication failures are returned as errors; every other
    /// failure becomes [`Decision::Fail`].
    pub async fn decide(&self, unit: &MigrationUnit) -> Result<Decision> {
        if self.skip_existing && self.completed.contains(&unit.id) {
            tracing::debug!(unit = %unit.id, "Finished in a previous run");
            return Ok(Decision::Skip(COMPLETED_EARLIER.to_string()));
        }

        let existing = self
            .retry
            .execute(|| self.target.find_project(&unit.target))
            .await;

        match existing {
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                tracing::warn!(unit = %unit.id, error = %e, "Existence check failed");
                Ok(Decision::Fail(format!("existence check failed: {e}")))
            }
            Ok(None) => Ok(Decision::Proceed { replace: None }),
            Ok(Some(_)) if self.skip_existing => {
                tracing::debug!(unit = %unit.id, target = %unit.target, "Target exists, skipping");
                Ok(Decision::Skip(TARGET_EXISTS.to_string()))
            }
            Ok(Some(project)) => match self.on_existing {
                ExistingTargetPolicy::Fail => Ok(Decision::Fail(TARGET_EXISTS.to_string())),
                ExistingTargetPolicy::Overwrite => {
                    tracing::info!(unit = %unit.id, target = %unit.target, "Existing target will be replaced");
                    Ok(Decision::Proceed {
                        replace: Some(project),
                    })
                }
            },
        }
    }

    /// Decide for every unit, in input order, with bounded concurrency.
    ///
    /// Stops at the first authentication failure.
    pub async fn decide_all(
        &self,
        units: Vec<MigrationUnit>,
    ) -> Result<Vec<(MigrationUnit, Decision)>> {
        futures::stream::iter(units)
            .map(|unit| async move {
                let decision = self.decide(&unit).await?;
                Ok::<_, MigrationError>((unit, decision))
            })
            .buffered(self.concurrency)
            .try_collect()
            .await
    }
}
