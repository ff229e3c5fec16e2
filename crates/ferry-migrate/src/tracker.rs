//! Thread-safe accumulator of per-unit outcomes.

use crate::types::{IdentityReport, MigrationReport, MigrationUnit, UnitId, UnitRecord, UnitState};
use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;

/// Tracker misuse. Every variant is a programming error in the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The unit was never registered.
    #[error("unit {0} is not registered")]
    UnknownUnit(UnitId),

    /// `record` was called with a non-terminal state.
    #[error("state {state} is not terminal (unit {unit})")]
    NotTerminal { unit: UnitId, state: UnitState },

    /// The unit already reached a different terminal state.
    #[error("unit {unit} already {existing}, refusing to record {attempted}")]
    ConflictingOutcome {
        unit: UnitId,
        existing: UnitState,
        attempted: UnitState,
    },
}

#[derive(Debug, Default)]
struct TrackerState {
    report: MigrationReport,
}

/// Collects unit states for a run and hands out consistent snapshots.
#[derive(Debug)]
pub struct StatusTracker {
    state: RwLock<TrackerState>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Create a tracker for a new run.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrackerState {
                report: MigrationReport::new(),
            }),
        }
    }

    /// Register a unit as `Pending`. Registering twice keeps the first entry.
    pub fn register(&self, unit: &MigrationUnit) {
        self.register_entry(unit.id.clone(), unit.source_display(), unit.target.full_path());
    }

    /// Register a unit by its parts; used for units that never got a target path.
    pub fn register_entry(&self, id: UnitId, source: String, target: String) {
        let mut state = self.state.write();
        state.report.units.entry(id).or_insert(UnitRecord {
            source,
            target,
            state: UnitState::Pending,
            detail: None,
            finished_at: None,
        });
    }

    /// Move a pending unit to `Dispatched`.
    pub fn mark_dispatched(&self, id: &UnitId) -> Result<(), TrackerError> {
        let mut state = self.state.write();
        let record = state
            .report
            .units
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownUnit(id.clone()))?;

        if record.state.is_terminal() {
            let err = TrackerError::ConflictingOutcome {
                unit: id.clone(),
                existing: record.state,
                attempted: UnitState::Dispatched,
            };
            tracing::error!(unit = %id, error = %err, "Tracker invariant violated");
            return Err(err);
        }
        record.state = UnitState::Dispatched;
        Ok(())
    }

    /// Record the terminal outcome of a unit.
    ///
    /// Recording the same terminal state twice is a no-op; a different
    /// terminal state is rejected and logged.
    pub fn record(
        &self,
        id: &UnitId,
        outcome: UnitState,
        detail: Option<String>,
    ) -> Result<(), TrackerError> {
        if !outcome.is_terminal() {
            let err = TrackerError::NotTerminal {
                unit: id.clone(),
                state: outcome,
            };
            tracing::error!(unit = %id, error = %err, "Tracker invariant violated");
            return Err(err);
        }

        let mut state = self.state.write();
        let record = state
            .report
            .units
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownUnit(id.clone()))?;

        if record.state.is_terminal() {
            if record.state == outcome {
                tracing::debug!(unit = %id, state = %outcome, "Duplicate outcome ignored");
                return Ok(());
            }
            let err = TrackerError::ConflictingOutcome {
                unit: id.clone(),
                existing: record.state,
                attempted: outcome,
            };
            tracing::error!(unit = %id, error = %err, "Tracker invariant violated");
            return Err(err);
        }

        record.state = outcome;
        record.detail = detail;
        record.finished_at = Some(Utc::now());

        match outcome {
            UnitState::Failed => tracing::warn!(
                unit = %id,
                detail = record.detail.as_deref().unwrap_or(""),
                "Unit failed"
            ),
            _ => tracing::info!(unit = %id, state = %outcome, "Unit finished"),
        }
        Ok(())
    }

    /// Fail every unit that has not reached a terminal state.
    ///
    /// Returns how many units were affected.
    pub fn finalize_pending(&self, detail: &str) -> usize {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut count = 0;
        for record in state.report.units.values_mut() {
            if !record.state.is_terminal() {
                record.state = UnitState::Failed;
                record.detail = Some(detail.to_string());
                record.finished_at = Some(now);
                count += 1;
            }
        }
        count
    }

    /// Attach the identity mapping result.
    pub fn set_identities(&self, identities: IdentityReport) {
        self.state.write().report.identities = Some(identities);
    }

    /// Flag the run as cancelled.
    pub fn mark_cancelled(&self) {
        self.state.write().report.cancelled = true;
    }

    /// Current state of one unit.
    pub fn state_of(&self, id: &UnitId) -> Option<UnitState> {
        self.state.read().report.state_of(id)
    }

    /// Point-in-time copy of the report.
    pub fn snapshot(&self) -> MigrationReport {
        self.state.read().report.clone()
    }

    /// Final report with the completion time set.
    pub fn finish(&self) -> MigrationReport {
        let mut state = self.state.write();
        state.report.complete();
        state.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceRepo, TargetPath};
    use std::sync::Arc;

    fn unit(slug: &str) -> MigrationUnit {
        MigrationUnit {
            id: UnitId::new("A", slug),
            project_name: "Team A".into(),
            repo: SourceRepo {
                slug: slug.into(),
                name: slug.into(),
                project_key: "A".into(),
                description: None,
                public: false,
            },
            target: TargetPath::new("team-a", slug),
            namespace_title: "Team A".into(),
        }
    }

    #[test]
    fn test_lifecycle() {
        let tracker = StatusTracker::new();
        let u = unit("svc");
        tracker.register(&u);
        assert_eq!(tracker.state_of(&u.id), Some(UnitState::Pending));

        tracker.mark_dispatched(&u.id).unwrap();
        assert_eq!(tracker.state_of(&u.id), Some(UnitState::Dispatched));

        tracker.record(&u.id, UnitState::Succeeded, None).unwrap();
        let report = tracker.snapshot();
        assert_eq!(report.state_of(&u.id), Some(UnitState::Succeeded));
        assert!(report.get(&u.id).unwrap().finished_at.is_some());
        assert!(report.is_complete());
    }

    #[test]
    fn test_record_is_idempotent() {
        let tracker = StatusTracker::new();
        let u = unit("svc");
        tracker.register(&u);

        tracker
            .record(&u.id, UnitState::Failed, Some("timeout".into()))
            .unwrap();
        tracker
            .record(&u.id, UnitState::Failed, Some("other".into()))
            .unwrap();

        let report = tracker.snapshot();
        assert_eq!(report.get(&u.id).unwrap().detail.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_conflicting_outcome_is_rejected() {
        let tracker = StatusTracker::new();
        let u = unit("svc");
        tracker.register(&u);
        tracker.record(&u.id, UnitState::Skipped, None).unwrap();

        let err = tracker.record(&u.id, UnitState::Succeeded, None).unwrap_err();
        assert!(matches!(err, TrackerError::ConflictingOutcome { .. }));
        assert_eq!(tracker.state_of(&u.id), Some(UnitState::Skipped));

        assert!(tracker.mark_dispatched(&u.id).is_err());
    }

    #[test]
    fn test_non_terminal_and_unknown_are_rejected() {
        let tracker = StatusTracker::new();
        let u = unit("svc");
        assert!(matches!(
            tracker.record(&u.id, UnitState::Succeeded, None),
            Err(TrackerError::UnknownUnit(_))
        ));

        tracker.register(&u);
        assert!(matches!(
            tracker.record(&u.id, UnitState::Dispatched, None),
            Err(TrackerError::NotTerminal { .. })
        ));
    }

    #[test]
    fn test_finalize_pending() {
        let tracker = StatusTracker::new();
        let (a, b, c) = (unit("a"), unit("b"), unit("c"));
        for u in [&a, &b, &c] {
            tracker.register(u);
        }
        tracker.mark_dispatched(&b.id).unwrap();
        tracker.record(&c.id, UnitState::Succeeded, None).unwrap();

        assert_eq!(tracker.finalize_pending("run cancelled"), 2);
        let report = tracker.snapshot();
        assert!(report.is_complete());
        assert_eq!(report.summary().failed, 2);
        assert_eq!(report.summary().succeeded, 1);
    }

    #[test]
    fn test_snapshots_during_concurrent_records() {
        let tracker = Arc::new(StatusTracker::new());
        let units: Vec<MigrationUnit> = (0..64).map(|i| unit(&format!("repo-{i}"))).collect();
        for u in &units {
            tracker.register(u);
        }

        let writers: Vec<_> = units
            .chunks(16)
            .map(|chunk| {
                let tracker = tracker.clone();
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for u in chunk {
                        tracker.mark_dispatched(&u.id).unwrap();
                        tracker.record(&u.id, UnitState::Succeeded, None).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..100 {
            let snapshot = tracker.snapshot();
            assert_eq!(snapshot.units.len(), 64);
            for record in snapshot.units.values() {
                // terminal records are always complete
                if record.state.is_terminal() {
                    assert!(record.finished_at.is_some());
                }
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(tracker.snapshot().summary().succeeded, 64);
    }
}
