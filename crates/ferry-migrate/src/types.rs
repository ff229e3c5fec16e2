//! Common types for migration operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a migration unit: `{project_key}/{repo_slug}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Build the identifier for a repository of a project.
    pub fn new(project_key: &str, repo_slug: &str) -> Self {
        Self(format!("{project_key}/{repo_slug}"))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A project on the source platform together with its repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProject {
    /// Project key (e.g. "TEAMA").
    pub key: String,
    /// Display name (e.g. "Team A").
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Repositories in source listing order.
    pub repos: Vec<SourceRepo>,
}

/// A repository on the source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRepo {
    /// Repository slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Key of the owning project.
    pub project_key: String,
    /// Optional description.
    pub description: Option<String>,
    /// Whether the repository is publicly readable.
    pub public: bool,
}

/// A user account on the source platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUser {
    /// Login name.
    pub username: String,
    /// Display name.
    pub display_name: Option<String>,
    /// Email address, when visible to the migrating account.
    pub email: Option<String>,
}

/// Location of a project on the target platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetPath {
    /// Namespace path, `/`-separated for nested groups.
    pub namespace: String,
    /// Project path within the namespace.
    pub project: String,
}

impl TargetPath {
    /// Create a target path.
    pub fn new(namespace: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            project: project.into(),
        }
    }

    /// Full path, `namespace/project`.
    pub fn full_path(&self) -> String {
        format!("{}/{}", self.namespace, self.project)
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.project)
    }
}

/// One repository-level work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub id: UnitId,
    /// Display name of the source project.
    pub project_name: String,
    pub repo: SourceRepo,
    pub target: TargetPath,
    /// Human-readable name for the target namespace when it has to be created.
    pub namespace_title: String,
}

impl MigrationUnit {
    /// Source location as shown to operators, e.g. "Team A/svc-one".
    pub fn source_display(&self) -> String {
        format!("{}/{}", self.project_name, self.repo.name)
    }
}

/// State of a migration unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Created, not yet decided.
    Pending,
    /// Import submitted and being supervised.
    Dispatched,
    /// Already present on the target; not imported.
    Skipped,
    /// Import finished on the target.
    Succeeded,
    /// Not migrated; see the detail.
    Failed,
}

impl UnitState {
    /// Check if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Skipped => write!(f, "skipped"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Report entry for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Source location, e.g. "Team A/svc-one".
    pub source: String,
    /// Mapped target path, empty when mapping failed.
    pub target: String,
    pub state: UnitState,
    /// Human-readable detail for non-success outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the unit reached its terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// How source users resolved to target accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityReport {
    /// Source username to target username.
    pub mapped: BTreeMap<String, String>,
    /// Source usernames with no target account.
    pub unmatched: Vec<String>,
}

/// Counts of units per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Units not in a terminal state.
    pub unfinished: usize,
}

impl ReportSummary {
    /// Total number of units.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.unfinished
    }
}

/// Report of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Start time of the run.
    pub started_at: Option<DateTime<Utc>>,

    /// End time of the run.
    pub completed_at: Option<DateTime<Utc>>,

    /// Whether the run was cancelled by the operator.
    #[serde(default)]
    pub cancelled: bool,

    /// Per-unit outcomes.
    pub units: BTreeMap<UnitId, UnitRecord>,

    /// Identity mapping, when it ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identities: Option<IdentityReport>,
}

impl MigrationReport {
    /// Create a new empty report.
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark the run as complete.
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Look up a unit.
    pub fn get(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    /// State of a unit, if present.
    pub fn state_of(&self, id: &UnitId) -> Option<UnitState> {
        self.units.get(id).map(|r| r.state)
    }

    /// Count units per state.
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for record in self.units.values() {
            match record.state {
                UnitState::Succeeded => summary.succeeded += 1,
                UnitState::Failed => summary.failed += 1,
                UnitState::Skipped => summary.skipped += 1,
                UnitState::Pending | UnitState::Dispatched => summary.unfinished += 1,
            }
        }
        summary
    }

    /// Every unit reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.units.values().all(|r| r.state.is_terminal())
    }

    /// Complete and nothing failed.
    pub fn is_successful(&self) -> bool {
        self.is_complete() && self.summary().failed == 0 && !self.cancelled
    }

    /// Units that failed, in identifier order.
    pub fn failures(&self) -> impl Iterator<Item = (&UnitId, &UnitRecord)> {
        self.units
            .iter()
            .filter(|(_, r)| r.state == UnitState::Failed)
    }

    /// Get the duration of the run.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Serialize to pretty JSON for persistence.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a persisted report.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Print a summary of the run.
    pub fn print_summary(&self) {
        let summary = self.summary();

        println!("\n=== Migration Summary ===\n");
        for (id, record) in &self.units {
            let mark = match record.state {
                UnitState::Succeeded => "✓",
                UnitState::Skipped => "-",
                UnitState::Failed => "✗",
                UnitState::Pending | UnitState::Dispatched => "?",
            };
            let target = if record.target.is_empty() {
                "(unmapped)"
            } else {
                record.target.as_str()
            };
            match &record.detail {
                Some(detail) => println!("  {mark} {id} -> {target} [{}] {detail}", record.state),
                None => println!("  {mark} {id} -> {target} [{}]", record.state),
            }
        }

        println!();
        println!("Succeeded: {}", summary.succeeded);
        println!("Skipped:   {}", summary.skipped);
        println!("Failed:    {}", summary.failed);
        if summary.unfinished > 0 {
            println!("Unfinished: {}", summary.unfinished);
        }

        if let Some(identities) = &self.identities {
            println!(
                "\nIdentities mapped: {} (unmatched: {})",
                identities.mapped.len(),
                identities.unmatched.len()
            );
            for user in &identities.unmatched {
                println!("  - {user}");
            }
        }

        if let Some(duration) = self.duration() {
            println!("\nCompleted in {} seconds", duration.num_seconds());
        }

        let status = if self.cancelled {
            "CANCELLED"
        } else if self.is_successful() {
            "SUCCESS"
        } else {
            "FAILED"
        };
        println!("\nOverall Status: {status}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: UnitState) -> UnitRecord {
        UnitRecord {
            source: "Team A/svc".into(),
            target: "team-a/svc".into(),
            state,
            detail: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut report = MigrationReport::new();
        report
            .units
            .insert(UnitId::new("A", "one"), record(UnitState::Succeeded));
        report
            .units
            .insert(UnitId::new("A", "two"), record(UnitState::Skipped));
        report
            .units
            .insert(UnitId::new("A", "three"), record(UnitState::Failed));

        let summary = report.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
        assert!(report.is_complete());
        assert!(!report.is_successful());
    }

    #[test]
    fn test_pending_units_make_report_incomplete() {
        let mut report = MigrationReport::new();
        report
            .units
            .insert(UnitId::new("A", "one"), record(UnitState::Dispatched));
        assert!(!report.is_complete());
        assert_eq!(report.summary().unfinished, 1);
    }

    #[test]
    fn test_report_json_uses_unit_ids_as_keys() {
        let mut report = MigrationReport::new();
        report
            .units
            .insert(UnitId::new("TEAMA", "svc-one"), record(UnitState::Succeeded));

        let json = report.to_json().unwrap();
        assert!(json.contains("\"TEAMA/svc-one\""));
        assert!(json.contains("\"succeeded\""));

        let parsed = MigrationReport::from_json(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
