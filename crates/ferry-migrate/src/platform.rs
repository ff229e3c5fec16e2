//! Platform abstractions the orchestration core talks to.
//!
//! The core never issues HTTP requests itself. It reads the source through
//! [`SourcePlatform`] and drives imports through [`TargetPlatform`]; the
//! Bitbucket Server and GitLab clients in this crate implement them, and
//! [`crate::memory`] provides in-memory versions.

use crate::error::Result;
use crate::types::{SourceUser, TargetPath, UnitId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Requested window of a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Offset of the first item.
    pub start: u64,
    /// Maximum number of items.
    pub limit: u32,
}

impl PageRequest {
    /// Default page size for listing calls.
    pub const DEFAULT_LIMIT: u32 = 100;

    /// First page with the default size.
    pub fn first() -> Self {
        Self {
            start: 0,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    /// The page starting at `start`, keeping the size.
    pub fn at(self, start: u64) -> Self {
        Self { start, ..self }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub values: Vec<T>,
    /// Offset of the next page, `None` on the last page.
    pub next_start: Option<u64>,
}

/// A project as listed by the source, without its repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
}

/// A repository as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRecord {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub public: bool,
}

/// Read-only access to the platform being migrated from.
#[async_trait]
pub trait SourcePlatform: Send + Sync {
    /// Check that the configured credentials are accepted.
    async fn verify_credentials(&self) -> Result<()>;

    /// List projects.
    async fn list_projects(&self, page: PageRequest) -> Result<Page<ProjectRecord>>;

    /// List repositories of a project.
    async fn list_repos(&self, project_key: &str, page: PageRequest) -> Result<Page<RepoRecord>>;

    /// List user accounts.
    async fn list_users(&self, page: PageRequest) -> Result<Page<SourceUser>>;
}

/// A project that already exists on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingProject {
    /// Target-side project identifier.
    pub id: String,
    pub path: TargetPath,
}

/// Everything the target needs to start one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub unit: UnitId,
    /// Source project key.
    pub project_key: String,
    /// Source repository slug.
    pub repo_slug: String,
    pub target: TargetPath,
    /// Display name for the created project.
    pub project_name: String,
}

/// Handle to an import job running on the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    /// Target-side job (or project) identifier.
    pub id: String,
    pub target: TargetPath,
}

/// Status of an import job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    Queued,
    Running,
    Succeeded,
    /// Failed, with the target's own explanation.
    Failed(String),
}

impl ImportStatus {
    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// The platform repositories are imported into.
#[async_trait]
pub trait TargetPlatform: Send + Sync {
    /// Check that the configured credentials are accepted.
    async fn verify_credentials(&self) -> Result<()>;

    /// Look up a project by its full path.
    async fn find_project(&self, path: &TargetPath) -> Result<Option<ExistingProject>>;

    /// Create the namespace (and missing parents) if it does not exist yet.
    async fn ensure_namespace(&self, namespace: &str, title: &str) -> Result<()>;

    /// Delete an existing project so it can be imported again.
    async fn delete_project(&self, project: &ExistingProject) -> Result<()>;

    /// Start an import job.
    async fn submit_import(&self, request: &ImportRequest) -> Result<JobHandle>;

    /// Read the current status of an import job.
    async fn import_status(&self, job: &JobHandle) -> Result<ImportStatus>;

    /// Ask the target to stop an import job.
    ///
    /// Returns `false` when the target offers no way to cancel.
    async fn cancel_import(&self, _job: &JobHandle) -> Result<bool> {
        Ok(false)
    }

    /// Resolve a source user to a target username.
    async fn find_user(&self, user: &SourceUser) -> Result<Option<String>>;
}
