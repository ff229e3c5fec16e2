//! In-memory platforms for tests and dry experiments.
//!
//! [`MemorySource`] serves a fixed inventory; [`MemoryTarget`] keeps projects,
//! namespaces and import jobs in memory and counts how many jobs are
//! outstanding at once.

use crate::error::{MigrationError, Platform, Result};
use crate::platform::{
    ExistingProject, ImportRequest, ImportStatus, JobHandle, Page, PageRequest, ProjectRecord,
    RepoRecord, SourcePlatform, TargetPlatform,
};
use crate::types::{SourceUser, TargetPath};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn slice_page<T: Clone>(items: &[T], page: PageRequest) -> Page<T> {
    let start = (page.start as usize).min(items.len());
    let end = (start + page.limit as usize).min(items.len());
    Page {
        values: items[start..end].to_vec(),
        next_start: (end < items.len()).then_some(end as u64),
    }
}

fn auth_error(platform: Platform) -> MigrationError {
    MigrationError::AuthenticationFailed {
        platform,
        message: "credentials rejected".to_string(),
    }
}

/// A source platform serving a fixed inventory.
#[derive(Default)]
pub struct MemorySource {
    projects: Vec<(ProjectRecord, Vec<RepoRecord>)>,
    users: Vec<SourceUser>,
    fail_project_page: Option<u32>,
    fail_repos_of: Option<String>,
    reject_credentials: bool,
    project_pages: AtomicU32,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a project with repositories named `repos`.
    ///
    /// Slugs are the lowercased names with spaces replaced by `_`.
    pub fn with_project(mut self, key: &str, name: &str, repos: &[&str]) -> Self {
        let repos = repos
            .iter()
            .map(|name| RepoRecord {
                slug: name.to_lowercase().replace(' ', "_"),
                name: name.to_string(),
                description: None,
                public: false,
            })
            .collect();
        self.projects.push((
            ProjectRecord {
                key: key.to_string(),
                name: name.to_string(),
                description: None,
            },
            repos,
        ));
        self
    }

    /// Add a user account.
    pub fn with_user(mut self, username: &str, email: Option<&str>) -> Self {
        self.users.push(SourceUser {
            username: username.to_string(),
            display_name: None,
            email: email.map(str::to_string),
        });
        self
    }

    /// Fail the `n`-th project page request (1-based).
    pub fn fail_project_page_at(mut self, n: u32) -> Self {
        self.fail_project_page = Some(n);
        self
    }

    /// Fail repository listings of one project.
    pub fn fail_repos_of(mut self, key: &str) -> Self {
        self.fail_repos_of = Some(key.to_string());
        self
    }

    /// Reject every call with an authentication error.
    pub fn reject_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    /// Number of project pages requested so far.
    pub fn project_pages_served(&self) -> u32 {
        self.project_pages.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourcePlatform for MemorySource {
    async fn verify_credentials(&self) -> Result<()> {
        if self.reject_credentials {
            return Err(auth_error(Platform::Source));
        }
        Ok(())
    }

    async fn list_projects(&self, page: PageRequest) -> Result<Page<ProjectRecord>> {
        if self.reject_credentials {
            return Err(auth_error(Platform::Source));
        }
        let served = self.project_pages.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_project_page == Some(served) {
            return Err(MigrationError::NetworkError("connection reset".to_string()));
        }
        let records: Vec<ProjectRecord> = self.projects.iter().map(|(p, _)| p.clone()).collect();
        Ok(slice_page(&records, page))
    }

    async fn list_repos(&self, project_key: &str, page: PageRequest) -> Result<Page<RepoRecord>> {
        if self.fail_repos_of.as_deref() == Some(project_key) {
            return Err(MigrationError::ApiError {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        let repos = self
            .projects
            .iter()
            .find(|(p, _)| p.key == project_key)
            .map(|(_, repos)| repos.as_slice())
            .ok_or_else(|| MigrationError::NotFound(project_key.to_string()))?;
        Ok(slice_page(repos, page))
    }

    async fn list_users(&self, page: PageRequest) -> Result<Page<SourceUser>> {
        Ok(slice_page(&self.users, page))
    }
}

/// How a submitted import behaves on the in-memory target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBehavior {
    /// Report success once the status was read this many times.
    SucceedAfter(u32),
    /// Report failure with this detail on the first status read.
    Fail(String),
    /// Never finish.
    Hang,
}

impl Default for ImportBehavior {
    fn default() -> Self {
        Self::SucceedAfter(2)
    }
}

/// Submission failure injected for a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitFailure {
    /// The request never reached the target.
    Network,
    /// The target refused the request.
    Rejected(String),
    /// The credentials were refused.
    Unauthorized,
}

#[derive(Debug)]
struct Job {
    path: String,
    behavior: ImportBehavior,
    polls: u32,
    finished: bool,
}

#[derive(Debug, Default)]
struct TargetState {
    projects: HashMap<String, ExistingProject>,
    namespaces: HashSet<String>,
    jobs: HashMap<String, Job>,
    behaviors: HashMap<String, ImportBehavior>,
    submit_failures: HashMap<String, SubmitFailure>,
    users: Vec<(String, Option<String>)>,
    submissions: Vec<String>,
    deleted: Vec<String>,
    cancelled: Vec<String>,
    active: usize,
    max_active: usize,
    next_id: u64,
    transient_find_errors: u32,
    transient_status_errors: u32,
    reject_credentials: bool,
    supports_cancel: bool,
}

/// A target platform keeping everything in memory.
pub struct MemoryTarget {
    state: Mutex<TargetState>,
    default_behavior: ImportBehavior,
    lookup_delay: Duration,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    /// Create an empty target where imports succeed on the second status read.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TargetState {
                supports_cancel: true,
                ..Default::default()
            }),
            default_behavior: ImportBehavior::default(),
            lookup_delay: Duration::ZERO,
        }
    }

    /// Behaviour of imports without an explicit override.
    pub fn with_default_behavior(mut self, behavior: ImportBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Pre-create a project at `full_path`.
    pub fn with_existing_project(self, full_path: &str) -> Self {
        self.insert_project(full_path);
        self
    }

    /// Override the import behaviour for one target path.
    pub fn with_behavior(self, full_path: &str, behavior: ImportBehavior) -> Self {
        self.state
            .lock()
            .behaviors
            .insert(full_path.to_string(), behavior);
        self
    }

    /// Make submissions for one target path fail.
    pub fn with_submit_failure(self, full_path: &str, failure: SubmitFailure) -> Self {
        self.state
            .lock()
            .submit_failures
            .insert(full_path.to_string(), failure);
        self
    }

    /// Add a target account.
    pub fn with_user(self, username: &str, email: Option<&str>) -> Self {
        self.state
            .lock()
            .users
            .push((username.to_string(), email.map(str::to_string)));
        self
    }

    /// Fail the next `n` existence checks with a network error.
    pub fn with_transient_find_errors(self, n: u32) -> Self {
        self.state.lock().transient_find_errors = n;
        self
    }

    /// Fail the next `n` status reads with a network error.
    pub fn with_transient_status_errors(self, n: u32) -> Self {
        self.state.lock().transient_status_errors = n;
        self
    }

    /// Reject every call with an authentication error.
    pub fn reject_credentials(self) -> Self {
        self.state.lock().reject_credentials = true;
        self
    }

    /// Make every user lookup take `delay`.
    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    /// Behave like a target without job cancellation.
    pub fn without_cancel(self) -> Self {
        self.state.lock().supports_cancel = false;
        self
    }

    fn insert_project(&self, full_path: &str) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id.to_string();
        let (namespace, project) = full_path.rsplit_once('/').unwrap_or(("", full_path));
        state.namespaces.insert(namespace.to_string());
        state.projects.insert(
            full_path.to_string(),
            ExistingProject {
                id,
                path: TargetPath::new(namespace, project),
            },
        );
    }

    /// Full paths in submission order.
    pub fn submissions(&self) -> Vec<String> {
        self.state.lock().submissions.clone()
    }

    /// Highest number of jobs outstanding at the same time.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.state.lock().max_active
    }

    /// Whether a project exists at `full_path`.
    pub fn has_project(&self, full_path: &str) -> bool {
        self.state.lock().projects.contains_key(full_path)
    }

    /// Whether a namespace exists.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().namespaces.contains(namespace)
    }

    /// Full paths of deleted projects.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Full paths of cancelled jobs.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    fn check_credentials(&self) -> Result<()> {
        if self.state.lock().reject_credentials {
            return Err(auth_error(Platform::Target));
        }
        Ok(())
    }
}

#[async_trait]
impl TargetPlatform for MemoryTarget {
    async fn verify_credentials(&self) -> Result<()> {
        self.check_credentials()
    }

    async fn find_project(&self, path: &TargetPath) -> Result<Option<ExistingProject>> {
        self.check_credentials()?;
        let mut state = self.state.lock();
        if state.transient_find_errors > 0 {
            state.transient_find_errors -= 1;
            return Err(MigrationError::NetworkError("timed out".to_string()));
        }
        Ok(state.projects.get(&path.full_path()).cloned())
    }

    async fn ensure_namespace(&self, namespace: &str, _title: &str) -> Result<()> {
        self.check_credentials()?;
        let mut state = self.state.lock();
        let mut current = String::new();
        for segment in namespace.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            state.namespaces.insert(current.clone());
        }
        Ok(())
    }

    async fn delete_project(&self, project: &ExistingProject) -> Result<()> {
        self.check_credentials()?;
        let mut state = self.state.lock();
        let full_path = project.path.full_path();
        state
            .projects
            .remove(&full_path)
            .ok_or_else(|| MigrationError::NotFound(full_path.clone()))?;
        state.deleted.push(full_path);
        Ok(())
    }

    async fn submit_import(&self, request: &ImportRequest) -> Result<JobHandle> {
        self.check_credentials()?;
        let full_path = request.target.full_path();
        let mut state = self.state.lock();

        if let Some(failure) = state.submit_failures.get(&full_path) {
            return Err(match failure {
                SubmitFailure::Network => {
                    MigrationError::NetworkError("connection refused".to_string())
                }
                SubmitFailure::Rejected(message) => MigrationError::ApiError {
                    status: 422,
                    message: message.clone(),
                },
                SubmitFailure::Unauthorized => auth_error(Platform::Target),
            });
        }
        if state.projects.contains_key(&full_path) {
            return Err(MigrationError::ApiError {
                status: 400,
                message: "Project namespace path has already been taken".to_string(),
            });
        }
        if !state.namespaces.contains(&request.target.namespace) {
            return Err(MigrationError::ApiError {
                status: 422,
                message: format!("namespace {} does not exist", request.target.namespace),
            });
        }

        state.next_id += 1;
        let id = format!("job-{}", state.next_id);
        let behavior = state
            .behaviors
            .get(&full_path)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        state.jobs.insert(
            id.clone(),
            Job {
                path: full_path.clone(),
                behavior,
                polls: 0,
                finished: false,
            },
        );
        state.submissions.push(full_path);
        state.active += 1;
        state.max_active = state.max_active.max(state.active);

        Ok(JobHandle {
            id,
            target: request.target.clone(),
        })
    }

    async fn import_status(&self, job: &JobHandle) -> Result<ImportStatus> {
        self.check_credentials()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.transient_status_errors > 0 {
            state.transient_status_errors -= 1;
            return Err(MigrationError::NetworkError("timed out".to_string()));
        }

        let entry = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| MigrationError::NotFound(job.id.clone()))?;
        entry.polls += 1;

        let status = match &entry.behavior {
            ImportBehavior::SucceedAfter(n) if entry.polls >= *n => ImportStatus::Succeeded,
            ImportBehavior::SucceedAfter(_) | ImportBehavior::Hang => {
                if entry.polls == 1 {
                    ImportStatus::Queued
                } else {
                    ImportStatus::Running
                }
            }
            ImportBehavior::Fail(detail) => ImportStatus::Failed(detail.clone()),
        };

        if status.is_terminal() && !entry.finished {
            entry.finished = true;
            let path = entry.path.clone();
            state.active -= 1;
            if status == ImportStatus::Succeeded {
                drop(guard);
                self.insert_project(&path);
            }
        }

        Ok(status)
    }

    async fn cancel_import(&self, job: &JobHandle) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.supports_cancel {
            return Ok(false);
        }
        let entry = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| MigrationError::NotFound(job.id.clone()))?;
        if !entry.finished {
            entry.finished = true;
            state.active -= 1;
        }
        let path = entry.path.clone();
        state.cancelled.push(path);
        Ok(true)
    }

    async fn find_user(&self, user: &SourceUser) -> Result<Option<String>> {
        if !self.lookup_delay.is_zero() {
            tokio::time::sleep(self.lookup_delay).await;
        }
        let state = self.state.lock();
        let by_email = user.email.as_ref().and_then(|email| {
            state
                .users
                .iter()
                .find(|(_, e)| e.as_deref() == Some(email.as_str()))
        });
        let found = by_email.or_else(|| state.users.iter().find(|(name, _)| *name == user.username));
        Ok(found.map(|(name, _)| name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_target_job_lifecycle() {
        let target = MemoryTarget::new();
        target.ensure_namespace("team-a", "Team A").await.unwrap();

        let request = ImportRequest {
            unit: crate::types::UnitId::new("A", "svc"),
            project_key: "A".into(),
            repo_slug: "svc".into(),
            target: TargetPath::new("team-a", "svc"),
            project_name: "svc".into(),
        };
        let job = target.submit_import(&request).await.unwrap();
        assert_eq!(target.import_status(&job).await.unwrap(), ImportStatus::Queued);
        assert_eq!(target.import_status(&job).await.unwrap(), ImportStatus::Succeeded);
        assert!(target.has_project("team-a/svc"));
        assert_eq!(target.max_concurrent_jobs(), 1);

        // a second import of the same path is refused
        assert!(target.submit_import(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_source_pages() {
        let source = MemorySource::new()
            .with_project("A", "A", &[])
            .with_project("B", "B", &[])
            .with_project("C", "C", &[]);
        let page = source
            .list_projects(PageRequest { start: 0, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.values.len(), 2);
        assert_eq!(page.next_start, Some(2));

        let last = source
            .list_projects(PageRequest { start: 2, limit: 2 })
            .await
            .unwrap();
        assert_eq!(last.values.len(), 1);
        assert_eq!(last.next_start, None);
    }
}
