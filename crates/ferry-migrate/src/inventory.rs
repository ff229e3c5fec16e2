//! Enumeration of source projects and repositories.

use crate::error::{MigrationError, Result};
use crate::platform::{Page, PageRequest, ProjectRecord, SourcePlatform};
use crate::types::{SourceProject, SourceRepo};
use futures::{Stream, TryStreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Drain every page of a paginated listing.
///
/// Fails on the first page error, and when the listing does not advance.
pub async fn collect_pages<T, F, Fut>(first: PageRequest, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut all_items = Vec::new();
    let mut request = Some(first);

    while let Some(current) = request {
        let page = fetch(current).await?;
        all_items.extend(page.values);
        request = advance(current, page.next_start)?;
    }

    Ok(all_items)
}

fn advance(current: PageRequest, next_start: Option<u64>) -> Result<Option<PageRequest>> {
    match next_start {
        Some(next) if next <= current.start => Err(MigrationError::InvalidResponse(format!(
            "pagination did not advance past offset {}",
            current.start
        ))),
        Some(next) => Ok(Some(current.at(next))),
        None => Ok(None),
    }
}

/// The complete source listing of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Projects in source listing order.
    pub projects: Vec<SourceProject>,
}

impl Inventory {
    /// Number of repositories across all projects.
    pub fn repo_count(&self) -> usize {
        self.projects.iter().map(|p| p.repos.len()).sum()
    }
}

struct Cursor {
    buffered: VecDeque<ProjectRecord>,
    next: Option<PageRequest>,
}

/// Reads the source inventory page by page.
pub struct InventoryCollector {
    source: Arc<dyn SourcePlatform>,
    page_size: u32,
}

impl InventoryCollector {
    /// Create a collector over a source platform.
    pub fn new(source: Arc<dyn SourcePlatform>) -> Self {
        Self {
            source,
            page_size: PageRequest::DEFAULT_LIMIT,
        }
    }

    /// Set the page size used for listing calls.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn first_page(&self) -> PageRequest {
        PageRequest {
            start: 0,
            limit: self.page_size,
        }
    }

    /// Lazily yield projects, each with all of its repositories.
    ///
    /// The stream ends after the first error.
    pub fn stream(&self) -> impl Stream<Item = Result<SourceProject>> + '_ {
        let start = Cursor {
            buffered: VecDeque::new(),
            next: Some(self.first_page()),
        };

        futures::stream::try_unfold(start, move |mut cursor| async move {
            loop {
                if let Some(record) = cursor.buffered.pop_front() {
                    let project = self.load_project(record).await?;
                    return Ok(Some((project, cursor)));
                }

                let Some(request) = cursor.next else {
                    return Ok(None);
                };
                let page = self
                    .source
                    .list_projects(request)
                    .await
                    .map_err(|e| collection_error(format!("listing projects at {}", request.start), e))?;
                debug!(
                    start = request.start,
                    count = page.values.len(),
                    "Fetched project page"
                );
                cursor.next = advance(request, page.next_start).map_err(|e| {
                    collection_error(format!("listing projects at {}", request.start), e)
                })?;
                cursor.buffered.extend(page.values);
            }
        })
    }

    /// Collect the whole inventory. Any page failure fails the collection.
    pub async fn collect(&self) -> Result<Inventory> {
        let projects: Vec<SourceProject> = self.stream().try_collect().await?;
        let inventory = Inventory { projects };
        tracing::info!(
            projects = inventory.projects.len(),
            repositories = inventory.repo_count(),
            "Collected source inventory"
        );
        Ok(inventory)
    }

    async fn load_project(&self, record: ProjectRecord) -> Result<SourceProject> {
        let key = record.key.clone();
        let repos = collect_pages(self.first_page(), |page| {
            let source = self.source.clone();
            let key = key.clone();
            async move { source.list_repos(&key, page).await }
        })
        .await
        .map_err(|e| collection_error(format!("listing repositories of {key}"), e))?;

        debug!(project = %key, repositories = repos.len(), "Fetched project repositories");

        Ok(SourceProject {
            repos: repos
                .into_iter()
                .map(|r| SourceRepo {
                    slug: r.slug,
                    name: r.name,
                    project_key: record.key.clone(),
                    description: r.description,
                    public: r.public,
                })
                .collect(),
            key: record.key,
            name: record.name,
            description: record.description,
        })
    }
}

/// Credential errors stay as they are; everything else becomes a collection failure.
fn collection_error(context: String, e: MigrationError) -> MigrationError {
    match e {
        MigrationError::AuthenticationFailed { .. } | MigrationError::CollectionFailed(_) => e,
        other => MigrationError::CollectionFailed(format!("{context}: {other}")),
    }
}
