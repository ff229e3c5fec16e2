//! Resolution of source user accounts on the target.
//!
//! The result is informational: GitLab's importer attributes history by
//! email on its own, so an unmatched user never blocks a run.

use crate::error::Result;
use crate::inventory::collect_pages;
use crate::platform::{PageRequest, SourcePlatform, TargetPlatform};
use crate::types::IdentityReport;
use std::sync::Arc;

/// Maps source users to target usernames.
pub struct IdentityMapper {
    source: Arc<dyn SourcePlatform>,
    target: Arc<dyn TargetPlatform>,
}

impl IdentityMapper {
    /// Mapper reading users from `source` and resolving them on `target`.
    pub fn new(source: Arc<dyn SourcePlatform>, target: Arc<dyn TargetPlatform>) -> Self {
        Self { source, target }
    }

    /// Read every source user and look each one up on the target.
    ///
    /// Fails only when the source user listing fails; lookup errors leave
    /// the user unmatched.
    pub async fn map(&self) -> Result<IdentityReport> {
        let users = collect_pages(PageRequest::first(), |page| {
            let source = self.source.clone();
            async move { source.list_users(page).await }
        })
        .await?;

        let mut report = IdentityReport::default();
        for user in users {
            match self.target.find_user(&user).await {
                Ok(Some(target_user)) => {
                    report.mapped.insert(user.username, target_user);
                }
                Ok(None) => report.unmatched.push(user.username),
                Err(e) => {
                    tracing::debug!(user = %user.username, error = %e, "User lookup failed");
                    report.unmatched.push(user.username);
                }
            }
        }

        tracing::info!(
            mapped = report.mapped.len(),
            unmatched = report.unmatched.len(),
            "Mapped source identities"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySource, MemoryTarget};

    #[tokio::test]
    async fn test_matches_by_email_then_username() {
        let source = MemorySource::new()
            .with_user("jdoe", Some("jane@example.com"))
            .with_user("bob", None)
            .with_user("ghost", Some("ghost@example.com"));
        let target = MemoryTarget::new()
            .with_user("jane.doe", Some("jane@example.com"))
            .with_user("bob", Some("bob@example.com"));

        let report = IdentityMapper::new(Arc::new(source), Arc::new(target))
            .map()
            .await
            .unwrap();

        assert_eq!(report.mapped.get("jdoe").map(String::as_str), Some("jane.doe"));
        assert_eq!(report.mapped.get("bob").map(String::as_str), Some("bob"));
        assert_eq!(report.unmatched, vec!["ghost".to_string()]);
    }
}
