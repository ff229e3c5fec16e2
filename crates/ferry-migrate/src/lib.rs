//! # Ferry Migration Core
//!
//! This crate migrates every repository of a Bitbucket Server instance into
//! GitLab, project by project, using GitLab's Bitbucket Server importer.
//!
//! ## Features
//!
//! - **Inventory**: Paginated listing of source projects and repositories
//! - **Naming**: Deterministic mapping to GitLab paths with collision detection
//! - **Skip/Resume**: Projects already on the target are left alone
//! - **Dispatch**: Bounded parallel imports with per-unit timeouts
//! - **Reporting**: A terminal outcome for every repository, persisted as JSON
//!
//! ## Example
//!
//! ```rust,ignore
//! use ferry_migrate::{MigrationConfig, MigrationOptions, Orchestrator, SourceConnection, TargetConnection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MigrationConfig::new(
//!         SourceConnection {
//!             url: "https://bitbucket.example.com".to_string(),
//!             username: "migrator".to_string(),
//!             token: "bb_token".into(),
//!         },
//!         TargetConnection {
//!             url: "https://gitlab.example.com".to_string(),
//!             token: "glpat-xxx".into(),
//!         },
//!     )
//!     .with_options(
//!         MigrationOptions::default()
//!             .with_group_prefix("bb-")
//!             .with_parallel_imports(4),
//!     );
//!
//!     let report = Orchestrator::connect(config)?.run().await?;
//!     report.print_summary();
//!     Ok(())
//! }
//! ```

pub mod bitbucket;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gitlab;
pub mod identity;
pub mod inventory;
pub mod memory;
pub mod naming;
pub mod orchestrator;
pub mod platform;
pub mod progress;
pub mod resume;
pub mod retry;
pub mod secret;
pub mod tracker;
pub mod types;

// Re-export main types
pub use bitbucket::BitbucketServerClient;
pub use config::{
    ExistingTargetPolicy, MigrationConfig, MigrationOptions, SourceConnection, TargetConnection,
};
pub use error::{MigrationError, Platform, Result};
pub use gitlab::GitLabClient;
pub use naming::NamespaceMapper;
pub use orchestrator::{MigrationPlan, Orchestrator};
pub use platform::{SourcePlatform, TargetPlatform};
pub use progress::{
    ConsoleProgressReporter, MigrationPhase, MigrationProgress, ProgressObserver, ProgressSnapshot,
};
pub use retry::RetryPolicy;
pub use secret::SecretString;
pub use tracker::StatusTracker;
pub use types::*;

/// Version of the migration core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
