//! Layered configuration for the `ferry` binary.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. Config file given with `--config` (TOML, YAML or JSON)
//! 3. `BITBUCKET_URL`, `BITBUCKET_USER`, `BITBUCKET_TOKEN`, `GITLAB_URL`, `GITLAB_TOKEN`
//! 4. `FERRY_` variables, e.g. `FERRY_MIGRATION__PARALLEL_IMPORTS=4`
//! 5. Command-line flags
//!
//! Example config file:
//! ```toml
//! [bitbucket]
//! url = "https://bitbucket.example.com"
//! user = "migrator"
//! token = "..."  # or use BITBUCKET_TOKEN
//!
//! [gitlab]
//! url = "https://gitlab.example.com"
//! token = "glpat-..."  # or use GITLAB_TOKEN
//!
//! [migration]
//! group_prefix = "bb-"
//! parallel_imports = 4
//! skip_existing = true
//! on_existing = "fail"
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config as ConfigBuilder, Environment, File};
use ferry_migrate::{
    ExistingTargetPolicy, MigrationConfig, MigrationOptions, SecretString, SourceConnection,
    TargetConnection,
};
use serde::Deserialize;
use validator::{Validate, ValidationError};

fn non_empty_secret(secret: &SecretString) -> Result<(), ValidationError> {
    if secret.is_empty() {
        let mut err = ValidationError::new("length");
        err.message = Some("token must not be empty".into());
        return Err(err);
    }
    Ok(())
}

/// Bitbucket Server connection.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct BitbucketSettings {
    #[validate(url)]
    pub url: String,
    #[validate(length(min = 1, message = "user must not be empty"))]
    pub user: String,
    #[validate(custom(function = "non_empty_secret"))]
    pub token: SecretString,
}

/// GitLab connection.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct GitLabSettings {
    #[validate(url)]
    pub url: String,
    #[validate(custom(function = "non_empty_secret"))]
    pub token: SecretString,
}

/// Behaviour of a migration run.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct MigrationSettings {
    pub skip_existing: bool,
    pub group_prefix: String,
    #[validate(range(min = 1, max = 64))]
    pub parallel_imports: usize,
    pub on_existing: ExistingTargetPolicy,
    #[validate(range(min = 1, max = 256))]
    pub existence_check_concurrency: Option<usize>,
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,
    #[validate(range(min = 1))]
    pub import_timeout_secs: u64,
    pub retry_submissions: bool,
    pub map_identities: bool,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        let options = MigrationOptions::default();
        Self {
            skip_existing: options.skip_existing,
            group_prefix: options.group_prefix,
            parallel_imports: options.parallel_imports,
            on_existing: options.on_existing,
            existence_check_concurrency: options.existence_check_concurrency,
            poll_interval_secs: options.poll_interval.as_secs(),
            import_timeout_secs: options.import_timeout.as_secs(),
            retry_submissions: options.retry_submissions,
            map_identities: options.map_identities,
        }
    }
}

/// Complete settings of the binary.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(nested)]
    pub bitbucket: BitbucketSettings,
    #[validate(nested)]
    pub gitlab: GitLabSettings,
    #[validate(nested)]
    pub migration: MigrationSettings,
}

impl Settings {
    /// Load settings from the optional file and the process environment.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_from(file, std::env::vars().collect())
    }

    /// Load settings from the optional file and the given environment.
    pub fn load_from(file: Option<&Path>, env: HashMap<String, String>) -> anyhow::Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(File::from(path).required(true));
        }

        // BITBUCKET_URL -> bitbucket.url, GITLAB_TOKEN -> gitlab.token
        let platform_env: HashMap<String, String> = env
            .iter()
            .filter(|(key, _)| key.starts_with("BITBUCKET_") || key.starts_with("GITLAB_"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        builder = builder.add_source(
            Environment::default()
                .separator("_")
                .source(Some(platform_env)),
        );

        // FERRY_MIGRATION__GROUP_PREFIX -> migration.group_prefix
        builder = builder.add_source(
            Environment::with_prefix("FERRY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(env)),
        );

        let settings = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize::<Settings>()
            .context("invalid configuration")?;
        Ok(settings)
    }

    /// Validate and convert into a run configuration.
    pub fn to_migration_config(&self) -> anyhow::Result<MigrationConfig> {
        self.validate().context("invalid configuration")?;

        let m = &self.migration;
        let mut options = MigrationOptions::default()
            .with_skip_existing(m.skip_existing)
            .with_group_prefix(m.group_prefix.clone())
            .with_parallel_imports(m.parallel_imports)
            .with_on_existing(m.on_existing)
            .with_poll_interval(Duration::from_secs(m.poll_interval_secs))
            .with_import_timeout(Duration::from_secs(m.import_timeout_secs))
            .with_retry_submissions(m.retry_submissions)
            .with_identity_mapping(m.map_identities);
        if let Some(concurrency) = m.existence_check_concurrency {
            options = options.with_existence_check_concurrency(concurrency);
        }

        let config = MigrationConfig::new(
            SourceConnection {
                url: self.bitbucket.url.clone(),
                username: self.bitbucket.user.clone(),
                token: self.bitbucket.token.clone(),
            },
            TargetConnection {
                url: self.gitlab.url.clone(),
                token: self.gitlab.token.clone(),
            },
        )
        .with_options(options);

        config.validate()?;
        Ok(config)
    }
}
