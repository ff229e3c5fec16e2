//! Configuration passed into a migration run.
//!
//! A [`MigrationConfig`] is built once by the caller and threaded through
//! the run unchanged. Loading it from files or the environment is the
//! caller's job.

use crate::error::{MigrationError, Result};
use crate::retry::RetryPolicy;
use crate::secret::SecretString;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Connection parameters for the source platform.
#[derive(Debug, Clone)]
pub struct SourceConnection {
    /// Base URL, e.g. "https://bitbucket.example.com".
    pub url: String,
    pub username: String,
    /// Personal access token or password.
    pub token: SecretString,
}

/// Connection parameters for the target platform.
#[derive(Debug, Clone)]
pub struct TargetConnection {
    /// Base URL, e.g. "https://gitlab.example.com".
    pub url: String,
    /// Personal access token.
    pub token: SecretString,
}

/// What to do when the mapped project already exists and skip mode is off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingTargetPolicy {
    /// Fail the unit with "target already exists".
    #[default]
    Fail,
    /// Delete the existing project and import again.
    Overwrite,
}

impl FromStr for ExistingTargetPolicy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(MigrationError::InvalidConfig(format!(
                "unknown existing-target policy '{other}', expected 'fail' or 'overwrite'"
            ))),
        }
    }
}

/// Behavioural options of a run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Treat projects already present on the target as migrated.
    pub skip_existing: bool,

    /// Prefix for target namespaces; empty means top-level groups.
    pub group_prefix: String,

    /// Maximum number of imports in flight.
    pub parallel_imports: usize,

    /// Policy for existing targets when `skip_existing` is off.
    pub on_existing: ExistingTargetPolicy,

    /// Maximum number of concurrent existence checks.
    /// Defaults to `parallel_imports`.
    pub existence_check_concurrency: Option<usize>,

    /// Delay between two status reads of the same import.
    pub poll_interval: Duration,

    /// Per-unit budget from submission to terminal status.
    pub import_timeout: Duration,

    /// Retry failed submissions. Off by default to avoid duplicate jobs.
    pub retry_submissions: bool,

    /// Backoff used for retried calls.
    pub retry: RetryPolicy,

    /// Resolve source users to target accounts.
    pub map_identities: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
            group_prefix: String::new(),
            parallel_imports: 1,
            on_existing: ExistingTargetPolicy::Fail,
            existence_check_concurrency: None,
            poll_interval: Duration::from_secs(5),
            import_timeout: Duration::from_secs(60 * 60),
            retry_submissions: false,
            retry: RetryPolicy::default(),
            map_identities: true,
        }
    }
}

impl MigrationOptions {
    /// Enable or disable skip mode.
    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Set the namespace prefix.
    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }

    /// Set the number of concurrent imports.
    pub fn with_parallel_imports(mut self, parallel: usize) -> Self {
        self.parallel_imports = parallel;
        self
    }

    /// Set the existing-target policy.
    pub fn with_on_existing(mut self, policy: ExistingTargetPolicy) -> Self {
        self.on_existing = policy;
        self
    }

    /// Set the existence check concurrency.
    pub fn with_existence_check_concurrency(mut self, concurrency: usize) -> Self {
        self.existence_check_concurrency = Some(concurrency);
        self
    }

    /// Set the status polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-unit import timeout.
    pub fn with_import_timeout(mut self, timeout: Duration) -> Self {
        self.import_timeout = timeout;
        self
    }

    /// Enable or disable submission retries.
    pub fn with_retry_submissions(mut self, retry: bool) -> Self {
        self.retry_submissions = retry;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable or disable identity mapping.
    pub fn with_identity_mapping(mut self, map: bool) -> Self {
        self.map_identities = map;
        self
    }

    /// Effective existence check concurrency.
    pub fn check_concurrency(&self) -> usize {
        self.existence_check_concurrency
            .unwrap_or(self.parallel_imports)
            .max(1)
    }

    /// Reject option combinations the run cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_imports == 0 {
            return Err(MigrationError::InvalidConfig(
                "parallel_imports must be at least 1".to_string(),
            ));
        }
        if self.existence_check_concurrency == Some(0) {
            return Err(MigrationError::InvalidConfig(
                "existence_check_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(MigrationError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.import_timeout < self.poll_interval {
            return Err(MigrationError::InvalidConfig(
                "import_timeout must not be shorter than poll_interval".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MigrationError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub source: SourceConnection,
    pub target: TargetConnection,
    pub options: MigrationOptions,
}

impl MigrationConfig {
    /// Create a configuration with default options.
    pub fn new(source: SourceConnection, target: TargetConnection) -> Self {
        Self {
            source,
            target,
            options: MigrationOptions::default(),
        }
    }

    /// Replace the options.
    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate connection parameters and options.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("source url", &self.source.url), ("target url", &self.target.url)] {
            url::Url::parse(value)
                .map_err(|e| MigrationError::InvalidConfig(format!("{name} '{value}': {e}")))?;
        }
        if self.source.username.is_empty() {
            return Err(MigrationError::InvalidConfig(
                "source username is required".to_string(),
            ));
        }
        if self.source.token.is_empty() || self.target.token.is_empty() {
            return Err(MigrationError::InvalidConfig(
                "source and target credentials are required".to_string(),
            ));
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MigrationConfig {
        MigrationConfig::new(
            SourceConnection {
                url: "https://bitbucket.example.com".into(),
                username: "migrator".into(),
                token: "bb-token".into(),
            },
            TargetConnection {
                url: "https://gitlab.example.com".into(),
                token: "glpat-token".into(),
            },
        )
    }

    #[test]
    fn test_defaults() {
        let options = MigrationOptions::default();
        assert!(options.skip_existing);
        assert!(options.group_prefix.is_empty());
        assert_eq!(options.parallel_imports, 1);
        assert_eq!(options.on_existing, ExistingTargetPolicy::Fail);
        assert!(!options.retry_submissions);
        assert_eq!(options.check_concurrency(), 1);
    }

    #[test]
    fn test_options_builder() {
        let options = MigrationOptions::default()
            .with_group_prefix("bb-")
            .with_parallel_imports(4)
            .with_skip_existing(false)
            .with_on_existing(ExistingTargetPolicy::Overwrite);

        assert_eq!(options.group_prefix, "bb-");
        assert_eq!(options.check_concurrency(), 4);
        assert!(!options.skip_existing);
        assert_eq!(options.on_existing, ExistingTargetPolicy::Overwrite);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = config().with_options(MigrationOptions::default().with_parallel_imports(0));
        assert!(matches!(
            config.validate(),
            Err(MigrationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        assert!(config().validate().is_ok());

        let mut config = config();
        config.target.url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "Overwrite".parse::<ExistingTargetPolicy>().unwrap(),
            ExistingTargetPolicy::Overwrite
        );
        assert!("merge".parse::<ExistingTargetPolicy>().is_err());
    }
}
