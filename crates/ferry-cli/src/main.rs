//! Ferry CLI - Migrate Bitbucket Server repositories into GitLab.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ferry_migrate::{ExistingTargetPolicy, MigrationConfig};
use tokio_util::sync::CancellationToken;

mod commands;
mod logging;
mod settings;
mod shutdown;

use logging::LogFormat;
use settings::Settings;

/// Ferry - Bitbucket Server to GitLab migration
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify Bitbucket Server and GitLab credentials
    Check,

    /// Show how repositories would be mapped, without importing anything
    Plan {
        /// Prefix for target groups
        #[arg(long)]
        group_prefix: Option<String>,
    },

    /// Migrate every repository
    Migrate {
        /// Where to write the JSON report
        #[arg(long, default_value = "ferry-report.json")]
        report: PathBuf,

        /// Resume from the report of an earlier run
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Prefix for target groups
        #[arg(long)]
        group_prefix: Option<String>,

        /// Maximum number of concurrent imports
        #[arg(long)]
        parallel_imports: Option<usize>,

        /// Do not treat existing target projects as migrated
        #[arg(long)]
        no_skip_existing: bool,

        /// What to do with existing targets when not skipping
        #[arg(long)]
        on_existing: Option<ExistingTargetPolicy>,

        /// Disable the progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Render a persisted report
    Report {
        /// Report file
        file: PathBuf,
    },
}

/// Command-line values that override the loaded settings.
#[derive(Debug, Default)]
struct Overrides {
    group_prefix: Option<String>,
    parallel_imports: Option<usize>,
    no_skip_existing: bool,
    on_existing: Option<ExistingTargetPolicy>,
}

impl Overrides {
    fn apply(self, settings: &mut Settings) {
        if let Some(prefix) = self.group_prefix {
            settings.migration.group_prefix = prefix;
        }
        if let Some(parallel) = self.parallel_imports {
            settings.migration.parallel_imports = parallel;
        }
        if self.no_skip_existing {
            settings.migration.skip_existing = false;
        }
        if let Some(policy) = self.on_existing {
            settings.migration.on_existing = policy;
        }
    }
}

fn load_config(file: Option<&Path>, overrides: Overrides) -> anyhow::Result<MigrationConfig> {
    let mut settings = Settings::load(file)?;
    overrides.apply(&mut settings);
    settings.to_migration_config()
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Check => {
            let config = load_config(cli.config.as_deref(), Overrides::default())?;
            commands::check(config).await
        }
        Commands::Plan { group_prefix } => {
            let overrides = Overrides {
                group_prefix,
                ..Overrides::default()
            };
            let config = load_config(cli.config.as_deref(), overrides)?;
            commands::plan(config).await
        }
        Commands::Migrate {
            report,
            resume,
            group_prefix,
            parallel_imports,
            no_skip_existing,
            on_existing,
            quiet,
        } => {
            let overrides = Overrides {
                group_prefix,
                parallel_imports,
                no_skip_existing,
                on_existing,
            };
            let config = load_config(cli.config.as_deref(), overrides)?;

            let cancel = CancellationToken::new();
            shutdown::setup_shutdown_handler(cancel.clone());

            let args = commands::MigrateArgs {
                report,
                resume,
                quiet,
            };
            commands::migrate(config, args, cancel).await
        }
        Commands::Report { file } => commands::report(&file),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init_logging(logging::level_for(cli.verbose), cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_migrate() {
        let cli = Cli::try_parse_from([
            "ferry",
            "-vv",
            "migrate",
            "--group-prefix",
            "bb-",
            "--parallel-imports",
            "4",
            "--no-skip-existing",
            "--on-existing",
            "overwrite",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Migrate {
                report,
                resume,
                group_prefix,
                parallel_imports,
                no_skip_existing,
                on_existing,
                quiet,
            } => {
                assert_eq!(report, PathBuf::from("ferry-report.json"));
                assert!(resume.is_none());
                assert_eq!(group_prefix.as_deref(), Some("bb-"));
                assert_eq!(parallel_imports, Some(4));
                assert!(no_skip_existing);
                assert_eq!(on_existing, Some(ExistingTargetPolicy::Overwrite));
                assert!(!quiet);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ferry",
            "check",
            "--log-format",
            "json",
            "--config",
            "ferry.toml",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("ferry.toml")));
        assert!(matches!(cli.command, Commands::Check));
    }

    #[test]
    fn test_parse_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["ferry", "migrate", "--on-existing", "merge"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_report_requires_file() {
        assert!(Cli::try_parse_from(["ferry", "report"]).is_err());
        assert!(Cli::try_parse_from(["ferry", "report", "run.json"]).is_ok());
    }

    #[test]
    fn test_overrides_apply() {
        let mut settings = Settings::default();
        Overrides {
            group_prefix: Some("bb-".into()),
            parallel_imports: Some(8),
            no_skip_existing: true,
            on_existing: Some(ExistingTargetPolicy::Overwrite),
        }
        .apply(&mut settings);

        assert_eq!(settings.migration.group_prefix, "bb-");
        assert_eq!(settings.migration.parallel_imports, 8);
        assert!(!settings.migration.skip_existing);
        assert_eq!(settings.migration.on_existing, ExistingTargetPolicy::Overwrite);
    }
}
