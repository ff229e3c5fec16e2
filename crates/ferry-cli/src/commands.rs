//! CLI command implementations.

use anyhow::Context;
use console::style;
use ferry_migrate::{
    ConsoleProgressReporter, MigrationConfig, MigrationError, MigrationProgress, MigrationReport,
    Orchestrator,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::shutdown::INTERRUPTED;

/// Arguments of `ferry migrate` that do not change the run configuration.
#[derive(Debug, Clone)]
pub struct MigrateArgs {
    /// Where the JSON report is written.
    pub report: PathBuf,
    /// Report of an earlier run to resume from.
    pub resume: Option<PathBuf>,
    /// Disable the progress bar.
    pub quiet: bool,
}

/// Verify both sets of credentials.
pub async fn check(config: MigrationConfig) -> anyhow::Result<ExitCode> {
    tracing::info!(
        source = %config.source.url,
        target = %config.target.url,
        "Checking credentials"
    );

    let orchestrator = Orchestrator::connect(config)?;
    orchestrator
        .preflight()
        .await
        .context("credential check failed")?;

    println!(
        "{} Credentials accepted by Bitbucket Server and GitLab",
        style("✓").green()
    );
    Ok(ExitCode::SUCCESS)
}

/// Print the planned mapping without touching the target.
pub async fn plan(config: MigrationConfig) -> anyhow::Result<ExitCode> {
    let orchestrator = Orchestrator::connect(config)?;
    let plan = orchestrator.plan().await.context("planning failed")?;
    plan.print();

    if plan.failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Run the migration, print the summary and write the report.
pub async fn migrate(
    config: MigrationConfig,
    args: MigrateArgs,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    let reporter = ConsoleProgressReporter::for_terminal(args.quiet);
    let progress = Arc::new(MigrationProgress::observed_by(reporter.observer()));

    let mut orchestrator = Orchestrator::connect(config)?
        .with_progress(progress)
        .with_cancellation(cancel);

    if let Some(path) = &args.resume {
        let previous = read_report(path)?;
        tracing::info!(
            path = %path.display(),
            units = previous.units.len(),
            "Resuming from previous report"
        );
        orchestrator = orchestrator.with_previous_report(previous);
    }

    let report = match orchestrator.run().await {
        Ok(report) => report,
        Err(MigrationError::Aborted { reason, report }) => {
            reporter.finish("aborted");
            report.print_summary();
            write_report(&args.report, &report)?;
            eprintln!("{} Run aborted: {reason}", style("✗").red());
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            reporter.finish("failed");
            return Err(e).context("migration failed");
        }
    };

    reporter.finish("done");
    report.print_summary();
    write_report(&args.report, &report)?;
    println!("\nReport written to {}", args.report.display());

    Ok(exit_code_for(&report))
}

/// Render a persisted report.
pub fn report(path: &Path) -> anyhow::Result<ExitCode> {
    let report = read_report(path)?;
    report.print_summary();
    Ok(exit_code_for(&report))
}

fn exit_code_for(report: &MigrationReport) -> ExitCode {
    if report.cancelled {
        ExitCode::from(INTERRUPTED)
    } else if report.is_successful() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read_report(path: &Path) -> anyhow::Result<MigrationReport> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    MigrationReport::from_json(&data)
        .with_context(|| format!("failed to parse report {}", path.display()))
}

fn write_report(path: &Path, report: &MigrationReport) -> anyhow::Result<()> {
    let json = report.to_json().context("failed to serialize report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    tracing::info!(path = %path.display(), "Report written");
    Ok(())
}
