//! Progress reporting for migration runs.
//!
//! [`MigrationProgress`] keeps the counters of the current phase and hands a
//! [`ProgressSnapshot`] to an optional observer after every change.
//! [`ConsoleProgressReporter`] is the observer used by the CLI.

use parking_lot::Mutex;

/// Receives a snapshot after every progress change.
pub type ProgressObserver = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Phases of a migration run, in order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationPhase {
    /// Checking credentials on both platforms.
    #[default]
    Authenticating,
    /// Listing source projects and repositories.
    CollectingInventory,
    /// Resolving source users on the target.
    MappingIdentities,
    /// Looking for projects that already exist on the target.
    CheckingTargets,
    /// Submitting and polling imports.
    Importing,
    /// Run finished.
    Complete,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Authenticating => "Authenticating",
            Self::CollectingInventory => "Collecting inventory",
            Self::MappingIdentities => "Mapping identities",
            Self::CheckingTargets => "Checking targets",
            Self::Importing => "Importing",
            Self::Complete => "Complete",
        };
        f.write_str(label)
    }
}

/// State of the current phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub phase: MigrationPhase,
    /// Items finished in this phase, failed ones included.
    pub completed: u64,
    /// Items that finished with a failure in this phase.
    pub failed: u64,
    /// Items expected in this phase; zero when unknown.
    pub total: u64,
    /// Last item that finished.
    pub last_item: Option<String>,
    /// Free-form note, e.g. a retry in progress.
    pub note: Option<String>,
}

impl ProgressSnapshot {
    /// Share of the phase that is done, `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        (self.total > 0).then(|| self.completed.min(self.total) as f64 / self.total as f64)
    }
}

/// Phase and counters of a run, shared between the orchestrator and its workers.
#[derive(Default)]
pub struct MigrationProgress {
    state: Mutex<ProgressSnapshot>,
    observer: Option<ProgressObserver>,
}

impl MigrationProgress {
    /// Progress without an observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress that reports every change to `observer`.
    pub fn observed_by(observer: ProgressObserver) -> Self {
        Self {
            state: Mutex::default(),
            observer: Some(observer),
        }
    }

    /// Enter `phase` with `total` expected items and reset the counters.
    pub fn begin(&self, phase: MigrationPhase, total: u64) {
        self.update(|state| {
            *state = ProgressSnapshot {
                phase,
                total,
                ..ProgressSnapshot::default()
            };
        });
    }

    /// Count one finished item.
    pub fn advance(&self, item: &str, ok: bool) {
        self.update(|state| {
            state.completed += 1;
            if !ok {
                state.failed += 1;
            }
            state.last_item = Some(item.to_string());
            state.note = None;
        });
    }

    /// Attach a note to the current phase.
    pub fn note(&self, note: impl Into<String>) {
        let note = note.into();
        self.update(|state| state.note = Some(note));
    }

    /// Current phase.
    pub fn phase(&self) -> MigrationPhase {
        self.state.lock().phase
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().clone()
    }

    fn update(&self, change: impl FnOnce(&mut ProgressSnapshot)) {
        let snapshot = {
            let mut state = self.state.lock();
            change(&mut state);
            state.clone()
        };
        // Observers run outside the lock so they may read progress again.
        if let Some(observer) = &self.observer {
            observer(&snapshot);
        }
    }
}

/// Renders progress as an indicatif bar on stderr.
pub struct ConsoleProgressReporter {
    bar: indicatif::ProgressBar,
}

impl ConsoleProgressReporter {
    const TEMPLATE: &'static str =
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

    /// A reporter drawing to stderr.
    pub fn new() -> Self {
        Self::drawing_to(indicatif::ProgressDrawTarget::stderr())
    }

    /// A reporter that draws nothing.
    pub fn hidden() -> Self {
        Self::drawing_to(indicatif::ProgressDrawTarget::hidden())
    }

    /// Draw only when not `quiet` and stderr is an interactive terminal.
    pub fn for_terminal(quiet: bool) -> Self {
        if quiet || !console::Term::stderr().features().is_attended() {
            Self::hidden()
        } else {
            Self::new()
        }
    }

    fn drawing_to(target: indicatif::ProgressDrawTarget) -> Self {
        let bar = indicatif::ProgressBar::with_draw_target(Some(0), target);
        let style = indicatif::ProgressStyle::default_bar()
            .template(Self::TEMPLATE)
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }

    /// Observer that mirrors snapshots onto the bar.
    pub fn observer(&self) -> ProgressObserver {
        let bar = self.bar.clone();
        Box::new(move |snapshot: &ProgressSnapshot| {
            bar.set_length(snapshot.total);
            bar.set_position(snapshot.completed);
            bar.set_message(status_line(snapshot));
        })
    }

    /// Print a line above the bar without tearing it.
    pub fn println(&self, line: &str) {
        self.bar.println(line);
    }

    /// Stop the bar, leaving `message` in place.
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

impl Default for ConsoleProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn status_line(snapshot: &ProgressSnapshot) -> String {
    let mut line = snapshot.phase.to_string();
    if let Some(item) = &snapshot.last_item {
        line.push_str(": ");
        line.push_str(item);
    }
    if snapshot.failed > 0 {
        line.push_str(&format!(" ({} failed)", snapshot.failed));
    }
    if let Some(note) = &snapshot.note {
        line.push_str(" - ");
        line.push_str(note);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_phase_counters() {
        let progress = MigrationProgress::new();
        assert_eq!(progress.phase(), MigrationPhase::Authenticating);
        assert_eq!(progress.snapshot().fraction(), None);

        progress.begin(MigrationPhase::Importing, 4);
        progress.advance("A/one", true);
        progress.advance("A/two", false);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.phase, MigrationPhase::Importing);
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.fraction(), Some(0.5));

        progress.begin(MigrationPhase::Complete, 0);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.completed, 0);
        assert!(snapshot.last_item.is_none());
    }

    #[test]
    fn test_observer_sees_every_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = MigrationProgress::observed_by(Box::new(move |snapshot| {
            sink.lock().push(snapshot.clone());
        }));

        progress.begin(MigrationPhase::CheckingTargets, 2);
        progress.note("rate limited");
        progress.advance("A/one", true);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].note.as_deref(), Some("rate limited"));
        // advancing clears the note
        assert_eq!(seen[2].note, None);
        assert_eq!(seen[2].last_item.as_deref(), Some("A/one"));
    }

    #[test]
    fn test_status_line() {
        let snapshot = ProgressSnapshot {
            phase: MigrationPhase::Importing,
            completed: 3,
            failed: 1,
            total: 5,
            last_item: Some("A/svc".into()),
            note: None,
        };
        assert_eq!(status_line(&snapshot), "Importing: A/svc (1 failed)");
    }

    #[test]
    fn test_hidden_reporter_accepts_snapshots() {
        let reporter = ConsoleProgressReporter::hidden();
        let observer = reporter.observer();
        observer(&ProgressSnapshot::default());
        reporter.finish("done");
    }
}
