//! Ctrl+C handling for the `ferry` binary.

use console::Term;
use tokio_util::sync::CancellationToken;

/// Exit code after an interrupt.
pub const INTERRUPTED: u8 = 130;

/// Set up the Ctrl+C handler for graceful shutdown.
///
/// The first Ctrl+C cancels `token`: no new imports are started and running
/// ones are awaited. A second Ctrl+C exits immediately.
pub fn setup_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("Failed to install Ctrl+C handler");
            return;
        }

        let is_tty = Term::stderr().is_term();
        if is_tty {
            eprintln!("\n\nShutdown requested, waiting for running imports...");
            eprintln!("Press Ctrl+C again to force quit.");
        } else {
            tracing::warn!("Shutdown requested, waiting for running imports");
        }

        token.cancel();

        // Wait for second Ctrl+C for force quit
        if tokio::signal::ctrl_c().await.is_ok() {
            if is_tty {
                eprintln!("Force quit!");
            }
            std::process::exit(i32::from(INTERRUPTED));
        }
    });
}
