//! The herald broker daemon.
//!
//! Usage: `heraldd [socket-path]` (default `/tmp/herald.sock`).
//! Log verbosity via `RUST_LOG`.

use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/herald.sock".to_string());

    match herald_broker::run_blocking(Path::new(&path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "broker failed");
            ExitCode::FAILURE
        }
    }
}
