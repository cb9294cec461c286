//! The broker accept loop.
//!
//! Runs on a current-thread runtime with a `LocalSet`: one spawned task
//! per client connection, all sharing the registry through `Rc<RefCell>`.
//! That single-threaded cooperative model is what makes broker state
//! access race-free by construction.

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::path::Path;
use std::rc::Rc;

use herald_shm::scb::Scb;
use tokio::net::UnixListener;

use crate::handler;
use crate::registry::Registry;

/// Bind the control socket, replacing a stale one from a previous run.
pub fn bind_socket(path: &Path) -> io::Result<std::os::unix::net::UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = std::os::unix::net::UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept connections until `shutdown` resolves.
///
/// Must run inside a `LocalSet` (see [`run_blocking`]).
pub async fn serve_listener(
    listener: UnixListener,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    let registry = Rc::new(RefCell::new(Registry::new(Scb::create()?)));
    let mut next_session: u64 = 0;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("broker shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let session = next_session;
                next_session += 1;
                tracing::debug!(session, "client connected");
                tokio::task::spawn_local(handler::serve(stream, registry.clone(), session));
            }
        }
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn run_until(path: &Path, shutdown: impl Future<Output = ()>) -> io::Result<()> {
    let listener = UnixListener::from_std(bind_socket(path)?)?;
    tracing::info!(path = %path.display(), "broker listening");
    serve_listener(listener, shutdown).await
}

/// Bind and serve forever.
pub async fn run(path: &Path) -> io::Result<()> {
    run_until(path, std::future::pending::<()>()).await
}

/// Entry point for the daemon: builds the single-threaded runtime and
/// serves forever.
pub fn run_blocking(path: &Path) -> io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(path))
}
