//! In-process broker harness for integration tests.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::server;

/// A broker running on its own thread, torn down on drop.
///
/// The control socket is bound before `spawn` returns, so clients may
/// connect immediately.
pub struct TestBroker {
    _dir: TempDir,
    socket_path: PathBuf,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TestBroker {
    pub fn spawn() -> Self {
        let dir = tempfile::tempdir().expect("tempdir for broker socket");
        let socket_path = dir.path().join("herald.sock");
        let std_listener = server::bind_socket(&socket_path).expect("bind control socket");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .expect("broker runtime");
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let listener =
                    tokio::net::UnixListener::from_std(std_listener).expect("tokio listener");
                let shutdown = async {
                    let _ = shutdown_rx.await;
                };
                if let Err(err) = server::serve_listener(listener, shutdown).await {
                    panic!("test broker failed: {err}");
                }
            });
        });

        Self {
            _dir: dir,
            socket_path,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
