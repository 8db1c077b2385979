//! Shared harness: a guest server accepting on a Unix socket so the host
//! client can be driven end-to-end without a VM.

use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vserial_guest::server::{ServeOutcome, Server};
use vserial_guest::{GuestConfig, build_router};

pub struct TestGuest {
    pub socket: PathBuf,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestGuest {
    /// Bind `channel.sock` under `dir` and serve accepted connections with
    /// a real guest server until stopped.
    pub async fn start(dir: &Path, config: GuestConfig) -> Self {
        let socket = dir.join("channel.sock");
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).expect("bind test socket");

        let router = build_router(&config, Instant::now()).expect("route table");
        let server = Server::new(config, router);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = stop_rx.recv() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };
                if server.serve_connection(stream, &mut stop_rx).await == ServeOutcome::Stopped {
                    return;
                }
            }
        });

        TestGuest {
            socket,
            stop_tx,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.handle.await;
    }
}
