//! Control socket: the admin surface of a running gateway.
//!
//! The master binds a Unix domain socket inside the instance directory and
//! accepts one newline-delimited JSON command per connection. The same
//! module provides the client side used by the stop/reload/status CLI
//! subcommands and by the configuration poller.

use crate::error::GatewayError;
use crate::ipc::{ControlCommand, ControlReply};
use crate::supervisor::WorkerPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Listening end of the control socket
pub struct ControlChannel {
    listener: UnixListener,
    path: PathBuf,
    pool: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Bind the control socket. A socket file already present means another
    /// instance owns this directory (or died without cleaning up), which is
    /// fatal either way.
    pub fn bind(
        path: &Path,
        pool: Arc<WorkerPool>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Result<Self, GatewayError> {
        if path.exists() {
            return Err(GatewayError::AlreadyRunning(path.to_path_buf()));
        }
        let listener = UnixListener::bind(path)?;
        info!(socket = %path.display(), "Control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            pool,
            shutdown_tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept loop. Runs until the process shuts down. Each connection is
    /// served on its own task so a slow command (a reload draining workers)
    /// never blocks status queries or the busy-reload rejection.
    pub async fn run(self) {
        let channel = Arc::new(self);
        loop {
            match channel.listener.accept().await {
                Ok((stream, _)) => {
                    let channel = Arc::clone(&channel);
                    tokio::spawn(async move {
                        if let Err(err) = channel.handle_connection(stream).await {
                            warn!(error = %err, "Control connection failed");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "Control socket accept failed");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = ControlCommand::parse(&line) else {
                // Unknown commands are dropped without a reply
                debug!(%line, "Ignoring unrecognized control message");
                continue;
            };
            let reply = self.execute(command).await;
            writer.write_all(reply.to_json().as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            if command == ControlCommand::Stop {
                let _ = self.shutdown_tx.send(true);
            }
        }
        Ok(())
    }

    async fn execute(&self, command: ControlCommand) -> ControlReply {
        match command {
            ControlCommand::Reload => {
                info!("Reload requested over control socket");
                match self.pool.reload().await {
                    Ok(_) => ControlReply::Ok,
                    Err(err) => {
                        warn!(error = %err, "Reload rejected");
                        ControlReply::Rejected(err.to_string())
                    }
                }
            }
            ControlCommand::Stop => {
                info!("Stop requested over control socket");
                self.pool.terminate().await;
                ControlReply::Ok
            }
            ControlCommand::Status => ControlReply::WorkerCount(self.pool.count_tracked()),
        }
    }
}

/// Send one command to a running instance and read the reply.
///
/// A missing socket file or a refused connection both mean no instance is
/// running here.
pub async fn send_command(path: &Path, command: ControlCommand) -> Result<ControlReply, GatewayError> {
    let stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(err)
            if err.kind() == std::io::ErrorKind::NotFound
                || err.kind() == std::io::ErrorKind::ConnectionRefused =>
        {
            return Err(GatewayError::NotRunning);
        }
        Err(err) => return Err(err.into()),
    };
    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_vec(&command)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    match lines.next_line().await? {
        Some(reply) => ControlReply::parse(&reply)
            .ok_or_else(|| GatewayError::Config(format!("unexpected control reply: {reply}"))),
        None => Err(GatewayError::NotRunning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadyWhen;
    use crate::supervisor::WorkerSpec;
    use std::time::Duration;

    fn test_pool(workers: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            WorkerSpec {
                program: PathBuf::from("/bin/sh"),
                args: vec![
                    "-c".to_string(),
                    r#"echo '{"type":"online"}'; read _line; exit 0"#.to_string(),
                ],
            },
            workers,
            ReadyWhen::Online,
        )
    }

    async fn wait_tracked(pool: &Arc<WorkerPool>, n: usize) {
        let pool = Arc::clone(pool);
        assert!(
            crate::waiter::wait_until(
                Duration::from_millis(20),
                Duration::from_secs(5),
                move || pool.count_tracked() == n
            )
            .await
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_reports_worker_count() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let pool = test_pool(2);
        pool.run().unwrap();
        wait_tracked(&pool, 2).await;

        let (shutdown_tx, _rx) = watch::channel(false);
        let channel = ControlChannel::bind(&socket, Arc::clone(&pool), shutdown_tx).unwrap();
        tokio::spawn(channel.run());

        let reply = send_command(&socket, ControlCommand::Status).await.unwrap();
        assert_eq!(reply, ControlReply::WorkerCount(2));
        pool.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_bind_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        std::fs::write(&socket, b"").unwrap();

        let (shutdown_tx, _rx) = watch::channel(false);
        let err = ControlChannel::bind(&socket, test_pool(1), shutdown_tx).unwrap_err();
        assert!(err.to_string().contains("try removing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_socket_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing.sock");
        let err = send_command(&socket, ControlCommand::Status).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotRunning));
    }

    /// Workers that announce themselves but ignore drain requests, keeping
    /// a rolling reload in flight until they are force killed.
    fn stubborn_pool(workers: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            WorkerSpec {
                program: PathBuf::from("/bin/sh"),
                args: vec![
                    "-c".to_string(),
                    r#"echo '{"type":"online"}'; exec sleep 30"#.to_string(),
                ],
            },
            workers,
            ReadyWhen::Online,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commands_interleave_with_a_reload_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let pool = stubborn_pool(1);
        pool.run().unwrap();
        wait_tracked(&pool, 1).await;

        let (shutdown_tx, _rx) = watch::channel(false);
        let channel = ControlChannel::bind(&socket, Arc::clone(&pool), shutdown_tx).unwrap();
        tokio::spawn(channel.run());

        let reload_socket = socket.clone();
        let first = tokio::spawn(async move {
            send_command(&reload_socket, ControlCommand::Reload).await
        });

        // The reload is in flight once the old worker has been demoted to
        // the draining set (it ignores the drain request and hangs there).
        let draining = Arc::clone(&pool);
        assert!(
            crate::waiter::wait_until(
                Duration::from_millis(20),
                Duration::from_secs(10),
                move || draining.count_closing() == 1
            )
            .await
        );

        // Status still answers promptly
        let reply = send_command(&socket, ControlCommand::Status).await.unwrap();
        assert!(matches!(reply, ControlReply::WorkerCount(_)));

        // A second reload is rejected instead of queuing a second roll
        let reply = send_command(&socket, ControlCommand::Reload).await.unwrap();
        match reply {
            ControlReply::Rejected(message) => assert!(message.contains("busy reloading")),
            other => panic!("expected rejection, got {other:?}"),
        }

        pool.terminate().await;
        first.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_terminates_and_signals_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");
        let pool = test_pool(1);
        pool.run().unwrap();
        wait_tracked(&pool, 1).await;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let channel = ControlChannel::bind(&socket, Arc::clone(&pool), shutdown_tx).unwrap();
        tokio::spawn(channel.run());

        let reply = send_command(&socket, ControlCommand::Stop).await.unwrap();
        assert_eq!(reply, ControlReply::Ok);
        assert_eq!(pool.count_cluster(), 0);
        shutdown_rx.changed().await.unwrap();
        assert!(*shutdown_rx.borrow());
    }
}
