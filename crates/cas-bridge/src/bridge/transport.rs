//! Loopback socket transport and worker process monitoring.
//!
//! The host binds a listener on an OS-assigned port, hands the port to the
//! worker on its command line, and accepts exactly one connection. The
//! worker's process handle lives in a monitor task that reports its exit.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};

use crate::error::BridgeError;

/// Tracing target for lines the worker prints on stdout/stderr.
pub const WORKER_LOG_TARGET: &str = "cas_bridge::worker";

/// Listener waiting for the worker's single inbound connection.
pub struct WorkerListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl WorkerListener {
    /// Bind on `host:0` so the OS picks a free port.
    pub async fn bind(host: &str) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        tracing::debug!(%addr, "Bound worker listener");
        Ok(Self { listener, addr })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the first connection, then close the listener.
    pub async fn accept(self, deadline: Duration) -> Result<TcpStream, BridgeError> {
        tracing::trace!(port = self.port(), ?deadline, "Waiting for worker connection");
        let accepted = tokio::time::timeout(deadline, self.listener.accept()).await;
        match accepted {
            Ok(Ok((stream, peer))) => {
                tracing::debug!(%peer, "Worker connected");
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(BridgeError::Connection(format!(
                "failed to accept worker connection: {}",
                e
            ))),
            Err(_) => Err(BridgeError::Connection(format!(
                "worker did not connect within {:?}",
                deadline
            ))),
        }
    }
}

/// Worker side: connect back to the host.
pub async fn connect(port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.set_nodelay(true)?;
    tracing::debug!(port, "Connected to host");
    Ok(stream)
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub success: bool,
}

impl WorkerExit {
    fn unknown() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Handle to a running worker process.
///
/// The child is owned by a monitor task; this handle can request a kill and
/// observe the exit. Dropping the handle kills the worker.
pub struct WorkerProcess {
    pid: Option<u32>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerProcess {
    /// Take ownership of a spawned child and start monitoring it.
    pub fn monitor(mut child: Child) -> Self {
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let (status, killed) = tokio::select! {
                status = child.wait() => (status, false),
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Kill signal failed, process may have exited");
                    }
                    (child.wait().await, true)
                }
            };

            let exit = match status {
                Ok(status) => WorkerExit::from(status),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to wait for worker process");
                    WorkerExit::unknown()
                }
            };

            if killed {
                tracing::debug!(?pid, %exit, "Worker killed");
            } else if exit.success {
                tracing::debug!(?pid, "Worker exited");
            } else {
                tracing::warn!(?pid, %exit, "Worker exited unexpectedly");
            }
            let _ = exit_tx.send(Some(exit));
        });

        tracing::info!(?pid, "Worker process started");
        Self {
            pid,
            kill_tx: StdMutex::new(Some(kill_tx)),
            exit_rx,
        }
    }

    /// OS pid, while the process has not been reaped.
    pub fn id(&self) -> Option<u32> {
        if self.has_exited() { None } else { self.pid }
    }

    /// Request termination. Idempotent.
    pub fn kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            tracing::debug!(pid = ?self.pid, "Killing worker");
            let _ = tx.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Resolve once the process has exited and been reaped.
    pub async fn wait(&self) -> WorkerExit {
        self.exited().await
    }

    /// Like `wait`, but the future does not borrow the handle, so it can be
    /// moved into a task without keeping the worker alive.
    pub fn exited(&self) -> impl Future<Output = WorkerExit> + Send + 'static {
        let mut rx = self.exit_rx.clone();
        async move {
            let exit = match rx.wait_for(|exit| exit.is_some()).await {
                Ok(exit) => *exit,
                // Monitor task is gone without publishing, the child was dropped with it.
                Err(_) => None,
            };
            exit.unwrap_or_else(WorkerExit::unknown)
        }
    }

    /// `wait` bounded by `timeout`. `None` if the process is still running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<WorkerExit> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Kill and wait until the process is reaped.
    pub async fn kill_and_wait(&self) -> WorkerExit {
        self.kill();
        self.wait().await
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if stream == "stderr" {
                    tracing::warn!(target: WORKER_LOG_TARGET, stream, "{}", line);
                } else {
                    tracing::info!(target: WORKER_LOG_TARGET, stream, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream, error = %e, "Worker output stream closed with error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_nonzero_port() {
        let listener = WorkerListener::bind("127.0.0.1").await.unwrap();
        assert_ne!(listener.port(), 0);
        assert!(listener.local_addr().ip().is_loopback());
    }

    #[tokio::test]
    async fn accepts_single_connection_then_closes() {
        let listener = WorkerListener::bind("127.0.0.1").await.unwrap();
        let port = listener.port();

        let client = tokio::spawn(async move { connect(port).await });
        let server = listener.accept(Duration::from_secs(5)).await.unwrap();
        let client = client.await.unwrap().unwrap();

        assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());

        // Listener was consumed, a second connect must be refused.
        assert!(connect(port).await.is_err());
    }

    #[tokio::test]
    async fn accept_times_out_as_connection_error() {
        let listener = WorkerListener::bind("127.0.0.1").await.unwrap();
        let err = listener.accept(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(ref m) if m.contains("did not connect")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn monitor_reports_normal_exit() {
        let child = tokio::process::Command::new("true")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let process = WorkerProcess::monitor(child);

        let exit = process.wait().await;
        assert!(exit.success);
        assert_eq!(exit.code, Some(0));
        assert!(process.has_exited());
        assert_eq!(process.id(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let process = WorkerProcess::monitor(child);
        assert!(process.id().is_some());
        assert!(process.wait_timeout(Duration::from_millis(50)).await.is_none());

        process.kill();
        process.kill();
        let exit = process.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(!exit.success);
        assert_eq!(process.exit_status(), Some(exit));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_future_outlives_the_handle_borrow() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let process = WorkerProcess::monitor(child);
        let exited = tokio::spawn(process.exited());

        process.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), exited)
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_handle_kills_worker() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let process = WorkerProcess::monitor(child);
        let mut exit_rx = process.exit_rx.clone();
        drop(process);

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            exit_rx.wait_for(|exit| exit.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!(*exit).unwrap().success);
    }
}
