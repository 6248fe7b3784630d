//! Bridge - owns the worker process, the socket, and request correlation.
//!
//! Flow:
//! 1. Bind a loopback listener, spawn the worker with the port
//! 2. Accept the worker's connection within the connect deadline
//! 3. Run the receive loop, settling responses through the correlation table
//! 4. On EOF or a bad frame outside shutdown: fail every pending request
//! 5. On shutdown: send exit, race it against the deadline, kill if needed

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::commands::Command;
use crate::bridge::protocol::{Outcome, Request, RequestFrame, RequestId, ResponseFrame};
use crate::bridge::transport::{WorkerExit, WorkerListener, WorkerProcess};
use crate::correlation::{CorrelationTable, PendingResponse};
use crate::error::BridgeError;
use crate::spawner::WorkerSpawner;
use crate::state::BridgeState;

const CONNECT_TIMEOUT_ENV: &str = "CAS_CONNECT_TIMEOUT_SECS";
const SHUTDOWN_TIMEOUT_ENV: &str = "CAS_SHUTDOWN_TIMEOUT_SECS";

/// Upper bound on waiting for the receive loop after the socket is torn down.
const RECEIVE_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Stand-in deadline for timeouts too large to add to the current instant.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the listener binds on. The worker always connects to loopback.
    pub host: String,
    /// How long `initialize` waits for the worker to connect.
    pub connect_timeout: Duration,
    /// Deadline used by `shutdown_default`.
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden by `CAS_CONNECT_TIMEOUT_SECS` and `CAS_SHUTDOWN_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(timeout) = parse_secs(CONNECT_TIMEOUT_ENV, lookup(CONNECT_TIMEOUT_ENV)) {
            self.connect_timeout = timeout;
        }
        if let Some(timeout) = parse_secs(SHUTDOWN_TIMEOUT_ENV, lookup(SHUTDOWN_TIMEOUT_ENV)) {
            self.shutdown_timeout = timeout;
        }
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn parse_secs(key: &str, value: Option<String>) -> Option<Duration> {
    let value = value?;
    let parsed = value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    if parsed.is_none() {
        tracing::warn!(key, %value, "Ignoring invalid timeout");
    }
    parsed
}

/// `now + timeout`, clamped so an effectively unbounded timeout cannot overflow.
fn shutdown_deadline(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + UNBOUNDED_WAIT)
}

/// A dispatched request: its id plus the awaitable outcome.
#[derive(Debug)]
pub struct SendResult {
    pub uid: RequestId,
    pub response: PendingResponse,
}

type ErrorSink = Arc<dyn Fn(&str, &str) + Send + Sync>;
type SocketWriter = FramedWrite<OwnedWriteHalf, JsonCodec<RequestFrame>>;
type SocketReader = FramedRead<OwnedReadHalf, JsonCodec<ResponseFrame>>;

struct Shared {
    config: BridgeConfig,
    state: StdMutex<BridgeState>,
    table: CorrelationTable,
    writer: tokio::sync::Mutex<Option<SocketWriter>>,
    sinks: RwLock<Vec<ErrorSink>>,
    process: OnceLock<WorkerProcess>,
    receive_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Bridge state mutex poisoned");
                poisoned.into_inner()
            }
        }
    }

    fn state(&self) -> BridgeState {
        *self.lock_state()
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> Result<(), BridgeState> {
        let mut state = self.lock_state();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        tracing::debug!(%from, %to, "Bridge state changed");
        Ok(())
    }

    fn notify_sinks(&self, usr_message: &str, dev_message: &str) {
        let sinks: Vec<ErrorSink> = match self.sinks.read() {
            Ok(sinks) => sinks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for sink in sinks {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| sink(usr_message, dev_message)));
            if call.is_err() {
                tracing::error!("Error sink panicked");
            }
        }
    }

    /// Fatal transport failure: reject everything, report once, kill the worker.
    ///
    /// No-op once the bridge is shutting down or already terminal.
    fn fail(&self, error: BridgeError) {
        {
            let mut state = self.lock_state();
            if state.is_terminal() || state.is_winding_down() {
                return;
            }
            *state = BridgeState::Failed;
        }

        tracing::error!(error = %error, "Bridge failed");
        let rejected = self.table.drain_rejecting(error.clone());
        if rejected > 0 {
            tracing::warn!(rejected, "Rejected pending requests");
        }
        self.notify_sinks(&error.usr_message(), &error.dev_message());
        if let Some(process) = self.process.get() {
            process.kill();
        }
    }

    fn handle_frame(&self, frame: ResponseFrame) {
        let reported = match &frame.outcome {
            Outcome::Error(e) => Some((e.usr_message.clone(), e.dev_message.clone())),
            _ => None,
        };
        let uid = frame.uid.clone();
        let settled = self.table.settle(frame);

        if let Some((usr_message, dev_message)) = reported {
            tracing::debug!(%uid, ?settled, %usr_message, "Worker reported an error");
            self.notify_sinks(&usr_message, &dev_message);
        }
    }
}

/// Supervises one worker process over one socket connection.
///
/// All methods take `&self`; wrap in an `Arc` to share between tasks.
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: StdMutex::new(BridgeState::Idle),
                table: CorrelationTable::new(),
                writer: tokio::sync::Mutex::new(None),
                sinks: RwLock::new(Vec::new()),
                process: OnceLock::new(),
                receive_loop: StdMutex::new(None),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BridgeConfig::default())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    /// OS pid of the worker while it is running.
    pub fn worker_pid(&self) -> Option<u32> {
        self.shared.process.get().and_then(WorkerProcess::id)
    }

    /// Register a sink for worker-reported and fatal errors.
    pub fn on_error<F>(&self, sink: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        match self.shared.sinks.write() {
            Ok(mut sinks) => sinks.push(Arc::new(sink)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(sink)),
        }
    }

    /// Spawn the worker and wait for it to connect. Valid once, from `Idle`.
    pub async fn initialize(&self, spawner: &dyn WorkerSpawner) -> Result<(), BridgeError> {
        self.shared
            .transition(BridgeState::Idle, BridgeState::Connecting)
            .map_err(|state| {
                BridgeError::InvalidState(format!("initialize called while {}", state))
            })?;

        match self.connect(spawner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, "Worker initialization failed");
                if let Some(process) = self.shared.process.get() {
                    process.kill_and_wait().await;
                }
                *self.shared.lock_state() = BridgeState::Failed;
                self.shared.table.drain_rejecting(e.clone());
                Err(e)
            }
        }
    }

    async fn connect(&self, spawner: &dyn WorkerSpawner) -> Result<(), BridgeError> {
        let config = &self.shared.config;
        let listener = WorkerListener::bind(&config.host)
            .await
            .map_err(|e| BridgeError::Connection(format!("failed to bind listener: {}", e)))?;
        let port = listener.port();

        tracing::info!(port, "Spawning worker");
        let child = spawner.spawn(port)?;
        let process = self.shared.process.get_or_init(|| WorkerProcess::monitor(child));

        let stream = tokio::select! {
            accepted = listener.accept(config.connect_timeout) => accepted?,
            exit = process.wait() => {
                return Err(BridgeError::Connection(format!(
                    "worker exited before connecting ({})",
                    exit
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await =
            Some(FramedWrite::new(write_half, JsonCodec::<RequestFrame>::new()));
        let reader = FramedRead::new(read_half, JsonCodec::<ResponseFrame>::new());

        let handle = tokio::spawn(receive_loop(Arc::downgrade(&self.shared), reader));
        match self.shared.receive_loop.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }

        self.shared
            .transition(BridgeState::Connecting, BridgeState::Active)
            .map_err(|state| {
                BridgeError::InvalidState(format!("bridge became {} while connecting", state))
            })?;
        tokio::spawn(watch_worker_exit(
            Arc::downgrade(&self.shared),
            process.exited(),
        ));
        tracing::info!(port, pid = ?process.id(), "Bridge active");
        Ok(())
    }

    fn unavailable(&self, state: BridgeState) -> BridgeError {
        match state {
            BridgeState::Failed | BridgeState::Closed => self
                .shared
                .table
                .closed_reason()
                .cloned()
                .unwrap_or_else(|| BridgeError::InvalidState(format!("bridge is {}", state))),
            other => BridgeError::InvalidState(format!("cannot send while {}", other)),
        }
    }

    /// Send a request. Requests are written in call order.
    pub async fn send(&self, request: impl Into<Request>) -> Result<SendResult, BridgeError> {
        self.dispatch(request.into(), false).await
    }

    /// Send a typed catalog command.
    pub async fn start(&self, command: Command) -> Result<SendResult, BridgeError> {
        let request = Request::try_from(command)
            .map_err(|e| BridgeError::Decode(format!("failed to encode start args: {}", e)))?;
        self.send(request).await
    }

    async fn dispatch(&self, request: Request, draining: bool) -> Result<SendResult, BridgeError> {
        let mut writer = self.shared.writer.lock().await;

        // Checked under the writer lock so shutdown cannot slip in between.
        let state = self.shared.state();
        let allowed = state == BridgeState::Active || (draining && state == BridgeState::Draining);
        if !allowed {
            return Err(self.unavailable(state));
        }
        let Some(sink) = writer.as_mut() else {
            return Err(self.unavailable(state));
        };

        let uid = RequestId::new();
        let response = match request {
            Request::Start(_) => self.shared.table.register(uid.clone())?,
            Request::Interrupt(_) | Request::Exit(_) => {
                self.shared.table.register_control(uid.clone())?
            }
        };
        let kind = request.kind();

        if let Err(e) = sink.send(RequestFrame::new(uid.clone(), request)).await {
            let error = BridgeError::Connection(format!("failed to write {} request: {}", kind, e));
            self.shared.table.reject(&uid, error.clone());
            drop(writer);
            self.shared.fail(error.clone());
            return Err(error);
        }

        tracing::debug!(%uid, kind, "Request sent");
        Ok(SendResult { uid, response })
    }

    /// Ask the worker to interrupt `targets`.
    ///
    /// Targets stay pending until the worker answers `interrupted` for them.
    pub async fn interrupt(&self, targets: &[RequestId]) -> Result<SendResult, BridgeError> {
        tracing::debug!(count = targets.len(), "Interrupting requests");
        self.send(Request::interrupt(targets.to_vec())).await
    }

    /// Interrupt every outstanding `start` request. `None` if there are none.
    ///
    /// Pending `interrupt` and `exit` requests are never targeted.
    pub async fn interrupt_all(&self) -> Result<Option<SendResult>, BridgeError> {
        let targets = self.shared.table.interruptible();
        if targets.is_empty() {
            return Ok(None);
        }
        self.interrupt(&targets).await.map(Some)
    }

    /// Every request still awaiting a response, oldest first.
    pub fn outstanding(&self) -> Vec<RequestId> {
        self.shared.table.outstanding_for(Duration::ZERO)
    }

    /// Requests pending for at least `min_age`, oldest first.
    pub fn hanging(&self, min_age: Duration) -> Vec<RequestId> {
        self.shared.table.outstanding_for(min_age)
    }

    /// `shutdown` with the configured deadline.
    pub async fn shutdown_default(&self) -> Result<(), BridgeError> {
        self.shutdown(self.shared.config.shutdown_timeout).await
    }

    /// Ask the worker to exit, killing it if it does not within `timeout`.
    ///
    /// Socket and process are released on every path. Calling again after
    /// the bridge is closed is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), BridgeError> {
        // Decide under the lock, act after releasing it.
        let previous = {
            let mut state = self.shared.lock_state();
            let previous = *state;
            match previous {
                BridgeState::Idle => *state = BridgeState::Closed,
                BridgeState::Active => *state = BridgeState::Draining,
                _ => {}
            }
            previous
        };

        match previous {
            BridgeState::Idle => {
                self.shared
                    .table
                    .drain_rejecting(BridgeError::Connection("bridge shut down".to_string()));
                tracing::debug!("Shut down bridge that was never initialized");
                return Ok(());
            }
            BridgeState::Closed => return Ok(()),
            BridgeState::Connecting => {
                return Err(BridgeError::InvalidState(
                    "shutdown called while connecting".to_string(),
                ));
            }
            BridgeState::Draining => {
                return Err(BridgeError::InvalidState(
                    "shutdown already in progress".to_string(),
                ));
            }
            BridgeState::Failed => {
                tracing::debug!("Releasing resources of failed bridge");
                self.release().await;
                return Ok(());
            }
            BridgeState::Active => {}
        }

        tracing::info!(?timeout, "Shutting down worker");
        let deadline = shutdown_deadline(timeout);
        let exit = tokio::time::timeout_at(deadline, async {
            let sent = self.dispatch(Request::exit(), true).await?;
            sent.response.await
        })
        .await;

        let result = match exit {
            Ok(Ok(_)) => {
                tracing::debug!("Worker acknowledged exit");
                if let Some(process) = self.shared.process.get() {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if process.wait_timeout(remaining).await.is_none() {
                        tracing::warn!("Worker still running after acknowledging exit, killing");
                        process.kill();
                    }
                }
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Exit request failed, killing worker");
                if let Some(process) = self.shared.process.get() {
                    process.kill();
                }
                Err(e)
            }
            Err(_) => {
                tracing::warn!(?timeout, "Worker did not exit in time, killing");
                if let Some(process) = self.shared.process.get() {
                    process.kill();
                }
                Err(BridgeError::ShutdownTimeout(timeout))
            }
        };

        self.release().await;
        if let Err(state) = self.shared.transition(BridgeState::Draining, BridgeState::Closed) {
            tracing::warn!(%state, "Unexpected state at end of shutdown");
        }
        tracing::info!("Bridge closed");
        result
    }

    /// Reap the worker, close the socket, stop the receive loop, reject leftovers.
    async fn release(&self) {
        if let Some(process) = self.shared.process.get() {
            let exit = process.kill_and_wait().await;
            tracing::debug!(%exit, "Worker reaped");
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Failed to close socket writer");
        }

        let handle = match self.shared.receive_loop.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut handle) = handle {
            match tokio::time::timeout(RECEIVE_LOOP_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Receive loop task failed"),
                Err(_) => {
                    tracing::warn!("Receive loop did not stop, aborting");
                    handle.abort();
                }
            }
        }

        self.shared
            .table
            .drain_rejecting(BridgeError::Connection("bridge shut down".to_string()));
    }
}

/// Fails the bridge when the worker dies outside shutdown, even if its socket
/// is still held open by another process.
async fn watch_worker_exit(
    shared: Weak<Shared>,
    exited: impl Future<Output = WorkerExit> + Send + 'static,
) {
    let exit = exited.await;
    let Some(bridge) = shared.upgrade() else {
        return;
    };
    if bridge.state().is_winding_down() {
        return;
    }
    bridge.fail(BridgeError::Connection(format!("worker exited ({})", exit)));
}

async fn receive_loop(shared: Weak<Shared>, mut reader: SocketReader) {
    let error = loop {
        let next = reader.next().await;
        let Some(bridge) = shared.upgrade() else {
            tracing::debug!("Bridge dropped, receive loop exiting");
            return;
        };
        match next {
            Some(Ok(frame)) => bridge.handle_frame(frame),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                break BridgeError::Protocol(format!("malformed frame: {}", e));
            }
            Some(Err(e)) => {
                break BridgeError::Connection(format!("socket read failed: {}", e));
            }
            None => {
                break BridgeError::Connection("worker closed the connection".to_string());
            }
        }
    };

    let Some(bridge) = shared.upgrade() else {
        return;
    };
    if bridge.state().is_winding_down() {
        tracing::debug!(reason = %error, "Receive loop finished during shutdown");
        bridge
            .table
            .drain_rejecting(BridgeError::Connection("bridge shut down".to_string()));
    } else {
        bridge.fail(error);
    }
    tracing::debug!("Receive loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpawnError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::process::Child;
    use tokio::sync::oneshot;

    #[test]
    fn config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn config_env_overrides() {
        let config = BridgeConfig::default().with_env_overrides(|key| match key {
            CONNECT_TIMEOUT_ENV => Some("2.5".to_string()),
            SHUTDOWN_TIMEOUT_ENV => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn negative_timeout_is_ignored() {
        assert_eq!(parse_secs("X", Some("-1".to_string())), None);
        assert_eq!(parse_secs("X", None), None);
    }

    #[test]
    fn out_of_range_timeout_is_ignored() {
        assert_eq!(parse_secs("X", Some("1e30".to_string())), None);
        assert_eq!(parse_secs("X", Some("inf".to_string())), None);
        assert_eq!(parse_secs("X", Some("NaN".to_string())), None);

        let config = BridgeConfig::default().with_env_overrides(|key| match key {
            SHUTDOWN_TIMEOUT_ENV => Some("1e30".to_string()),
            _ => None,
        });
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn shutdown_deadline_saturates() {
        let now = tokio::time::Instant::now();
        assert!(shutdown_deadline(Duration::MAX) > now + Duration::from_secs(86_400));
        let short = shutdown_deadline(Duration::from_secs(1));
        assert!(short <= tokio::time::Instant::now() + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_before_initialize_is_invalid() {
        let bridge = Bridge::with_defaults();
        let err = bridge.send(Request::exit()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState(_)));
    }

    #[tokio::test]
    async fn shutdown_of_idle_bridge_closes_immediately() {
        let bridge = Bridge::with_defaults();
        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Closed);
        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    struct FailingSpawner;

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _port: u16) -> Result<Child, SpawnError> {
            Err(SpawnError::Other("no interpreter".to_string()))
        }
    }

    #[tokio::test]
    async fn spawn_failure_fails_bridge_and_blocks_reinit() {
        let bridge = Bridge::with_defaults();
        let err = bridge.initialize(&FailingSpawner).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn(ref m) if m.contains("no interpreter")));
        assert_eq!(bridge.state(), BridgeState::Failed);

        let again = bridge.initialize(&FailingSpawner).await.unwrap_err();
        assert!(matches!(again, BridgeError::InvalidState(_)));

        let send = bridge.send(Request::exit()).await.unwrap_err();
        assert!(matches!(send, BridgeError::Spawn(_)));
    }

    /// Spawns a placeholder process and hands the port to the test, which
    /// then plays the worker over a real socket.
    struct FakeWorkerSpawner {
        port_tx: StdMutex<Option<oneshot::Sender<u16>>>,
        program: &'static str,
    }

    impl FakeWorkerSpawner {
        fn new(program: &'static str) -> (Self, oneshot::Receiver<u16>) {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    port_tx: StdMutex::new(Some(tx)),
                    program,
                },
                rx,
            )
        }
    }

    impl WorkerSpawner for FakeWorkerSpawner {
        fn spawn(&self, port: u16) -> Result<Child, SpawnError> {
            if let Some(tx) = self.port_tx.lock().unwrap().take() {
                let _ = tx.send(port);
            }
            let mut cmd = tokio::process::Command::new(self.program);
            if self.program == "sleep" {
                cmd.arg("30");
            }
            Ok(cmd.kill_on_drop(true).spawn()?)
        }
    }

    struct FakeWorker {
        reader: FramedRead<OwnedReadHalf, JsonCodec<RequestFrame>>,
        writer: OwnedWriteHalf,
    }

    impl FakeWorker {
        async fn recv(&mut self) -> RequestFrame {
            tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }

        async fn reply(&mut self, frame: ResponseFrame) {
            let mut line = serde_json::to_vec(&frame).unwrap();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }

        async fn raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }
    }

    async fn connected_bridge(config: BridgeConfig) -> (Arc<Bridge>, FakeWorker) {
        let bridge = Arc::new(Bridge::new(config));
        let (spawner, port_rx) = FakeWorkerSpawner::new("sleep");

        let (init, stream) = tokio::join!(bridge.initialize(&spawner), async {
            let port = port_rx.await.unwrap();
            TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });
        init.unwrap();
        assert_eq!(bridge.state(), BridgeState::Active);

        let (r, w) = stream.into_split();
        let worker = FakeWorker {
            reader: FramedRead::new(r, JsonCodec::new()),
            writer: w,
        };
        (bridge, worker)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_round_trip() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;
        assert!(bridge.worker_pid().is_some());

        let sent = bridge
            .start(Command::Eval(crate::bridge::commands::EvaluateArgs::new("1 + 1")))
            .await
            .unwrap();
        let frame = worker.recv().await;
        assert_eq!(frame.uid, sent.uid);
        match &frame.request {
            Request::Start(p) => assert_eq!(p.command_type, "eval"),
            other => panic!("unexpected request: {:?}", other),
        }
        assert_eq!(bridge.outstanding(), vec![sent.uid.clone()]);

        worker
            .reply(ResponseFrame::success(
                frame.uid,
                "result",
                json!({"evaluated_expression": "2"}),
            ))
            .await;

        let response = sent.response.await.unwrap();
        assert_eq!(response.value()["evaluated_expression"], "2");
        assert!(bridge.outstanding().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_responses_reach_every_sink() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bridge.on_error(move |usr, dev| {
                seen.lock().unwrap().push((usr.to_string(), dev.to_string()));
            });
        }

        let sent = bridge
            .send(crate::bridge::protocol::StartPayload::custom("nope", json!({})))
            .await
            .unwrap();
        let frame = worker.recv().await;
        worker.reply(ResponseFrame::error(frame.uid, "bad", "Unsupported command type: nope")).await;

        let err = sent.response.await.unwrap_err();
        assert_eq!(err, BridgeError::request("bad", "Unsupported command type: nope"));

        // Errors for uids nobody awaits are still broadcast.
        worker.reply(ResponseFrame::error("stray".into(), "u", "d")).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("bad".to_string(), "Unsupported command type: nope".to_string()));
        assert_eq!(seen[3], ("u".to_string(), "d".to_string()));
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupted_and_late_success_settle_once() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;

        let sent = bridge
            .send(crate::bridge::protocol::StartPayload::custom("slow", json!({})))
            .await
            .unwrap();
        let start = worker.recv().await;

        let interrupt = bridge.interrupt(std::slice::from_ref(&sent.uid)).await.unwrap();
        let frame = worker.recv().await;
        match &frame.request {
            Request::Interrupt(p) => assert_eq!(p.target_uids, vec![sent.uid.clone()]),
            other => panic!("unexpected request: {:?}", other),
        }
        // Not removed locally until the worker answers.
        assert!(bridge.outstanding().contains(&sent.uid));

        worker.reply(ResponseFrame::interrupted(start.uid.clone())).await;
        worker.reply(ResponseFrame::success(start.uid, "result", json!({}))).await;
        worker
            .reply(ResponseFrame::success(
                frame.uid,
                "result",
                json!({"interrupted": [sent.uid.as_str()]}),
            ))
            .await;

        assert!(sent.response.await.unwrap_err().is_interrupted());
        interrupt.response.await.unwrap();
        assert!(bridge.outstanding().is_empty());
        assert_eq!(bridge.state(), BridgeState::Active);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_frame_is_fatal_protocol_error() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            bridge.on_error(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let a = bridge
            .send(crate::bridge::protocol::StartPayload::custom("x", json!({})))
            .await
            .unwrap();
        let b = bridge
            .send(crate::bridge::protocol::StartPayload::custom("y", json!({})))
            .await
            .unwrap();

        worker.raw(b"this is not json\n").await;

        assert!(matches!(a.response.await, Err(BridgeError::Protocol(_))));
        assert!(matches!(b.response.await, Err(BridgeError::Protocol(_))));
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = bridge.send(Request::exit()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));

        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(bridge.worker_pid(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn eof_is_fatal_connection_error() {
        let (bridge, worker) = connected_bridge(BridgeConfig::default()).await;
        let pending = bridge
            .send(crate::bridge::protocol::StartPayload::custom("x", json!({})))
            .await
            .unwrap();

        drop(worker);

        let err = pending.response.await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(err.is_fatal());
        assert_eq!(bridge.state(), BridgeState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hanging_tracks_age() {
        let (bridge, _worker) = connected_bridge(BridgeConfig::default()).await;
        let first = bridge
            .send(crate::bridge::protocol::StartPayload::custom("x", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = bridge
            .send(crate::bridge::protocol::StartPayload::custom("y", json!({})))
            .await
            .unwrap();

        assert_eq!(bridge.hanging(Duration::ZERO), vec![first.uid.clone(), second.uid.clone()]);
        assert_eq!(bridge.hanging(Duration::from_millis(100)), vec![first.uid.clone()]);
        assert!(bridge.hanging(Duration::from_secs(60)).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn acknowledged_exit_closes_and_rejects_leftovers() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;
        let leftover = bridge
            .send(crate::bridge::protocol::StartPayload::custom("x", json!({})))
            .await
            .unwrap();
        worker.recv().await;

        let shutdown = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.shutdown(Duration::from_millis(500)).await })
        };

        let exit = worker.recv().await;
        assert!(matches!(exit.request, Request::Exit(_)));
        worker.reply(ResponseFrame::success(exit.uid, "result", json!({}))).await;
        drop(worker);

        // Placeholder process ignores exit, so it is killed once the deadline passes.
        shutdown.await.unwrap().unwrap();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.worker_pid(), None);
        assert_eq!(
            leftover.response.await.unwrap_err(),
            BridgeError::Connection("bridge shut down".to_string())
        );

        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
        let err = bridge.send(Request::exit()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unanswered_exit_times_out_and_kills() {
        let (bridge, _worker) = connected_bridge(BridgeConfig::default()).await;

        let started = std::time::Instant::now();
        let err = bridge.shutdown(Duration::from_millis(300)).await.unwrap_err();

        assert_eq!(err, BridgeError::ShutdownTimeout(Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.worker_pid(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unbounded_shutdown_timeout_still_releases_worker() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;

        let shutdown = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.shutdown(Duration::MAX).await })
        };
        let exit = worker.recv().await;
        assert!(matches!(exit.request, Request::Exit(_)));
        drop(worker);

        let result = tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.worker_pid(), None);
        bridge.shutdown(Duration::MAX).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_death_with_open_socket_is_fatal() {
        let (bridge, _worker) = connected_bridge(BridgeConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            bridge.on_error(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let pending = bridge
            .send(crate::bridge::protocol::StartPayload::custom("x", json!({})))
            .await
            .unwrap();

        let pid = bridge.worker_pid().unwrap();
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), pending.response)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection(ref m) if m.contains("worker exited")));
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        bridge.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_all_skips_control_requests() {
        let (bridge, mut worker) = connected_bridge(BridgeConfig::default()).await;
        let work = bridge
            .send(crate::bridge::protocol::StartPayload::custom("slow", json!({})))
            .await
            .unwrap();
        worker.recv().await;

        let first = bridge.interrupt_all().await.unwrap().unwrap();
        worker.recv().await;
        let second = bridge.interrupt_all().await.unwrap().unwrap();
        let frame = worker.recv().await;

        match &frame.request {
            Request::Interrupt(p) => assert_eq!(p.target_uids, vec![work.uid.clone()]),
            other => panic!("unexpected request: {:?}", other),
        }
        assert_eq!(bridge.outstanding().len(), 3);
        assert!(bridge.outstanding().contains(&first.uid));
        assert!(bridge.outstanding().contains(&second.uid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_deadline_kills_worker() {
        let bridge = Bridge::new(BridgeConfig::default().with_connect_timeout(Duration::from_millis(200)));
        let (spawner, _port_rx) = FakeWorkerSpawner::new("sleep");

        let err = bridge.initialize(&spawner).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(ref m) if m.contains("did not connect")));
        assert_eq!(bridge.state(), BridgeState::Failed);
        assert_eq!(bridge.worker_pid(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_exiting_before_connect_fails_fast() {
        let bridge = Bridge::with_defaults();
        let (spawner, _port_rx) = FakeWorkerSpawner::new("true");

        let started = std::time::Instant::now();
        let err = bridge.initialize(&spawner).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(ref m) if m.contains("exited before connecting")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
