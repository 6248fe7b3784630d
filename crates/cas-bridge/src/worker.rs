//! Worker runtime - the child side of the bridge protocol.
//!
//! The parent side (spawning, correlation) is in orchestrator.rs.
//!
//! Architecture:
//! - One TCP connection back to the host on `127.0.0.1:<port>`
//! - Each `start` runs as its own task; completions funnel back through the
//!   event loop so a request is answered exactly once
//! - All frames go out through a single writer task

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::commands::{CommandError, InterruptResult, RESULT_KIND};
use crate::bridge::protocol::{Request, RequestFrame, RequestId, ResponseFrame, StartPayload};
use crate::bridge::transport;

/// Successful output of a command handler.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub kind: String,
    pub value: Value,
}

impl CommandOutput {
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }

    /// A plain `"result"` output from any serializable value.
    pub fn result<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        let value = serde_json::to_value(value).map_err(|e| {
            HandlerError::new("Failed to encode result", format!("serialize result: {}", e))
        })?;
        Ok(Self::new(RESULT_KIND, value))
    }
}

/// Failure reported back to the host as an `error` response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{dev_message}")]
pub struct HandlerError {
    pub usr_message: String,
    pub dev_message: String,
}

impl HandlerError {
    pub fn new(usr_message: impl Into<String>, dev_message: impl Into<String>) -> Self {
        Self {
            usr_message: usr_message.into(),
            dev_message: dev_message.into(),
        }
    }

    /// Arguments that do not match what the command expects.
    pub fn invalid_args(command_type: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(
            format!("Invalid arguments for {}", command_type),
            format!("invalid arguments for `{}`: {}", command_type, detail),
        )
    }
}

impl From<CommandError> for HandlerError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Unsupported(_) => Self::new("Unsupported command", e.to_string()),
            CommandError::InvalidArgs { .. } => Self::new("Invalid command arguments", e.to_string()),
        }
    }
}

/// Runs one command type.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, args: Value) -> Result<CommandOutput, HandlerError>;
}

/// Adapter so a plain async closure can serve as a handler.
struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandOutput, HandlerError>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> Result<CommandOutput, HandlerError> {
        (self.0)(args).await
    }
}

/// Command name to handler lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, command_type: impl Into<String>, handler: impl CommandHandler) -> Self {
        self.handlers.insert(command_type.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(self, command_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandOutput, HandlerError>> + Send + 'static,
    {
        self.register(command_type, FnHandler(f))
    }

    pub fn get(&self, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command_type).cloned()
    }

    pub fn command_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Never answer `exit`. Simulates a hung worker.
    pub ignore_exit: bool,
}

type Writer = FramedWrite<OwnedWriteHalf, JsonCodec<ResponseFrame>>;
type Reader = FramedRead<OwnedReadHalf, JsonCodec<RequestFrame>>;

/// Connect to the host and serve requests until `exit` or EOF.
pub async fn run_worker(port: u16, registry: HandlerRegistry, config: WorkerConfig) -> io::Result<()> {
    let stream = transport::connect(port).await?;
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, JsonCodec::<RequestFrame>::new());
    let writer = FramedWrite::new(write_half, JsonCodec::<ResponseFrame>::new());

    tracing::info!(
        port,
        commands = ?registry.command_types(),
        "Worker connected"
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel::<ResponseFrame>();
    let writer_task = tokio::spawn(writer_task(writer, out_rx));

    let result = serve(reader, out_tx, registry, config).await;

    // Sender is gone once serve() returns, so the writer flushes and exits.
    if let Err(e) = writer_task.await {
        tracing::error!(error = %e, "Writer task failed");
    }
    tracing::info!("Worker exiting");
    result
}

async fn writer_task(mut writer: Writer, mut rx: mpsc::UnboundedReceiver<ResponseFrame>) {
    while let Some(frame) = rx.recv().await {
        let uid = frame.uid.clone();
        if let Err(e) = writer.send(frame).await {
            tracing::error!(%uid, error = %e, "Failed to write response");
            return;
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(error = %e, "Failed to close writer");
    }
}

async fn serve(
    mut reader: Reader,
    out_tx: mpsc::UnboundedSender<ResponseFrame>,
    registry: HandlerRegistry,
    config: WorkerConfig,
) -> io::Result<()> {
    let mut running: HashMap<RequestId, AbortHandle> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ResponseFrame>();

    let reply = |frame: ResponseFrame| {
        if out_tx.send(frame).is_err() {
            tracing::warn!("Writer closed, dropping response");
        }
    };

    let outcome = loop {
        tokio::select! {
            biased;

            Some(frame) = done_rx.recv() => {
                // Absent means it was interrupted and already answered.
                if running.remove(&frame.uid).is_some() {
                    reply(frame);
                }
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(RequestFrame { uid, request: Request::Start(payload) })) => {
                        if running.contains_key(&uid) {
                            tracing::warn!(%uid, "Duplicate request id");
                            reply(ResponseFrame::error(
                                uid.clone(),
                                "Duplicate request",
                                format!("request {} is already running", uid),
                            ));
                            continue;
                        }
                        match start(&registry, uid.clone(), payload, done_tx.clone()) {
                            Ok(handle) => {
                                running.insert(uid, handle);
                            }
                            Err(e) => reply(ResponseFrame::error(uid, e.usr_message, e.dev_message)),
                        }
                    }
                    Some(Ok(RequestFrame { uid, request: Request::Interrupt(payload) })) => {
                        let mut interrupted = Vec::new();
                        for target in payload.target_uids {
                            if let Some(handle) = running.remove(&target) {
                                handle.abort();
                                reply(ResponseFrame::interrupted(target.clone()));
                                interrupted.push(target);
                            }
                        }
                        tracing::debug!(%uid, count = interrupted.len(), "Interrupted requests");
                        reply(ResponseFrame::success(
                            uid,
                            RESULT_KIND,
                            serde_json::json!(InterruptResult { interrupted }),
                        ));
                    }
                    Some(Ok(RequestFrame { uid, request: Request::Exit(_) })) => {
                        if config.ignore_exit {
                            tracing::warn!(%uid, "Ignoring exit request");
                            continue;
                        }
                        tracing::info!(%uid, "Exit requested");
                        reply(ResponseFrame::success(uid, RESULT_KIND, serde_json::json!({})));
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Failed to read request");
                        break Err(e);
                    }
                    None => {
                        tracing::info!("Host closed the connection");
                        break Ok(());
                    }
                }
            }
        }
    };

    for (uid, handle) in running.drain() {
        tracing::debug!(%uid, "Aborting running request");
        handle.abort();
    }
    outcome
}

fn start(
    registry: &HandlerRegistry,
    uid: RequestId,
    payload: StartPayload,
    done_tx: mpsc::UnboundedSender<ResponseFrame>,
) -> Result<AbortHandle, HandlerError> {
    let StartPayload {
        command_type,
        start_args,
    } = payload;

    let handler = registry
        .get(&command_type)
        .ok_or_else(|| HandlerError::from(CommandError::Unsupported(command_type.clone())))?;

    tracing::debug!(%uid, %command_type, "Starting command");
    let task = tokio::spawn(async move {
        let result = AssertUnwindSafe(handler.handle(start_args)).catch_unwind().await;
        let frame = match result {
            Ok(Ok(output)) => ResponseFrame::success(uid, output.kind, output.value),
            Ok(Err(e)) => {
                tracing::debug!(%uid, %command_type, error = %e, "Command failed");
                ResponseFrame::error(uid, e.usr_message, e.dev_message)
            }
            Err(_) => {
                tracing::error!(%uid, %command_type, "Command handler panicked");
                ResponseFrame::error(
                    uid,
                    "Internal worker error",
                    format!("handler for `{}` panicked", command_type),
                )
            }
        };
        let _ = done_tx.send(frame);
    });
    Ok(task.abort_handle())
}
