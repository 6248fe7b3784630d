//! cas-bridge: host-side supervisor for a computer algebra worker process.

mod correlation;
mod state;

pub mod bridge;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod spawner;
pub mod verifier;
pub mod worker;

pub use orchestrator::{Bridge, BridgeConfig, SendResult};

pub use correlation::{CorrelationTable, PendingResponse, Settled};
pub use state::BridgeState;

pub use bridge::commands::{Command, CommandError};
pub use bridge::protocol::{Request, RequestId, StartPayload, SuccessResponse};
pub use bridge::transport::{WorkerExit, WorkerProcess};
pub use error::{BridgeError, SpawnError};
pub use spawner::{ExecutableSpawner, SourceSpawner, WorkerSpawner};
pub use verifier::ResponseVerifier;
pub use worker::{
    CommandHandler, CommandOutput, HandlerError, HandlerRegistry, WorkerConfig, run_worker,
};
