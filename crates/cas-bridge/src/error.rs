//! Bridge error taxonomy.

use std::time::Duration;

/// Errors surfaced by the bridge.
///
/// `Clone` so a single fatal reason can reject every pending request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Worker never connected, or the socket closed unexpectedly. Fatal.
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame failed to parse or carried an unknown status. Fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Worker could not be started. Fatal.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Worker answered `status=error` for one request.
    #[error("{dev_message}")]
    Request {
        usr_message: String,
        dev_message: String,
    },

    /// Worker answered `status=interrupted` for one request.
    #[error("Interrupted")]
    Interrupted,

    /// The exit round-trip did not finish in time; the worker was killed.
    #[error("worker did not exit within {0:?} and was killed")]
    ShutdownTimeout(Duration),

    /// Operation not valid in the bridge's current lifecycle state.
    #[error("invalid bridge state: {0}")]
    InvalidState(String),

    /// Success response carried a result type the caller did not expect.
    #[error("unexpected response type `{actual}`, expected one of {expected:?}")]
    UnexpectedResultType {
        actual: String,
        expected: Vec<String>,
    },

    /// Success value did not deserialize into the requested result type.
    #[error("failed to decode result: {0}")]
    Decode(String),
}

impl BridgeError {
    pub fn request(usr_message: impl Into<String>, dev_message: impl Into<String>) -> Self {
        Self::Request {
            usr_message: usr_message.into(),
            dev_message: dev_message.into(),
        }
    }

    /// Fatal errors poison the bridge: every pending request is rejected and
    /// no further requests are accepted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Protocol(_) | Self::Spawn(_)
        )
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Short message suitable for a notice in the editor.
    pub fn usr_message(&self) -> String {
        match self {
            Self::Request { usr_message, .. } => usr_message.clone(),
            Self::Interrupted => "Computation was interrupted".to_string(),
            Self::Connection(_) | Self::Protocol(_) | Self::Spawn(_) => {
                "Lost connection to the math worker".to_string()
            }
            Self::ShutdownTimeout(_) => "Math worker did not shut down cleanly".to_string(),
            other => other.to_string(),
        }
    }

    /// Full diagnostic detail.
    pub fn dev_message(&self) -> String {
        match self {
            Self::Request { dev_message, .. } => dev_message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from a [`WorkerSpawner`](crate::spawner::WorkerSpawner).
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

impl From<SpawnError> for BridgeError {
    fn from(e: SpawnError) -> Self {
        Self::Spawn(e.to_string())
    }
}
