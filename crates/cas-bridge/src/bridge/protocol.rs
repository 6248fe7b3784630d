//! Wire protocol types for host-worker communication.
//!
//! One channel, one TCP connection:
//! - **Requests** (host → worker): `start`, `interrupt`, `exit`, each tagged with a uid
//! - **Responses** (worker → host): `success`, `error`, `interrupted`, echoing the uid
//!
//! Responses may arrive in any order; the uid is the only correlation key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::commands::Command;
use crate::error::BridgeError;

/// Correlation identifier for one request.
///
/// Generated from a UUID v4 by the host. Kept as a string on the wire so a
/// worker echoing an id the host never issued is a harmless unknown, not a
/// decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `{}` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Payload of a `start` request: an opaque command name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub command_type: String,
    #[serde(default)]
    pub start_args: serde_json::Value,
}

impl StartPayload {
    /// A command outside the typed catalog. The worker decides whether it knows it.
    pub fn custom(command_type: impl Into<String>, start_args: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            start_args,
        }
    }
}

/// Payload of an `interrupt` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub target_uids: Vec<RequestId>,
}

/// Request body, without its uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    Start(StartPayload),
    Interrupt(InterruptPayload),
    Exit(EmptyPayload),
}

impl Request {
    pub fn start(payload: StartPayload) -> Self {
        Self::Start(payload)
    }

    pub fn interrupt(target_uids: Vec<RequestId>) -> Self {
        Self::Interrupt(InterruptPayload { target_uids })
    }

    pub fn exit() -> Self {
        Self::Exit(EmptyPayload {})
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Interrupt(_) => "interrupt",
            Self::Exit(_) => "exit",
        }
    }
}

impl From<StartPayload> for Request {
    fn from(payload: StartPayload) -> Self {
        Self::Start(payload)
    }
}

impl TryFrom<Command> for Request {
    type Error = serde_json::Error;

    fn try_from(command: Command) -> Result<Self, Self::Error> {
        Ok(Self::Start(command.into_payload()?))
    }
}

/// A complete request frame as written to the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub uid: RequestId,
    #[serde(flatten)]
    pub request: Request,
}

impl RequestFrame {
    pub fn new(uid: RequestId, request: Request) -> Self {
        Self { uid, request }
    }
}

/// Payload of a `success` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessPayload {
    /// Semantic kind of the result (`"result"` for plain computed values).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Payload of an `error` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Short, user-facing summary.
    pub usr_message: String,
    /// Full diagnostic detail (stack trace etc).
    pub dev_message: String,
}

/// Response body, without its uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum Outcome {
    Success(SuccessPayload),
    Error(ErrorPayload),
    Interrupted(EmptyPayload),
}

impl Outcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Error(_) => "error",
            Self::Interrupted(_) => "interrupted",
        }
    }
}

/// A complete response frame as read from the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub uid: RequestId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResponseFrame {
    pub fn success(uid: RequestId, kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            uid,
            outcome: Outcome::Success(SuccessPayload {
                kind: kind.into(),
                value,
            }),
        }
    }

    pub fn error(
        uid: RequestId,
        usr_message: impl Into<String>,
        dev_message: impl Into<String>,
    ) -> Self {
        Self {
            uid,
            outcome: Outcome::Error(ErrorPayload {
                usr_message: usr_message.into(),
                dev_message: dev_message.into(),
            }),
        }
    }

    pub fn interrupted(uid: RequestId) -> Self {
        Self {
            uid,
            outcome: Outcome::Interrupted(EmptyPayload {}),
        }
    }
}

/// What a caller's awaited response resolves to on success.
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessResponse {
    pub uid: RequestId,
    pub payload: SuccessPayload,
}

impl SuccessResponse {
    pub fn kind(&self) -> &str {
        &self.payload.kind
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.payload.value
    }

    /// Deserialize the result value into a typed result.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        serde_json::from_value(self.payload.value.clone()).map_err(|e| {
            BridgeError::Decode(format!(
                "result of request {} (type `{}`) did not match: {}",
                self.uid, self.payload.kind, e
            ))
        })
    }
}
