//! Lifecycle state of a bridge.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeState {
    /// Constructed, no worker yet
    #[default]
    Idle,
    /// Inside initialize(): worker spawned, waiting for it to connect
    Connecting,
    /// Accepting requests
    Active,
    /// Inside shutdown(): exit sent, no new requests
    Draining,
    /// Shut down cleanly
    Closed,
    /// Unrecoverable transport or protocol failure
    Failed,
}

impl BridgeState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// EOF on the socket is expected in these states.
    pub fn is_winding_down(self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
