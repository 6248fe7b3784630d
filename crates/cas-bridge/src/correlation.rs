//! Correlation table - maps in-flight request ids to their waiting callers.
//!
//! Pure bookkeeping, no I/O. Every entry is removed exactly once: by a
//! matching response, by an explicit reject, or by a drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::{Outcome, RequestId, ResponseFrame, SuccessResponse};
use crate::error::BridgeError;

type Settlement = Result<SuccessResponse, BridgeError>;

struct PendingEntry {
    sent_at: Instant,
    /// False for `interrupt` and `exit` requests.
    interruptible: bool,
    tx: oneshot::Sender<Settlement>,
}

/// Awaitable outcome of one request.
///
/// Resolves with the success response, or rejects with `Request`,
/// `Interrupted`, or the fatal error that tore the bridge down.
#[derive(Debug)]
pub struct PendingResponse {
    uid: RequestId,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub fn uid(&self) -> &RequestId {
        &self.uid
    }
}

impl Future for PendingResponse {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Connection(
                "request was dropped without a response".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// What `settle` did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Resolved,
    Rejected,
    /// No pending entry: already settled, drained, or never issued.
    Unknown,
}

/// Pending request bookkeeping with lock-free concurrent access.
pub struct CorrelationTable {
    entries: DashMap<RequestId, PendingEntry>,
    closed: OnceLock<BridgeError>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            closed: OnceLock::new(),
        }
    }

    /// Create a pending entry for `uid`, timestamped now.
    pub fn register(&self, uid: RequestId) -> Result<PendingResponse, BridgeError> {
        self.insert(uid, Instant::now(), true)
    }

    /// Like `register`, for control requests that are never interrupt targets.
    pub fn register_control(&self, uid: RequestId) -> Result<PendingResponse, BridgeError> {
        self.insert(uid, Instant::now(), false)
    }

    pub(crate) fn register_at(
        &self,
        uid: RequestId,
        sent_at: Instant,
    ) -> Result<PendingResponse, BridgeError> {
        self.insert(uid, sent_at, true)
    }

    fn insert(
        &self,
        uid: RequestId,
        sent_at: Instant,
        interruptible: bool,
    ) -> Result<PendingResponse, BridgeError> {
        if let Some(reason) = self.closed.get() {
            return Err(reason.clone());
        }

        let (tx, rx) = oneshot::channel();
        match self.entries.entry(uid.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::InvalidState(format!(
                    "request id {} is already pending",
                    uid
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    sent_at,
                    interruptible,
                    tx,
                });
            }
        }

        // A drain may have run between the check above and the insert.
        if let Some(reason) = self.closed.get()
            && let Some((_, entry)) = self.entries.remove(&uid)
        {
            let _ = entry.tx.send(Err(reason.clone()));
        }

        Ok(PendingResponse { uid, rx })
    }

    /// Route a response frame to its waiting caller.
    pub fn settle(&self, frame: ResponseFrame) -> Settled {
        let ResponseFrame { uid, outcome } = frame;

        let Some((_, entry)) = self.entries.remove(&uid) else {
            tracing::warn!(
                %uid,
                status = outcome.status(),
                "Response for unknown or already-settled request"
            );
            return Settled::Unknown;
        };

        let (settlement, settled) = match outcome {
            Outcome::Success(payload) => (
                Ok(SuccessResponse {
                    uid: uid.clone(),
                    payload,
                }),
                Settled::Resolved,
            ),
            Outcome::Error(e) => (
                Err(BridgeError::Request {
                    usr_message: e.usr_message,
                    dev_message: e.dev_message,
                }),
                Settled::Rejected,
            ),
            Outcome::Interrupted(_) => (Err(BridgeError::Interrupted), Settled::Rejected),
        };

        tracing::trace!(
            %uid,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            "Request settled"
        );

        if entry.tx.send(settlement).is_err() {
            tracing::debug!(%uid, "Caller stopped waiting before the response arrived");
        }
        settled
    }

    /// Remove one entry and reject it. Returns false if it was not pending.
    pub fn reject(&self, uid: &RequestId, error: BridgeError) -> bool {
        match self.entries.remove(uid) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Ids of requests pending for at least `min_age`, oldest first.
    pub fn outstanding_for(&self, min_age: Duration) -> Vec<RequestId> {
        self.outstanding_at(Instant::now(), min_age)
    }

    pub(crate) fn outstanding_at(&self, now: Instant, min_age: Duration) -> Vec<RequestId> {
        self.collect_sorted(|e| now.saturating_duration_since(e.sent_at) >= min_age)
    }

    /// Pending requests a worker can be asked to interrupt, oldest first.
    pub fn interruptible(&self) -> Vec<RequestId> {
        self.collect_sorted(|e| e.interruptible)
    }

    fn collect_sorted(&self, keep: impl Fn(&PendingEntry) -> bool) -> Vec<RequestId> {
        let mut aged: Vec<(Instant, RequestId)> = self
            .entries
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| (e.sent_at, e.key().clone()))
            .collect();
        aged.sort();
        aged.into_iter().map(|(_, uid)| uid).collect()
    }

    /// Close the table and reject every remaining entry with `reason`.
    ///
    /// Later `register` calls fail with the first reason the table was closed with.
    pub fn drain_rejecting(&self, reason: BridgeError) -> usize {
        let _ = self.closed.set(reason.clone());

        let uids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for uid in uids {
            if self.reject(&uid, reason.clone()) {
                rejected += 1;
            }
        }

        if rejected > 0 {
            tracing::debug!(rejected, reason = %reason, "Drained pending requests");
        }
        rejected
    }

    pub fn closed_reason(&self) -> Option<&BridgeError> {
        self.closed.get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
