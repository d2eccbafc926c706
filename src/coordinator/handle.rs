//! The control handle binding a coordinator to the run it governs.
//!
//! A handle carries two signals:
//!
//! - **cancel** (capacity [`CANCEL_CAPACITY`]): preemptors post requests,
//!   the runner polls for one at each checkpoint. A full buffer still counts
//!   as delivered; the runner only needs to observe one pending request.
//! - **ack** (capacity [`ACK_CAPACITY`]): the runner posts exactly one
//!   [`Acknowledgement`] when it reaches a terminal state. Every reader
//!   re-posts what it took, so the acknowledgement behaves as a latch and
//!   any number of preemptors waiting on the same handle see one answer.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::types::RunId;

/// Number of cancellation requests that can be buffered without blocking.
pub const CANCEL_CAPACITY: usize = 3;

/// The acknowledgement signal is single-slot.
pub const ACK_CAPACITY: usize = 1;

/// How a run reached its terminal state, as reported to preemptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The run finished on its own (completed or failed) and released its
    /// registration before it noticed any cancellation request. A request
    /// posted by the preemptor may still be buffered. Corresponds to `true`.
    SelfCompleted,

    /// The run observed a cancellation request at a checkpoint, cleaned up,
    /// and stopped. Its registration is left for the preemptor to replace.
    /// Corresponds to `false`.
    Stopped,
}

impl Acknowledgement {
    /// The boolean form used on the wire of the handshake.
    pub fn as_bool(self) -> bool {
        matches!(self, Acknowledgement::SelfCompleted)
    }
}

/// Per-run cancellation and acknowledgement signals.
///
/// Handles are created by the [`RunRegistry`](super::RunRegistry) and shared
/// via `Arc`; identity (not equality) decides which run a registry entry
/// belongs to.
pub struct ControlHandle {
    id: RunId,
    cancel_tx: mpsc::Sender<()>,
    cancel_rx: Mutex<mpsc::Receiver<()>>,
    ack_tx: mpsc::Sender<Acknowledgement>,
    ack_rx: tokio::sync::Mutex<mpsc::Receiver<Acknowledgement>>,
}

impl ControlHandle {
    pub(crate) fn new(id: RunId) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CAPACITY);
        ControlHandle {
            id,
            cancel_tx,
            cancel_rx: Mutex::new(cancel_rx),
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
        }
    }

    /// Returns the run ID this handle was created for.
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Posts one cancellation request without blocking.
    ///
    /// Returns `false` if the buffer was already full. The request is still
    /// considered delivered in that case.
    pub fn request_cancel(&self) -> bool {
        match self.cancel_tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                trace!(run_id = %self.id, "cancel buffer full, request already pending");
                false
            }
            // The receiver lives on `self`, so the channel cannot close.
            Err(TrySendError::Closed(())) => false,
        }
    }

    /// Non-blocking checkpoint poll: consumes one pending cancellation
    /// request if there is one.
    pub fn poll_cancel(&self) -> bool {
        self.cancel_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .is_ok()
    }

    /// Number of cancellation requests currently buffered.
    pub fn pending_cancels(&self) -> usize {
        self.cancel_tx.max_capacity() - self.cancel_tx.capacity()
    }

    /// Posts the run's terminal acknowledgement.
    ///
    /// A runner posts exactly once; if the slot is already occupied the
    /// existing value stands.
    pub fn acknowledge(&self, ack: Acknowledgement) {
        if self.ack_tx.try_send(ack).is_err() {
            trace!(run_id = %self.id, ?ack, "acknowledgement slot already filled");
        }
    }

    /// Waits for the run's acknowledgement and re-posts it for the next reader.
    ///
    /// Readers are serialised on the receiver, so the take-and-repost is
    /// atomic with respect to other preemptors.
    pub async fn wait_ack(&self) -> Acknowledgement {
        let mut rx = self.ack_rx.lock().await;
        // The sender lives on `self`, so `recv` only yields a value.
        let ack = rx.recv().await.unwrap_or(Acknowledgement::Stopped);
        if self.ack_tx.try_send(ack).is_err() {
            trace!(run_id = %self.id, ?ack, "acknowledgement re-post found slot occupied");
        }
        ack
    }
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("id", &self.id)
            .field("pending_cancels", &self.pending_cancels())
            .finish()
    }
}
