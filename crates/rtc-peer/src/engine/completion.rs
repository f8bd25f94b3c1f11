//! One-shot completion slots handed to the engine
//!
//! Every CreateOffer/CreateAnswer/SetDescription request gets a fresh slot
//! stamped with the connection's current generation. When the requester
//! gives up (timeout) it bumps the generation, so a completion that shows up
//! afterwards sees a stale stamp and is dropped instead of being delivered
//! to whichever request happens to be waiting next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::sdp::SessionDescription;

/// Engine-side outcome: a value or a failure reason
pub type CompletionResult<T> = std::result::Result<T, String>;

/// Single-use completion for an asynchronous engine request
#[derive(Debug)]
pub struct Completion<T> {
    operation: &'static str,
    generation: u64,
    current: Arc<AtomicU64>,
    tx: oneshot::Sender<CompletionResult<T>>,
}

/// Completion for CreateOffer/CreateAnswer
pub type SdpCompletion = Completion<SessionDescription>;

/// Completion for SetLocalDescription/SetRemoteDescription
pub type SetDescriptionCompletion = Completion<()>;

impl<T> Completion<T> {
    pub(crate) fn new(
        operation: &'static str,
        generation: u64,
        current: Arc<AtomicU64>,
    ) -> (Self, oneshot::Receiver<CompletionResult<T>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            operation,
            generation,
            current,
            tx,
        };
        (completion, rx)
    }

    /// Slot that is always current; used when driving an engine directly
    pub fn detached(operation: &'static str) -> (Self, oneshot::Receiver<CompletionResult<T>>) {
        Self::new(operation, 0, Arc::new(AtomicU64::new(0)))
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once the requester has moved on
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.resolve(Err(reason.into()));
    }

    fn resolve(self, outcome: CompletionResult<T>) {
        if !self.is_current() {
            debug!(
                operation = self.operation,
                generation = self.generation,
                current = self.current.load(Ordering::Acquire),
                "Dropping late engine completion"
            );
            return;
        }
        if self.tx.send(outcome).is_err() {
            debug!(
                operation = self.operation,
                generation = self.generation,
                "Requester no longer waiting for completion"
            );
        }
    }
}
