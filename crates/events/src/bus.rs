//! Distribution of committed movements to their consumers.
//!
//! Publishing always happens after the ledger append, so anything lost in
//! transit here is recoverable by replaying from a cursor. Consumers get
//! at-least-once delivery and must be idempotent.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Consumer end of one bus subscription.
///
/// Messages buffer until taken. `drain` is the path for fold-style
/// consumers that catch up on everything buffered in one go; `next_within`
/// serves worker loops that block with a periodic shutdown check. Both see
/// messages in publication order.
#[derive(Debug)]
pub struct Subscription<M> {
    inbox: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(inbox: Receiver<M>) -> Self {
        Self { inbox }
    }

    /// Take everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        std::iter::from_fn(|| self.inbox.try_recv().ok()).collect()
    }

    /// Wait up to `timeout` for one message. `None` covers both an empty
    /// inbox and a bus whose publisher side is gone.
    pub fn next_within(&self, timeout: Duration) -> Option<M> {
        self.inbox.recv_timeout(timeout).ok()
    }
}

/// Broadcast pub/sub over committed movements.
///
/// Implementations distribute, they never store: each subscription sees
/// every message published after it was opened, and a failed publish is
/// reported to the caller rather than retried internally.
pub trait EventBus<M>: Send + Sync {
    type Error: fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
