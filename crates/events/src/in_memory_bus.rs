//! Channel-backed bus for the in-process deployment and tests.

use std::sync::RwLock;
use std::sync::mpsc::{self, Sender};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// The subscriber registry lock was poisoned by a panicking publisher.
    #[error("subscriber registry poisoned")]
    Poisoned,
}

/// Broadcast bus backed by one channel per subscription.
///
/// Fan-out is best-effort: a dropped subscription is pruned the next time
/// a publish reaches it and never blocks the remaining ones.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    outboxes: RwLock<Vec<Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            outboxes: RwLock::new(Vec::new()),
        }
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut outboxes = self
            .outboxes
            .write()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        // The single-subscriber wiring is the common one; it moves the
        // message instead of cloning it.
        if outboxes.len() == 1 {
            if outboxes[0].send(message).is_err() {
                outboxes.clear();
            }
            return Ok(());
        }

        outboxes.retain(|outbox| outbox.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (outbox, inbox) = mpsc::channel();
        // A poisoned registry cannot take the sender; the subscription then
        // simply stays empty.
        if let Ok(mut outboxes) = self.outboxes.write() {
            outboxes.push(outbox);
        }
        Subscription::new(inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let bus: InMemoryEventBus<u64> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.drain(), vec![7]);
        assert_eq!(b.drain(), vec![7]);
    }

    #[test]
    fn dropped_subscriber_does_not_break_publish() {
        let bus: InMemoryEventBus<u64> = InMemoryEventBus::new();
        let a = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(a.drain(), vec![1, 2]);
    }

    #[test]
    fn late_subscriber_only_sees_later_messages() {
        let bus: InMemoryEventBus<u64> = InMemoryEventBus::new();
        let early = bus.subscribe();
        bus.publish(1).unwrap();

        let late = bus.subscribe();
        bus.publish(2).unwrap();

        assert_eq!(early.drain(), vec![1, 2]);
        assert_eq!(late.drain(), vec![2]);
    }
}
