//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; the movement ledger is the source of
//! truth. This module provides deterministic replay and cursor tracking
//! without making storage assumptions.

use crate::projection::{Projection, Sequenced};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError<E> {
    /// A message arrived beyond the next expected sequence number.
    SequenceGap { last: u64, found: u64 },
    /// The projection's fold failed.
    Apply(E),
}

/// Runs sequenced messages through a projection and tracks progress.
///
/// - Messages at or below the cursor are skipped (at-least-once delivery).
/// - The next applied message must be exactly `cursor + 1` (the ledger is
///   gap-free, so anything else means lost messages).
#[derive(Debug)]
pub struct ProjectionRunner<P> {
    projection: P,
    cursor: u64,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursor: 0,
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn projection_mut(&mut self) -> &mut P {
        &mut self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }

    /// Last applied sequence number (0 if nothing applied yet).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Apply a single message, enforcing gap-free monotonic sequencing.
    pub fn apply(&mut self, message: &P::Msg) -> Result<(), ProjectionError<P::Error>> {
        let found = message.sequence_number();

        if found <= self.cursor {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }

        if found != self.cursor + 1 {
            return Err(ProjectionError::SequenceGap {
                last: self.cursor,
                found,
            });
        }

        self.projection
            .apply(message)
            .map_err(ProjectionError::Apply)?;
        self.cursor = found;
        Ok(())
    }

    /// Apply many messages in order.
    pub fn run<'a>(
        &mut self,
        messages: impl IntoIterator<Item = &'a P::Msg>,
    ) -> Result<(), ProjectionError<P::Error>>
    where
        P::Msg: 'a,
    {
        for m in messages {
            self.apply(m)?;
        }
        Ok(())
    }

    /// Rebuild the projection from scratch by replaying the full stream.
    pub fn rebuild_from_scratch<'a>(
        &mut self,
        messages: impl IntoIterator<Item = &'a P::Msg>,
    ) -> Result<(), ProjectionError<P::Error>>
    where
        P::Msg: 'a,
    {
        self.projection.clear();
        self.cursor = 0;
        self.run(messages)
    }
}
