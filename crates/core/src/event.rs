// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pooled events flowing over connections.
//!
//! An [`Event`] is owned by its producer while it sits in the free pool. Once
//! queued it is shared read-only between every consumer that received it; each
//! consumer holds an [`EventShare`](crate::connection::EventShare) and the last
//! share to be released hands the owned event back to the producer.

use std::time::{SystemTime, UNIX_EPOCH};

/// A reusable unit of data with stream bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event<T> {
    pub sequence_count: u64,
    pub timestamp_nanos: i64,
    pub end_of_stream: bool,
    pub payload: T,
}

impl<T> Event<T> {
    pub const fn new(payload: T) -> Self {
        Self { sequence_count: 0, timestamp_nanos: 0, end_of_stream: false, payload }
    }

    /// Sets sequence and timestamp before the event is queued.
    pub const fn stamp(&mut self, sequence_count: u64, timestamp_nanos: i64) -> &mut Self {
        self.sequence_count = sequence_count;
        self.timestamp_nanos = timestamp_nanos;
        self
    }

    /// Stamps with the current wall clock.
    pub fn stamp_now(&mut self, sequence_count: u64) -> &mut Self {
        self.stamp(sequence_count, now_nanos())
    }

    pub const fn mark_end_of_stream(&mut self) -> &mut Self {
        self.end_of_stream = true;
        self
    }

    /// Clears stream bookkeeping so a pooled event can be reused for a new stream.
    pub const fn reset(&mut self) {
        self.sequence_count = 0;
        self.timestamp_nanos = 0;
        self.end_of_stream = false;
    }

    /// Copies stream bookkeeping from another event, leaving the payload untouched.
    pub const fn copy_header_from<U>(&mut self, other: &Event<U>) {
        self.sequence_count = other.sequence_count;
        self.timestamp_nanos = other.timestamp_nanos;
        self.end_of_stream = other.end_of_stream;
    }
}

/// Nanoseconds since the Unix epoch, saturating on overflow.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_and_reset() {
        let mut event = Event::new(7_u32);
        event.stamp(3, 1_000).mark_end_of_stream();
        assert_eq!(event.sequence_count, 3);
        assert_eq!(event.timestamp_nanos, 1_000);
        assert!(event.end_of_stream);

        event.reset();
        assert_eq!(event, Event::new(7));
    }

    #[test]
    fn test_copy_header_keeps_payload() {
        let mut source = Event::new("src");
        source.stamp(9, 42);
        let mut target = Event::new(1_u8);
        target.copy_header_from(&source);
        assert_eq!((target.sequence_count, target.timestamp_nanos, target.payload), (9, 42, 1));
    }
}
