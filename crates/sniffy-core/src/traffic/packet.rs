use crate::identity::ConnectionIdentity;
use crate::thread::ThreadMeta;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("SENT"),
            Direction::Received => f.write_str("RECEIVED"),
        }
    }
}

/// A run of consecutive bytes in one direction, as the application
/// perceives a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPacket {
    pub connection: ConnectionIdentity,
    pub direction: Direction,
    /// Time of the first append.
    pub timestamp_nanos: u64,
    pub thread: ThreadMeta,
    pub stack_trace: Option<Arc<str>>,
    pub payload: Vec<u8>,
    #[serde(skip)]
    last_append_nanos: u64,
}

impl NetworkPacket {
    pub fn new(
        connection: ConnectionIdentity,
        direction: Direction,
        timestamp_nanos: u64,
        thread: ThreadMeta,
        stack_trace: Option<Arc<str>>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            connection,
            direction,
            timestamp_nanos,
            thread,
            stack_trace,
            payload,
            last_append_nanos: timestamp_nanos,
        }
    }

    pub fn last_append_nanos(&self) -> u64 {
        self.last_append_nanos
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether bytes observed at `timestamp_nanos` continue this packet.
    pub fn continues_with(
        &self,
        direction: Direction,
        thread: &ThreadMeta,
        timestamp_nanos: u64,
        merge_threshold_nanos: u64,
    ) -> bool {
        self.direction == direction
            && self.thread == *thread
            && timestamp_nanos.saturating_sub(self.last_append_nanos) <= merge_threshold_nanos
    }

    pub(crate) fn extend(&mut self, bytes: &[u8], timestamp_nanos: u64) {
        self.payload.extend_from_slice(bytes);
        self.last_append_nanos = self.last_append_nanos.max(timestamp_nanos);
    }

    /// Appends `next` if it continues this packet (same direction, thread
    /// and call site, close enough in time). Returns `next` back otherwise.
    pub fn combine(
        &mut self,
        next: NetworkPacket,
        merge_threshold_nanos: u64,
    ) -> Result<(), NetworkPacket> {
        if self.stack_trace == next.stack_trace
            && self.continues_with(
                next.direction,
                &next.thread,
                next.timestamp_nanos,
                merge_threshold_nanos,
            )
        {
            self.payload.extend_from_slice(&next.payload);
            self.last_append_nanos = self.last_append_nanos.max(next.last_append_nanos);
            Ok(())
        } else {
            Err(next)
        }
    }

    /// Drops the first `n` payload bytes.
    pub(crate) fn skip_bytes(&mut self, n: usize) {
        let n = n.min(self.payload.len());
        self.payload.drain(..n);
    }
}
