use super::packet::{Direction, NetworkPacket};
use crate::identity::ConnectionIdentity;
use crate::thread::ThreadMeta;
use std::sync::Arc;
use std::time::Duration;

/// Where a packet list stood at some point: number of closed packets and
/// how many bytes the open packet already had.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficPosition {
    pub closed: usize,
    pub open_bytes: usize,
}

/// Coalesces raw reads and writes of one connection into logical packets.
#[derive(Debug)]
pub struct PacketReconstructor {
    connection: ConnectionIdentity,
    merge_threshold_nanos: u64,
    closed: Vec<NetworkPacket>,
    open: Option<NetworkPacket>,
}

impl PacketReconstructor {
    pub fn new(connection: ConnectionIdentity, merge_threshold: Duration) -> Self {
        Self {
            connection,
            merge_threshold_nanos: u64::try_from(merge_threshold.as_nanos()).unwrap_or(u64::MAX),
            closed: Vec::new(),
            open: None,
        }
    }

    pub fn connection(&self) -> &ConnectionIdentity {
        &self.connection
    }

    pub fn append(
        &mut self,
        direction: Direction,
        bytes: &[u8],
        timestamp_nanos: u64,
        thread: &ThreadMeta,
        stack_trace: Option<&Arc<str>>,
    ) {
        if bytes.is_empty() {
            return;
        }

        if let Some(open) = self.open.as_mut()
            && open.continues_with(direction, thread, timestamp_nanos, self.merge_threshold_nanos)
        {
            open.extend(bytes, timestamp_nanos);
            return;
        }

        self.flush();
        self.open = Some(NetworkPacket::new(
            self.connection.clone(),
            direction,
            timestamp_nanos,
            thread.clone(),
            stack_trace.cloned(),
            bytes.to_vec(),
        ));
    }

    /// Closes the in-progress packet, if any.
    pub fn flush(&mut self) {
        if let Some(packet) = self.open.take() {
            self.closed.push(packet);
        }
    }

    pub fn closed(&self) -> &[NetworkPacket] {
        &self.closed
    }

    pub fn open(&self) -> Option<&NetworkPacket> {
        self.open.as_ref()
    }

    /// Closed packets followed by a copy of the open one.
    pub fn packets(&self) -> Vec<NetworkPacket> {
        self.closed.iter().chain(self.open.as_ref()).cloned().collect()
    }

    pub fn position(&self) -> TrafficPosition {
        TrafficPosition {
            closed: self.closed.len(),
            open_bytes: self.open.as_ref().map_or(0, NetworkPacket::len),
        }
    }

    /// Packets appended after `position`. A packet that was open at that
    /// point is returned without the bytes it already had.
    pub fn packets_since(&self, position: TrafficPosition) -> Vec<NetworkPacket> {
        let open_len = self.open.as_ref().map_or(0, NetworkPacket::len);
        let position = if position.closed > self.closed.len()
            || (position.closed == self.closed.len() && position.open_bytes > open_len)
        {
            // list was recreated since the position was taken
            TrafficPosition::default()
        } else {
            position
        };

        let mut packets: Vec<NetworkPacket> = self
            .closed
            .iter()
            .chain(self.open.as_ref())
            .skip(position.closed)
            .cloned()
            .collect();

        if position.open_bytes > 0
            && let Some(first) = packets.first_mut()
        {
            first.skip_bytes(position.open_bytes);
            if first.is_empty() {
                packets.remove(0);
            }
        }
        packets
    }

    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.open.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SocketAddress;

    const MS: u64 = 1_000_000;

    fn reconstructor() -> PacketReconstructor {
        let connection = ConnectionIdentity {
            address: SocketAddress::new("db", 5432),
            ordinal: 0,
            owner_thread: ThreadMeta::current(),
            stack_trace: None,
        };
        PacketReconstructor::new(connection, Duration::from_millis(500))
    }

    #[test]
    fn test_merges_within_threshold() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, &[1; 10], 0, &t, None);
        r.append(Direction::Sent, &[2; 5], 100 * MS, &t, None);

        let packets = r.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 15);
        assert_eq!(packets[0].direction, Direction::Sent);
    }

    #[test]
    fn test_direction_change_splits() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, &[1; 10], 0, &t, None);
        r.append(Direction::Received, &[2; 5], 0, &t, None);

        let packets = r.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 10);
        assert_eq!(packets[1].direction, Direction::Received);
        assert_eq!(r.closed().len(), 1);
    }

    #[test]
    fn test_gap_measured_from_last_append() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, b"a", 0, &t, None);
        r.append(Direction::Sent, b"b", 400 * MS, &t, None);
        r.append(Direction::Sent, b"c", 800 * MS, &t, None);
        assert_eq!(r.len(), 1);

        r.append(Direction::Sent, b"d", 1400 * MS, &t, None);
        let packets = r.packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload, b"abc");
        assert_eq!(packets[1].payload, b"d");
    }

    #[test]
    fn test_thread_change_splits() {
        let mut r = reconstructor();
        let main = ThreadMeta::current();
        let other = std::thread::spawn(ThreadMeta::current).join().unwrap();
        r.append(Direction::Sent, b"a", 0, &main, None);
        r.append(Direction::Sent, b"b", 0, &other, None);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_zero_length_ignored() {
        let mut r = reconstructor();
        r.append(Direction::Sent, b"", 0, &ThreadMeta::current(), None);
        assert!(r.is_empty());
    }

    #[test]
    fn test_flush() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, b"a", 0, &t, None);
        r.flush();
        r.append(Direction::Sent, b"b", 0, &t, None);
        assert_eq!(r.closed().len(), 1);
        assert!(r.open().is_some());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_packets_since_position() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, b"hello", 0, &t, None);
        let position = r.position();
        assert_eq!(position, TrafficPosition { closed: 0, open_bytes: 5 });

        r.append(Direction::Sent, b" world", 1, &t, None);
        r.append(Direction::Received, b"ok", 2, &t, None);

        let since = r.packets_since(position);
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].payload, b" world");
        assert_eq!(since[1].payload, b"ok");

        let now = r.position();
        assert!(r.packets_since(now).is_empty());
    }

    #[test]
    fn test_stale_position_restarts() {
        let mut r = reconstructor();
        let t = ThreadMeta::current();
        r.append(Direction::Sent, b"abc", 0, &t, None);
        let stale = TrafficPosition { closed: 4, open_bytes: 0 };
        assert_eq!(r.packets_since(stale).len(), 1);
    }
}
