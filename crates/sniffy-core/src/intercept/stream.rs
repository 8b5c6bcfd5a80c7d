use super::traits::Connector;
use crate::identity::{ConnectionIdentity, SocketAddress};
use crate::policy::{PolicyRefusal, PolicyStatus};
use crate::sniffy::Sniffy;
use crate::stats::StatsValues;
use crate::thread::ThreadMeta;
use crate::traffic::Direction;
use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Bytes a throttled connection may move per injected delay.
const TCP_WINDOW: usize = 64 * 1024;

/// Connector that enforces socket policy and accounts every connection it
/// opens.
pub struct InstrumentedConnector<C> {
    inner: C,
    sniffy: Sniffy,
}

impl<C: Connector> InstrumentedConnector<C> {
    pub fn new(inner: C, sniffy: Sniffy) -> Self {
        Self { inner, sniffy }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }
}

impl<C: Connector> Connector for InstrumentedConnector<C> {
    type Stream = InstrumentedStream<C::Stream>;

    fn connect(&self, address: &SocketAddress) -> io::Result<Self::Stream> {
        let status = self
            .sniffy
            .registry()
            .resolve_socket(&address.host, address.port);
        if let Some(delay) = status.delay() {
            self.sniffy.sleeper().sleep(delay);
        }
        if status.is_refused() {
            debug!(address = %address, status = %status, "connect refused by policy");
            return Err(PolicyRefusal::socket(address).into_io());
        }

        let identity = ConnectionIdentity {
            address: address.clone(),
            ordinal: self.sniffy.aggregator().next_ordinal(address),
            owner_thread: ThreadMeta::current(),
            stack_trace: self.sniffy.capture_stack_trace(),
        };

        let start = self.sniffy.now_nanos();
        let result = self.inner.connect(address);
        let elapsed = self.sniffy.now_nanos().saturating_sub(start);

        if self.sniffy.config().monitor_socket {
            self.sniffy
                .aggregator()
                .record_socket(&identity, &StatsValues::operation(elapsed));
        }

        Ok(InstrumentedStream {
            inner: result?,
            identity,
            sniffy: self.sniffy.clone(),
        })
    }
}

/// Stream wrapper that re-checks policy on every call and accounts bytes,
/// time and reconstructed packets under its connection identity.
pub struct InstrumentedStream<S> {
    inner: S,
    identity: ConnectionIdentity,
    sniffy: Sniffy,
}

impl<S> InstrumentedStream<S> {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Closes the in-progress packet of this connection.
    pub fn close_traffic(&self) {
        self.sniffy.aggregator().flush_traffic(&self.identity);
    }

    fn check_policy(&self) -> io::Result<PolicyStatus> {
        let address = &self.identity.address;
        let status = self
            .sniffy
            .registry()
            .resolve_socket(&address.host, address.port);
        if status.is_refused() {
            if let Some(delay) = status.delay() {
                self.sniffy.sleeper().sleep(delay);
            }
            debug!(connection = %self.identity, status = %status, "I/O refused by policy");
            return Err(PolicyRefusal::socket(address).into_io());
        }
        Ok(status)
    }

    fn account(&self, direction: Direction, bytes: &[u8], elapsed_nanos: u64, timestamp_nanos: u64) {
        let config = self.sniffy.config();
        if !config.monitor_socket {
            return;
        }

        let thread = ThreadMeta::current();
        let identity = if thread == self.identity.owner_thread {
            Cow::Borrowed(&self.identity)
        } else {
            Cow::Owned(self.identity.on_thread(thread.clone()))
        };

        let count = bytes.len() as u64;
        let delta = match direction {
            Direction::Sent => StatsValues::operation(elapsed_nanos).with_sent(count),
            Direction::Received => StatsValues::operation(elapsed_nanos).with_received(count),
        };
        let aggregator = self.sniffy.aggregator();
        aggregator.record_socket(&identity, &delta);

        if config.capture_traffic && !bytes.is_empty() {
            let stack_trace = self.sniffy.capture_stack_trace();
            aggregator.append_traffic(
                &self.identity,
                direction,
                bytes,
                timestamp_nanos,
                &thread,
                stack_trace.as_ref(),
            );
        }
    }

    fn throttle(&self, status: PolicyStatus, bytes: usize) {
        if let PolicyStatus::Throttle(ms) = status
            && ms > 0
            && bytes > 0
        {
            let windows = 1 + bytes / TCP_WINDOW;
            let delay = Duration::from_millis(u64::from(ms) * windows as u64);
            self.sniffy.sleeper().sleep(delay);
        }
    }
}

impl<S: Read> Read for InstrumentedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let status = self.check_policy()?;
        let start = self.sniffy.now_nanos();
        let result = self.inner.read(buf);
        let end = self.sniffy.now_nanos();

        let n = *result.as_ref().unwrap_or(&0);
        self.account(Direction::Received, &buf[..n], end.saturating_sub(start), end);
        self.throttle(status, n);
        result
    }
}

impl<S: Write> Write for InstrumentedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let status = self.check_policy()?;
        let start = self.sniffy.now_nanos();
        let result = self.inner.write(buf);
        let end = self.sniffy.now_nanos();

        let n = *result.as_ref().unwrap_or(&0);
        self.account(Direction::Sent, &buf[..n], end.saturating_sub(start), end);
        self.throttle(status, n);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S> Drop for InstrumentedStream<S> {
    fn drop(&mut self) {
        self.close_traffic();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::config::SniffyConfig;
    use crate::intercept::MockConnector;
    use std::sync::Arc;

    fn sniffy() -> (Sniffy, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let sniffy = Sniffy::default().with_sleeper(sleeper.clone());
        (sniffy, sleeper)
    }

    #[test]
    fn test_closed_never_reaches_delegate() {
        let (sniffy, _) = sniffy();
        let mock = MockConnector::new();
        let connector = sniffy.connector(mock.clone());
        sniffy
            .registry()
            .set_socket_status(Some("db.internal"), Some(5432), PolicyStatus::Closed);

        let err = connector
            .connect(&SocketAddress::new("db.internal", 5432))
            .err()
            .unwrap();
        assert!(PolicyRefusal::from_io(&err).is_some());
        assert!(mock.attempts().is_empty());
        assert!(sniffy.aggregator().sockets(|_| true).is_empty());
    }

    #[test]
    fn test_refuse_after_sleeps_first() {
        let (sniffy, sleeper) = sniffy();
        let connector = sniffy.connector(MockConnector::new());
        sniffy
            .registry()
            .set_socket_status(None, Some(5432), PolicyStatus::RefuseAfter(30));

        let err = connector
            .connect(&SocketAddress::new("db", 5432))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_millis(30)]);
    }

    #[test]
    fn test_connect_accounts_with_ordinals() {
        let (sniffy, _) = sniffy();
        let connector = sniffy.connector(MockConnector::new());
        let addr = SocketAddress::new("db", 5432);

        let a = connector.connect(&addr).unwrap();
        let b = connector.connect(&addr).unwrap();
        assert_eq!(a.identity().ordinal, 0);
        assert_eq!(b.identity().ordinal, 1);
        assert_eq!(sniffy.aggregator().sockets(|_| true).len(), 2);
    }

    #[test]
    fn test_bytes_and_packets_recorded() {
        let (sniffy, _) = sniffy();
        let addr = SocketAddress::new("db", 5432);
        let mock = MockConnector::new().with_response(addr.clone(), b"pong".to_vec());
        let connector = sniffy.connector(mock.clone());

        let mut stream = connector.connect(&addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        let id = stream.identity().clone();
        drop(stream);

        let stats = sniffy.aggregator().sockets(|_| true)[&id];
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(stats.operations, 3);
        assert_eq!(mock.sent(&addr), b"ping");

        let traffic = sniffy.aggregator().traffic(|_| true);
        let packets = &traffic[&id];
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].direction, Direction::Sent);
        assert_eq!(packets[1].payload, b"pong");
    }

    #[test]
    fn test_refused_after_establishment() {
        let (sniffy, _) = sniffy();
        let connector = sniffy.connector(MockConnector::new());
        let mut stream = connector.connect(&SocketAddress::new("db", 5432)).unwrap();
        stream.write_all(b"ok").unwrap();

        sniffy
            .registry()
            .set_socket_status(Some("db"), Some(5432), PolicyStatus::Closed);
        let err = stream.write(b"nope").unwrap_err();
        assert!(PolicyRefusal::from_io(&err).is_some());
    }

    #[test]
    fn test_throttle_per_window() {
        let (sniffy, sleeper) = sniffy();
        let connector = sniffy.connector(MockConnector::new());
        sniffy
            .registry()
            .set_socket_status(Some("db"), None, PolicyStatus::Throttle(10));

        let mut stream = connector.connect(&SocketAddress::new("db", 5432)).unwrap();
        stream.write_all(&vec![0u8; 100 * 1024]).unwrap();

        // connect, then one write of two windows
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn test_other_thread_io_uses_derived_identity() {
        let (sniffy, _) = sniffy();
        let connector = sniffy.connector(MockConnector::new());
        let stream = connector.connect(&SocketAddress::new("db", 5432)).unwrap();
        let owner = stream.identity().clone();

        let mut stream = std::thread::spawn(move || {
            let mut stream = stream;
            stream.write_all(b"abc").unwrap();
            stream
        })
        .join()
        .unwrap();
        stream.write_all(b"d").unwrap();

        let sockets = sniffy.aggregator().sockets(|_| true);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[&owner].bytes_sent, 1);
        let derived = sockets.keys().find(|id| **id != owner).unwrap();
        assert!(derived.same_connection(&owner));
        assert_eq!(sockets[derived].bytes_sent, 3);
    }

    #[test]
    fn test_monitoring_disabled_still_enforces() {
        let sniffy = Sniffy::new(SniffyConfig::default().with_monitor_socket(false));
        let connector = sniffy.connector(MockConnector::new());
        let mut stream = connector.connect(&SocketAddress::new("db", 1)).unwrap();
        stream.write_all(b"x").unwrap();
        assert!(sniffy.aggregator().sockets(|_| true).is_empty());

        sniffy.registry().set_socket_status(None, None, PolicyStatus::Closed);
        assert!(connector.connect(&SocketAddress::new("db", 1)).is_err());
    }
}
