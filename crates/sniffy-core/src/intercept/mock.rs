//! In-memory connectors, executors and data sources for testing the
//! instrumentation without a network or a database.

use super::traits::{Connector, DataSource, SqlExecutor};
use crate::identity::SocketAddress;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct MockNetwork {
    /// Bytes each endpoint sends back on every new connection.
    responses: HashMap<SocketAddress, Vec<u8>>,
    /// Endpoints that refuse connections.
    refused: HashSet<SocketAddress>,
    attempts: Vec<SocketAddress>,
    sent: HashMap<SocketAddress, Vec<u8>>,
}

/// Simulated network. Clones share state, so a test can keep one handle
/// while the instrumented wrapper owns another.
///
/// Unknown endpoints accept connections and send nothing.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    network: Arc<Mutex<MockNetwork>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bytes `address` sends on every new connection.
    pub fn with_response(self, address: SocketAddress, response: impl Into<Vec<u8>>) -> Self {
        self.network.lock().responses.insert(address, response.into());
        self
    }

    /// Makes `address` refuse connections, like a closed port.
    pub fn refuse(&self, address: SocketAddress) {
        self.network.lock().refused.insert(address);
    }

    /// Every address the delegate was asked to connect to, in order.
    pub fn attempts(&self) -> Vec<SocketAddress> {
        self.network.lock().attempts.clone()
    }

    /// Everything written to `address` over all connections.
    pub fn sent(&self, address: &SocketAddress) -> Vec<u8> {
        self.network
            .lock()
            .sent
            .get(address)
            .cloned()
            .unwrap_or_default()
    }
}

impl Connector for MockConnector {
    type Stream = MockStream;

    fn connect(&self, address: &SocketAddress) -> io::Result<MockStream> {
        let mut network = self.network.lock();
        network.attempts.push(address.clone());
        if network.refused.contains(address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("mock endpoint {} refused the connection", address),
            ));
        }
        let response = network.responses.get(address).cloned().unwrap_or_default();
        Ok(MockStream {
            address: address.clone(),
            incoming: Cursor::new(response),
            network: Arc::clone(&self.network),
        })
    }
}

/// One simulated connection.
#[derive(Debug)]
pub struct MockStream {
    address: SocketAddress,
    incoming: Cursor<Vec<u8>>,
    network: Arc<Mutex<MockNetwork>>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.incoming.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.network
            .lock()
            .sent
            .entry(self.address.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockRow(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSqlError {
    pub sql: String,
}

impl fmt::Display for MockSqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mock failure executing '{}'", self.sql)
    }
}

impl std::error::Error for MockSqlError {}

/// Scripted SQL executor.
///
/// Queries return no rows and statements update one row unless configured
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    rows: HashMap<String, usize>,
    update_counts: HashMap<String, u64>,
    failing: HashSet<String>,
    executed: Vec<String>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, sql: impl Into<String>, rows: usize) -> Self {
        self.rows.insert(sql.into(), rows);
        self
    }

    pub fn with_update_count(mut self, sql: impl Into<String>, count: u64) -> Self {
        self.update_counts.insert(sql.into(), count);
        self
    }

    pub fn failing_on(mut self, sql: impl Into<String>) -> Self {
        self.failing.insert(sql.into());
        self
    }

    /// SQL received so far, in order.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    fn run(&mut self, sql: &str) -> Result<(), MockSqlError> {
        self.executed.push(sql.to_string());
        if self.failing.contains(sql) {
            return Err(MockSqlError {
                sql: sql.to_string(),
            });
        }
        Ok(())
    }
}

impl SqlExecutor for MockExecutor {
    type Row = MockRow;
    type Error = MockSqlError;

    fn query(&mut self, sql: &str) -> Result<Vec<MockRow>, MockSqlError> {
        self.run(sql)?;
        let rows = self.rows.get(sql).copied().unwrap_or(0);
        Ok((0..rows).map(MockRow).collect())
    }

    fn execute(&mut self, sql: &str) -> Result<u64, MockSqlError> {
        self.run(sql)?;
        Ok(self.update_counts.get(sql).copied().unwrap_or(1))
    }
}

/// Data source handing out clones of a template executor.
#[derive(Debug, Clone)]
pub struct MockDataSource {
    url: String,
    user: Option<String>,
    template: MockExecutor,
    fail: bool,
    connects: Arc<AtomicUsize>,
}

impl MockDataSource {
    pub fn new(url: impl Into<String>, user: Option<&str>) -> Self {
        Self {
            url: url.into(),
            user: user.map(str::to_string),
            template: MockExecutor::new(),
            fail: false,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_executor(mut self, template: MockExecutor) -> Self {
        self.template = template;
        self
    }

    /// Every connection attempt fails.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of times the delegate `connect` ran.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl DataSource for MockDataSource {
    type Connection = MockExecutor;
    type Error = MockSqlError;

    fn url(&self) -> &str {
        &self.url
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn connect(&self) -> Result<MockExecutor, MockSqlError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MockSqlError {
                sql: "connect".to_string(),
            });
        }
        Ok(self.template.clone())
    }
}
