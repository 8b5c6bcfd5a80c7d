use crate::identity::SocketAddress;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Opens byte streams to remote endpoints.
pub trait Connector {
    type Stream: Read + Write;

    fn connect(&self, address: &SocketAddress) -> io::Result<Self::Stream>;
}

/// Executes SQL on one database connection.
pub trait SqlExecutor {
    type Row;
    type Error;

    /// Runs a query and returns its rows.
    fn query(&mut self, sql: &str) -> Result<Vec<Self::Row>, Self::Error>;

    /// Runs a statement and returns the update count.
    fn execute(&mut self, sql: &str) -> Result<u64, Self::Error>;

    /// Runs statements in order and returns one update count per statement.
    fn execute_batch(&mut self, batch: &[String]) -> Result<Vec<u64>, Self::Error> {
        batch.iter().map(|sql| self.execute(sql)).collect()
    }
}

/// Factory of database connections.
pub trait DataSource {
    type Connection: SqlExecutor;
    type Error;

    fn url(&self) -> &str;

    fn user(&self) -> Option<&str>;

    fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, address: &SocketAddress) -> io::Result<TcpStream> {
        let Some(timeout) = self.timeout else {
            return TcpStream::connect((address.host.as_str(), address.port));
        };

        let mut last_error = None;
        for addr in (address.host.as_str(), address.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", address),
            )
        }))
    }
}
