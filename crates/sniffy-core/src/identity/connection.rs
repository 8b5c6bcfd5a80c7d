use crate::thread::ThreadMeta;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Remote endpoint as the application asked for it (not the resolved IP).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketAddress {
    pub host: String,
    pub port: u16,
}

impl SocketAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port.parse().ok()?))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for SocketAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Host/port filter for connection expectations and traffic queries.
/// `None` fields match anything; hosts compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AddressMatcher {
    host: Option<String>,
    port: Option<u16>,
}

impl AddressMatcher {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            port: None,
        }
    }

    pub fn port(port: u16) -> Self {
        Self {
            host: None,
            port: Some(port),
        }
    }

    pub fn address(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }

    pub fn matches(&self, address: &SocketAddress) -> bool {
        self.host
            .as_deref()
            .is_none_or(|h| h.eq_ignore_ascii_case(&address.host))
            && self.port.is_none_or(|p| p == address.port)
    }
}

impl fmt::Display for AddressMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(h), Some(p)) => write!(f, "{}", SocketAddress::new(h.clone(), p)),
            (Some(h), None) => write!(f, "{}", h),
            (None, Some(p)) => write!(f, "*:{}", p),
            (None, None) => f.write_str("any address"),
        }
    }
}

/// Accepts `host`, `host:port`, `*:port` and `*`.
impl FromStr for AddressMatcher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((h, p)) if !h.ends_with(':') => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in address '{}'", s))?;
                (h, Some(port))
            }
            // bare IPv6 literal
            _ => (s, None),
        };
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let host = match host {
            "" | "*" => None,
            h => Some(h.to_string()),
        };
        Ok(Self { host, port })
    }
}

/// Identifies one logical network connection.
///
/// `ordinal` counts connections to the same address, so two sequential
/// connections to `db:5432` are distinct identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionIdentity {
    pub address: SocketAddress,
    pub ordinal: u32,
    pub owner_thread: ThreadMeta,
    pub stack_trace: Option<Arc<str>>,
}

impl ConnectionIdentity {
    /// Identity used for I/O that another thread performs on this connection.
    pub fn on_thread(&self, thread: ThreadMeta) -> Self {
        Self {
            address: self.address.clone(),
            ordinal: self.ordinal,
            owner_thread: thread,
            stack_trace: None,
        }
    }

    pub fn without_stack_trace(&self) -> Self {
        Self {
            stack_trace: None,
            ..self.clone()
        }
    }

    /// Same physical connection, regardless of thread or call site.
    pub fn same_connection(&self, other: &ConnectionIdentity) -> bool {
        self.ordinal == other.ordinal && self.address == other.address
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection #{} to {}", self.ordinal, self.address)
    }
}
