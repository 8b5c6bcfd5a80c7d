//! Connectivity policy: which endpoints and data sources may be reached,
//! delayed or refused.

mod format;
mod registry;
mod storage;

pub use format::{DataSourceRecord, PolicyDocument, SocketRecord};
pub use registry::{PolicyEntry, PolicyRegistry};
pub use storage::RegistryError;

use crate::identity::SocketAddress;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

/// What happens to a connection attempt or an established connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PolicyStatus {
    #[default]
    Open,
    Closed,
    /// Allowed, with this many milliseconds of injected latency.
    Throttle(u32),
    /// Refused after this many milliseconds, like a connect timeout.
    RefuseAfter(u32),
}

impl PolicyStatus {
    pub fn is_refused(self) -> bool {
        matches!(self, PolicyStatus::Closed | PolicyStatus::RefuseAfter(_))
    }

    /// Delay to inject before the operation proceeds or fails.
    pub fn delay(self) -> Option<Duration> {
        match self {
            PolicyStatus::Throttle(ms) | PolicyStatus::RefuseAfter(ms) if ms > 0 => {
                Some(Duration::from_millis(u64::from(ms)))
            }
            _ => None,
        }
    }

    /// Integer form used by older policy files: 0 open, -1 closed,
    /// positive throttle, below -1 refuse after `|n|` ms.
    pub fn from_legacy(code: i64) -> Self {
        match code {
            0 => PolicyStatus::Open,
            -1 => PolicyStatus::Closed,
            n if n > 0 => PolicyStatus::Throttle(u32::try_from(n).unwrap_or(u32::MAX)),
            n => PolicyStatus::RefuseAfter(u32::try_from(n.unsigned_abs()).unwrap_or(u32::MAX)),
        }
    }

    pub fn to_legacy(self) -> i64 {
        match self {
            PolicyStatus::Open => 0,
            PolicyStatus::Closed => -1,
            PolicyStatus::Throttle(ms) => i64::from(ms),
            // -1 is taken by Closed
            PolicyStatus::RefuseAfter(ms) => -i64::from(ms.max(2)),
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyStatus::Open => f.write_str("OPEN"),
            PolicyStatus::Closed => f.write_str("CLOSED"),
            PolicyStatus::Throttle(ms) => write!(f, "THROTTLE({})", ms),
            PolicyStatus::RefuseAfter(ms) => write!(f, "REFUSE_AFTER({})", ms),
        }
    }
}

impl FromStr for PolicyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let upper = s.to_ascii_uppercase();
        let with_arg = |prefix: &str| -> Option<Result<u32, String>> {
            let arg = upper.strip_prefix(prefix)?.strip_prefix('(')?.strip_suffix(')')?;
            Some(
                arg.trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid delay in policy status '{}'", s)),
            )
        };

        match upper.as_str() {
            "OPEN" => return Ok(PolicyStatus::Open),
            "CLOSED" => return Ok(PolicyStatus::Closed),
            _ => {}
        }
        if let Some(ms) = with_arg("THROTTLE") {
            return ms.map(PolicyStatus::Throttle);
        }
        if let Some(ms) = with_arg("REFUSE_AFTER") {
            return ms.map(PolicyStatus::RefuseAfter);
        }
        if let Ok(code) = s.parse::<i64>() {
            return Ok(PolicyStatus::from_legacy(code));
        }
        Err(format!("unknown policy status '{}'", s))
    }
}

impl Serialize for PolicyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PolicyStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Legacy(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Legacy(code) => Ok(PolicyStatus::from_legacy(code)),
        }
    }
}

/// Socket policy key. `None` fields are wildcards. Hosts are kept in
/// lowercase so keys differing only in case land on one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketPattern {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl SocketPattern {
    pub fn new(host: Option<&str>, port: Option<u16>) -> Self {
        Self {
            host: host.map(str::to_ascii_lowercase),
            port,
        }
    }

    pub fn exact(host: &str, port: u16) -> Self {
        Self::new(Some(host), Some(port))
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host
            .as_deref()
            .is_none_or(|h| h.eq_ignore_ascii_case(host))
            && self.port.is_none_or(|p| p == port)
    }

    /// Exact beats host-only beats port-only beats full wildcard.
    pub fn specificity(&self) -> u8 {
        match (&self.host, self.port) {
            (Some(_), Some(_)) => 3,
            (Some(_), None) => 2,
            (None, Some(_)) => 1,
            (None, None) => 0,
        }
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.host.as_deref().unwrap_or("*");
        match self.port {
            Some(port) => write!(f, "{}:{}", host, port),
            None => write!(f, "{}:*", host),
        }
    }
}

/// Data source policy key. `None` fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataSourcePattern {
    pub url: Option<String>,
    pub user: Option<String>,
}

impl DataSourcePattern {
    pub fn new(url: Option<&str>, user: Option<&str>) -> Self {
        Self {
            url: url.map(str::to_string),
            user: user.map(str::to_string),
        }
    }

    pub fn matches(&self, url: &str, user: Option<&str>) -> bool {
        self.url.as_deref().is_none_or(|u| u == url)
            && self.user.as_deref().is_none_or(|u| Some(u) == user)
    }

    /// Exact beats url-only beats user-only beats full wildcard.
    pub fn specificity(&self) -> u8 {
        match (&self.url, &self.user) {
            (Some(_), Some(_)) => 3,
            (Some(_), None) => 2,
            (None, Some(_)) => 1,
            (None, None) => 0,
        }
    }
}

impl fmt::Display for DataSourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (user {})",
            self.url.as_deref().unwrap_or("*"),
            self.user.as_deref().unwrap_or("*")
        )
    }
}

/// A connection or data source access refused by policy.
///
/// On the network path it travels inside an `io::Error` of kind
/// `ConnectionRefused`; use [`PolicyRefusal::from_io`] to tell it apart from
/// a real refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRefusal {
    target: String,
}

impl PolicyRefusal {
    pub fn socket(address: &SocketAddress) -> Self {
        Self {
            target: address.to_string(),
        }
    }

    pub fn data_source(url: &str, user: Option<&str>) -> Self {
        let target = match user {
            Some(user) => format!("{} (user {})", url, user),
            None => url.to_string(),
        };
        Self { target }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, self)
    }

    pub fn from_io(err: &io::Error) -> Option<&PolicyRefusal> {
        err.get_ref()?.downcast_ref::<PolicyRefusal>()
    }
}

impl fmt::Display for PolicyRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection to {} refused by policy", self.target)
    }
}

impl std::error::Error for PolicyRefusal {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        for status in [
            PolicyStatus::Open,
            PolicyStatus::Closed,
            PolicyStatus::Throttle(250),
            PolicyStatus::RefuseAfter(1000),
        ] {
            assert_eq!(status.to_string().parse::<PolicyStatus>().unwrap(), status);
        }
        assert_eq!("throttle( 5 )".parse::<PolicyStatus>().unwrap(), PolicyStatus::Throttle(5));
        assert!("THROTTLE(x)".parse::<PolicyStatus>().is_err());
        assert!("HALF_OPEN".parse::<PolicyStatus>().is_err());
    }

    #[test]
    fn test_legacy_codes() {
        assert_eq!(PolicyStatus::from_legacy(0), PolicyStatus::Open);
        assert_eq!(PolicyStatus::from_legacy(-1), PolicyStatus::Closed);
        assert_eq!(PolicyStatus::from_legacy(300), PolicyStatus::Throttle(300));
        assert_eq!(PolicyStatus::from_legacy(-500), PolicyStatus::RefuseAfter(500));
        assert_eq!("-1".parse::<PolicyStatus>().unwrap(), PolicyStatus::Closed);
        assert_eq!(PolicyStatus::RefuseAfter(500).to_legacy(), -500);
    }

    #[test]
    fn test_status_delay() {
        assert_eq!(PolicyStatus::Open.delay(), None);
        assert_eq!(PolicyStatus::Closed.delay(), None);
        assert_eq!(
            PolicyStatus::Throttle(20).delay(),
            Some(Duration::from_millis(20))
        );
        assert!(PolicyStatus::RefuseAfter(0).is_refused());
        assert!(!PolicyStatus::Throttle(1).is_refused());
    }

    #[test]
    fn test_status_json() {
        let json = serde_json::to_string(&PolicyStatus::Throttle(10)).unwrap();
        assert_eq!(json, "\"THROTTLE(10)\"");
        let legacy: PolicyStatus = serde_json::from_str("-1").unwrap();
        assert_eq!(legacy, PolicyStatus::Closed);
    }

    #[test]
    fn test_socket_pattern() {
        let exact = SocketPattern::exact("db.internal", 5432);
        assert!(exact.matches("DB.INTERNAL", 5432));
        assert!(!exact.matches("db.internal", 5433));
        assert!(SocketPattern::new(None, Some(5432)).matches("anything", 5432));
        assert!(SocketPattern::new(None, None).matches("anything", 1));
        assert_eq!(SocketPattern::new(Some("db"), None).to_string(), "db:*");
        assert_eq!(exact, SocketPattern::exact("DB.Internal", 5432));
        assert_eq!(exact.host.as_deref(), Some("db.internal"));
        assert!(
            SocketPattern::new(Some("db"), None).specificity()
                > SocketPattern::new(None, Some(1)).specificity()
        );
    }

    #[test]
    fn test_refusal_through_io_error() {
        let refusal = PolicyRefusal::socket(&SocketAddress::new("db.internal", 5432));
        let err = refusal.clone().into_io();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(PolicyRefusal::from_io(&err), Some(&refusal));
        assert_eq!(
            err.to_string(),
            "connection to db.internal:5432 refused by policy"
        );

        let plain = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(PolicyRefusal::from_io(&plain).is_none());
    }
}
