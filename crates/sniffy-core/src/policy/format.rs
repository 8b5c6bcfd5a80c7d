//! On-disk layout of the policy table.
//!
//! ```json
//! {"persistent":true,
//!  "sockets":[{"host":"db.internal","port":"5432","status":"CLOSED"}],
//!  "dataSources":[{"url":"postgresql://db/app","userName":"app","status":"THROTTLE(100)"}]}
//! ```
//!
//! Wildcard fields are omitted. `port` is written as a string and read as
//! either a string or a number. `status` also accepts legacy integer codes.

use super::PolicyStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub sockets: Vec<SocketRecord>,
    #[serde(default, rename = "dataSources")]
    pub data_sources: Vec<DataSourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "port_text")]
    pub port: Option<u16>,
    pub status: PolicyStatus,
    /// Entry was added by auto-discovery rather than set explicitly.
    #[serde(default, skip_serializing_if = "is_false")]
    pub discovered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, rename = "userName", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub status: PolicyStatus,
    #[serde(default, skip_serializing_if = "is_false")]
    pub discovered: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

mod port_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(port: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error> {
        match port {
            Some(port) => serializer.collect_str(port),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(port)) => Ok(Some(port)),
            Some(Raw::Text(s)) if s.trim().is_empty() || s.trim() == "*" => Ok(None),
            Some(Raw::Text(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", s))),
        }
    }
}
