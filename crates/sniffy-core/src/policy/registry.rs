use super::format::{DataSourceRecord, PolicyDocument, SocketRecord};
use super::storage::{self, RegistryError};
use super::{DataSourcePattern, PolicyStatus, SocketPattern};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::Hash;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    status: PolicyStatus,
    /// Added by auto-discovery; never takes part in resolution.
    discovered: bool,
}

impl Slot {
    fn set(status: PolicyStatus) -> Self {
        Self {
            status,
            discovered: false,
        }
    }

    fn discovered() -> Self {
        Self {
            status: PolicyStatus::Open,
            discovered: true,
        }
    }
}

/// One row of the policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEntry {
    Socket {
        pattern: SocketPattern,
        status: PolicyStatus,
        discovered: bool,
    },
    DataSource {
        pattern: DataSourcePattern,
        status: PolicyStatus,
        discovered: bool,
    },
}

impl PolicyEntry {
    pub fn status(&self) -> PolicyStatus {
        match self {
            PolicyEntry::Socket { status, .. } | PolicyEntry::DataSource { status, .. } => *status,
        }
    }
}

impl fmt::Display for PolicyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, key, status, discovered) = match self {
            PolicyEntry::Socket {
                pattern,
                status,
                discovered,
            } => ("socket", pattern.to_string(), status, discovered),
            PolicyEntry::DataSource {
                pattern,
                status,
                discovered,
            } => ("datasource", pattern.to_string(), status, discovered),
        };
        write!(f, "{:<10} {:<40} {}", kind, key, status)?;
        if *discovered {
            f.write_str(" (discovered)")?;
        }
        Ok(())
    }
}

/// Table of connectivity rules for sockets and data sources.
///
/// Resolution picks the most specific explicitly set entry that matches.
/// Keys that were never seen before are recorded as discovered `Open`
/// entries so they show up in listings.
#[derive(Default)]
pub struct PolicyRegistry {
    sockets: DashMap<SocketPattern, Slot>,
    data_sources: DashMap<DataSourcePattern, Slot>,
    persistent: AtomicBool,
    storage_path: RwLock<Option<PathBuf>>,
    store_lock: Mutex<()>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the policy file at `path` (missing file = empty table) and keeps
    /// it as the storage location. Persistence follows the file's flag.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let document = storage::read_document(&path)?;
        let registry = Self::from_document(document);
        *registry.storage_path.write() = Some(path);
        Ok(registry)
    }

    pub fn from_document(document: PolicyDocument) -> Self {
        let registry = Self::new();
        registry.apply(document);
        registry
    }

    fn apply(&self, document: PolicyDocument) {
        for record in document.sockets {
            let slot = Slot {
                status: record.status,
                discovered: record.discovered,
            };
            self.sockets
                .insert(SocketPattern::new(record.host.as_deref(), record.port), slot);
        }
        for record in document.data_sources {
            let slot = Slot {
                status: record.status,
                discovered: record.discovered,
            };
            self.data_sources.insert(
                DataSourcePattern::new(record.url.as_deref(), record.user_name.as_deref()),
                slot,
            );
        }
        if document.persistent {
            self.persistent.store(true, Ordering::Release);
        }
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage_path.read().clone()
    }

    pub fn set_storage_path(&self, path: Option<PathBuf>) {
        *self.storage_path.write() = path;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    /// When enabled, every change rewrites the storage file.
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
        if persistent {
            self.store_if_persistent();
        }
    }

    pub fn resolve_socket(&self, host: &str, port: u16) -> PolicyStatus {
        let status = best_match(&self.sockets, |p| p.matches(host, port), SocketPattern::specificity);
        self.discover(&self.sockets, SocketPattern::exact(host, port));
        status
    }

    pub fn resolve_data_source(&self, url: &str, user: Option<&str>) -> PolicyStatus {
        let status = best_match(
            &self.data_sources,
            |p| p.matches(url, user),
            DataSourcePattern::specificity,
        );
        self.discover(&self.data_sources, DataSourcePattern::new(Some(url), user));
        status
    }

    fn discover<K>(&self, map: &DashMap<K, Slot>, key: K)
    where
        K: Eq + Hash + fmt::Display,
    {
        if map.contains_key(&key) {
            return;
        }
        let inserted = match map.entry(key) {
            Entry::Vacant(vacant) => {
                debug!(key = %vacant.key(), "discovered new policy key");
                vacant.insert(Slot::discovered());
                true
            }
            Entry::Occupied(_) => false,
        };
        if inserted {
            self.store_if_persistent();
        }
    }

    /// Sets the status for a host/port pattern; `None` is a wildcard.
    pub fn set_socket_status(&self, host: Option<&str>, port: Option<u16>, status: PolicyStatus) {
        let pattern = SocketPattern::new(host, port);
        debug!(pattern = %pattern, status = %status, "socket policy updated");
        self.sockets.insert(pattern, Slot::set(status));
        self.store_if_persistent();
    }

    /// Sets the status for a url/user pattern; `None` is a wildcard.
    pub fn set_data_source_status(
        &self,
        url: Option<&str>,
        user: Option<&str>,
        status: PolicyStatus,
    ) {
        let pattern = DataSourcePattern::new(url, user);
        debug!(pattern = %pattern, status = %status, "data source policy updated");
        self.data_sources.insert(pattern, Slot::set(status));
        self.store_if_persistent();
    }

    /// All entries, sockets first, each group sorted by key.
    pub fn entries(&self) -> Vec<PolicyEntry> {
        let mut sockets: Vec<(SocketPattern, Slot)> = self
            .sockets
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        sockets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut data_sources: Vec<(DataSourcePattern, Slot)> = self
            .data_sources
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        data_sources.sort_by(|a, b| a.0.cmp(&b.0));

        sockets
            .into_iter()
            .map(|(pattern, slot)| PolicyEntry::Socket {
                pattern,
                status: slot.status,
                discovered: slot.discovered,
            })
            .chain(
                data_sources
                    .into_iter()
                    .map(|(pattern, slot)| PolicyEntry::DataSource {
                        pattern,
                        status: slot.status,
                        discovered: slot.discovered,
                    }),
            )
            .collect()
    }

    /// Empties the table and switches persistence off.
    pub fn clear(&self) {
        self.sockets.clear();
        self.data_sources.clear();
        self.persistent.store(false, Ordering::Release);
        debug!("policy registry cleared");
    }

    pub fn to_document(&self) -> PolicyDocument {
        let mut document = PolicyDocument {
            persistent: self.is_persistent(),
            ..Default::default()
        };
        for entry in self.entries() {
            match entry {
                PolicyEntry::Socket {
                    pattern,
                    status,
                    discovered,
                } => document.sockets.push(SocketRecord {
                    host: pattern.host,
                    port: pattern.port,
                    status,
                    discovered,
                }),
                PolicyEntry::DataSource {
                    pattern,
                    status,
                    discovered,
                } => document.data_sources.push(DataSourceRecord {
                    url: pattern.url,
                    user_name: pattern.user,
                    status,
                    discovered,
                }),
            }
        }
        document
    }

    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string(&self.to_document())?)
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        Ok(Self::from_document(serde_json::from_str(json)?))
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), RegistryError> {
        serde_json::to_writer(writer, &self.to_document())?;
        Ok(())
    }

    /// Merges entries read from `reader` into this table.
    pub fn read_from<R: Read>(&self, reader: R) -> Result<(), RegistryError> {
        let document: PolicyDocument = serde_json::from_reader(reader)?;
        self.apply(document);
        Ok(())
    }

    /// Writes the table to the storage file.
    pub fn save(&self) -> Result<(), RegistryError> {
        let path = self.storage_path().ok_or(RegistryError::NoStoragePath)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), RegistryError> {
        let _guard = self.store_lock.lock();
        storage::write_document(path, &self.to_document())
    }

    fn store_if_persistent(&self) {
        if !self.is_persistent() {
            return;
        }
        let Some(path) = self.storage_path() else {
            return;
        };
        if let Err(e) = self.save_to(&path) {
            warn!(error = %e, path = %path.display(), "failed to store policy file");
        }
    }
}

/// Status of the most specific explicitly set entry matching the key.
fn best_match<K, M, S>(map: &DashMap<K, Slot>, matches: M, specificity: S) -> PolicyStatus
where
    K: Eq + Hash,
    M: Fn(&K) -> bool,
    S: Fn(&K) -> u8,
{
    let mut best: Option<(u8, PolicyStatus)> = None;
    for entry in map.iter() {
        if entry.value().discovered || !matches(entry.key()) {
            continue;
        }
        let rank = specificity(entry.key());
        if best.is_none_or(|(r, _)| rank > r) {
            best = Some((rank, entry.value().status));
        }
    }
    best.map_or(PolicyStatus::Open, |(_, status)| status)
}
