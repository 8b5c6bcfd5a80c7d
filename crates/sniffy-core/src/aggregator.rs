//! Concurrent accounting store shared by every interception wrapper.

use crate::config::SniffyConfig;
use crate::identity::{AddressMatcher, ConnectionIdentity, SocketAddress, StatementIdentity};
use crate::interner::TextInterner;
use crate::query::{self, GroupingOptions, TrafficKey};
use crate::stats::{StatsCounter, StatsValues};
use crate::thread::{ThreadMeta, ThreadScope};
use crate::traffic::{Direction, NetworkPacket, PacketReconstructor, TrafficPosition};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default number of distinct SQL texts tracked by the top-SQL table.
pub const DEFAULT_TOP_SQL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct SqlTimer {
    executions: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

/// Execution time summary of one normalized SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlTiming {
    pub sql: Arc<str>,
    pub executions: u64,
    pub total_nanos: u64,
    pub max_nanos: u64,
}

pub struct TrafficAggregator {
    sockets: DashMap<ConnectionIdentity, StatsCounter>,
    statements: DashMap<StatementIdentity, StatsCounter>,
    traffic: DashMap<ConnectionIdentity, Arc<Mutex<PacketReconstructor>>>,
    ordinals: DashMap<SocketAddress, u32>,
    top_sql: DashMap<Arc<str>, SqlTimer>,
    interner: TextInterner,
    merge_threshold: Duration,
    top_sql_capacity: usize,
}

impl TrafficAggregator {
    pub fn new(merge_threshold: Duration, top_sql_capacity: usize) -> Self {
        Self {
            sockets: DashMap::new(),
            statements: DashMap::new(),
            traffic: DashMap::new(),
            ordinals: DashMap::new(),
            top_sql: DashMap::new(),
            interner: TextInterner::new(),
            merge_threshold,
            top_sql_capacity,
        }
    }

    pub fn from_config(config: &SniffyConfig) -> Self {
        Self::new(config.packet_merge_threshold, config.top_sql_capacity)
    }

    pub fn merge_threshold(&self) -> Duration {
        self.merge_threshold
    }

    pub(crate) fn merge_threshold_nanos(&self) -> u64 {
        u64::try_from(self.merge_threshold.as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn interner(&self) -> &TextInterner {
        &self.interner
    }

    /// Ordinal for a new connection to `address`: 0 for the first, then 1, 2...
    pub fn next_ordinal(&self, address: &SocketAddress) -> u32 {
        let mut next = self.ordinals.entry(address.clone()).or_insert(0);
        let ordinal = *next;
        *next = next.saturating_add(1);
        ordinal
    }

    pub fn record_socket(&self, identity: &ConnectionIdentity, delta: &StatsValues) {
        record(&self.sockets, identity, delta);
    }

    pub fn record_statement(&self, identity: &StatementIdentity, delta: &StatsValues) {
        record(&self.statements, identity, delta);
        self.record_sql_time(&identity.sql, delta.elapsed_nanos);
    }

    fn record_sql_time(&self, sql: &Arc<str>, elapsed_nanos: u64) {
        if let Some(timer) = self.top_sql.get(sql) {
            update_timer(&timer, elapsed_nanos);
            return;
        }
        if self.top_sql.len() >= self.top_sql_capacity {
            return;
        }
        update_timer(&self.top_sql.entry(sql.clone()).or_default(), elapsed_nanos);
    }

    /// Feeds bytes of `connection` to its packet reconstructor.
    pub fn append_traffic(
        &self,
        connection: &ConnectionIdentity,
        direction: Direction,
        bytes: &[u8],
        timestamp_nanos: u64,
        thread: &ThreadMeta,
        stack_trace: Option<&Arc<str>>,
    ) {
        if bytes.is_empty() {
            return;
        }
        let reconstructor = self.reconstructor(connection);
        reconstructor
            .lock()
            .append(direction, bytes, timestamp_nanos, thread, stack_trace);
    }

    /// Closes the open packet of `connection`.
    pub fn flush_traffic(&self, connection: &ConnectionIdentity) {
        let reconstructor = self.traffic.get(connection).map(|r| Arc::clone(&r));
        if let Some(reconstructor) = reconstructor {
            reconstructor.lock().flush();
        }
    }

    fn reconstructor(&self, connection: &ConnectionIdentity) -> Arc<Mutex<PacketReconstructor>> {
        if let Some(existing) = self.traffic.get(connection) {
            return Arc::clone(&existing);
        }
        let merge_threshold = self.merge_threshold;
        Arc::clone(&self.traffic.entry(connection.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(PacketReconstructor::new(
                connection.clone(),
                merge_threshold,
            )))
        }))
    }

    pub fn sockets<P>(&self, predicate: P) -> HashMap<ConnectionIdentity, StatsValues>
    where
        P: Fn(&ConnectionIdentity) -> bool,
    {
        read_all(&self.sockets, predicate)
    }

    pub fn statements<P>(&self, predicate: P) -> HashMap<StatementIdentity, StatsValues>
    where
        P: Fn(&StatementIdentity) -> bool,
    {
        read_all(&self.statements, predicate)
    }

    /// Closed packets plus a copy of the open one, per connection.
    pub fn traffic<P>(&self, predicate: P) -> HashMap<ConnectionIdentity, Vec<NetworkPacket>>
    where
        P: Fn(&ConnectionIdentity) -> bool,
    {
        self.reconstructors(predicate)
            .into_iter()
            .map(|(id, r)| {
                let packets = r.lock().packets();
                (id, packets)
            })
            .collect()
    }

    pub fn traffic_positions(&self) -> HashMap<ConnectionIdentity, TrafficPosition> {
        self.reconstructors(|_| true)
            .into_iter()
            .map(|(id, r)| {
                let position = r.lock().position();
                (id, position)
            })
            .collect()
    }

    /// Packets appended after `positions`; connections without a recorded
    /// position are returned whole.
    pub fn traffic_since(
        &self,
        positions: &HashMap<ConnectionIdentity, TrafficPosition>,
    ) -> HashMap<ConnectionIdentity, Vec<NetworkPacket>> {
        self.reconstructors(|_| true)
            .into_iter()
            .filter_map(|(id, r)| {
                let position = positions.get(&id).copied().unwrap_or_default();
                let packets = r.lock().packets_since(position);
                (!packets.is_empty()).then_some((id, packets))
            })
            .collect()
    }

    // Arcs are cloned out so no shard lock is held while a connection lock is taken.
    fn reconstructors<P>(&self, predicate: P) -> Vec<(ConnectionIdentity, Arc<Mutex<PacketReconstructor>>)>
    where
        P: Fn(&ConnectionIdentity) -> bool,
    {
        self.traffic
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// The most expensive statements by total execution time.
    pub fn top_sql(&self, limit: usize) -> Vec<SqlTiming> {
        let mut timings: Vec<SqlTiming> = self
            .top_sql
            .iter()
            .map(|e| SqlTiming {
                sql: e.key().clone(),
                executions: e.executions.load(Ordering::Acquire),
                total_nanos: e.total_nanos.load(Ordering::Acquire),
                max_nanos: e.max_nanos.load(Ordering::Acquire),
            })
            .collect();
        timings.sort_by(|a, b| {
            b.total_nanos
                .cmp(&a.total_nanos)
                .then_with(|| a.sql.cmp(&b.sql))
        });
        timings.truncate(limit);
        timings
    }

    /// Statements executed so far, filtered relative to the calling thread.
    pub fn executed_statements(
        &self,
        scope: ThreadScope,
        remove_stack_traces: bool,
    ) -> HashMap<StatementIdentity, StatsValues> {
        query::filter_statements(
            self.statements(|_| true),
            scope,
            &ThreadMeta::current(),
            remove_stack_traces,
        )
    }

    pub fn socket_operations(
        &self,
        scope: ThreadScope,
        matcher: &AddressMatcher,
        remove_stack_traces: bool,
    ) -> HashMap<ConnectionIdentity, StatsValues> {
        query::filter_sockets(
            self.sockets(|_| true),
            scope,
            &ThreadMeta::current(),
            matcher,
            remove_stack_traces,
        )
    }

    pub fn network_traffic(
        &self,
        scope: ThreadScope,
        matcher: &AddressMatcher,
        options: GroupingOptions,
    ) -> Vec<(TrafficKey, Vec<NetworkPacket>)> {
        query::group_traffic(
            self.traffic(|id| matcher.matches(&id.address)),
            scope,
            &ThreadMeta::current(),
            matcher,
            options,
            self.merge_threshold_nanos(),
        )
    }

    /// Drops every counter, packet and ordinal. Meant for test harnesses:
    /// open spies see counters restart from zero.
    pub fn clear(&self) {
        self.sockets.clear();
        self.statements.clear();
        self.traffic.clear();
        self.ordinals.clear();
        self.top_sql.clear();
        self.interner.clear();
        debug!("aggregator cleared");
    }
}

impl Default for TrafficAggregator {
    fn default() -> Self {
        Self::from_config(&SniffyConfig::default())
    }
}

fn record<K>(map: &DashMap<K, StatsCounter>, key: &K, delta: &StatsValues)
where
    K: Eq + Hash + Clone,
{
    if let Some(counter) = map.get(key) {
        counter.accumulate(delta);
        return;
    }
    map.entry(key.clone()).or_default().accumulate(delta);
}

fn read_all<K, P>(map: &DashMap<K, StatsCounter>, predicate: P) -> HashMap<K, StatsValues>
where
    K: Eq + Hash + Clone,
    P: Fn(&K) -> bool,
{
    map.iter()
        .filter(|e| predicate(e.key()))
        .map(|e| (e.key().clone(), e.value().values()))
        .collect()
}

fn update_timer(timer: &SqlTimer, elapsed_nanos: u64) {
    timer.executions.fetch_add(1, Ordering::AcqRel);
    timer.total_nanos.fetch_add(elapsed_nanos, Ordering::AcqRel);
    timer.max_nanos.fetch_max(elapsed_nanos, Ordering::AcqRel);
}
