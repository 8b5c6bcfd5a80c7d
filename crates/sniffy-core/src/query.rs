//! Filtering and grouping of aggregated counters and packets.
//!
//! Used by `Spy` (over the delta of its window) and by `TrafficAggregator`
//! (over everything recorded so far).

use crate::identity::{AddressMatcher, ConnectionIdentity, SocketAddress, StatementIdentity};
use crate::stats::StatsValues;
use crate::thread::{ThreadMeta, ThreadScope};
use crate::traffic::NetworkPacket;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Which parts of a connection identity keep traffic apart.
/// Dropped parts are erased and adjacent packets re-merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingOptions {
    pub group_by_connection: bool,
    pub group_by_thread: bool,
    pub group_by_stack_trace: bool,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            group_by_connection: true,
            group_by_thread: true,
            group_by_stack_trace: true,
        }
    }
}

impl GroupingOptions {
    /// Everything to the same address in one stream.
    pub fn by_address() -> Self {
        Self {
            group_by_connection: false,
            group_by_thread: false,
            group_by_stack_trace: false,
        }
    }
}

/// Key of a traffic group; fields not grouped by are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficKey {
    pub address: SocketAddress,
    pub ordinal: Option<u32>,
    pub thread: Option<ThreadMeta>,
    pub stack_trace: Option<Arc<str>>,
}

pub fn filter_statements(
    statements: HashMap<StatementIdentity, StatsValues>,
    scope: ThreadScope,
    creator: &ThreadMeta,
    remove_stack_traces: bool,
) -> HashMap<StatementIdentity, StatsValues> {
    regroup(
        statements
            .into_iter()
            .filter(|(id, _)| scope.matches(&id.owner_thread, creator)),
        |id| {
            if remove_stack_traces {
                id.without_stack_trace()
            } else {
                id
            }
        },
    )
}

pub fn filter_sockets(
    sockets: HashMap<ConnectionIdentity, StatsValues>,
    scope: ThreadScope,
    creator: &ThreadMeta,
    matcher: &AddressMatcher,
    remove_stack_traces: bool,
) -> HashMap<ConnectionIdentity, StatsValues> {
    regroup(
        sockets.into_iter().filter(|(id, _)| {
            scope.matches(&id.owner_thread, creator) && matcher.matches(&id.address)
        }),
        |id| {
            if remove_stack_traces {
                id.without_stack_trace()
            } else {
                id
            }
        },
    )
}

fn regroup<K, F>(
    entries: impl Iterator<Item = (K, StatsValues)>,
    rekey: F,
) -> HashMap<K, StatsValues>
where
    K: Eq + Hash,
    F: Fn(K) -> K,
{
    let mut out: HashMap<K, StatsValues> = HashMap::new();
    for (id, values) in entries {
        *out.entry(rekey(id)).or_default() += values;
    }
    out
}

/// Groups per-connection packet lists by `options`.
///
/// Packets are filtered by the thread that sent/received them. Groups come
/// out ordered by address, then by first packet timestamp; packets inside a
/// group are ordered by timestamp and adjacent ones are merged when they
/// continue each other.
pub fn group_traffic(
    traffic: HashMap<ConnectionIdentity, Vec<NetworkPacket>>,
    scope: ThreadScope,
    creator: &ThreadMeta,
    matcher: &AddressMatcher,
    options: GroupingOptions,
    merge_threshold_nanos: u64,
) -> Vec<(TrafficKey, Vec<NetworkPacket>)> {
    let mut groups: HashMap<TrafficKey, Vec<NetworkPacket>> = HashMap::new();

    for (connection, packets) in traffic {
        if !matcher.matches(&connection.address) {
            continue;
        }
        for mut packet in packets {
            if !scope.matches(&packet.thread, creator) {
                continue;
            }
            let key = TrafficKey {
                address: connection.address.clone(),
                ordinal: options.group_by_connection.then_some(connection.ordinal),
                thread: options.group_by_thread.then(|| packet.thread.clone()),
                stack_trace: if options.group_by_stack_trace {
                    packet.stack_trace.clone()
                } else {
                    None
                },
            };
            if !options.group_by_stack_trace {
                packet.stack_trace = None;
            }
            groups.entry(key).or_default().push(packet);
        }
    }

    let mut result: Vec<(TrafficKey, Vec<NetworkPacket>)> = groups
        .into_iter()
        .map(|(key, mut packets)| {
            packets.sort_by_key(|p| p.timestamp_nanos);
            let merged = if options.group_by_thread {
                merge_adjacent(packets, merge_threshold_nanos)
            } else {
                merge_adjacent_any_thread(packets, merge_threshold_nanos)
            };
            (key, merged)
        })
        .collect();

    result.sort_by(|(ka, pa), (kb, pb)| {
        ka.address
            .cmp(&kb.address)
            .then_with(|| ka.ordinal.cmp(&kb.ordinal))
            .then_with(|| first_ts(pa).cmp(&first_ts(pb)))
    });
    result
}

fn first_ts(packets: &[NetworkPacket]) -> u64 {
    packets.first().map_or(0, |p| p.timestamp_nanos)
}

fn merge_adjacent(packets: Vec<NetworkPacket>, merge_threshold_nanos: u64) -> Vec<NetworkPacket> {
    let mut merged: Vec<NetworkPacket> = Vec::with_capacity(packets.len());
    for packet in packets {
        match merged.last_mut() {
            Some(last) => {
                if let Err(packet) = last.combine(packet, merge_threshold_nanos) {
                    merged.push(packet);
                }
            }
            None => merged.push(packet),
        }
    }
    merged
}

/// Thread is not part of the key: packets from different threads merge as
/// long as direction and timing allow it. The surviving packet keeps the
/// thread of the first one.
fn merge_adjacent_any_thread(
    packets: Vec<NetworkPacket>,
    merge_threshold_nanos: u64,
) -> Vec<NetworkPacket> {
    let mut merged: Vec<NetworkPacket> = Vec::with_capacity(packets.len());
    for mut packet in packets {
        if let Some(last) = merged.last_mut() {
            let thread = std::mem::replace(&mut packet.thread, last.thread.clone());
            if let Err(mut packet) = last.combine(packet, merge_threshold_nanos) {
                packet.thread = thread;
                merged.push(packet);
            }
        } else {
            merged.push(packet);
        }
    }
    merged
}
