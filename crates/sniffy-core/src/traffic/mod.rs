//! Reconstruction of logical packets from raw socket reads and writes.

mod packet;
mod reconstructor;

pub use packet::{Direction, NetworkPacket};
pub use reconstructor::{PacketReconstructor, TrafficPosition};

/// Default gap after which consecutive same-direction bytes start a new packet.
pub const DEFAULT_MERGE_THRESHOLD_MS: u64 = 500;
