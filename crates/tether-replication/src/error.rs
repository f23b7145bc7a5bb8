//! Error types for the replication subsystems.

use tether_net::PeerId;
use tether_wire::WireError;

/// Why an inbound state bag update was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    /// The payload could not be decoded or has an empty field.
    #[error("malformed state bag update: {0}")]
    Malformed(&'static str),

    /// No bag with this name is registered and none may be pre-created.
    #[error("unknown state bag '{0}'")]
    UnknownBag(String),

    /// The bag is owned by another peer.
    #[error("state bag '{bag}' is owned by {owner}, not {source_peer}")]
    NotOwner {
        /// Bag id.
        bag: String,
        /// Current owner.
        owner: PeerId,
        /// Peer that attempted the write.
        source_peer: PeerId,
    },
}

/// Why a reassembled event could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    /// The peer was never registered as a reassembly target.
    #[error("{0} is not a reassembly target")]
    UnknownTarget(PeerId),

    /// The payload does not fit in the maximum number of fragments.
    #[error("payload of {size} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Largest size the scheme can carry.
        max: usize,
    },

    /// The event name does not fit its `u16` length field.
    #[error("event name of {0} bytes is too long")]
    NameTooLong(usize),
}

/// Why an outbound event could not be transmitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The event does not fit the wire schema.
    #[error("failed to encode event: {0}")]
    Encode(#[from] WireError),

    /// The legacy name table has no index for this event kind.
    #[error("event {0:#010x} has no legacy type index")]
    NoLegacyIndex(u32),

    /// An oversized payload could not be handed to reassembly.
    #[error("failed to queue oversized event: {0}")]
    Reassembly(#[from] ReassemblyError),
}
