//! Packet plumbing shared by every Tether subsystem.
//!
//! Peer addressing, the outbound [`PacketSink`] collaborator, the tag-based
//! [`Dispatcher`], per-peer token-bucket limiting and traffic counters. The
//! transport itself is out of scope: packets arrive whole through
//! [`inbound_channel`] and leave whole through a [`PacketSink`].

pub mod counters;
pub mod dispatch;
pub mod inbound;
pub mod limiter;
pub mod peer;
pub mod sink;

pub use counters::{CountersSnapshot, DispatchCounters, TagStats};
pub use dispatch::{Dispatch, Dispatcher, PacketHandler, dispatch_as};
pub use inbound::{InboundPacket, drain_inbound, inbound_channel};
pub use limiter::{KeyedRateLimiter, RateLimit};
pub use peer::{PeerId, Target};
pub use sink::{PacketSink, RecordingSink, send_packet};
