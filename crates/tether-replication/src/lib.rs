//! Replicated game state over Tether packets.
//!
//! - [`state_bag`]: named key/value bags with ownership, routing and queued
//!   updates, plus the inbound [`state_bag_handler`].
//! - [`net_event`]: game events with dedup, replies, expiry and relay.
//! - [`reassembly`] and [`reassembly_v1`]: events too large for one packet.
//! - [`array_diff`]: hash-diffed array slots in both directions.
//! - [`frame_sync`]: sync frame acknowledgement.
//! - [`connection`]: all of the above for one client connection.

pub mod array_diff;
pub mod connection;
mod error;
pub mod event_names;
pub mod frame_sync;
pub mod game_interface;
pub mod net_event;
pub mod reassembly;
pub mod reassembly_v1;
pub mod state_bag;
pub mod state_bag_handler;

pub use error::{EventError, InboundError, ReassemblyError};

pub use connection::{ConnectionConfig, ConnectionContext, install_handlers};
pub use event_names::EventNameTable;
pub use frame_sync::{FrameIndex, FrameReceiver, FrameReply, FrameSender, SendKind, SyncStyle};
pub use net_event::{Decision, EventConfig, EventDelivery, EventHost, NetEvent};
pub use reassembly::{Reassembly, ReassemblyConfig, ReassemblySink};
pub use state_bag::{StateBagHandle, StateBagRole, StateBagStore};
pub use state_bag_handler::{StateBagLimits, StateBagPacketHandler};
