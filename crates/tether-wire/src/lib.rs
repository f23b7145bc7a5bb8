//! Schema-driven binary serialization for the Tether wire protocol.
//!
//! A packet body is described exactly once, as a [`Component`] whose
//! [`process`](Component::process) walks its fields against a [`Stream`].
//! The same walk computes size bounds ([`BoundsCounter`]), decodes
//! ([`Reader`]) and encodes ([`Writer`]), so the three can never disagree
//! about field order or layout.
//!
//! Packets prefix their body with a `u32` tag, the [`joaat`] hash of the
//! packet name; see [`Packet`] and the schemas in [`packets`].

mod bounds;
mod codec;
mod error;
mod hash;
mod packet;
pub mod packets;
mod reader;
mod size;
mod stream;
mod writer;

pub use bounds::{Bounds, BoundsCounter};
pub use codec::{bounds, decode, encode};
pub use error::WireError;
pub use hash::joaat;
pub use packet::{Packet, decode_body, encode_packet, peek_tag, split_packet};
pub use reader::Reader;
pub use size::{Prefix, SizeOption};
pub use stream::{Component, Mode, Stream, WireInt};
pub use writer::Writer;
