//! Outbound packet sink: the "send packet to peer" collaborator.

use std::sync::{Mutex, PoisonError};

use tether_wire::{Packet, encode_packet};

use crate::PeerId;

/// Hands an encoded packet to the transport.
///
/// Implementations must not block; the transport is unreliable and may
/// drop or reorder what it is given.
pub trait PacketSink: Send + Sync {
    /// Queue `packet` (tag included) for delivery to `peer`.
    fn send_packet(&self, peer: PeerId, packet: Vec<u8>);
}

/// Blanket implementation for closures.
impl<F> PacketSink for F
where
    F: Fn(PeerId, Vec<u8>) + Send + Sync,
{
    fn send_packet(&self, peer: PeerId, packet: Vec<u8>) {
        self(peer, packet);
    }
}

/// Encode `packet` and hand it to `sink`.
///
/// Returns `false` (and logs) when the packet does not fit its schema.
pub fn send_packet<P: Packet>(sink: &dyn PacketSink, peer: PeerId, packet: &mut P) -> bool {
    match encode_packet(packet) {
        Ok(bytes) => {
            sink.send_packet(peer, bytes);
            true
        }
        Err(e) => {
            tracing::warn!("Failed to encode {} for {}: {}", P::NAME, peer, e);
            false
        }
    }
}

/// Sink that keeps every packet in memory, for loopback wiring and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of packets currently held.
    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketSink for RecordingSink {
    fn send_packet(&self, peer: PeerId, packet: Vec<u8>) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((peer, packet));
    }
}
