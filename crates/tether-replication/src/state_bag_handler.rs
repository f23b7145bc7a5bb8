//! Server-side admission of client state bag updates.
//!
//! Every update passes three per-peer token buckets before it is decoded:
//! an update-rate bucket whose overflow drops the update, a flood bucket
//! whose overflow drops the client, and a byte-rate bucket that also drops
//! the client. Updates for unknown `entity:<n>` bags may create the bag when
//! the entity exists.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use rustc_hash::FxHashMap;
use tether_net::{KeyedRateLimiter, PeerId, RateLimit, dispatch_as};
use tether_wire::packets::{StateBag as StateBagPacket, StateBagPayload, StateBagV2};
use tether_wire::{Packet, decode, split_packet};

use crate::InboundError;
use crate::state_bag::StateBagStore;

/// Prefix of bags a client may cause to be created.
const ENTITY_BAG_PREFIX: &str = "entity:";

/// Bucket settings for [`StateBagPacketHandler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateBagLimits {
    /// Updates per second before updates are dropped.
    pub update: RateLimit,
    /// Updates per second before the client is dropped.
    pub flood: RateLimit,
    /// Body bytes per second before the client is dropped.
    pub size: RateLimit,
}

impl Default for StateBagLimits {
    fn default() -> Self {
        Self {
            update: RateLimit::new(75.0, 125.0),
            flood: RateLimit::new(150.0, 175.0),
            size: RateLimit::new(128.0 * 1024.0, 256.0 * 1024.0),
        }
    }
}

/// Outcome of offering one packet to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBagVerdict {
    /// The update was applied.
    Applied,
    /// Not a state bag packet.
    NotStateBag,
    /// The packet failed to decode.
    Malformed,
    /// The store refused the update.
    Rejected(InboundError),
    /// The update was dropped by the update-rate bucket.
    RateLimited,
    /// The client exceeded the flood or size limit and must be dropped.
    DropClient(&'static str),
}

type EntityExists = dyn Fn(u32) -> bool + Send + Sync;

/// Rate-limited entry point for client state bag packets.
pub struct StateBagPacketHandler {
    store: StateBagStore,
    update: KeyedRateLimiter<PeerId>,
    flood: KeyedRateLimiter<PeerId>,
    size: KeyedRateLimiter<PeerId>,
    log: KeyedRateLimiter<PeerId>,
    entity_exists: Box<EntityExists>,
    dropped_bags: Mutex<FxHashMap<String, u64>>,
}

impl StateBagPacketHandler {
    /// Handler applying updates to `store`. No entity bags are created on
    /// demand until [`with_entity_check`](Self::with_entity_check) is used.
    pub fn new(store: StateBagStore, limits: StateBagLimits) -> Self {
        Self {
            store,
            update: KeyedRateLimiter::new(limits.update),
            flood: KeyedRateLimiter::new(limits.flood),
            size: KeyedRateLimiter::new(limits.size),
            log: KeyedRateLimiter::new(RateLimit::new(1.0, 1.0)),
            entity_exists: Box::new(|_| false),
            dropped_bags: Mutex::new(FxHashMap::default()),
        }
    }

    /// Allow `entity:<n>` bags to be created when `exists(n)` holds.
    pub fn with_entity_check(mut self, exists: impl Fn(u32) -> bool + Send + Sync + 'static) -> Self {
        self.entity_exists = Box::new(exists);
        self
    }

    /// Admit, decode and apply one tagged packet from `peer`.
    pub fn handle_packet(&self, peer: PeerId, buf: &[u8], now: Instant) -> StateBagVerdict {
        let Some((tag, body)) = split_packet(buf) else {
            return StateBagVerdict::NotStateBag;
        };
        if tag != StateBagPacket::TAG && tag != StateBagV2::TAG {
            return StateBagVerdict::NotStateBag;
        }
        if let Some(verdict) = self.admit(peer, body.len(), now) {
            if verdict == StateBagVerdict::RateLimited {
                self.note_dropped_bag(tag, buf);
            }
            return verdict;
        }

        let mut verdict = StateBagVerdict::Malformed;
        if tag == StateBagV2::TAG {
            dispatch_as::<StateBagV2>(buf, |packet| {
                verdict = self.apply(|| self.store.handle_packet_v2(peer, &packet));
            });
        } else {
            dispatch_as::<StateBagPacket>(buf, |packet| {
                verdict = self.apply(|| self.store.handle_packet(peer, &packet.data));
            });
        }
        if verdict == StateBagVerdict::Malformed {
            tracing::debug!("Malformed state bag packet from {}", peer);
        }
        verdict
    }

    fn admit(&self, peer: PeerId, body_len: usize, now: Instant) -> Option<StateBagVerdict> {
        let hit_rate = !self.update.consume(&peer, now);
        let hit_flood = !self.flood.consume(&peer, now);

        if hit_rate {
            if hit_flood {
                tracing::warn!(
                    "Client {} dropped for sending too many state bag updates (flood limit {}/s, burst {})",
                    peer,
                    self.flood.limit().rate,
                    self.flood.limit().burst
                );
                return Some(StateBagVerdict::DropClient(
                    "Reliable state bag packet overflow.",
                ));
            }
            if self.log.consume(&peer, now) {
                tracing::warn!(
                    "Client {} sent too many state bag updates and had them dropped (limit {}/s, burst {})",
                    peer,
                    self.update.limit().rate,
                    self.update.limit().burst
                );
            }
            return Some(StateBagVerdict::RateLimited);
        }

        if !self.size.consume_n(&peer, body_len as f64, now) {
            tracing::warn!(
                "Client {} dropped for sending too large state bag updates (limit {} bytes/s)",
                peer,
                self.size.limit().rate
            );
            return Some(StateBagVerdict::DropClient(
                "Reliable state bag packet overflow.",
            ));
        }
        None
    }

    fn apply(&self, attempt: impl Fn() -> Result<(), InboundError>) -> StateBagVerdict {
        match attempt() {
            Ok(()) => StateBagVerdict::Applied,
            Err(InboundError::UnknownBag(name)) => self.retry_for_entity(&name, attempt),
            Err(e) => {
                tracing::debug!("State bag update rejected: {}", e);
                StateBagVerdict::Rejected(e)
            }
        }
    }

    /// Create `entity:<n>` when the entity exists and try once more.
    fn retry_for_entity(
        &self,
        name: &str,
        attempt: impl Fn() -> Result<(), InboundError>,
    ) -> StateBagVerdict {
        let entity = name
            .strip_prefix(ENTITY_BAG_PREFIX)
            .and_then(|id| id.parse::<u32>().ok());
        match entity {
            Some(entity) if (self.entity_exists)(entity) => {
                self.store.register_state_bag(name, false);
                match attempt() {
                    Ok(()) => StateBagVerdict::Applied,
                    Err(e) => StateBagVerdict::Rejected(e),
                }
            }
            _ => {
                tracing::debug!("Update for unknown state bag {}", name);
                StateBagVerdict::Rejected(InboundError::UnknownBag(name.to_owned()))
            }
        }
    }

    /// Forget a departed peer's buckets.
    pub fn peer_left(&self, peer: PeerId) {
        self.update.remove(&peer);
        self.flood.remove(&peer);
        self.size.remove(&peer);
        self.log.remove(&peer);
    }

    /// Total updates dropped by the update-rate bucket.
    pub fn dropped_updates(&self) -> u64 {
        self.update.dropped()
    }

    /// Record the bag a dropped update targeted, for diagnostics.
    fn note_dropped_bag(&self, tag: u32, buf: &[u8]) {
        let mut name = None;
        if tag == StateBagV2::TAG {
            dispatch_as::<StateBagV2>(buf, |p| name = Some(p.state_bag_name));
        } else {
            dispatch_as::<StateBagPacket>(buf, |p| {
                name = decode::<StateBagPayload>(&p.data).ok().map(|payload| payload.id);
            });
        }
        if let Some(name) = name {
            *self
                .dropped_bags
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name)
                .or_default() += 1;
        }
    }

    /// Bags that had updates dropped, with drop counts, most dropped first.
    pub fn dropped_bags(&self) -> Vec<(String, u64)> {
        let mut bags: Vec<(String, u64)> = self
            .dropped_bags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        bags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        bags
    }
}
