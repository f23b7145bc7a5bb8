//! Reliable one-shot game events.
//!
//! Outbound events are queued by [`EventDelivery::send`], transmitted on the
//! next [`tick`](EventDelivery::tick) and kept until the receiver replies or
//! the TTL runs out. While an event is held it absorbs equal events, so a
//! game that re-sends the same event every frame produces one wire send.
//!
//! Inbound events pass the denylist and the name table before the host
//! decides what to do with them. A rejection that must persist puts the
//! event back in a queue that is offered to the host again on every tick
//! until the TTL elapses.
//!
//! Every event travels through the server. Packets relayed by the server
//! carry the originating player as their only target.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_net::{PacketSink, PeerId, Target};
use tether_wire::packets::{ClientNetGameEvent, ClientNetGameEventV2, MAX_EVENT_DATA, MAX_EVENT_TARGETS};
use tether_wire::{Component, SizeOption, Stream, WireError, decode, encode, encode_packet, joaat};

use crate::EventError;
use crate::event_names::{EventNameTable, is_denylisted, is_sent_modifying};
use crate::reassembly::{DEFAULT_BYTES_PER_SECOND, Reassembly};

/// Reassembly event name carrying a [`LargeGameEvent`].
pub const LARGE_EVENT_NAME: &str = "__netGameEventV2";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An outbound game event.
#[derive(Debug, Clone, Eq)]
pub struct NetEvent {
    /// Hash of the event kind name.
    pub name_hash: u32,
    /// Id to send under instead of allocating one.
    pub event_id: Option<u16>,
    /// Players the event is meant for.
    pub targets: Vec<PeerId>,
    /// Serialized event body.
    pub payload: Vec<u8>,
    /// Whether the receivers are expected to answer.
    pub requires_reply: bool,
}

impl NetEvent {
    pub fn new(name: &str, targets: Vec<PeerId>, payload: Vec<u8>) -> Self {
        Self {
            name_hash: joaat(name),
            event_id: None,
            targets,
            payload,
            requires_reply: false,
        }
    }

    pub fn with_event_id(mut self, event_id: u16) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_reply(mut self) -> Self {
        self.requires_reply = true;
        self
    }
}

/// Equal when kind, targets and payload match; ids and flags are ignored.
impl PartialEq for NetEvent {
    fn eq(&self, other: &Self) -> bool {
        self.name_hash == other.name_hash
            && self.targets == other.targets
            && self.payload == other.payload
    }
}

/// An event received from the network, after name translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingEvent {
    /// Player that originated the event.
    pub source: PeerId,
    pub name_hash: u32,
    pub event_id: u16,
    pub is_reply: bool,
    pub payload: Vec<u8>,
}

/// Body of an event too large for a single packet, sent through
/// [`Reassembly`] under [`LARGE_EVENT_NAME`].
///
/// `peers` holds the targets on the way to the server and the originating
/// player on the way back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LargeGameEvent {
    pub peers: Vec<u16>,
    pub event_name_hash: u32,
    pub event_id: u16,
    pub is_reply: bool,
    pub data: Vec<u8>,
}

impl Component for LargeGameEvent {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.array(&mut self.peers, SizeOption::area(0, MAX_EVENT_TARGETS))?;
        s.int(&mut self.event_name_hash)?;
        s.int(&mut self.event_id)?;
        s.boolean(&mut self.is_reply)?;
        s.bytes(&mut self.data, SizeOption::rest())
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// What the host wants done with an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Applied; nothing to send back.
    Accept,
    /// Applied; answer the sender with these bytes.
    Reply(Vec<u8>),
    /// Not applied. With `must_persist` the event is offered again on later
    /// ticks until it expires.
    Reject { must_persist: bool },
}

/// Game-side handling of events.
pub trait EventHost {
    /// Decide on an inbound event.
    fn decide(&mut self, source: PeerId, name_hash: u32, payload: &[u8]) -> Decision;

    /// A reply to `event` arrived from `source`.
    fn handle_reply(&mut self, source: PeerId, event: &NetEvent, reply: &[u8]);

    /// Whether the game gave up on a held event before the TTL.
    fn has_timed_out(&self, _event: &NetEvent) -> bool {
        false
    }

    /// Whether `candidate` duplicates the held `pending` event.
    ///
    /// May update the host's own bookkeeping; must not change either event.
    fn equals(&mut self, pending: &NetEvent, candidate: &NetEvent) -> bool {
        pending == candidate
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Settings for [`EventDelivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    /// How long an event is held for a reply, and how long a rejected event
    /// is retried. Default: 5 s.
    pub ttl: Duration,
    /// Address events by name hash; `false` uses legacy type indices.
    pub use_v2: bool,
    /// Largest payload sent as a plain packet; anything bigger goes through
    /// reassembly. Default: [`MAX_EVENT_DATA`].
    pub max_payload: usize,
    /// Most events of one kind held at once.
    pub pending_caps: Vec<(u32, usize)>,
    /// Pacing for reassembled events; non-positive uses the default.
    pub reassembly_bytes_per_second: i32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            use_v2: true,
            max_payload: MAX_EVENT_DATA,
            pending_caps: vec![(joaat("ALTER_WANTED_LEVEL_EVENT"), 5)],
            reassembly_bytes_per_second: DEFAULT_BYTES_PER_SECOND,
        }
    }
}

/// Running totals, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub queued: u64,
    pub sent: u64,
    pub deduplicated: u64,
    /// Dropped because the id was still held by an earlier event.
    pub id_collisions: u64,
    pub capped: u64,
    pub expired: u64,
    pub replies: u64,
    pub denylisted: u64,
    pub unknown: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct PendingEvent {
    event: NetEvent,
    sent: bool,
    queued_at: Instant,
}

#[derive(Debug)]
struct Outgoing {
    targets: Vec<PeerId>,
    name_hash: u32,
    event_id: u16,
    is_reply: bool,
    payload: Vec<u8>,
}

/// Event state for one connection.
pub struct EventDelivery {
    sink: Arc<dyn PacketSink>,
    config: EventConfig,
    names: EventNameTable,
    pending: BTreeMap<(u32, u16), PendingEvent>,
    replies: Vec<Outgoing>,
    re_events: VecDeque<(Instant, IncomingEvent)>,
    next_id: u16,
    stats: EventStats,
}

impl EventDelivery {
    pub fn new(sink: Arc<dyn PacketSink>, config: EventConfig, names: EventNameTable) -> Self {
        Self {
            sink,
            config,
            names,
            pending: BTreeMap::new(),
            replies: Vec::new(),
            re_events: VecDeque::new(),
            next_id: 0,
            stats: EventStats::default(),
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn names(&self) -> &EventNameTable {
        &self.names
    }

    pub fn stats(&self) -> EventStats {
        self.stats
    }

    /// Events held for transmission or a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Rejected events waiting to be offered again.
    pub fn re_events(&self) -> usize {
        self.re_events.len()
    }

    /// Queue `event`; returns its id, or `None` when it was absorbed by a
    /// held duplicate or refused.
    pub fn send(&mut self, host: &mut dyn EventHost, event: NetEvent, now: Instant) -> Option<u16> {
        let hash = event.name_hash;

        if let Some(&(_, cap)) = self.config.pending_caps.iter().find(|(h, _)| *h == hash) {
            let held = self.pending.keys().filter(|(h, _)| *h == hash).count();
            if held >= cap {
                self.stats.capped += 1;
                tracing::debug!("Dropping event {:#010x}: {} already pending", hash, held);
                return None;
            }
        }

        let skip_sent = is_sent_modifying(hash);
        for held in self.pending.values() {
            if held.event.name_hash != hash || (held.sent && skip_sent) {
                continue;
            }
            if host.equals(&held.event, &event) {
                self.stats.deduplicated += 1;
                return None;
            }
        }

        let event_id = event.event_id.unwrap_or_else(|| {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            id
        });
        let key = (hash, event_id);
        if self.pending.contains_key(&key) {
            self.stats.id_collisions += 1;
            tracing::debug!(
                "Dropping event {:#010x}: id {} is still held by an earlier event",
                hash,
                event_id
            );
            return None;
        }
        self.pending.insert(
            key,
            PendingEvent {
                event,
                sent: false,
                queued_at: now,
            },
        );
        self.stats.queued += 1;
        Some(event_id)
    }

    /// Transmit queued events and replies, expire held events and retry
    /// rejected ones.
    pub fn tick(&mut self, host: &mut dyn EventHost, reassembly: &mut Reassembly, now: Instant) {
        for outgoing in std::mem::take(&mut self.replies) {
            self.transmit(reassembly, &outgoing);
        }

        let mut unsent = Vec::new();
        for (&(name_hash, event_id), held) in self.pending.iter_mut().filter(|(_, p)| !p.sent) {
            held.sent = true;
            unsent.push(Outgoing {
                targets: held.event.targets.clone(),
                name_hash,
                event_id,
                is_reply: false,
                payload: held.event.payload.clone(),
            });
        }
        for outgoing in unsent {
            if !self.transmit(reassembly, &outgoing) {
                self.pending.remove(&(outgoing.name_hash, outgoing.event_id));
            }
        }

        let ttl = self.config.ttl;
        let stats = &mut self.stats;
        self.pending.retain(|(name_hash, event_id), held| {
            let expired = now.saturating_duration_since(held.queued_at) >= ttl
                || host.has_timed_out(&held.event);
            if expired {
                stats.expired += 1;
                if held.event.requires_reply {
                    tracing::debug!("Event {:#010x}/{} expired without a reply", name_hash, event_id);
                }
            }
            !expired
        });

        for (first_seen, event) in std::mem::take(&mut self.re_events) {
            if now.saturating_duration_since(first_seen) >= ttl {
                tracing::debug!(
                    "Giving up on rejected event {:#010x} from {}",
                    event.name_hash,
                    event.source
                );
                continue;
            }
            self.process(host, event, first_seen);
        }
    }

    fn transmit(&mut self, reassembly: &mut Reassembly, outgoing: &Outgoing) -> bool {
        match self.try_transmit(reassembly, outgoing) {
            Ok(()) => {
                self.stats.sent += 1;
                true
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!(
                    "Failed to send event {:#010x}/{}: {}",
                    outgoing.name_hash,
                    outgoing.event_id,
                    e
                );
                false
            }
        }
    }

    fn try_transmit(&self, reassembly: &mut Reassembly, outgoing: &Outgoing) -> Result<(), EventError> {
        let target_players: Vec<u16> = outgoing.targets.iter().map(|peer| peer.0).collect();

        if outgoing.payload.len() > self.config.max_payload {
            let mut large = LargeGameEvent {
                peers: target_players,
                event_name_hash: outgoing.name_hash,
                event_id: outgoing.event_id,
                is_reply: outgoing.is_reply,
                data: outgoing.payload.clone(),
            };
            let body = encode(&mut large)?;
            reassembly.trigger_event(
                Target::Peer(PeerId::SERVER),
                LARGE_EVENT_NAME,
                &body,
                self.config.reassembly_bytes_per_second,
            )?;
            return Ok(());
        }

        let bytes = if self.config.use_v2 {
            encode_packet(&mut ClientNetGameEventV2 {
                target_players,
                event_name_hash: outgoing.name_hash,
                event_id: outgoing.event_id,
                is_reply: outgoing.is_reply,
                data: outgoing.payload.clone(),
            })?
        } else {
            let event_type = self
                .names
                .index_of(outgoing.name_hash)
                .ok_or(EventError::NoLegacyIndex(outgoing.name_hash))?;
            encode_packet(&mut ClientNetGameEvent {
                target_players,
                event_type,
                event_id: outgoing.event_id,
                is_reply: outgoing.is_reply,
                data: outgoing.payload.clone(),
            })?
        };
        self.sink.send_packet(PeerId::SERVER, bytes);
        Ok(())
    }

    /// Handle an event addressed by name hash, received from `from`.
    pub fn receive(
        &mut self,
        host: &mut dyn EventHost,
        from: PeerId,
        packet: ClientNetGameEventV2,
        now: Instant,
    ) {
        let source = packet.target_players.first().map_or(from, |&id| PeerId(id));
        let event = IncomingEvent {
            source,
            name_hash: packet.event_name_hash,
            event_id: packet.event_id,
            is_reply: packet.is_reply,
            payload: packet.data,
        };
        self.process(host, event, now);
    }

    /// Handle an event addressed by legacy type index.
    pub fn receive_legacy(
        &mut self,
        host: &mut dyn EventHost,
        from: PeerId,
        packet: ClientNetGameEvent,
        now: Instant,
    ) {
        let Some(name_hash) = self.names.hash_of(packet.event_type) else {
            self.stats.unknown += 1;
            tracing::debug!("Dropping event with unknown type index {}", packet.event_type);
            return;
        };
        let source = packet.target_players.first().map_or(from, |&id| PeerId(id));
        let event = IncomingEvent {
            source,
            name_hash,
            event_id: packet.event_id,
            is_reply: packet.is_reply,
            payload: packet.data,
        };
        self.process(host, event, now);
    }

    /// Handle a reassembled [`LargeGameEvent`] body.
    pub fn receive_large(&mut self, host: &mut dyn EventHost, from: PeerId, body: &[u8], now: Instant) {
        let Ok(large) = decode::<LargeGameEvent>(body) else {
            tracing::warn!("Malformed large event from {}", from);
            return;
        };
        let source = large.peers.first().map_or(from, |&id| PeerId(id));
        let event = IncomingEvent {
            source,
            name_hash: large.event_name_hash,
            event_id: large.event_id,
            is_reply: large.is_reply,
            payload: large.data,
        };
        self.process(host, event, now);
    }

    fn process(&mut self, host: &mut dyn EventHost, event: IncomingEvent, first_seen: Instant) {
        if event.is_reply {
            match self.pending.remove(&(event.name_hash, event.event_id)) {
                Some(held) => {
                    self.stats.replies += 1;
                    host.handle_reply(event.source, &held.event, &event.payload);
                }
                None => tracing::debug!(
                    "Reply to unknown event {:#010x}/{} from {}",
                    event.name_hash,
                    event.event_id,
                    event.source
                ),
            }
            return;
        }

        if is_denylisted(event.name_hash) {
            self.stats.denylisted += 1;
            tracing::warn!(
                "Dropping denylisted event {:#010x} from {}",
                event.name_hash,
                event.source
            );
            return;
        }
        if !self.names.contains(event.name_hash) {
            self.stats.unknown += 1;
            tracing::debug!("Dropping unknown event {:#010x}", event.name_hash);
            return;
        }

        match host.decide(event.source, event.name_hash, &event.payload) {
            Decision::Accept => {}
            Decision::Reply(payload) => self.replies.push(Outgoing {
                targets: vec![event.source],
                name_hash: event.name_hash,
                event_id: event.event_id,
                is_reply: true,
                payload,
            }),
            Decision::Reject { must_persist } => {
                self.stats.rejected += 1;
                if must_persist {
                    self.re_events.push_back((first_seen, event));
                }
            }
        }
    }

    /// Drop everything held, e.g. on disconnect.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.replies.clear();
        self.re_events.clear();
    }
}

// ---------------------------------------------------------------------------
// Server relay
// ---------------------------------------------------------------------------

/// Forward an event from `source` to each of its connected targets, with
/// `source` as the only target of the copy. Returns how many were sent.
pub fn relay_event(
    sink: &dyn PacketSink,
    source: PeerId,
    packet: &ClientNetGameEventV2,
    is_connected: impl Fn(PeerId) -> bool,
) -> usize {
    let mut relayed = ClientNetGameEventV2 {
        target_players: vec![source.0],
        ..packet.clone()
    };
    let Ok(bytes) = encode_packet(&mut relayed) else {
        return 0;
    };
    fan_out(sink, &packet.target_players, bytes, is_connected)
}

/// [`relay_event`] for legacy-addressed events.
pub fn relay_legacy_event(
    sink: &dyn PacketSink,
    source: PeerId,
    packet: &ClientNetGameEvent,
    is_connected: impl Fn(PeerId) -> bool,
) -> usize {
    let mut relayed = ClientNetGameEvent {
        target_players: vec![source.0],
        ..packet.clone()
    };
    let Ok(bytes) = encode_packet(&mut relayed) else {
        return 0;
    };
    fan_out(sink, &packet.target_players, bytes, is_connected)
}

fn fan_out(
    sink: &dyn PacketSink,
    targets: &[u16],
    bytes: Vec<u8>,
    is_connected: impl Fn(PeerId) -> bool,
) -> usize {
    let mut sent = 0;
    for &target in targets {
        let peer = PeerId(target);
        if !is_connected(peer) {
            tracing::debug!("Not relaying event to disconnected {}", peer);
            continue;
        }
        sink.send_packet(peer, bytes.clone());
        sent += 1;
    }
    sent
}

/// Forward a reassembled [`LargeGameEvent`] from `source` to its registered
/// targets. Returns how many were queued.
pub fn relay_large_event(
    reassembly: &mut Reassembly,
    source: PeerId,
    body: &[u8],
    bytes_per_second: i32,
) -> usize {
    let Ok(mut large) = decode::<LargeGameEvent>(body) else {
        tracing::warn!("Malformed large event from {}", source);
        return 0;
    };
    let targets = std::mem::replace(&mut large.peers, vec![source.0]);
    let Ok(relayed) = encode(&mut large) else {
        return 0;
    };
    targets
        .into_iter()
        .filter(|&target| {
            reassembly
                .trigger_event(
                    Target::Peer(PeerId(target)),
                    LARGE_EVENT_NAME,
                    &relayed,
                    bytes_per_second,
                )
                .is_ok()
        })
        .count()
}

#[cfg(test)]
#[path = "net_event_tests.rs"]
mod tests;
