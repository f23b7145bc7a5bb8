//! Authoritative side of the loopback session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tether_config::Config;
use tether_net::{
    Dispatch, Dispatcher, InboundPacket, PacketSink, PeerId, RateLimit,
};
use tether_replication::array_diff::ArrayHandlers;
use tether_replication::frame_sync::{FrameIndex, FrameSender, SendKind};
use tether_replication::net_event::{LARGE_EVENT_NAME, relay_event, relay_large_event, relay_legacy_event};
use tether_replication::reassembly::{Reassembly, ReassemblyConfig, ReassemblySink};
use tether_replication::state_bag_handler::StateBagVerdict;
use tether_replication::{
    StateBagLimits, StateBagPacketHandler, StateBagRole, StateBagStore, SyncStyle,
};
use tether_wire::packets::{
    ClientArrayUpdate, ClientGameStateAck, ClientGameStateNAck, ClientNetGameEvent,
    ClientNetGameEventV2, ReassembledEventV2,
};
use tokio::sync::mpsc;

/// Replicated array every client writes its own slot of.
pub const PLAYER_ARRAY: u8 = 1;
/// Bytes per player array slot.
pub const PLAYER_SLOT_SIZE: u32 = 32;

/// Objects carried in one simulated sync fragment.
const OBJECTS_PER_FRAGMENT: usize = 8;

/// State the packet handlers work on.
pub struct ServerState {
    sink: Arc<dyn PacketSink>,
    arrays: ArrayHandlers,
    reassembly: Reassembly,
    frames: BTreeMap<PeerId, FrameSender>,
    /// Per client: object id to the first frame that must carry its change.
    changed: BTreeMap<PeerId, BTreeMap<u16, u64>>,
    connected: BTreeSet<PeerId>,
    large_events: Vec<(PeerId, Vec<u8>)>,
    bytes_per_second: i32,
    now: Instant,
}

/// Collects reassembled game events for relay once the engine is free.
struct LargeEvents<'a>(&'a mut Vec<(PeerId, Vec<u8>)>);

impl ReassemblySink for LargeEvents<'_> {
    fn deliver(&mut self, source: PeerId, name: &str, payload: Vec<u8>) {
        if name == LARGE_EVENT_NAME {
            self.0.push((source, payload));
        } else {
            tracing::info!("{} sent reassembled '{}' ({} bytes)", source, name, payload.len());
        }
    }
}

pub struct Server {
    store: StateBagStore,
    bags: StateBagPacketHandler,
    dispatcher: Dispatcher<ServerState>,
    state: ServerState,
    inbound: mpsc::Receiver<InboundPacket>,
    sync_style: SyncStyle,
    frame_history: usize,
    max_pending: u8,
}

impl Server {
    pub fn new(
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::Receiver<InboundPacket>,
        config: &Config,
        sync_style: SyncStyle,
        now: Instant,
    ) -> Result<Self, tether_wire::WireError> {
        let store = StateBagStore::new(StateBagRole::Server, sink.clone());
        let cfg = &config.state_bag;
        let limits = StateBagLimits {
            update: RateLimit::new(cfg.update_rate, cfg.update_burst),
            flood: RateLimit::new(cfg.flood_rate, cfg.flood_burst),
            size: RateLimit::new(cfg.size_rate, cfg.size_burst),
        };
        let bags = StateBagPacketHandler::new(store.clone(), limits);

        let mut arrays = ArrayHandlers::new();
        arrays.register(PLAYER_ARRAY, u32::from(config.network.max_peers) + 1, PLAYER_SLOT_SIZE);

        let reassembly = Reassembly::new(
            sink.clone(),
            ReassemblyConfig {
                job_ttl: std::time::Duration::from_secs(config.reassembly.job_ttl_secs),
                ..Default::default()
            },
        );

        let mut dispatcher = Dispatcher::new();
        install_server_handlers(&mut dispatcher)?;

        Ok(Self {
            store,
            bags,
            dispatcher,
            state: ServerState {
                sink,
                arrays,
                reassembly,
                frames: BTreeMap::new(),
                changed: BTreeMap::new(),
                connected: BTreeSet::new(),
                large_events: Vec::new(),
                bytes_per_second: config.reassembly.bytes_per_second,
                now,
            },
            inbound,
            sync_style,
            frame_history: config.sync.frame_history,
            max_pending: config.reassembly.max_pending,
        })
    }

    pub fn store(&self) -> &StateBagStore {
        &self.store
    }

    pub fn arrays(&self) -> &ArrayHandlers {
        &self.state.arrays
    }

    /// Admit a client: state bag target, reassembly target, frame sender.
    pub fn connect(&mut self, peer: PeerId) {
        self.state.connected.insert(peer);
        self.state.reassembly.register_target(peer, self.max_pending);
        self.state
            .frames
            .insert(peer, FrameSender::new(self.sync_style, self.frame_history));
        self.state.changed.insert(peer, BTreeMap::new());

        let bag = self.store.register_state_bag(&format!("player:{}", peer.0), true);
        if let Some(bag) = bag.upgrade() {
            bag.set_owning_peer(Some(peer));
        }
        self.store.register_target(peer);
        tracing::info!("{} connected", peer);
    }

    pub fn disconnect(&mut self, peer: PeerId) {
        self.state.connected.remove(&peer);
        self.state.reassembly.unregister_target(peer);
        self.state.frames.remove(&peer);
        self.state.changed.remove(&peer);
        self.state.arrays.player_has_left(peer);
        self.store.unregister_target(peer);
        self.store.unregister_state_bag(&format!("player:{}", peer.0));
        self.bags.peer_left(peer);
        tracing::info!("{} disconnected", peer);
    }

    /// Apply everything the clients sent since the last call.
    pub fn drain(&mut self, now: Instant) -> usize {
        self.state.now = now;
        let mut drained = 0;
        while let Ok(packet) = self.inbound.try_recv() {
            drained += 1;
            match self.bags.handle_packet(packet.peer, &packet.data, now) {
                StateBagVerdict::NotStateBag => {}
                StateBagVerdict::DropClient(reason) => {
                    tracing::warn!("Dropping {}: {}", packet.peer, reason);
                    self.disconnect(packet.peer);
                    continue;
                }
                verdict => {
                    tracing::trace!("State bag update from {}: {:?}", packet.peer, verdict);
                    continue;
                }
            }
            if self.dispatcher.dispatch(&mut self.state, packet.peer, &packet.data)
                == Dispatch::NotThisType
            {
                tracing::debug!("Unhandled packet from {}", packet.peer);
            }
        }

        let ServerState {
            reassembly,
            large_events,
            bytes_per_second,
            ..
        } = &mut self.state;
        for (source, body) in large_events.drain(..) {
            let relayed = relay_large_event(reassembly, source, &body, *bytes_per_second);
            tracing::debug!("Relayed large event from {} to {} peers", source, relayed);
        }
        drained
    }

    /// Mark `object` changed for every client.
    pub fn touch_object(&mut self, object: u16) {
        for (peer, changed) in &mut self.state.changed {
            if let Some(frames) = self.state.frames.get(peer) {
                changed.insert(object, frames.next_frame());
            }
        }
    }

    /// Replicate arrays and bags, pace reassembly and build one sync frame
    /// per client. Returns the fragment indices each client should see.
    pub fn tick(&mut self, now: Instant, objects: &[u16]) -> Vec<(PeerId, Vec<FrameIndex>)> {
        self.state.now = now;
        self.store.tick();
        for &peer in &self.state.connected {
            self.state.arrays.send_updates(self.state.sink.as_ref(), peer);
        }
        self.state.reassembly.tick(now);

        let mut out = Vec::new();
        for (&peer, frames) in &mut self.state.frames {
            if !frames.can_advance() {
                tracing::trace!("{} has not acknowledged frame {}", peer, frames.last_acked() + 1);
                continue;
            }
            let changed = self.state.changed.entry(peer).or_default();
            let frame = frames.begin_frame();
            let mut sent = Vec::new();
            for &object in objects {
                let last_changed = changed.get(&object).copied().unwrap_or(0);
                let kind = frames.send_kind(object, last_changed);
                if kind != SendKind::Skip {
                    frames.record_sent(frame, object, kind);
                    sent.push(object);
                }
            }

            let fragments = sent.len().div_ceil(OBJECTS_PER_FRAGMENT).max(1);
            let fragments = fragments.min(usize::from(FrameIndex::MAX_FRAGMENT));
            let indices = (1..=fragments)
                .map(|n| frames.fragment_index(frame, n as u8, n == fragments))
                .collect();
            out.push((peer, indices));
        }
        out
    }
}

fn install_server_handlers(dispatcher: &mut Dispatcher<ServerState>) -> Result<(), tether_wire::WireError> {
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ClientNetGameEventV2| {
        let connected = &s.connected;
        relay_event(s.sink.as_ref(), peer, &p, |t| connected.contains(&t));
    })?;
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ClientNetGameEvent| {
        let connected = &s.connected;
        relay_legacy_event(s.sink.as_ref(), peer, &p, |t| connected.contains(&t));
    })?;
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ClientArrayUpdate| {
        s.arrays.read_update(peer, &p);
    })?;
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ReassembledEventV2| {
        let now = s.now;
        let mut sink = LargeEvents(&mut s.large_events);
        s.reassembly.handle_packet(peer, &p, &mut sink, now);
    })?;
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ClientGameStateAck| {
        if let Some(frames) = s.frames.get_mut(&peer) {
            frames.handle_ack(&p);
        }
    })?;
    dispatcher.register(|s: &mut ServerState, peer: PeerId, p: ClientGameStateNAck| {
        if let Some(frames) = s.frames.get_mut(&peer) {
            frames.handle_nack(&p);
        }
    })?;
    Ok(())
}
