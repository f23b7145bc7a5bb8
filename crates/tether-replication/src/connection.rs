//! Everything the client keeps for one server connection.
//!
//! [`ConnectionContext`] owns the event delivery state, both reassembly
//! engines, the array-diff tables and the frame receiver. It lives exactly
//! as long as the connection and is only touched from the game thread:
//! inbound packets reach it through a [`Dispatcher`] prepared with
//! [`install_handlers`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_net::{Dispatch, Dispatcher, PacketSink, PeerId, Target};
use tether_wire::WireError;
use tether_wire::packets::{
    ArrayUpdate, ClientNetGameEvent, ClientNetGameEventV2, ReassembledEvent, ReassembledEventV2,
};

use crate::ReassemblyError;
use crate::array_diff::{ClientArraySync, SlotSource};
use crate::event_names::EventNameTable;
use crate::frame_sync::{FrameIndex, FrameObservation, FrameReceiver, SyncStyle};
use crate::net_event::{EventConfig, EventDelivery, EventHost, LARGE_EVENT_NAME, NetEvent};
use crate::reassembly::{Reassembly, ReassemblyConfig, ReassemblySink, UNLIMITED_PENDING};
use crate::reassembly_v1::ReassemblyV1;

/// Callback for reassembled events that are not game events.
pub type ReassembledFn = dyn FnMut(PeerId, &str, Vec<u8>);

/// Settings for a [`ConnectionContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub events: EventConfig,
    pub reassembly: ReassemblyConfig,
    /// Idle timeout for legacy reassembly jobs.
    pub legacy_reassembly_ttl: Duration,
    /// Concurrent legacy reassembly jobs accepted from one source.
    pub legacy_max_jobs: usize,
    pub sync_style: SyncStyle,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            events: EventConfig::default(),
            reassembly: ReassemblyConfig::default(),
            legacy_reassembly_ttl: Duration::from_secs(120),
            legacy_max_jobs: 16,
            sync_style: SyncStyle::default(),
        }
    }
}

/// Per-connection replication state on the client.
pub struct ConnectionContext {
    sink: Arc<dyn PacketSink>,
    host: Box<dyn EventHost>,
    events: EventDelivery,
    reassembly: Reassembly,
    legacy_reassembly: ReassemblyV1,
    arrays: ClientArraySync,
    array_updates: Vec<ArrayUpdate>,
    frames: FrameReceiver,
    sync_style: SyncStyle,
    on_reassembled: Option<Box<ReassembledFn>>,
    now: Instant,
}

impl ConnectionContext {
    pub fn new(
        sink: Arc<dyn PacketSink>,
        host: Box<dyn EventHost>,
        config: ConnectionConfig,
        names: EventNameTable,
        now: Instant,
    ) -> Self {
        let mut reassembly = Reassembly::new(sink.clone(), config.reassembly);
        reassembly.register_target(PeerId::SERVER, UNLIMITED_PENDING);
        Self {
            events: EventDelivery::new(sink.clone(), config.events, names),
            legacy_reassembly: ReassemblyV1::new(
                sink.clone(),
                config.legacy_reassembly_ttl,
                config.legacy_max_jobs,
            ),
            reassembly,
            sink,
            host,
            arrays: ClientArraySync::new(),
            array_updates: Vec::new(),
            frames: FrameReceiver::new(),
            sync_style: config.sync_style,
            on_reassembled: None,
            now,
        }
    }

    /// Receive reassembled events other than oversized game events.
    pub fn on_reassembled(&mut self, callback: impl FnMut(PeerId, &str, Vec<u8>) + 'static) {
        self.on_reassembled = Some(Box::new(callback));
    }

    pub fn events(&self) -> &EventDelivery {
        &self.events
    }

    pub fn reassembly(&self) -> &Reassembly {
        &self.reassembly
    }

    pub fn arrays_mut(&mut self) -> &mut ClientArraySync {
        &mut self.arrays
    }

    /// Slot updates received from the server since the last call.
    pub fn take_array_updates(&mut self) -> Vec<ArrayUpdate> {
        std::mem::take(&mut self.array_updates)
    }

    pub fn frames(&self) -> &FrameReceiver {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameReceiver {
        &mut self.frames
    }

    /// Route one inbound packet at time `now`.
    pub fn dispatch(
        &mut self,
        dispatcher: &Dispatcher<Self>,
        peer: PeerId,
        buf: &[u8],
        now: Instant,
    ) -> Dispatch {
        self.now = now;
        dispatcher.dispatch(self, peer, buf)
    }

    /// Queue a game event for the server to relay.
    pub fn send_event(&mut self, event: NetEvent) -> Option<u16> {
        self.events.send(self.host.as_mut(), event, self.now)
    }

    /// Send a named payload to the server through reassembly.
    pub fn trigger_reassembled(
        &mut self,
        name: &str,
        payload: &[u8],
        bytes_per_second: i32,
    ) -> Result<u64, ReassemblyError> {
        self.reassembly
            .trigger_event(Target::Peer(PeerId::SERVER), name, payload, bytes_per_second)
    }

    /// Track a sync fragment and send whatever reply it calls for.
    pub fn observe_frame(&mut self, index: FrameIndex) -> FrameObservation {
        let observation = self.frames.observe(index);
        if observation != FrameObservation::Rejected
            && let Some(reply) = self.frames.finish(self.sync_style)
        {
            reply.send(self.sink.as_ref());
        }
        observation
    }

    /// Periodic sweep: diff the given arrays against what the server has,
    /// send and expire events, pace reassembly and drop stale jobs.
    pub fn tick(&mut self, now: Instant, arrays: &[(u8, &dyn SlotSource)]) {
        self.now = now;
        for &(handler, source) in arrays {
            self.arrays.send(self.sink.as_ref(), handler, source);
        }
        self.events
            .tick(self.host.as_mut(), &mut self.reassembly, now);
        self.reassembly.tick(now);
        self.legacy_reassembly.tick(now);
    }

    /// Forget per-connection state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.events.reset();
        self.frames.reset();
        self.arrays.invalidate();
        self.array_updates.clear();
    }

    fn route(&mut self) -> (Route<'_>, &mut Reassembly, &mut ReassemblyV1) {
        let Self {
            host,
            events,
            reassembly,
            legacy_reassembly,
            on_reassembled,
            now,
            ..
        } = self;
        let route = Route {
            events,
            host: host.as_mut(),
            on_reassembled,
            now: *now,
        };
        (route, reassembly, legacy_reassembly)
    }
}

/// Hands completed reassembly jobs to event delivery or the callback.
struct Route<'a> {
    events: &'a mut EventDelivery,
    host: &'a mut dyn EventHost,
    on_reassembled: &'a mut Option<Box<ReassembledFn>>,
    now: Instant,
}

impl ReassemblySink for Route<'_> {
    fn deliver(&mut self, source: PeerId, name: &str, payload: Vec<u8>) {
        if name == LARGE_EVENT_NAME {
            self.events
                .receive_large(self.host, source, &payload, self.now);
        } else if let Some(callback) = self.on_reassembled.as_mut() {
            callback(source, name, payload);
        } else {
            tracing::debug!("No handler for reassembled event '{}' from {}", name, source);
        }
    }
}

/// Register the client's inbound handlers on `dispatcher`.
pub fn install_handlers(dispatcher: &mut Dispatcher<ConnectionContext>) -> Result<(), WireError> {
    dispatcher.register(
        |ctx: &mut ConnectionContext, peer: PeerId, packet: ClientNetGameEventV2| {
            let now = ctx.now;
            ctx.events.receive(ctx.host.as_mut(), peer, packet, now);
        },
    )?;
    dispatcher.register(
        |ctx: &mut ConnectionContext, peer: PeerId, packet: ClientNetGameEvent| {
            let now = ctx.now;
            ctx.events
                .receive_legacy(ctx.host.as_mut(), peer, packet, now);
        },
    )?;
    dispatcher.register(
        |ctx: &mut ConnectionContext, peer: PeerId, packet: ReassembledEventV2| {
            let now = ctx.now;
            let (mut route, reassembly, _) = ctx.route();
            reassembly.handle_packet(peer, &packet, &mut route, now);
        },
    )?;
    dispatcher.register(
        |ctx: &mut ConnectionContext, peer: PeerId, packet: ReassembledEvent| {
            let now = ctx.now;
            let (mut route, _, legacy) = ctx.route();
            legacy.handle_packet(peer, &packet, &mut route, now);
        },
    )?;
    dispatcher.register(|ctx: &mut ConnectionContext, _: PeerId, packet: ArrayUpdate| {
        ctx.array_updates.push(packet);
    })?;
    tracing::debug!(
        "Installed connection handlers: {:?}",
        dispatcher.registered_names().collect::<Vec<_>>()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::net_event::{Decision, LargeGameEvent};
    use tether_net::RecordingSink;
    use tether_wire::packets::{ClientArrayUpdate, ClientGameStateNAck, MissingFrames};
    use tether_wire::{Packet, decode_body, encode, encode_packet, joaat, peek_tag};

    #[derive(Default)]
    struct Seen {
        decided: Vec<(PeerId, u32, Vec<u8>)>,
    }

    struct SharedHost(Rc<RefCell<Seen>>);

    impl EventHost for SharedHost {
        fn decide(&mut self, source: PeerId, name_hash: u32, payload: &[u8]) -> Decision {
            self.0
                .borrow_mut()
                .decided
                .push((source, name_hash, payload.to_vec()));
            Decision::Accept
        }

        fn handle_reply(&mut self, _source: PeerId, _event: &NetEvent, _reply: &[u8]) {}
    }

    struct Harness {
        ctx: ConnectionContext,
        dispatcher: Dispatcher<ConnectionContext>,
        wire: Arc<RecordingSink>,
        seen: Rc<RefCell<Seen>>,
        now: Instant,
    }

    fn harness(sync_style: SyncStyle) -> Harness {
        let wire = Arc::new(RecordingSink::new());
        let seen = Rc::new(RefCell::new(Seen::default()));
        let now = Instant::now();
        let config = ConnectionConfig {
            sync_style,
            ..Default::default()
        };
        let ctx = ConnectionContext::new(
            wire.clone(),
            Box::new(SharedHost(seen.clone())),
            config,
            EventNameTable::default(),
            now,
        );
        let mut dispatcher = Dispatcher::new();
        install_handlers(&mut dispatcher).unwrap();
        Harness {
            ctx,
            dispatcher,
            wire,
            seen,
            now,
        }
    }

    impl Harness {
        fn feed(&mut self, buf: &[u8]) -> Dispatch {
            self.ctx
                .dispatch(&self.dispatcher, PeerId::SERVER, buf, self.now)
        }
    }

    #[test]
    fn test_relayed_event_reaches_host_with_origin() {
        let mut h = harness(SyncStyle::Nak);
        let mut packet = ClientNetGameEventV2 {
            target_players: vec![3],
            event_name_hash: joaat("WEAPON_DAMAGE_EVENT"),
            event_id: 1,
            is_reply: false,
            data: vec![1, 2, 3],
        };
        let bytes = encode_packet(&mut packet).unwrap();
        assert_eq!(h.feed(&bytes), Dispatch::Handled);

        let seen = h.seen.borrow();
        assert_eq!(
            seen.decided,
            vec![(PeerId(3), joaat("WEAPON_DAMAGE_EVENT"), vec![1, 2, 3])]
        );
    }

    #[test]
    fn test_large_event_arrives_through_reassembly() {
        let mut h = harness(SyncStyle::Nak);

        let server_wire = Arc::new(RecordingSink::new());
        let mut server = Reassembly::new(server_wire.clone(), ReassemblyConfig::default());
        server.register_target(PeerId(1), 4);
        let mut large = LargeGameEvent {
            peers: vec![5],
            event_name_hash: joaat("WEAPON_DAMAGE_EVENT"),
            event_id: 9,
            is_reply: false,
            data: vec![0xab; 1500],
        };
        let body = encode(&mut large).unwrap();
        server
            .trigger_event(Target::Peer(PeerId(1)), LARGE_EVENT_NAME, &body, 10_000_000)
            .unwrap();
        server.tick(h.now);

        let fragments = server_wire.take();
        assert_eq!(fragments.len(), 1);
        assert_eq!(h.feed(&fragments[0].1), Dispatch::Handled);

        let acks = h.wire.take();
        assert_eq!(acks.len(), 1);
        let ack = decode_body::<ReassembledEventV2>(&acks[0].1).unwrap();
        assert!(ack.is_ack());

        let seen = h.seen.borrow();
        assert_eq!(seen.decided.len(), 1);
        assert_eq!(seen.decided[0].0, PeerId(5));
        assert_eq!(seen.decided[0].2, vec![0xab; 1500]);
    }

    #[test]
    fn test_other_reassembled_names_go_to_callback() {
        let mut h = harness(SyncStyle::Nak);
        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = got.clone();
        h.ctx.on_reassembled(move |source, name, payload| {
            sink.borrow_mut().push((source, name.to_owned(), payload));
        });

        let server_wire = Arc::new(RecordingSink::new());
        let mut server = ReassemblyV1::new(server_wire.clone(), Duration::from_secs(120), 4);
        server.send(PeerId(1), "resourceBlob", &[4; 2000]).unwrap();
        for (_, bytes) in server_wire.take() {
            assert_eq!(h.feed(&bytes), Dispatch::Handled);
        }

        assert_eq!(
            *got.borrow(),
            vec![(PeerId::SERVER, "resourceBlob".to_owned(), vec![4; 2000])]
        );
        assert!(h.seen.borrow().decided.is_empty());
    }

    #[test]
    fn test_frame_gap_sends_nack() {
        let mut h = harness(SyncStyle::Nak);
        h.ctx.observe_frame(FrameIndex::new(1, 1, true));
        assert!(h.wire.is_empty());
        h.ctx.observe_frame(FrameIndex::new(4, 1, true));

        let sent = h.wire.take();
        assert_eq!(sent.len(), 1);
        let nack = decode_body::<ClientGameStateNAck>(&sent[0].1).unwrap();
        assert_eq!(nack.missing, Some(MissingFrames { first: 2, last: 3 }));
    }

    #[test]
    fn test_server_array_updates_are_queued() {
        let mut h = harness(SyncStyle::Nak);
        let mut update = ArrayUpdate {
            handler: 1,
            owner_net_id: 4,
            index: 2,
            data: vec![5; 16],
        };
        let bytes = encode_packet(&mut update).unwrap();
        assert_eq!(h.feed(&bytes), Dispatch::Handled);
        assert_eq!(h.ctx.take_array_updates(), vec![update]);
        assert!(h.ctx.take_array_updates().is_empty());
    }

    #[test]
    fn test_tick_sends_array_changes_and_events() {
        let mut h = harness(SyncStyle::Arq);
        h.ctx.arrays_mut().register(2, 4);
        let slots: Vec<Option<Vec<u8>>> = vec![None, Some(vec![9; 8]), None, None];
        let source: &dyn SlotSource = &slots;
        h.ctx
            .send_event(NetEvent::new("WEAPON_DAMAGE_EVENT", vec![PeerId(2)], vec![1]));

        h.ctx.tick(h.now, &[(2, source)]);
        let sent = h.wire.take();
        let tags: Vec<u32> = sent.iter().filter_map(|(_, b)| peek_tag(b)).collect();
        assert!(tags.contains(&ClientArrayUpdate::TAG));
        assert!(tags.contains(&ClientNetGameEventV2::TAG));

        h.ctx.tick(h.now + Duration::from_millis(50), &[(2, source)]);
        assert!(h.wire.is_empty());
    }
}
