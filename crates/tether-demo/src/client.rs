//! One simulated client: its connection context, state bags and array.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tether_net::{Dispatch, Dispatcher, InboundPacket, PacketSink, PeerId, dispatch_as};
use tether_replication::array_diff::SlotSource;
use tether_replication::frame_sync::{FrameIndex, FrameObservation};
use tether_replication::{
    ConnectionConfig, ConnectionContext, Decision, EventHost, EventNameTable, NetEvent,
    StateBagRole, StateBagStore, install_handlers,
};
use tether_wire::joaat;
use tether_wire::packets::StateBag as StateBagPacket;
use tokio::sync::mpsc;

use crate::server::{PLAYER_ARRAY, PLAYER_SLOT_SIZE};

/// What the client's game saw, for the end-of-run summary.
#[derive(Debug, Default)]
pub struct GameLog {
    pub events: usize,
    pub replies: usize,
    pub largest_event: usize,
    pub array_updates: usize,
    pub missing_frames: usize,
}

/// Game side of event handling: accepts everything and answers control
/// requests.
struct DemoHost {
    me: PeerId,
    log: Rc<RefCell<GameLog>>,
}

impl EventHost for DemoHost {
    fn decide(&mut self, source: PeerId, name_hash: u32, payload: &[u8]) -> Decision {
        let mut log = self.log.borrow_mut();
        log.events += 1;
        log.largest_event = log.largest_event.max(payload.len());
        tracing::debug!(
            "{} got event {:#010x} from {} ({} bytes)",
            self.me,
            name_hash,
            source,
            payload.len()
        );
        if name_hash == joaat("REQUEST_CONTROL_EVENT") {
            return Decision::Reply(vec![1]);
        }
        Decision::Accept
    }

    fn handle_reply(&mut self, source: PeerId, event: &NetEvent, reply: &[u8]) {
        self.log.borrow_mut().replies += 1;
        tracing::info!(
            "{} got reply {:?} to {:#010x} from {}",
            self.me,
            reply,
            event.name_hash,
            source
        );
    }
}

pub struct Client {
    pub id: PeerId,
    ctx: ConnectionContext,
    dispatcher: Dispatcher<ConnectionContext>,
    store: StateBagStore,
    inbound: mpsc::Receiver<InboundPacket>,
    slots: Vec<Option<Vec<u8>>>,
    pub log: Rc<RefCell<GameLog>>,
}

impl Client {
    pub fn new(
        id: PeerId,
        sink: Arc<dyn PacketSink>,
        inbound: mpsc::Receiver<InboundPacket>,
        config: ConnectionConfig,
        slot_count: usize,
        now: Instant,
    ) -> Result<Self, tether_wire::WireError> {
        let log = Rc::new(RefCell::new(GameLog::default()));
        let host = DemoHost {
            me: id,
            log: log.clone(),
        };
        let mut ctx = ConnectionContext::new(
            sink.clone(),
            Box::new(host),
            config,
            EventNameTable::default(),
            now,
        );
        ctx.arrays_mut().register(PLAYER_ARRAY, slot_count);

        let mut dispatcher = Dispatcher::new();
        install_handlers(&mut dispatcher)?;

        let store = StateBagStore::new(StateBagRole::ClientV2, sink);
        store.add_safe_pre_create_prefix("player:", true);
        store.register_target(PeerId::SERVER);
        store.register_state_bag(&format!("player:{}", id.0), true);

        Ok(Self {
            id,
            ctx,
            dispatcher,
            store,
            inbound,
            slots: vec![None; slot_count],
            log,
        })
    }

    pub fn store(&self) -> &StateBagStore {
        &self.store
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Write this client's own bag.
    pub fn set_state(&self, key: &str, value: &[u8]) {
        let bag = self
            .store
            .get_state_bag(&format!("player:{}", self.id.0))
            .and_then(|handle| handle.upgrade());
        match bag {
            Some(bag) => bag.set_key(None, key, value, true),
            None => tracing::warn!("{} has no player bag", self.id),
        }
    }

    /// Write this client's slot of the player array.
    pub fn set_slot(&mut self, value: Vec<u8>) {
        let index = usize::from(self.id.0);
        let mut value = value;
        value.truncate(PLAYER_SLOT_SIZE as usize);
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(value);
        }
    }

    pub fn send_event(&mut self, event: NetEvent) -> Option<u16> {
        self.ctx.send_event(event)
    }

    /// Apply everything the server sent since the last call.
    pub fn drain(&mut self, now: Instant) -> usize {
        let mut drained = 0;
        while let Ok(packet) = self.inbound.try_recv() {
            drained += 1;
            let store = &self.store;
            let bag = dispatch_as::<StateBagPacket>(&packet.data, |p| {
                if let Err(e) = store.handle_packet(packet.peer, &p.data) {
                    tracing::debug!("State bag update rejected: {}", e);
                }
            });
            if bag != Dispatch::NotThisType {
                continue;
            }
            self.ctx
                .dispatch(&self.dispatcher, packet.peer, &packet.data, now);
        }

        let updates = self.ctx.take_array_updates();
        self.log.borrow_mut().array_updates += updates.len();
        drained
    }

    /// Feed one simulated sync fragment.
    pub fn observe_frame(&mut self, index: FrameIndex) {
        if let FrameObservation::Missing(range) = self.ctx.observe_frame(index) {
            self.log.borrow_mut().missing_frames += 1;
            tracing::debug!("{} missed frames {}..={}", self.id, range.first, range.last);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        let slots: &dyn SlotSource = &self.slots;
        self.ctx.tick(now, &[(PLAYER_ARRAY, slots)]);
    }
}
