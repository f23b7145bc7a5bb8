//! State bags: named key/value stores replicated to a set of peers.
//!
//! The [`StateBagStore`] owns every [`StateBag`]; callers hold weak
//! [`StateBagHandle`]s. A bag sends changed values to its routing targets
//! (or to the store's targets when it inherits them), either immediately or
//! from a per-key queue flushed on [`tick`](StateBagStore::tick).
//!
//! Lock order is always bag before store: store methods collect the bags
//! they need and release the store lock before touching any bag.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tether_net::{PacketSink, PeerId, send_packet};
use tether_wire::packets::{StateBag as StateBagPacket, StateBagPayload, StateBagV2};
use tether_wire::{decode, encode};

use crate::InboundError;
use crate::game_interface::{GameInterface, InlineGameInterface};

/// A value starting with this byte (msgpack `nil`) deletes the key.
pub const MSGPACK_NIL: u8 = 0xc0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Role and change callback
// ---------------------------------------------------------------------------

/// Which side of the connection the store serves, deciding the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateBagRole {
    /// Authoritative server; sends the legacy format and replicates inbound
    /// changes onward.
    #[default]
    Server,
    /// Client talking to a server that only understands the legacy format.
    Client,
    /// Client sending [`StateBagV2`] packets.
    ClientV2,
}

/// A pending change offered to the on-change callback.
#[derive(Debug, Clone, Copy)]
pub struct StateChange<'a> {
    /// Peer the change came from, `None` for local writes.
    pub source: Option<PeerId>,
    /// Bag id.
    pub bag_id: &'a str,
    /// Key being written.
    pub key: &'a str,
    /// New value.
    pub value: &'a [u8],
    /// Whether the change will be replicated.
    pub replicated: bool,
}

/// On-change callback; returning `false` vetoes the change.
pub type OnChangeFn = dyn Fn(&StateChange<'_>) -> bool + Send + Sync;

// ---------------------------------------------------------------------------
// Store internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    bags: HashMap<String, Arc<StateBag>>,
    targets: BTreeSet<PeerId>,
    erase: HashSet<String>,
    prefixes: Vec<(String, bool)>,
    pre_created: HashSet<String>,
}

struct StoreShared {
    role: RwLock<StateBagRole>,
    inner: Mutex<StoreInner>,
    sink: Arc<dyn PacketSink>,
    game: RwLock<Arc<dyn GameInterface>>,
    on_change: RwLock<Option<Arc<OnChangeFn>>>,
}

impl StoreShared {
    fn role(&self) -> StateBagRole {
        *self.role.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn targets(&self) -> Vec<PeerId> {
        lock(&self.inner).targets.iter().copied().collect()
    }

    fn safe_prefix(&self, id: &str) -> Option<bool> {
        lock(&self.inner)
            .prefixes
            .iter()
            .find(|(prefix, _)| id.starts_with(prefix.as_str()))
            .map(|(_, use_parent_targets)| *use_parent_targets)
    }

    fn queue_erase(&self, id: &str) {
        lock(&self.inner).erase.insert(id.to_owned());
    }
}

// ---------------------------------------------------------------------------
// StateBag
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedValue {
    source: Option<PeerId>,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct BagState {
    data: BTreeMap<String, Vec<u8>>,
    routing_targets: BTreeSet<PeerId>,
    owner: Option<PeerId>,
    queued: BTreeMap<String, QueuedValue>,
}

/// One replicated key/value store.
pub struct StateBag {
    id: String,
    use_parent_targets: bool,
    store: Weak<StoreShared>,
    state: Mutex<BagState>,
    replication_enabled: AtomicBool,
    expired: AtomicBool,
}

impl std::fmt::Debug for StateBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBag")
            .field("id", &self.id)
            .field("use_parent_targets", &self.use_parent_targets)
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

impl StateBag {
    fn new(store: Weak<StoreShared>, id: &str, use_parent_targets: bool) -> Self {
        Self {
            id: id.to_owned(),
            use_parent_targets,
            store,
            state: Mutex::new(BagState::default()),
            replication_enabled: AtomicBool::new(true),
            expired: AtomicBool::new(false),
        }
    }

    /// Bag id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether changes go to the store's targets instead of the bag's own.
    pub fn uses_parent_targets(&self) -> bool {
        self.use_parent_targets
    }

    /// Current value of `key`.
    pub fn get_key(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).data.get(key).cloned()
    }

    /// Whether `key` holds a value.
    pub fn has_key(&self, key: &str) -> bool {
        lock(&self.state).data.contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).data.keys().cloned().collect()
    }

    /// Write `value` under `key`.
    ///
    /// The on-change callback, if any, runs first and may veto the write;
    /// when the game interface is asynchronous the whole write is deferred
    /// to the game thread. Empty keys and values are ignored.
    pub fn set_key(
        self: &Arc<Self>,
        source: Option<PeerId>,
        key: &str,
        value: &[u8],
        replicate: bool,
    ) {
        if key.is_empty() || value.is_empty() {
            tracing::debug!("Ignoring empty key or value on state bag {}", self.id);
            return;
        }
        let Some(store) = self.store.upgrade() else {
            self.set_key_internal(source, key, value, replicate);
            return;
        };
        let callback = store
            .on_change
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            self.set_key_internal(source, key, value, replicate);
            return;
        };

        let game = Arc::clone(&*store.game.read().unwrap_or_else(PoisonError::into_inner));
        if game.is_asynchronous() {
            let bag = Arc::clone(self);
            let key = key.to_owned();
            let value = value.to_vec();
            game.queue_task(Box::new(move || {
                let change = StateChange {
                    source,
                    bag_id: &bag.id,
                    key: &key,
                    value: &value,
                    replicated: replicate,
                };
                if callback(&change) {
                    bag.set_key_internal(source, &key, &value, replicate);
                }
            }));
            return;
        }

        let change = StateChange {
            source,
            bag_id: &self.id,
            key,
            value,
            replicated: replicate,
        };
        if !callback(&change) {
            tracing::debug!("Change to {}.{} vetoed", self.id, key);
            return;
        }
        self.set_key_internal(source, key, value, replicate);
    }

    fn set_key_internal(&self, source: Option<PeerId>, key: &str, value: &[u8], replicate: bool) {
        let mut replicate = replicate;
        {
            let mut state = lock(&self.state);
            if value.first() == Some(&MSGPACK_NIL) {
                state.data.remove(key);
            } else {
                match state.data.get_mut(key) {
                    Some(existing) if existing.as_slice() == value => replicate = false,
                    Some(existing) => *existing = value.to_vec(),
                    None => {
                        state.data.insert(key.to_owned(), value.to_vec());
                    }
                }
            }

            if !replicate {
                return;
            }
            if !self.replication_enabled.load(Ordering::Acquire) {
                state.queued.insert(
                    key.to_owned(),
                    QueuedValue {
                        source,
                        value: value.to_vec(),
                    },
                );
                return;
            }
        }
        self.send_to_all_targets(source, key, value);
    }

    /// Replace the routing set, sending full state to newly added peers.
    pub fn set_routing_targets(&self, peers: impl IntoIterator<Item = PeerId>) {
        let new_targets: Vec<PeerId> = {
            let mut state = lock(&self.state);
            let peers: BTreeSet<PeerId> = peers.into_iter().collect();
            let added = peers
                .difference(&state.routing_targets)
                .copied()
                .collect();
            state.routing_targets = peers;
            added
        };
        for target in new_targets {
            self.send_all(target);
        }
    }

    /// Add one routing target; sends full state when the peer is new.
    pub fn add_routing_target(&self, peer: PeerId) -> bool {
        let inserted = lock(&self.state).routing_targets.insert(peer);
        if inserted {
            self.send_all(peer);
        }
        inserted
    }

    /// Remove one routing target.
    ///
    /// Removing the last target expires the bag, unless its id matches a
    /// safe pre-create prefix; expired bags are erased at the next tick.
    pub fn remove_routing_target(&self, peer: PeerId) {
        let now_empty = {
            let mut state = lock(&self.state);
            state.routing_targets.remove(&peer) && state.routing_targets.is_empty()
        };
        if !now_empty {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        if store.safe_prefix(&self.id).is_some() {
            return;
        }
        tracing::debug!("State bag {} lost its last target, expiring", self.id);
        self.expired.store(true, Ordering::Release);
        store.queue_erase(&self.id);
    }

    /// Current routing targets (the bag's own set, not the store's).
    pub fn routing_targets(&self) -> Vec<PeerId> {
        lock(&self.state).routing_targets.iter().copied().collect()
    }

    /// Set or clear the peer allowed to write this bag remotely.
    pub fn set_owning_peer(&self, peer: Option<PeerId>) {
        lock(&self.state).owner = peer;
    }

    /// Peer allowed to write this bag remotely.
    pub fn owning_peer(&self) -> Option<PeerId> {
        lock(&self.state).owner
    }

    /// Send changes as they happen (`true`) or queue them for
    /// [`send_queued_updates`](Self::send_queued_updates).
    pub fn enable_immediate_replication(&self, enabled: bool) {
        self.replication_enabled.store(enabled, Ordering::Release);
    }

    /// Send every queued change to the current targets.
    pub fn send_queued_updates(&self) {
        let queued = std::mem::take(&mut lock(&self.state).queued);
        for (key, entry) in queued {
            self.send_to_all_targets(entry.source, &key, &entry.value);
        }
    }

    /// Whether the bag lost its last target or was unregistered.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn current_targets(&self, store: &StoreShared) -> Vec<PeerId> {
        if self.use_parent_targets {
            store.targets()
        } else {
            self.routing_targets()
        }
    }

    fn send_to_all_targets(&self, source: Option<PeerId>, key: &str, value: &[u8]) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        for target in self.current_targets(&store) {
            if Some(target) != source {
                self.send_key_value(&store, target, key, value);
            }
        }
    }

    fn send_all(&self, target: PeerId) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let entries: Vec<(String, Vec<u8>)> = lock(&self.state)
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            self.send_key_value(&store, target, &key, &value);
        }
    }

    fn send_all_initial(&self, target: PeerId) {
        {
            let state = lock(&self.state);
            if !state.routing_targets.is_empty() && !state.routing_targets.contains(&target) {
                return;
            }
        }
        self.send_all(target);
    }

    fn send_key_value(&self, store: &StoreShared, target: PeerId, key: &str, value: &[u8]) {
        if key.is_empty() || value.is_empty() {
            return;
        }
        let sink = store.sink.as_ref();
        if store.role() == StateBagRole::ClientV2 {
            let mut packet = StateBagV2 {
                state_bag_name: self.id.clone(),
                key: key.to_owned(),
                data: value.to_vec(),
            };
            send_packet(sink, target, &mut packet);
            return;
        }

        let mut payload = StateBagPayload {
            id: self.id.clone(),
            key: key.to_owned(),
            value: value.to_vec(),
        };
        match encode(&mut payload) {
            Ok(data) => {
                send_packet(sink, target, &mut StateBagPacket { data });
            }
            Err(e) => tracing::warn!("Failed to encode state bag {}.{}: {}", self.id, key, e),
        }
    }
}

// ---------------------------------------------------------------------------
// StateBagHandle
// ---------------------------------------------------------------------------

/// Non-owning reference to a bag in a [`StateBagStore`].
#[derive(Debug, Clone)]
pub struct StateBagHandle {
    bag: Weak<StateBag>,
}

impl StateBagHandle {
    /// The bag, unless the store has erased it.
    pub fn upgrade(&self) -> Option<Arc<StateBag>> {
        self.bag.upgrade()
    }

    /// Whether the store still holds the bag.
    pub fn is_alive(&self) -> bool {
        self.bag.strong_count() > 0
    }
}

// ---------------------------------------------------------------------------
// StateBagStore
// ---------------------------------------------------------------------------

/// Owner of every state bag for one process, callable from any thread.
#[derive(Clone)]
pub struct StateBagStore {
    shared: Arc<StoreShared>,
}

impl StateBagStore {
    /// Create an empty store sending through `sink`.
    pub fn new(role: StateBagRole, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                role: RwLock::new(role),
                inner: Mutex::new(StoreInner::default()),
                sink,
                game: RwLock::new(Arc::new(InlineGameInterface)),
                on_change: RwLock::new(None),
            }),
        }
    }

    /// Current role.
    pub fn role(&self) -> StateBagRole {
        self.shared.role()
    }

    /// Change the role, e.g. once the server's version is known.
    pub fn set_role(&self, role: StateBagRole) {
        *self
            .shared
            .role
            .write()
            .unwrap_or_else(PoisonError::into_inner) = role;
    }

    /// Install the game-thread marshaling capability.
    pub fn set_game_interface(&self, game: Arc<dyn GameInterface>) {
        *self
            .shared
            .game
            .write()
            .unwrap_or_else(PoisonError::into_inner) = game;
    }

    /// Install the change callback; it may veto writes by returning `false`.
    pub fn set_on_change(&self, callback: impl Fn(&StateChange<'_>) -> bool + Send + Sync + 'static) {
        *self
            .shared
            .on_change
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Remove the change callback.
    pub fn clear_on_change(&self) {
        *self
            .shared
            .on_change
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Register `id`, or return the existing bag.
    ///
    /// A bag that was pre-created or queued for erasure is adopted: it stops
    /// counting as pre-created and will no longer be erased.
    pub fn register_state_bag(&self, id: &str, use_parent_targets: bool) -> StateBagHandle {
        let mut inner = lock(&self.shared.inner);
        inner.erase.remove(id);
        if let Some(bag) = inner.bags.get(id) {
            let bag = Arc::clone(bag);
            inner.pre_created.remove(id);
            drop(inner);
            bag.expired.store(false, Ordering::Release);
            return StateBagHandle {
                bag: Arc::downgrade(&bag),
            };
        }
        let bag = Arc::new(StateBag::new(
            Arc::downgrade(&self.shared),
            id,
            use_parent_targets,
        ));
        inner.bags.insert(id.to_owned(), Arc::clone(&bag));
        tracing::debug!("Registered state bag {}", id);
        StateBagHandle {
            bag: Arc::downgrade(&bag),
        }
    }

    /// Look up a registered bag.
    pub fn get_state_bag(&self, id: &str) -> Option<StateBagHandle> {
        lock(&self.shared.inner)
            .bags
            .get(id)
            .map(|bag| StateBagHandle {
                bag: Arc::downgrade(bag),
            })
    }

    fn bag(&self, id: &str) -> Option<Arc<StateBag>> {
        lock(&self.shared.inner).bags.get(id).cloned()
    }

    /// Expire `id`; the store drops it at the next tick.
    pub fn unregister_state_bag(&self, id: &str) {
        let mut inner = lock(&self.shared.inner);
        if let Some(bag) = inner.bags.get(id) {
            bag.expired.store(true, Ordering::Release);
            inner.erase.insert(id.to_owned());
        }
    }

    /// Allow bags whose id starts with `prefix` to be created on demand by
    /// inbound updates.
    pub fn add_safe_pre_create_prefix(&self, prefix: &str, use_parent_targets: bool) {
        lock(&self.shared.inner)
            .prefixes
            .push((prefix.to_owned(), use_parent_targets));
    }

    /// `Some(use_parent_targets)` when `id` matches a safe prefix.
    pub fn is_safe_pre_create_name(&self, id: &str) -> Option<bool> {
        self.shared.safe_prefix(id)
    }

    /// Create `id` ahead of its owner registering it. Only ids matching a
    /// safe prefix may be pre-created.
    pub fn pre_create_state_bag(&self, id: &str) -> Option<StateBagHandle> {
        let use_parent_targets = self.is_safe_pre_create_name(id)?;
        let handle = self.register_state_bag(id, use_parent_targets);
        lock(&self.shared.inner).pre_created.insert(id.to_owned());
        Some(handle)
    }

    /// Whether `id` was pre-created and not yet registered by its owner.
    pub fn is_pre_created(&self, id: &str) -> bool {
        lock(&self.shared.inner).pre_created.contains(id)
    }

    /// Add a store-level target and send it the state of every bag routed
    /// to it.
    pub fn register_target(&self, peer: PeerId) {
        let bags: Vec<Arc<StateBag>> = {
            let mut inner = lock(&self.shared.inner);
            if !inner.targets.insert(peer) {
                return;
            }
            inner.bags.values().cloned().collect()
        };
        tracing::debug!("Registered state bag target {}", peer);
        for bag in bags {
            bag.send_all_initial(peer);
        }
    }

    /// Remove a target from the store and from every bag.
    pub fn unregister_target(&self, peer: PeerId) {
        let bags: Vec<Arc<StateBag>> = {
            let mut inner = lock(&self.shared.inner);
            inner.targets.remove(&peer);
            inner.bags.values().cloned().collect()
        };
        for bag in bags {
            bag.remove_routing_target(peer);
        }
    }

    /// Store-level targets.
    pub fn targets(&self) -> Vec<PeerId> {
        self.shared.targets()
    }

    /// Apply a legacy [`StateBagPacket`] payload from `source`.
    pub fn handle_packet(&self, source: PeerId, data: &[u8]) -> Result<(), InboundError> {
        let payload: StateBagPayload =
            decode(data).map_err(|_| InboundError::Malformed("undecodable payload"))?;
        self.apply_inbound(source, &payload.id, &payload.key, &payload.value)
    }

    /// Apply a [`StateBagV2`] update from `source`.
    pub fn handle_packet_v2(&self, source: PeerId, packet: &StateBagV2) -> Result<(), InboundError> {
        self.apply_inbound(source, &packet.state_bag_name, &packet.key, &packet.data)
    }

    fn apply_inbound(
        &self,
        source: PeerId,
        name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), InboundError> {
        if name.is_empty() {
            return Err(InboundError::Malformed("empty bag name"));
        }
        if key.is_empty() {
            return Err(InboundError::Malformed("empty key"));
        }
        if value.is_empty() {
            return Err(InboundError::Malformed("empty value"));
        }

        let bag = match self.bag(name) {
            Some(bag) => bag,
            None => self
                .pre_create_state_bag(name)
                .and_then(|handle| handle.upgrade())
                .ok_or_else(|| InboundError::UnknownBag(name.to_owned()))?,
        };

        if let Some(owner) = bag.owning_peer() {
            if owner != source {
                return Err(InboundError::NotOwner {
                    bag: name.to_owned(),
                    owner,
                    source_peer: source,
                });
            }
        }

        let replicate = self.role() == StateBagRole::Server;
        bag.set_key(Some(source), key, value, replicate);
        Ok(())
    }

    /// Erase expired bags and flush every bag's queued updates.
    pub fn tick(&self) {
        let bags: Vec<Arc<StateBag>> = {
            let mut inner = lock(&self.shared.inner);
            let erase = std::mem::take(&mut inner.erase);
            for id in &erase {
                inner.bags.remove(id);
                inner.pre_created.remove(id);
            }
            if !erase.is_empty() {
                tracing::debug!("Erased {} expired state bags", erase.len());
            }
            inner.bags.values().cloned().collect()
        };
        for bag in bags {
            bag.send_queued_updates();
        }
    }

    /// Drop every bag, target and prefix.
    pub fn reset(&self) {
        *lock(&self.shared.inner) = StoreInner::default();
    }

    /// Number of bags held, expired ones included until the next tick.
    pub fn len(&self) -> usize {
        lock(&self.shared.inner).bags.len()
    }

    /// Whether no bag is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "state_bag_tests.rs"]
mod tests;
