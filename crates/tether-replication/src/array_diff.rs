//! Change detection over fixed-size replicated arrays.
//!
//! Each side keeps the hash of what it last sent per slot and only emits
//! slots whose current hash differs. Clients report their own slots with
//! [`ClientArraySync`]; the server stores them in [`ArrayHandlers`] and
//! fans changes out to every other client.

use std::collections::BTreeMap;
use std::hash::Hasher;

use rustc_hash::{FxHashMap, FxHasher};
use tether_net::{PacketSink, PeerId, send_packet};
use tether_wire::packets::{ArrayUpdate, ClientArrayUpdate, MAX_ARRAY_SLOT};

/// Most array handlers a server hosts.
pub const MAX_ARRAY_HANDLERS: usize = 20;

/// Read access to the slots of one array.
pub trait SlotSource {
    fn slot_count(&self) -> usize;

    /// Content of slot `index`; `None` when empty.
    fn slot(&self, index: usize) -> Option<&[u8]>;
}

impl SlotSource for [Option<Vec<u8>>] {
    fn slot_count(&self) -> usize {
        self.len()
    }

    fn slot(&self, index: usize) -> Option<&[u8]> {
        self.get(index)?.as_deref()
    }
}

impl SlotSource for Vec<Option<Vec<u8>>> {
    fn slot_count(&self) -> usize {
        self.len()
    }

    fn slot(&self, index: usize) -> Option<&[u8]> {
        self.as_slice().slot(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotHash {
    /// Never sent; differs from everything.
    Unsent,
    Empty,
    Content(u64),
}

impl SlotHash {
    fn of(content: Option<&[u8]>) -> Self {
        match content {
            None => SlotHash::Empty,
            Some(bytes) => {
                let mut hasher = FxHasher::default();
                hasher.write(bytes);
                SlotHash::Content(hasher.finish())
            }
        }
    }

    /// Hash of a server slot; the owner is part of the content.
    fn of_owned(slot: Option<&(PeerId, Vec<u8>)>) -> Self {
        match slot {
            None => SlotHash::Empty,
            Some((owner, data)) => {
                let mut hasher = FxHasher::default();
                hasher.write_u16(owner.0);
                hasher.write(data);
                SlotHash::Content(hasher.finish())
            }
        }
    }
}

/// A slot whose content changed since the last tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotChange {
    pub index: u32,
    /// New content; empty when the slot was cleared.
    pub data: Vec<u8>,
}

/// Last-sent hashes for one array.
#[derive(Debug, Clone)]
pub struct ArrayDiff {
    sent: Vec<SlotHash>,
}

impl ArrayDiff {
    /// Diff for `count` slots, all assumed empty on the receiving side.
    pub fn new(count: usize) -> Self {
        Self {
            sent: vec![SlotHash::Empty; count],
        }
    }

    /// Changes since the previous tick; the new hashes become the baseline.
    pub fn tick(&mut self, source: &dyn SlotSource) -> Vec<SlotChange> {
        let count = source.slot_count();
        if count != self.sent.len() {
            self.sent.resize(count, SlotHash::Unsent);
        }

        let mut changes = Vec::new();
        for (index, sent) in self.sent.iter_mut().enumerate() {
            let content = source.slot(index);
            let hash = SlotHash::of(content);
            if hash == *sent {
                continue;
            }
            *sent = hash;
            changes.push(SlotChange {
                index: index as u32,
                data: content.map(<[u8]>::to_vec).unwrap_or_default(),
            });
        }
        changes
    }

    /// Forget what was sent so the next tick reports every slot.
    pub fn invalidate(&mut self) {
        self.sent.fill(SlotHash::Unsent);
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client-side diffs, one per array handler.
#[derive(Debug, Default)]
pub struct ClientArraySync {
    diffs: BTreeMap<u8, ArrayDiff>,
}

impl ClientArraySync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `count` slots for `handler`.
    pub fn register(&mut self, handler: u8, count: usize) {
        self.diffs.insert(handler, ArrayDiff::new(count));
    }

    pub fn unregister(&mut self, handler: u8) {
        self.diffs.remove(&handler);
    }

    /// Update packets for the slots of `handler` that changed.
    ///
    /// Slots larger than [`MAX_ARRAY_SLOT`] cannot be sent and are skipped.
    pub fn tick(&mut self, handler: u8, source: &dyn SlotSource) -> Vec<ClientArrayUpdate> {
        let Some(diff) = self.diffs.get_mut(&handler) else {
            return Vec::new();
        };
        diff.tick(source)
            .into_iter()
            .filter(|change| {
                let fits = change.data.len() <= MAX_ARRAY_SLOT;
                if !fits {
                    tracing::warn!(
                        "Array {} slot {} is {} bytes, not sending",
                        handler,
                        change.index,
                        change.data.len()
                    );
                }
                fits
            })
            .map(|change| ClientArrayUpdate {
                handler,
                index: change.index,
                data: change.data,
            })
            .collect()
    }

    /// Diff `handler` and send the changes to the server.
    pub fn send(&mut self, sink: &dyn PacketSink, handler: u8, source: &dyn SlotSource) -> usize {
        let mut sent = 0;
        for mut update in self.tick(handler, source) {
            if send_packet(sink, PeerId::SERVER, &mut update) {
                sent += 1;
            }
        }
        sent
    }

    /// Resend everything on the next tick, e.g. after reconnecting.
    pub fn invalidate(&mut self) {
        for diff in self.diffs.values_mut() {
            diff.invalidate();
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ArrayHandler {
    element_size: u32,
    slots: Vec<Option<(PeerId, Vec<u8>)>>,
    sent: FxHashMap<PeerId, Vec<SlotHash>>,
}

/// Server-side array storage and per-client change tracking.
#[derive(Debug)]
pub struct ArrayHandlers {
    handlers: Vec<Option<ArrayHandler>>,
}

impl Default for ArrayHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrayHandlers {
    pub fn new() -> Self {
        Self {
            handlers: (0..MAX_ARRAY_HANDLERS).map(|_| None).collect(),
        }
    }

    /// Install handler `id` with `count` slots of at most `element_size`
    /// bytes. Returns `false` when the id or size is out of range.
    pub fn register(&mut self, id: u8, count: u32, element_size: u32) -> bool {
        let Some(entry) = self.handlers.get_mut(usize::from(id)) else {
            return false;
        };
        if element_size as usize > MAX_ARRAY_SLOT {
            return false;
        }
        *entry = Some(ArrayHandler {
            element_size,
            slots: vec![None; count as usize],
            sent: FxHashMap::default(),
        });
        true
    }

    fn handler(&self, id: u8) -> Option<&ArrayHandler> {
        self.handlers.get(usize::from(id))?.as_ref()
    }

    pub fn count(&self, id: u8) -> Option<u32> {
        self.handler(id).map(|h| h.slots.len() as u32)
    }

    pub fn element_size(&self, id: u8) -> Option<u32> {
        self.handler(id).map(|h| h.element_size)
    }

    /// Current content and owner of a slot.
    pub fn slot(&self, id: u8, index: u32) -> Option<(PeerId, &[u8])> {
        let (owner, data) = self.handler(id)?.slots.get(index as usize)?.as_ref()?;
        Some((*owner, data.as_slice()))
    }

    /// Validate and store a client's slot update.
    ///
    /// A slot held by another peer cannot be overwritten; empty data clears
    /// the sender's own slot.
    pub fn read_update(&mut self, peer: PeerId, update: &ClientArrayUpdate) -> bool {
        let Some(handler) = self
            .handlers
            .get_mut(usize::from(update.handler))
            .and_then(Option::as_mut)
        else {
            tracing::debug!("{} updated unknown array handler {}", peer, update.handler);
            return false;
        };
        if update.data.len() > handler.element_size as usize {
            tracing::warn!(
                "{} sent {} bytes for array {} (element size {})",
                peer,
                update.data.len(),
                update.handler,
                handler.element_size
            );
            return false;
        }
        let Some(slot) = handler.slots.get_mut(update.index as usize) else {
            tracing::debug!("{} updated array {} out of range at {}", peer, update.handler, update.index);
            return false;
        };
        if let Some((owner, _)) = slot
            && *owner != peer
        {
            tracing::debug!(
                "{} tried to take array {} slot {} from {}",
                peer,
                update.handler,
                update.index,
                owner
            );
            return false;
        }

        *slot = (!update.data.is_empty()).then(|| (peer, update.data.clone()));
        true
    }

    /// Changes `peer` has not seen yet, excluding its own slots.
    pub fn write_updates(&mut self, peer: PeerId) -> Vec<ArrayUpdate> {
        let mut updates = Vec::new();
        for (id, handler) in self.handlers.iter_mut().enumerate() {
            let Some(handler) = handler else {
                continue;
            };
            let count = handler.slots.len();
            let sent = handler
                .sent
                .entry(peer)
                .or_insert_with(|| vec![SlotHash::Empty; count]);
            for (index, (slot, last)) in handler.slots.iter().zip(sent.iter_mut()).enumerate() {
                let hash = SlotHash::of_owned(slot.as_ref());
                if hash == *last {
                    continue;
                }
                *last = hash;
                let (owner, data) = match slot {
                    Some((owner, data)) => (*owner, data.clone()),
                    None => (PeerId::SERVER, Vec::new()),
                };
                if owner == peer {
                    continue;
                }
                updates.push(ArrayUpdate {
                    handler: id as u8,
                    owner_net_id: owner.0,
                    index: index as u32,
                    data,
                });
            }
        }
        updates
    }

    /// Diff for `peer` and send the changes to it.
    pub fn send_updates(&mut self, sink: &dyn PacketSink, peer: PeerId) -> usize {
        let mut sent = 0;
        for mut update in self.write_updates(peer) {
            if send_packet(sink, peer, &mut update) {
                sent += 1;
            }
        }
        sent
    }

    /// Clear the slots `peer` owned and forget what it was sent.
    pub fn player_has_left(&mut self, peer: PeerId) {
        for handler in self.handlers.iter_mut().flatten() {
            for slot in &mut handler.slots {
                if slot.as_ref().is_some_and(|(owner, _)| *owner == peer) {
                    *slot = None;
                }
            }
            handler.sent.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use tether_net::{Dispatch, Dispatcher, RecordingSink};
    use tether_wire::{Packet, decode_body, encode_packet, peek_tag};

    fn slots(count: usize) -> Vec<Option<Vec<u8>>> {
        vec![None; count]
    }

    #[test]
    fn test_unchanged_ticks_produce_nothing() {
        let mut array = slots(8);
        array[2] = Some(vec![1, 2, 3]);
        let mut diff = ArrayDiff::new(8);
        assert_eq!(diff.tick(&array).len(), 1);
        assert!(diff.tick(&array).is_empty());
        assert!(diff.tick(&array).is_empty());
    }

    #[test]
    fn test_single_change_reports_only_that_slot() {
        let mut array = slots(8);
        array[1] = Some(vec![9]);
        array[5] = Some(vec![8]);
        let mut diff = ArrayDiff::new(8);
        diff.tick(&array);

        array[5] = Some(vec![7]);
        assert_eq!(
            diff.tick(&array),
            vec![SlotChange {
                index: 5,
                data: vec![7]
            }]
        );

        array[1] = None;
        assert_eq!(
            diff.tick(&array),
            vec![SlotChange {
                index: 1,
                data: Vec::new()
            }]
        );
    }

    #[test]
    fn test_invalidate_resends_everything() {
        let array = slots(3);
        let mut diff = ArrayDiff::new(3);
        assert!(diff.tick(&array).is_empty());
        diff.invalidate();
        assert_eq!(diff.tick(&array).len(), 3);
    }

    #[test]
    fn test_client_sync_skips_oversized_slots() {
        let mut sync = ClientArraySync::new();
        sync.register(2, 2);
        let mut array = slots(2);
        array[0] = Some(vec![0; MAX_ARRAY_SLOT + 1]);
        array[1] = Some(vec![1]);
        let updates = sync.tick(2, &array);
        assert_eq!(
            updates,
            vec![ClientArrayUpdate {
                handler: 2,
                index: 1,
                data: vec![1]
            }]
        );
        assert!(sync.tick(9, &array).is_empty());
    }

    #[test]
    fn test_client_update_reaches_server_handler_intact() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let data: Vec<u8> = (0..128).map(|_| rng.random()).collect();

        let wire = RecordingSink::new();
        let mut sync = ClientArraySync::new();
        sync.register(1, 16);
        let mut array = slots(16);
        array[7] = Some(data.clone());
        assert_eq!(sync.send(&wire, 1, &array), 1);

        let mut server: Dispatcher<Vec<(u8, u32, Vec<u8>)>> = Dispatcher::new();
        server
            .register(
                |seen: &mut Vec<(u8, u32, Vec<u8>)>, _peer: PeerId, update: ClientArrayUpdate| {
                    seen.push((update.handler, update.index, update.data));
                },
            )
            .unwrap();

        let mut seen = Vec::new();
        for (peer, bytes) in wire.take() {
            assert_eq!(peer, PeerId::SERVER);
            assert_eq!(server.dispatch(&mut seen, PeerId(3), &bytes), Dispatch::Handled);
        }
        assert_eq!(seen, vec![(1, 7, data)]);
    }

    #[test]
    fn test_server_validates_updates() {
        let mut handlers = ArrayHandlers::new();
        assert!(handlers.register(1, 4, 16));
        assert!(!handlers.register(20, 4, 16));
        assert!(!handlers.register(2, 4, 129));
        assert_eq!(handlers.count(1), Some(4));
        assert_eq!(handlers.element_size(1), Some(16));

        let update = |index, data: Vec<u8>| ClientArrayUpdate {
            handler: 1,
            index,
            data,
        };
        assert!(handlers.read_update(PeerId(1), &update(0, vec![1])));
        assert!(!handlers.read_update(PeerId(1), &update(4, vec![1])));
        assert!(!handlers.read_update(PeerId(1), &update(1, vec![0; 17])));
        assert!(!handlers.read_update(PeerId(2), &update(0, vec![2])));
        assert!(!handlers.read_update(
            PeerId(1),
            &ClientArrayUpdate {
                handler: 3,
                index: 0,
                data: vec![]
            }
        ));
        assert_eq!(handlers.slot(1, 0), Some((PeerId(1), &[1u8][..])));

        // the owner may clear its slot, after which anyone may take it
        assert!(handlers.read_update(PeerId(1), &update(0, vec![])));
        assert_eq!(handlers.slot(1, 0), None);
        assert!(handlers.read_update(PeerId(2), &update(0, vec![2])));
    }

    #[test]
    fn test_server_fans_out_without_echo() {
        let mut handlers = ArrayHandlers::new();
        handlers.register(0, 4, 8);
        let update = ClientArrayUpdate {
            handler: 0,
            index: 2,
            data: vec![5, 5],
        };
        handlers.read_update(PeerId(1), &update);

        assert!(handlers.write_updates(PeerId(1)).is_empty());
        let to_other = handlers.write_updates(PeerId(2));
        assert_eq!(
            to_other,
            vec![ArrayUpdate {
                handler: 0,
                owner_net_id: 1,
                index: 2,
                data: vec![5, 5]
            }]
        );
        assert!(handlers.write_updates(PeerId(2)).is_empty());

        handlers.player_has_left(PeerId(1));
        assert_eq!(handlers.slot(0, 2), None);
        let cleared = handlers.write_updates(PeerId(2));
        assert_eq!(cleared.len(), 1);
        assert!(cleared[0].data.is_empty());
    }

    #[test]
    fn test_departed_owner_slots_clear_for_others() {
        let mut handlers = ArrayHandlers::new();
        handlers.register(1, 4, 8);
        let (a, b) = (PeerId(1), PeerId(2));
        handlers.read_update(a, &ClientArrayUpdate { handler: 1, index: 3, data: vec![9; 4] });
        assert!(handlers.write_updates(a).is_empty());
        assert_eq!(handlers.write_updates(b).len(), 1);
        assert_eq!(handlers.handler(1).unwrap().sent.len(), 2);

        handlers.player_has_left(a);
        assert_eq!(handlers.handler(1).unwrap().sent.len(), 1);
        assert!(!handlers.handler(1).unwrap().sent.contains_key(&a));
        assert_eq!(
            handlers.write_updates(b),
            vec![ArrayUpdate {
                handler: 1,
                owner_net_id: PeerId::SERVER.0,
                index: 3,
                data: vec![]
            }]
        );
        assert!(handlers.write_updates(b).is_empty());
    }

    #[test]
    fn test_new_owner_with_same_bytes_is_sent() {
        let mut handlers = ArrayHandlers::new();
        handlers.register(1, 4, 8);
        let (a, b, c) = (PeerId(1), PeerId(2), PeerId(3));
        handlers.read_update(a, &ClientArrayUpdate { handler: 1, index: 0, data: vec![7; 4] });
        assert_eq!(handlers.write_updates(c).len(), 1);

        // the slot changes hands between two diffs, bytes unchanged
        handlers.player_has_left(a);
        handlers.read_update(b, &ClientArrayUpdate { handler: 1, index: 0, data: vec![7; 4] });
        assert_eq!(
            handlers.write_updates(c),
            vec![ArrayUpdate {
                handler: 1,
                owner_net_id: 2,
                index: 0,
                data: vec![7; 4]
            }]
        );
    }

    #[test]
    fn test_send_updates_encodes_packets() {
        let mut handlers = ArrayHandlers::new();
        handlers.register(3, 2, 4);
        handlers.read_update(
            PeerId(5),
            &ClientArrayUpdate {
                handler: 3,
                index: 1,
                data: vec![1, 2, 3, 4],
            },
        );
        let wire = RecordingSink::new();
        assert_eq!(handlers.send_updates(&wire, PeerId(6)), 1);
        let sent = wire.take();
        assert_eq!(sent[0].0, PeerId(6));
        assert_eq!(peek_tag(&sent[0].1), Some(ArrayUpdate::TAG));
        let update = decode_body::<ArrayUpdate>(&sent[0].1).unwrap();
        assert_eq!(update.owner_net_id, 5);

        // round trip through encode_packet for the same value
        let mut again = update.clone();
        assert_eq!(encode_packet(&mut again).unwrap(), sent[0].1);
    }
}
