//! Frame reconciliation between the server's object stream and a client.
//!
//! The server numbers every outbound sync frame and splits it into
//! fragments. [`FrameReceiver`] watches the indices arriving on the client
//! and reports what it missed; [`FrameSender`] keeps a bounded history of
//! which objects went out in which frame so acks and nacks can be mapped
//! back to per-object state.
//!
//! Fragments are numbered from 1 within a frame. Frame 0 is never sent and
//! marks "nothing received yet".

use std::collections::{HashMap, VecDeque};

use tether_net::{PacketSink, PeerId, send_packet};
use tether_wire::packets::{
    ClientGameStateAck, ClientGameStateNAck, IgnoreEntry, IgnoreList, MAX_FRAME_LIST,
    MissingFrames, RecreateList,
};

/// How the client acknowledges sync frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStyle {
    /// Positive ack of every completed frame; the server waits for it.
    Arq,
    /// Negative ack only when something was lost.
    #[default]
    Nak,
}

// ---------------------------------------------------------------------------
// Frame index
// ---------------------------------------------------------------------------

/// Position of one fragment in the sync stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameIndex {
    /// Frame number, 56 bits.
    pub frame: u64,
    /// Fragment number within the frame, 7 bits.
    pub fragment: u8,
    /// Whether this is the frame's final fragment.
    pub last_fragment: bool,
}

impl FrameIndex {
    /// Largest representable frame number.
    pub const MAX_FRAME: u64 = (1 << 56) - 1;
    /// Largest representable fragment number.
    pub const MAX_FRAGMENT: u8 = 0x7f;

    pub fn new(frame: u64, fragment: u8, last_fragment: bool) -> Self {
        Self {
            frame: frame & Self::MAX_FRAME,
            fragment: fragment & Self::MAX_FRAGMENT,
            last_fragment,
        }
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            frame: raw >> 8,
            fragment: ((raw >> 1) & u64::from(Self::MAX_FRAGMENT)) as u8,
            last_fragment: raw & 1 != 0,
        }
    }

    pub fn to_u64(self) -> u64 {
        ((self.frame & Self::MAX_FRAME) << 8)
            | (u64::from(self.fragment & Self::MAX_FRAGMENT) << 1)
            | u64::from(self.last_fragment)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Outcome of [`FrameReceiver::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameObservation {
    /// The fragment follows the previous one.
    InOrder,
    /// The fragment is usable but data before it was lost.
    Missing(MissingFrames),
    /// The fragment repeats a finished frame and must be discarded.
    Rejected,
}

/// Reply the client owes the server after processing a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameReply {
    Ack(ClientGameStateAck),
    Nack(ClientGameStateNAck),
}

impl FrameReply {
    /// Send the reply to the server.
    pub fn send(self, sink: &dyn PacketSink) -> bool {
        match self {
            Self::Ack(mut ack) => send_packet(sink, PeerId::SERVER, &mut ack),
            Self::Nack(mut nack) => send_packet(sink, PeerId::SERVER, &mut nack),
        }
    }
}

/// Client-side tracker of received sync frames.
#[derive(Debug, Default)]
pub struct FrameReceiver {
    last: Option<FrameIndex>,
    missing: Option<MissingFrames>,
    ignore: Vec<IgnoreEntry>,
    recreate: Vec<u16>,
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the last accepted fragment.
    pub fn last(&self) -> Option<FrameIndex> {
        self.last
    }

    /// Check `index` against the previous fragment and remember it.
    pub fn observe(&mut self, index: FrameIndex) -> FrameObservation {
        let Some(last) = self.last.filter(|last| last.frame != 0) else {
            self.last = Some(index);
            return FrameObservation::InOrder;
        };

        let gap = if last.frame == index.frame {
            if last.last_fragment && index.last_fragment {
                tracing::debug!("Rejecting repeated final fragment of frame {}", index.frame);
                return FrameObservation::Rejected;
            }
            (u16::from(last.fragment) + 1 != u16::from(index.fragment))
                .then_some(MissingFrames { first: index.frame, last: index.frame })
        } else if last.frame.wrapping_add(1) != index.frame {
            Some(MissingFrames {
                first: last.frame.wrapping_add(1),
                last: index.frame.wrapping_sub(1),
            })
        } else if last.last_fragment && index.fragment != 1 {
            Some(MissingFrames { first: last.frame.wrapping_add(1), last: index.frame })
        } else if !last.last_fragment {
            Some(MissingFrames { first: last.frame, last: last.frame })
        } else {
            None
        };

        self.last = Some(index);
        match gap {
            Some(range) => {
                tracing::trace!("Missing frames {}..={}", range.first, range.last);
                self.missing = Some(match self.missing {
                    Some(prev) => MissingFrames {
                        first: prev.first.min(range.first),
                        last: prev.last.max(range.last),
                    },
                    None => range,
                });
                FrameObservation::Missing(range)
            }
            None => FrameObservation::InOrder,
        }
    }

    /// The client already holds `object` as of `last_frame`.
    pub fn ignore(&mut self, object_id: u16, last_frame: u64) {
        self.ignore.push(IgnoreEntry { object_id, last_frame });
    }

    /// The client lost `object` and needs it created again.
    pub fn recreate(&mut self, object_id: u16) {
        if !self.recreate.contains(&object_id) {
            self.recreate.push(object_id);
        }
    }

    /// Hints not yet sent.
    pub fn pending_hints(&self) -> (usize, usize) {
        (self.ignore.len(), self.recreate.len())
    }

    /// Build the reply owed after the last observed fragment, if any.
    ///
    /// At most [`MAX_FRAME_LIST`] ignore and recreate entries go into one
    /// reply; the rest wait for the next one.
    pub fn finish(&mut self, style: SyncStyle) -> Option<FrameReply> {
        let last = self.last?;
        match style {
            SyncStyle::Arq => {
                self.missing = None;
                if !last.last_fragment {
                    return None;
                }
                Some(FrameReply::Ack(ClientGameStateAck {
                    frame_index: last.frame,
                    ignore: IgnoreList(take_capped(&mut self.ignore)),
                    recreate: RecreateList(take_capped(&mut self.recreate)),
                }))
            }
            SyncStyle::Nak => {
                if self.missing.is_none() && self.ignore.is_empty() && self.recreate.is_empty() {
                    return None;
                }
                Some(FrameReply::Nack(ClientGameStateNAck::new(
                    last.frame,
                    self.missing.take(),
                    take_capped(&mut self.ignore),
                    take_capped(&mut self.recreate),
                )))
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn take_capped<T>(list: &mut Vec<T>) -> Vec<T> {
    let rest = list.split_off(list.len().min(MAX_FRAME_LIST));
    std::mem::replace(list, rest)
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// How an object should go out in the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// The client already has the latest state.
    Skip,
    /// Send the changed state.
    Update,
    /// Send the full creation data.
    Create,
}

#[derive(Debug, Clone, Copy, Default)]
struct ObjectAck {
    /// Latest frame the client is known (or, under NAK, assumed) to hold.
    acked_frame: Option<u64>,
    needs_create: bool,
}

/// Server-side per-client frame bookkeeping.
#[derive(Debug)]
pub struct FrameSender {
    style: SyncStyle,
    max_history: usize,
    next_frame: u64,
    last_acked: u64,
    history: VecDeque<(u64, Vec<(u16, SendKind)>)>,
    objects: HashMap<u16, ObjectAck>,
}

impl FrameSender {
    pub fn new(style: SyncStyle, max_history: usize) -> Self {
        Self {
            style,
            max_history: max_history.max(1),
            next_frame: 1,
            last_acked: 0,
            history: VecDeque::new(),
            objects: HashMap::new(),
        }
    }

    pub fn style(&self) -> SyncStyle {
        self.style
    }

    /// Number the next [`begin_frame`](Self::begin_frame) will return.
    pub fn next_frame(&self) -> u64 {
        self.next_frame
    }

    /// Latest frame the client acknowledged.
    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// Allocate the next frame number.
    pub fn begin_frame(&mut self) -> u64 {
        let frame = self.next_frame;
        self.next_frame = if frame >= FrameIndex::MAX_FRAME { 1 } else { frame + 1 };

        self.history.push_back((frame, Vec::new()));
        while self.history.len() > self.max_history {
            if let Some((dropped, _)) = self.history.pop_front() {
                tracing::trace!("Frame {} fell out of the sync history", dropped);
            }
        }
        frame
    }

    /// Index for fragment `fragment` (from 1) of `frame`.
    pub fn fragment_index(&self, frame: u64, fragment: u8, last: bool) -> FrameIndex {
        FrameIndex::new(frame, fragment, last)
    }

    /// Whether a new frame may start. Under ARQ the previous frame must have
    /// been acknowledged first.
    pub fn can_advance(&self) -> bool {
        match self.style {
            SyncStyle::Nak => true,
            SyncStyle::Arq => self.next_frame == 1 || self.last_acked + 1 >= self.next_frame,
        }
    }

    /// Note that `object` went out in `frame`.
    pub fn record_sent(&mut self, frame: u64, object: u16, kind: SendKind) {
        if kind == SendKind::Skip {
            return;
        }
        if let Some((_, sent)) = self.history.iter_mut().rev().find(|(f, _)| *f == frame) {
            sent.push((object, kind));
        }
        let state = self.objects.entry(object).or_default();
        if kind == SendKind::Create {
            state.needs_create = false;
            if self.style == SyncStyle::Arq {
                state.acked_frame = None;
            }
        }
        if self.style == SyncStyle::Nak {
            state.acked_frame = Some(frame);
        }
    }

    /// Process a positive ack.
    pub fn handle_ack(&mut self, ack: &ClientGameStateAck) {
        let frame = ack.frame_index;
        while let Some((sent_frame, _)) = self.history.front() {
            if *sent_frame > frame {
                break;
            }
            let Some((sent_frame, sent)) = self.history.pop_front() else {
                break;
            };
            for (object, _) in sent {
                let state = self.objects.entry(object).or_default();
                state.acked_frame = Some(state.acked_frame.map_or(sent_frame, |f| f.max(sent_frame)));
            }
        }
        self.last_acked = self.last_acked.max(frame);
        self.apply_hints(&ack.ignore.0, &ack.recreate.0);
    }

    /// Process a negative ack.
    pub fn handle_nack(&mut self, nack: &ClientGameStateNAck) {
        if let Some(missing) = nack.missing {
            let oldest = self.history.front().map(|(frame, _)| *frame);
            if oldest.is_none_or(|oldest| missing.first < oldest) {
                // part of the range is no longer in history, resend everything
                tracing::debug!(
                    "Missing frames {}..={} predate the sync history, resetting all objects",
                    missing.first,
                    missing.last
                );
                for state in self.objects.values_mut() {
                    state.acked_frame = None;
                }
            }
            for (frame, sent) in &self.history {
                if *frame < missing.first || *frame > missing.last {
                    continue;
                }
                for (object, kind) in sent {
                    let state = self.objects.entry(*object).or_default();
                    state.acked_frame = None;
                    if *kind == SendKind::Create {
                        state.needs_create = true;
                    }
                }
            }
        }
        self.last_acked = self.last_acked.max(nack.frame_index);

        let ignore = nack.ignore.as_ref().map(|l| l.0.as_slice()).unwrap_or_default();
        let recreate = nack.recreate.as_ref().map(|l| l.0.as_slice()).unwrap_or_default();
        self.apply_hints(ignore, recreate);
    }

    fn apply_hints(&mut self, ignore: &[IgnoreEntry], recreate: &[u16]) {
        for entry in ignore {
            let state = self.objects.entry(entry.object_id).or_default();
            state.needs_create = false;
            state.acked_frame = (entry.last_frame != 0).then_some(entry.last_frame);
        }
        for object in recreate {
            let state = self.objects.entry(*object).or_default();
            state.needs_create = true;
            state.acked_frame = None;
        }
    }

    /// Decide how `object`, last changed in `last_changed_frame`, goes out.
    pub fn send_kind(&self, object: u16, last_changed_frame: u64) -> SendKind {
        match self.objects.get(&object) {
            None => SendKind::Create,
            Some(state) if state.needs_create => SendKind::Create,
            Some(state) => match state.acked_frame {
                Some(acked) if acked >= last_changed_frame => SendKind::Skip,
                _ => SendKind::Update,
            },
        }
    }

    /// Forget an object that was deleted.
    pub fn remove_object(&mut self, object: u16) {
        self.objects.remove(&object);
    }

    /// Frames still waiting for acknowledgement or loss reports.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_net::RecordingSink;
    use tether_wire::decode_body;

    fn idx(frame: u64, fragment: u8, last: bool) -> FrameIndex {
        FrameIndex::new(frame, fragment, last)
    }

    #[test]
    fn test_frame_index_packing() {
        let index = idx(0x1234, 5, true);
        assert_eq!(index.to_u64(), (0x1234 << 8) | (5 << 1) | 1);
        assert_eq!(FrameIndex::from_u64(index.to_u64()), index);
        assert_eq!(idx(FrameIndex::MAX_FRAME + 1, 0x80, false), idx(0, 0, false));
    }

    #[test]
    fn test_in_order_stream_reports_nothing() {
        let mut rx = FrameReceiver::new();
        assert_eq!(rx.observe(idx(1, 1, false)), FrameObservation::InOrder);
        assert_eq!(rx.observe(idx(1, 2, true)), FrameObservation::InOrder);
        assert_eq!(rx.observe(idx(2, 1, true)), FrameObservation::InOrder);
        assert_eq!(rx.finish(SyncStyle::Nak), None);
    }

    #[test]
    fn test_skipped_fragment_in_same_frame() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(7, 1, false));
        assert_eq!(
            rx.observe(idx(7, 3, true)),
            FrameObservation::Missing(MissingFrames { first: 7, last: 7 })
        );
    }

    #[test]
    fn test_frame_gap() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(3, 1, true));
        assert_eq!(
            rx.observe(idx(6, 1, true)),
            FrameObservation::Missing(MissingFrames { first: 4, last: 5 })
        );
    }

    #[test]
    fn test_next_frame_missing_first_fragment() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(3, 1, true));
        assert_eq!(
            rx.observe(idx(4, 2, true)),
            FrameObservation::Missing(MissingFrames { first: 4, last: 4 })
        );
    }

    #[test]
    fn test_previous_frame_never_finished() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(3, 1, false));
        assert_eq!(
            rx.observe(idx(4, 1, true)),
            FrameObservation::Missing(MissingFrames { first: 3, last: 3 })
        );
    }

    #[test]
    fn test_repeated_last_fragment_rejected() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(3, 1, true));
        assert_eq!(rx.observe(idx(3, 1, true)), FrameObservation::Rejected);
        assert_eq!(rx.last(), Some(idx(3, 1, true)));
    }

    #[test]
    fn test_nak_reply_merges_ranges_and_clears() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(1, 1, true));
        rx.observe(idx(3, 1, true));
        rx.observe(idx(6, 1, true));
        rx.recreate(12);

        let Some(FrameReply::Nack(nack)) = rx.finish(SyncStyle::Nak) else {
            panic!("expected a nack");
        };
        assert_eq!(nack.frame_index, 6);
        assert_eq!(nack.missing, Some(MissingFrames { first: 2, last: 5 }));
        assert_eq!(nack.recreate, Some(RecreateList(vec![12])));
        assert_eq!(nack.ignore, None);
        assert_eq!(
            nack.flags,
            ClientGameStateNAck::FLAG_MISSING
                | ClientGameStateNAck::FLAG_RECREATE
                | ClientGameStateNAck::FLAG_EXTENDED
        );
        assert_eq!(rx.finish(SyncStyle::Nak), None);
    }

    #[test]
    fn test_arq_acks_only_last_fragment() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(1, 1, false));
        rx.ignore(4, 0);
        assert_eq!(rx.finish(SyncStyle::Arq), None);

        rx.observe(idx(1, 2, true));
        let Some(FrameReply::Ack(ack)) = rx.finish(SyncStyle::Arq) else {
            panic!("expected an ack");
        };
        assert_eq!(ack.frame_index, 1);
        assert_eq!(ack.ignore.0, vec![IgnoreEntry { object_id: 4, last_frame: 0 }]);
    }

    #[test]
    fn test_hint_lists_carry_over() {
        let mut rx = FrameReceiver::new();
        rx.observe(idx(1, 1, true));
        for object in 0..300u16 {
            rx.recreate(object);
        }
        let Some(FrameReply::Nack(first)) = rx.finish(SyncStyle::Nak) else {
            panic!("expected a nack");
        };
        assert_eq!(first.recreate.map(|l| l.0.len()), Some(MAX_FRAME_LIST));
        assert_eq!(rx.pending_hints(), (0, 300 - MAX_FRAME_LIST));

        let Some(FrameReply::Nack(second)) = rx.finish(SyncStyle::Nak) else {
            panic!("expected a nack");
        };
        assert_eq!(second.recreate.map(|l| l.0[0]), Some(MAX_FRAME_LIST as u16));
    }

    #[test]
    fn test_reply_goes_to_server() {
        let sink = RecordingSink::new();
        let mut rx = FrameReceiver::new();
        rx.observe(idx(2, 1, true));
        rx.finish(SyncStyle::Arq).unwrap().send(&sink);

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PeerId::SERVER);
        let ack = decode_body::<ClientGameStateAck>(&sent[0].1).unwrap();
        assert_eq!(ack.frame_index, 2);
    }

    #[test]
    fn test_arq_sender_waits_for_ack() {
        let mut tx = FrameSender::new(SyncStyle::Arq, 16);
        assert!(tx.can_advance());
        let frame = tx.begin_frame();
        assert_eq!(tx.send_kind(9, frame), SendKind::Create);
        tx.record_sent(frame, 9, SendKind::Create);
        assert!(!tx.can_advance());
        assert_eq!(tx.send_kind(9, frame), SendKind::Update);

        tx.handle_ack(&ClientGameStateAck { frame_index: frame, ..Default::default() });
        assert!(tx.can_advance());
        assert_eq!(tx.send_kind(9, frame), SendKind::Skip);
        assert_eq!(tx.send_kind(9, frame + 1), SendKind::Update);
        assert_eq!(tx.history_len(), 0);
    }

    #[test]
    fn test_nak_sender_resets_missing_frames() {
        let mut tx = FrameSender::new(SyncStyle::Nak, 16);
        let f1 = tx.begin_frame();
        tx.record_sent(f1, 1, SendKind::Create);
        let f2 = tx.begin_frame();
        tx.record_sent(f2, 2, SendKind::Create);
        tx.record_sent(f2, 1, SendKind::Update);
        assert_eq!(tx.send_kind(1, f2), SendKind::Skip);

        tx.handle_nack(&ClientGameStateNAck::new(
            f2,
            Some(MissingFrames { first: f2, last: f2 }),
            Vec::new(),
            Vec::new(),
        ));
        assert_eq!(tx.send_kind(1, f1), SendKind::Update);
        assert_eq!(tx.send_kind(2, f2), SendKind::Create);
    }

    #[test]
    fn test_hints_override_state() {
        let mut tx = FrameSender::new(SyncStyle::Nak, 16);
        let f1 = tx.begin_frame();
        tx.record_sent(f1, 1, SendKind::Create);
        tx.handle_nack(&ClientGameStateNAck::new(
            f1,
            None,
            vec![IgnoreEntry { object_id: 5, last_frame: 40 }],
            vec![1],
        ));
        assert_eq!(tx.send_kind(1, f1), SendKind::Create);
        assert_eq!(tx.send_kind(5, 40), SendKind::Skip);
        assert_eq!(tx.send_kind(5, 41), SendKind::Update);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tx = FrameSender::new(SyncStyle::Nak, 2);
        for object in 0..4u16 {
            let frame = tx.begin_frame();
            tx.record_sent(frame, object, SendKind::Create);
        }
        assert_eq!(tx.history_len(), 2);

        tx.handle_nack(&ClientGameStateNAck::new(
            4,
            Some(MissingFrames { first: 1, last: 1 }),
            Vec::new(),
            Vec::new(),
        ));
        for object in 0..4u16 {
            assert_eq!(tx.send_kind(object, 1), SendKind::Update);
        }
    }
}
