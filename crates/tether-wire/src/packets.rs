//! Packet schemas exchanged between client and server.
//!
//! Each struct is the body of one tagged packet; the tag is the hash of
//! [`Packet::NAME`]. Field order in `process` is the wire order.

use static_assertions::const_assert;

use crate::{Component, Mode, Packet, Prefix, SizeOption, Stream, WireError};

// ---------------------------------------------------------------------------
// State bags
// ---------------------------------------------------------------------------

/// Legacy state bag update: an opaque, self-delimiting payload.
///
/// The payload is `u16 len+1, id, 0, u16 len+1, key, 0, value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBag {
    /// Encoded bag id, key and value.
    pub data: Vec<u8>,
}

impl StateBag {
    /// Largest accepted payload.
    pub const MAX_DATA: usize = 131_072;
}

impl Component for StateBag {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.bytes(&mut self.data, SizeOption::rest_between(0, Self::MAX_DATA))
    }
}

impl Packet for StateBag {
    const NAME: &'static str = "msgStateBag";
}

/// Decoded content of a legacy [`StateBag`] payload.
///
/// Id and key are each written as a big-endian `u16` holding `len + 1`, the
/// bytes, and a terminating zero; the value takes the rest of the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBagPayload {
    /// Bag id.
    pub id: String,
    /// Key within the bag.
    pub key: String,
    /// Serialized value.
    pub value: Vec<u8>,
}

fn terminated_string<S: Stream>(s: &mut S, value: &mut String) -> Result<(), WireError> {
    let mut len_plus_one = match s.mode() {
        Mode::Encode => {
            u16::try_from(value.len() + 1).map_err(|_| WireError::CapacityExceeded {
                len: value.len(),
                min: 0,
                max: u16::MAX as usize - 1,
            })?
        }
        _ => 0,
    };
    s.int_be(&mut len_plus_one)?;
    if s.mode() == Mode::Decode && len_plus_one == 0 {
        return Err(WireError::CountOutOfRange {
            count: 0,
            min: 1,
            max: u16::MAX as usize,
        });
    }
    s.string(value, SizeOption::fixed(usize::from(len_plus_one.saturating_sub(1))))?;
    let mut terminator = 0u8;
    s.int(&mut terminator)
}

impl Component for StateBagPayload {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        terminated_string(s, &mut self.id)?;
        terminated_string(s, &mut self.key)?;
        s.bytes(&mut self.value, SizeOption::rest())
    }
}

/// State bag update with explicit name, key and value fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBagV2 {
    /// Bag id, e.g. `entity:12`.
    pub state_bag_name: String,
    /// Key within the bag.
    pub key: String,
    /// Serialized value; a leading `0xC0` deletes the key.
    pub data: Vec<u8>,
}

impl StateBagV2 {
    /// Longest bag name.
    pub const MAX_NAME: usize = 128;
    /// Longest key.
    pub const MAX_KEY: usize = 512;
    /// Longest value.
    pub const MAX_DATA: usize = 4096;
}

impl Component for StateBagV2 {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.string(&mut self.state_bag_name, SizeOption::area(1, Self::MAX_NAME))?;
        s.string(&mut self.key, SizeOption::area(1, Self::MAX_KEY))?;
        s.bytes(&mut self.data, SizeOption::rest_between(1, Self::MAX_DATA))
    }
}

impl Packet for StateBagV2 {
    const NAME: &'static str = "msgStateBagV2";
}

// ---------------------------------------------------------------------------
// Array updates
// ---------------------------------------------------------------------------

/// Largest encoded array slot.
pub const MAX_ARRAY_SLOT: usize = 128;

/// Server to client: one changed slot of a replicated array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrayUpdate {
    /// Array handler id.
    pub handler: u8,
    /// Net id of the peer that owns the slot.
    pub owner_net_id: u16,
    /// Slot index.
    pub index: u32,
    /// Slot content; empty marks the slot as cleared.
    pub data: Vec<u8>,
}

impl Component for ArrayUpdate {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.handler)?;
        s.int(&mut self.owner_net_id)?;
        s.int(&mut self.index)?;
        s.bytes(
            &mut self.data,
            SizeOption::prefixed(Prefix::U32, 0, MAX_ARRAY_SLOT),
        )
    }
}

impl Packet for ArrayUpdate {
    const NAME: &'static str = "msgArrayUpdate";
}

/// Client to server: one locally changed slot of a replicated array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientArrayUpdate {
    /// Array handler id.
    pub handler: u8,
    /// Slot index.
    pub index: u32,
    /// Slot content; empty marks the slot as cleared.
    pub data: Vec<u8>,
}

impl Component for ClientArrayUpdate {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.handler)?;
        s.int(&mut self.index)?;
        s.bytes(&mut self.data, SizeOption::area(0, MAX_ARRAY_SLOT))
    }
}

impl Packet for ClientArrayUpdate {
    const NAME: &'static str = "msgClientArrayUpdate";
}

// ---------------------------------------------------------------------------
// Game events
// ---------------------------------------------------------------------------

/// Largest event payload that fits a single packet.
pub const MAX_EVENT_DATA: usize = 1025;

/// Most target players a single event can address.
pub const MAX_EVENT_TARGETS: usize = u8::MAX as usize;

/// Game event addressed by name hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientNetGameEventV2 {
    /// Net ids the event is meant for.
    pub target_players: Vec<u16>,
    /// Hash of the event kind name.
    pub event_name_hash: u32,
    /// Per-sender event id.
    pub event_id: u16,
    /// Whether this is the reply to an earlier event.
    pub is_reply: bool,
    /// Event payload.
    pub data: Vec<u8>,
}

impl Component for ClientNetGameEventV2 {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.array(
            &mut self.target_players,
            SizeOption::area(0, MAX_EVENT_TARGETS),
        )?;
        s.int(&mut self.event_name_hash)?;
        s.int(&mut self.event_id)?;
        s.boolean(&mut self.is_reply)?;
        s.bytes(&mut self.data, SizeOption::rest_between(0, MAX_EVENT_DATA))
    }
}

impl Packet for ClientNetGameEventV2 {
    const NAME: &'static str = "msgNetGameEventV2";
}

/// Game event addressed by the legacy numeric type index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientNetGameEvent {
    /// Net ids the event is meant for.
    pub target_players: Vec<u16>,
    /// Legacy event type index.
    pub event_type: u16,
    /// Per-sender event id.
    pub event_id: u16,
    /// Whether this is the reply to an earlier event.
    pub is_reply: bool,
    /// Event payload.
    pub data: Vec<u8>,
}

impl Component for ClientNetGameEvent {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.array(
            &mut self.target_players,
            SizeOption::area(0, MAX_EVENT_TARGETS),
        )?;
        s.int(&mut self.event_type)?;
        s.int(&mut self.event_id)?;
        s.boolean(&mut self.is_reply)?;
        s.bytes(&mut self.data, SizeOption::rest_between(0, MAX_EVENT_DATA))
    }
}

impl Packet for ClientNetGameEvent {
    const NAME: &'static str = "msgNetGameEvent";
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// First-generation reassembly fragment.
///
/// Carries no fragment index: fragments are applied in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassembledEvent {
    /// Low half of the event id.
    pub event_id_lo: u32,
    /// High half of the event id.
    pub event_id_hi: u32,
    /// Number of fragments in the event.
    pub total_packets: u32,
    /// Fragment bytes.
    pub data: Vec<u8>,
}

impl ReassembledEvent {
    /// Payload bytes per fragment.
    pub const FRAGMENT_SIZE: usize = 1023;
    /// Bits used for the fragment count.
    pub const PACKET_SIZE_BITS: u32 = 17;
    /// Bits needed to express a fragment length.
    pub const FRAGMENT_SIZE_BITS: u32 = 10;
    /// Largest payload the scheme can carry.
    pub const MAX_PACKET_SIZE: usize = Self::FRAGMENT_SIZE << Self::PACKET_SIZE_BITS;

    /// Full 64-bit event id.
    pub fn event_id(&self) -> u64 {
        (u64::from(self.event_id_hi) << 32) | u64::from(self.event_id_lo)
    }

    /// Split `id` into the two wire halves.
    pub fn set_event_id(&mut self, id: u64) {
        self.event_id_lo = id as u32;
        self.event_id_hi = (id >> 32) as u32;
    }
}

const_assert!(ReassembledEvent::FRAGMENT_SIZE <= 1 << ReassembledEvent::FRAGMENT_SIZE_BITS);

impl Component for ReassembledEvent {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.event_id_lo)?;
        s.int(&mut self.event_id_hi)?;
        s.bits(
            &mut self.total_packets,
            SizeOption::bits(Self::PACKET_SIZE_BITS),
        )?;
        s.bytes(&mut self.data, SizeOption::area(0, Self::FRAGMENT_SIZE))
    }
}

impl Packet for ReassembledEvent {
    const NAME: &'static str = "msgReassembledEvent";
}

/// Second-generation reassembly fragment; empty data is an acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassembledEventV2 {
    /// Sender-assigned event id.
    pub event_id: u64,
    /// Index of this fragment.
    pub packet_idx: u16,
    /// Number of fragments in the event.
    pub total_packets: u16,
    /// Fragment bytes, empty for an ack.
    pub data: Vec<u8>,
}

impl ReassembledEventV2 {
    /// Payload bytes per fragment.
    pub const FRAGMENT_SIZE: usize = 2047;
    /// Bits used for fragment indices.
    pub const PACKET_SIZE_BITS: u32 = 16;
    /// Largest payload the scheme can carry.
    pub const MAX_PACKET_SIZE: usize = Self::FRAGMENT_SIZE << Self::PACKET_SIZE_BITS;

    /// Whether this fragment only acknowledges `packet_idx`.
    pub fn is_ack(&self) -> bool {
        self.data.is_empty()
    }
}

impl Component for ReassembledEventV2 {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.event_id)?;
        s.int(&mut self.packet_idx)?;
        s.int(&mut self.total_packets)?;
        s.bytes(&mut self.data, SizeOption::area(0, Self::FRAGMENT_SIZE))
    }
}

impl Packet for ReassembledEventV2 {
    const NAME: &'static str = "msgReassembledEventV2";
}

// ---------------------------------------------------------------------------
// Frame acknowledgement
// ---------------------------------------------------------------------------

/// Most entries a single ignore or recreate list can carry.
pub const MAX_FRAME_LIST: usize = u8::MAX as usize;

/// "I already have this object as of `last_frame`."
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoreEntry {
    /// Object id.
    pub object_id: u16,
    /// Last frame the receiver holds for the object (0 for none).
    pub last_frame: u64,
}

impl Component for IgnoreEntry {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.object_id)?;
        s.int(&mut self.last_frame)
    }
}

/// Count-prefixed list of [`IgnoreEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList(pub Vec<IgnoreEntry>);

impl Component for IgnoreList {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.array(&mut self.0, SizeOption::area(0, MAX_FRAME_LIST))
    }
}

/// Count-prefixed list of object ids the receiver lost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecreateList(pub Vec<u16>);

impl Component for RecreateList {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.array(&mut self.0, SizeOption::area(0, MAX_FRAME_LIST))
    }
}

/// Inclusive range of frames the receiver never saw completely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissingFrames {
    /// First missing frame.
    pub first: u64,
    /// Last missing frame.
    pub last: u64,
}

impl Component for MissingFrames {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.first)?;
        s.int(&mut self.last)
    }
}

/// Negative acknowledgement sent under the NAK sync style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientGameStateNAck {
    /// Presence flags, see the `FLAG_*` constants.
    pub flags: u8,
    /// Frame the reply refers to.
    pub frame_index: u64,
    /// Missing frame range, present with [`FLAG_MISSING`](Self::FLAG_MISSING).
    pub missing: Option<MissingFrames>,
    /// Present with [`FLAG_IGNORE`](Self::FLAG_IGNORE).
    pub ignore: Option<IgnoreList>,
    /// Present with [`FLAG_RECREATE`](Self::FLAG_RECREATE).
    pub recreate: Option<RecreateList>,
}

impl ClientGameStateNAck {
    /// A missing-frame range follows.
    pub const FLAG_MISSING: u8 = 1 << 0;
    /// An ignore list follows.
    pub const FLAG_IGNORE: u8 = 1 << 1;
    /// A recreate list follows.
    pub const FLAG_RECREATE: u8 = 1 << 2;
    /// Set by every peer that writes 64-bit last-frame values.
    pub const FLAG_EXTENDED: u8 = 1 << 3;

    /// Build a NAck whose flags match the parts supplied.
    pub fn new(
        frame_index: u64,
        missing: Option<MissingFrames>,
        ignore: Vec<IgnoreEntry>,
        recreate: Vec<u16>,
    ) -> Self {
        let mut flags = Self::FLAG_EXTENDED;
        if missing.is_some() {
            flags |= Self::FLAG_MISSING;
        }
        if !ignore.is_empty() {
            flags |= Self::FLAG_IGNORE;
        }
        if !recreate.is_empty() {
            flags |= Self::FLAG_RECREATE;
        }
        Self {
            flags,
            frame_index,
            missing,
            ignore: (!ignore.is_empty()).then_some(IgnoreList(ignore)),
            recreate: (!recreate.is_empty()).then_some(RecreateList(recreate)),
        }
    }
}

impl Component for ClientGameStateNAck {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.flags)?;
        s.int(&mut self.frame_index)?;
        s.optional(self.flags & Self::FLAG_MISSING != 0, &mut self.missing)?;
        s.optional(self.flags & Self::FLAG_IGNORE != 0, &mut self.ignore)?;
        s.optional(self.flags & Self::FLAG_RECREATE != 0, &mut self.recreate)
    }
}

impl Packet for ClientGameStateNAck {
    const NAME: &'static str = "gameStateNAck";
}

/// Positive acknowledgement sent under the ARQ sync style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientGameStateAck {
    /// Frame being acknowledged.
    pub frame_index: u64,
    /// Objects the receiver already holds.
    pub ignore: IgnoreList,
    /// Objects the receiver lost.
    pub recreate: RecreateList,
}

impl Component for ClientGameStateAck {
    fn process<S: Stream>(&mut self, s: &mut S) -> Result<(), WireError> {
        s.int(&mut self.frame_index)?;
        self.ignore.process(s)?;
        self.recreate.process(s)
    }
}

impl Packet for ClientGameStateAck {
    const NAME: &'static str = "gameStateAck";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bounds, decode, encode, encode_packet, peek_tag};

    #[test]
    fn test_state_bag_v2_bounds() {
        let b = bounds::<StateBagV2>().unwrap();
        // u8 name prefix + 1, u16 key prefix + 1, 1 data byte
        assert_eq!(b.min, 1 + 1 + 2 + 1 + 1);
        assert_eq!(b.max, 1 + 128 + 2 + 512 + 4096);
    }

    #[test]
    fn test_legacy_state_bag_payload_layout() {
        let mut payload = StateBagPayload {
            id: "bag".into(),
            key: "k".into(),
            value: vec![0xa1, b'x'],
        };
        let bytes = encode(&mut payload).unwrap();
        assert_eq!(
            bytes,
            vec![0, 4, b'b', b'a', b'g', 0, 0, 2, b'k', 0, 0xa1, b'x']
        );
        assert_eq!(decode::<StateBagPayload>(&bytes).unwrap(), payload);

        // zero length word and a short id are both rejected
        assert!(decode::<StateBagPayload>(&[0, 0, 0, 2, b'k', 0]).is_err());
        assert!(decode::<StateBagPayload>(&[0, 9, b'b']).is_err());
    }

    #[test]
    fn test_array_update_uses_u32_prefix() {
        let mut update = ArrayUpdate {
            handler: 1,
            owner_net_id: 3,
            index: 7,
            data: vec![0xaa; 2],
        };
        let bytes = encode(&mut update).unwrap();
        assert_eq!(bytes, vec![1, 3, 0, 7, 0, 0, 0, 2, 0, 0, 0, 0xaa, 0xaa]);
        let b = bounds::<ArrayUpdate>().unwrap();
        assert_eq!((b.min, b.max), (11, 11 + 128));
    }

    #[test]
    fn test_client_array_update_bounds() {
        let b = bounds::<ClientArrayUpdate>().unwrap();
        assert_eq!((b.min, b.max), (6, 6 + 128));
    }

    #[test]
    fn test_net_game_event_v2_layout() {
        let mut event = ClientNetGameEventV2 {
            target_players: vec![2, 5],
            event_name_hash: 0x0102_0304,
            event_id: 9,
            is_reply: true,
            data: vec![0xee],
        };
        let bytes = encode(&mut event).unwrap();
        assert_eq!(
            bytes,
            vec![2, 2, 0, 5, 0, 4, 3, 2, 1, 9, 0, 1, 0xee]
        );
        let b = bounds::<ClientNetGameEventV2>().unwrap();
        assert_eq!(b.min, 1 + 4 + 2 + 1);
        assert_eq!(b.max, 1 + 2 * 255 + 4 + 2 + 1 + 1025);
    }

    #[test]
    fn test_reassembled_v1_bit_packed_count() {
        let mut fragment = ReassembledEvent::default();
        fragment.set_event_id(0x1_0000_0002);
        fragment.total_packets = (1 << 17) - 1;
        fragment.data = vec![1, 2, 3];
        let bytes = encode(&mut fragment).unwrap();
        assert_eq!(bytes.len(), 4 + 4 + 3 + 2 + 3);
        let decoded: ReassembledEvent = decode(&bytes).unwrap();
        assert_eq!(decoded.event_id(), 0x1_0000_0002);
        assert_eq!(decoded.total_packets, (1 << 17) - 1);

        fragment.total_packets = 1 << 17;
        assert!(encode(&mut fragment).is_err());
    }

    #[test]
    fn test_reassembled_v2_ack_is_empty() {
        let ack = ReassembledEventV2 {
            event_id: 1,
            packet_idx: 0,
            total_packets: 1,
            data: Vec::new(),
        };
        assert!(ack.is_ack());
        assert_eq!(ReassembledEventV2::MAX_PACKET_SIZE, 2047 * 65536);
    }

    #[test]
    fn test_nack_flags_drive_optional_fields() {
        let mut nack = ClientGameStateNAck::new(
            42,
            Some(MissingFrames { first: 40, last: 41 }),
            Vec::new(),
            vec![7, 8],
        );
        assert_eq!(
            nack.flags,
            ClientGameStateNAck::FLAG_MISSING
                | ClientGameStateNAck::FLAG_RECREATE
                | ClientGameStateNAck::FLAG_EXTENDED
        );
        let bytes = encode(&mut nack).unwrap();
        // flags + frame + range + count + 2 ids
        assert_eq!(bytes.len(), 1 + 8 + 16 + 1 + 4);
        let decoded: ClientGameStateNAck = decode(&bytes).unwrap();
        assert_eq!(decoded, nack);
        assert!(decoded.ignore.is_none());
    }

    #[test]
    fn test_nack_bounds_cover_all_optionals() {
        let b = bounds::<ClientGameStateNAck>().unwrap();
        assert_eq!(b.min, 9);
        assert_eq!(b.max, 9 + 16 + (1 + 255 * 10) + (1 + 255 * 2));
    }

    #[test]
    fn test_nack_flag_without_value_fails_encode() {
        let mut nack = ClientGameStateNAck {
            flags: ClientGameStateNAck::FLAG_IGNORE,
            frame_index: 1,
            ..Default::default()
        };
        assert_eq!(encode(&mut nack), Err(WireError::MissingOptional));
    }

    #[test]
    fn test_ack_roundtrip_through_packet() {
        let mut ack = ClientGameStateAck {
            frame_index: 5,
            ignore: IgnoreList(vec![IgnoreEntry {
                object_id: 3,
                last_frame: 4,
            }]),
            recreate: RecreateList(vec![9]),
        };
        let bytes = encode_packet(&mut ack).unwrap();
        assert_eq!(peek_tag(&bytes), Some(ClientGameStateAck::TAG));
        assert_eq!(decode::<ClientGameStateAck>(&bytes[4..]).unwrap(), ack);
    }
}
