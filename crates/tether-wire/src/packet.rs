//! Tagged packets: a `u32` name hash followed by one component body.

use crate::{Component, WireError, codec, joaat};

/// A component that travels as a top-level packet.
pub trait Packet: Component + Default {
    /// Symbolic packet name; hashed into the wire tag.
    const NAME: &'static str;

    /// Wire tag: [`joaat`] of [`NAME`](Packet::NAME).
    const TAG: u32 = joaat(Self::NAME);
}

/// Encode `packet` as `tag ++ body`.
pub fn encode_packet<P: Packet>(packet: &mut P) -> Result<Vec<u8>, WireError> {
    let body = codec::encode(packet)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&P::TAG.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// The leading tag of `buf`, if it is long enough to have one.
pub fn peek_tag(buf: &[u8]) -> Option<u32> {
    split_packet(buf).map(|(tag, _)| tag)
}

/// Split `buf` into its tag and body.
pub fn split_packet(buf: &[u8]) -> Option<(u32, &[u8])> {
    let (tag, body) = buf.split_first_chunk::<4>()?;
    Some((u32::from_le_bytes(*tag), body))
}

/// Decode the body of a `P` packet, checking its tag first.
///
/// Unlike the dispatcher this does not enforce the maximum bound, so it is
/// meant for trusted, locally produced buffers.
pub fn decode_body<P: Packet>(buf: &[u8]) -> Result<P, WireError> {
    let (tag, body) = split_packet(buf).ok_or(WireError::Truncated {
        needed: 4,
        available: buf.len(),
    })?;
    if tag != P::TAG {
        return Err(WireError::TagMismatch {
            expected: P::TAG,
            found: tag,
        });
    }
    codec::decode(body)
}
