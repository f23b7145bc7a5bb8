//! Packet-name hashing.

/// Jenkins one-at-a-time hash of `name`, ASCII-lowercased.
///
/// Packet tags and event names are addressed by this hash, so it must stay
/// stable across builds and be computable in `const` contexts.
pub const fn joaat(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        hash = hash.wrapping_add(bytes[i].to_ascii_lowercase() as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
        i += 1;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}
