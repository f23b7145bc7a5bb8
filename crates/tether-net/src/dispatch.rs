//! Packet dispatch: route an inbound buffer to the handler for its tag.
//!
//! Every buffer is size-checked against the packet type's [`Bounds`] before
//! it is decoded, so a truncated or oversized frame is rejected in
//! O(schema) time without touching the body. The [`Dispatcher`] itself holds
//! no mutable state; handlers receive the per-connection context `C`.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tether_wire::{Bounds, Packet, WireError, bounds, decode, split_packet};

use crate::counters::DispatchCounters;
use crate::PeerId;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of offering a buffer to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The tag belongs to some other packet type.
    NotThisType,
    /// The tag matched but the body failed the bounds check or decoding.
    Malformed,
    /// The body decoded and the handler ran.
    Handled,
}

/// Bounds-check then decode a body, without invoking anything.
fn check_and_decode<P: Packet>(body: &[u8], bounds: Bounds) -> Result<P, WireError> {
    if !bounds.contains(body.len()) {
        return Err(WireError::CountOutOfRange {
            count: body.len(),
            min: bounds.min as usize,
            max: usize::try_from(bounds.max).unwrap_or(usize::MAX),
        });
    }
    decode::<P>(body)
}

/// Offer `buf` to a single packet type.
///
/// Stateless and safe to call from any thread; side effects are confined to
/// `handler`.
pub fn dispatch_as<P: Packet>(buf: &[u8], handler: impl FnOnce(P)) -> Dispatch {
    let Some((tag, body)) = split_packet(buf) else {
        return Dispatch::NotThisType;
    };
    if tag != P::TAG {
        return Dispatch::NotThisType;
    }
    let Ok(bounds) = bounds::<P>() else {
        return Dispatch::Malformed;
    };
    match check_and_decode::<P>(body, bounds) {
        Ok(packet) => {
            handler(packet);
            Dispatch::Handled
        }
        Err(e) => {
            tracing::debug!("Malformed {}: {}", P::NAME, e);
            Dispatch::Malformed
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Handler for one decoded packet type.
pub trait PacketHandler<C, P>: Send + Sync {
    /// Process a packet received from `peer`.
    fn handle(&self, ctx: &mut C, peer: PeerId, packet: P);
}

/// Blanket implementation for closures.
impl<C, P, F> PacketHandler<C, P> for F
where
    F: Fn(&mut C, PeerId, P) + Send + Sync,
{
    fn handle(&self, ctx: &mut C, peer: PeerId, packet: P) {
        self(ctx, peer, packet);
    }
}

type ErasedHandler<C> = Box<dyn Fn(&mut C, PeerId, &[u8]) -> Dispatch + Send + Sync>;

struct Route<C> {
    name: &'static str,
    bounds: Bounds,
    handler: ErasedHandler<C>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes tagged packets to handlers operating on a context `C`.
pub struct Dispatcher<C> {
    routes: FxHashMap<u32, Route<C>>,
    counters: Arc<DispatchCounters>,
}

impl<C> Dispatcher<C> {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self {
            routes: FxHashMap::default(),
            counters: Arc::new(DispatchCounters::new()),
        }
    }

    /// Register the handler for packet type `P`, replacing any previous one.
    ///
    /// Computes `P`'s bounds once; an invalid schema is reported here rather
    /// than on the first packet.
    pub fn register<P, H>(&mut self, handler: H) -> Result<(), WireError>
    where
        C: 'static,
        P: Packet + 'static,
        H: PacketHandler<C, P> + 'static,
    {
        let bounds = bounds::<P>()?;
        let erased: ErasedHandler<C> = Box::new(move |ctx, peer, body| {
            match check_and_decode::<P>(body, bounds) {
                Ok(packet) => {
                    handler.handle(ctx, peer, packet);
                    Dispatch::Handled
                }
                Err(e) => {
                    tracing::debug!("Malformed {} from {}: {}", P::NAME, peer, e);
                    Dispatch::Malformed
                }
            }
        });
        if self
            .routes
            .insert(
                P::TAG,
                Route {
                    name: P::NAME,
                    bounds,
                    handler: erased,
                },
            )
            .is_some()
        {
            tracing::debug!("Replaced handler for {}", P::NAME);
        }
        Ok(())
    }

    /// Route `buf` from `peer` to its handler.
    pub fn dispatch(&self, ctx: &mut C, peer: PeerId, buf: &[u8]) -> Dispatch {
        let Some((tag, body)) = split_packet(buf) else {
            self.counters.record_unknown();
            return Dispatch::NotThisType;
        };
        let Some(route) = self.routes.get(&tag) else {
            self.counters.record_unknown();
            tracing::warn!("No handler registered for tag {:#010x}, dropping packet", tag);
            return Dispatch::NotThisType;
        };
        let outcome = (route.handler)(ctx, peer, body);
        match outcome {
            Dispatch::Handled => self.counters.record_handled(tag, buf.len() as u64),
            Dispatch::Malformed => {
                self.counters.record_malformed(tag);
                tracing::warn!("Dropped malformed {} from {}", route.name, peer);
            }
            Dispatch::NotThisType => {}
        }
        outcome
    }

    /// Bounds of a registered packet type, by tag.
    pub fn bounds_of(&self, tag: u32) -> Option<Bounds> {
        self.routes.get(&tag).map(|r| r.bounds)
    }

    /// Names of registered packet types (useful for startup logging).
    pub fn registered_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.values().map(|r| r.name)
    }

    /// Shared traffic counters.
    pub fn counters(&self) -> &Arc<DispatchCounters> {
        &self.counters
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::encode_packet;
    use tether_wire::packets::{ClientArrayUpdate, StateBagV2};

    #[derive(Default)]
    struct Ctx {
        updates: Vec<(PeerId, ClientArrayUpdate)>,
        bags: u32,
    }

    fn update_bytes(data: Vec<u8>) -> Vec<u8> {
        encode_packet(&mut ClientArrayUpdate {
            handler: 1,
            index: 7,
            data,
        })
        .unwrap()
    }

    fn dispatcher() -> Dispatcher<Ctx> {
        let mut d = Dispatcher::new();
        d.register(|ctx: &mut Ctx, peer: PeerId, p: ClientArrayUpdate| {
            ctx.updates.push((peer, p));
        })
        .unwrap();
        d.register(|ctx: &mut Ctx, _: PeerId, _: StateBagV2| ctx.bags += 1)
            .unwrap();
        d
    }

    #[test]
    fn test_packet_routed_to_correct_handler() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let bytes = update_bytes(vec![1, 2, 3]);
        assert_eq!(d.dispatch(&mut ctx, PeerId(3), &bytes), Dispatch::Handled);
        assert_eq!(ctx.updates.len(), 1);
        assert_eq!(ctx.updates[0].0, PeerId(3));
        assert_eq!(ctx.updates[0].1.data, vec![1, 2, 3]);
        assert_eq!(ctx.bags, 0);
    }

    #[test]
    fn test_unknown_tag_not_this_type() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0];
        assert_eq!(d.dispatch(&mut ctx, PeerId(1), &bytes), Dispatch::NotThisType);
        assert_eq!(d.dispatch(&mut ctx, PeerId(1), &[1]), Dispatch::NotThisType);
        assert_eq!(d.counters().snapshot_and_reset().unknown, 2);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let bytes = update_bytes(vec![9; 10]);
        for len in 4..bytes.len() {
            assert_eq!(
                d.dispatch(&mut ctx, PeerId(1), &bytes[..len]),
                Dispatch::Malformed,
                "len {len}"
            );
        }
        assert!(ctx.updates.is_empty());
    }

    #[test]
    fn test_oversized_body_rejected_before_decode() {
        let d = dispatcher();
        let mut ctx = Ctx::default();
        let mut bytes = update_bytes(vec![9; 128]);
        bytes.push(0);
        assert_eq!(d.dispatch(&mut ctx, PeerId(1), &bytes), Dispatch::Malformed);
        let snapshot = d.counters().snapshot_and_reset();
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.handled, 0);
    }

    #[test]
    fn test_dispatch_as_single_type() {
        let bytes = update_bytes(vec![5]);
        let mut seen = None;
        assert_eq!(
            dispatch_as::<ClientArrayUpdate>(&bytes, |p| seen = Some(p)),
            Dispatch::Handled
        );
        assert_eq!(seen.unwrap().index, 7);
        assert_eq!(
            dispatch_as::<StateBagV2>(&bytes, |_| panic!("wrong type")),
            Dispatch::NotThisType
        );
    }

    #[test]
    fn test_bounds_recorded_at_registration() {
        let d = dispatcher();
        let b = d.bounds_of(ClientArrayUpdate::TAG).unwrap();
        assert_eq!((b.min, b.max), (6, 134));
        let mut names: Vec<_> = d.registered_names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["msgClientArrayUpdate", "msgStateBagV2"]);
    }
}
