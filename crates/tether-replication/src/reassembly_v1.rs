//! First-generation reassembly, kept for peers that only speak
//! [`ReassembledEvent`].
//!
//! Fragments carry no index. The sender emits them in order and the
//! receiver appends in arrival order, completing once `total_packets`
//! fragments have arrived; a reordered or lost fragment corrupts or stalls
//! the event. Stalled jobs are dropped after a TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tether_net::{PacketSink, PeerId, send_packet};
use tether_wire::packets::ReassembledEvent;

use crate::ReassemblyError;
use crate::reassembly::{ReassemblySink, frame_payload, unframe_payload};

/// Most fragments one event can have: the count is a 17-bit field.
pub const MAX_FRAGMENTS: u32 = (1 << ReassembledEvent::PACKET_SIZE_BITS) - 1;

/// Largest framed body one event can carry.
pub const MAX_BODY_SIZE: usize = ReassembledEvent::FRAGMENT_SIZE * MAX_FRAGMENTS as usize;

#[derive(Debug)]
struct Job {
    total: u32,
    received: u32,
    body: Vec<u8>,
    last_activity: Instant,
}

/// Order-dependent fragmenter and reassembler.
pub struct ReassemblyV1 {
    sink: Arc<dyn PacketSink>,
    ttl: Duration,
    max_jobs_per_peer: usize,
    jobs: FxHashMap<(PeerId, u64), Job>,
    next_event_id: u64,
}

impl ReassemblyV1 {
    /// `ttl` bounds how long a job may wait for its next fragment;
    /// `max_jobs_per_peer` bounds concurrent jobs from one source.
    pub fn new(sink: Arc<dyn PacketSink>, ttl: Duration, max_jobs_per_peer: usize) -> Self {
        Self {
            sink,
            ttl,
            max_jobs_per_peer,
            jobs: FxHashMap::default(),
            next_event_id: 0,
        }
    }

    /// Send every fragment of the event to `peer` at once.
    pub fn send(&mut self, peer: PeerId, name: &str, payload: &[u8]) -> Result<u64, ReassemblyError> {
        let body = frame_payload(name, payload)?;
        let total = u32::try_from(body.len().div_ceil(ReassembledEvent::FRAGMENT_SIZE))
            .ok()
            .filter(|&total| total <= MAX_FRAGMENTS)
            .ok_or(ReassemblyError::PayloadTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            })?;

        let event_id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        for chunk in body.chunks(ReassembledEvent::FRAGMENT_SIZE) {
            let mut fragment = ReassembledEvent {
                total_packets: total,
                data: chunk.to_vec(),
                ..Default::default()
            };
            fragment.set_event_id(event_id);
            send_packet(self.sink.as_ref(), peer, &mut fragment);
        }
        Ok(event_id)
    }

    /// Append one fragment from `source`.
    pub fn handle_packet(
        &mut self,
        source: PeerId,
        packet: &ReassembledEvent,
        deliver: &mut dyn ReassemblySink,
        now: Instant,
    ) {
        // an empty fragment is a bare ack; without an index there is nothing to mark
        if packet.total_packets == 0 || packet.data.is_empty() {
            return;
        }

        let key = (source, packet.event_id());
        if !self.jobs.contains_key(&key) {
            let open = self.jobs.keys().filter(|(peer, _)| *peer == source).count();
            if open >= self.max_jobs_per_peer {
                tracing::warn!("{} has too many legacy reassembly jobs open", source);
                return;
            }
        }
        let job = self.jobs.entry(key).or_insert_with(|| Job {
            total: packet.total_packets,
            received: 0,
            body: Vec::new(),
            last_activity: now,
        });
        job.body.extend_from_slice(&packet.data);
        job.received += 1;
        job.last_activity = now;
        if job.received < job.total {
            return;
        }

        let Some(job) = self.jobs.remove(&key) else {
            return;
        };
        let Some((name, payload)) = unframe_payload(job.body) else {
            tracing::warn!("Malformed legacy reassembled event from {}", source);
            return;
        };
        if !deliver.limit_event(source, &name) {
            deliver.deliver(source, &name, payload);
        }
    }

    /// Drop jobs that stopped receiving fragments.
    pub fn tick(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.jobs.retain(|(source, event_id), job| {
            let live = now.saturating_duration_since(job.last_activity) < ttl;
            if !live {
                tracing::debug!(
                    "Dropping stale legacy reassembly {} from {} ({}/{})",
                    event_id,
                    source,
                    job.received,
                    job.total
                );
            }
            live
        });
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_net::RecordingSink;
    use tether_wire::decode_body;

    #[derive(Default)]
    struct Collect(Vec<(PeerId, String, Vec<u8>)>);

    impl ReassemblySink for Collect {
        fn deliver(&mut self, source: PeerId, name: &str, payload: Vec<u8>) {
            self.0.push((source, name.to_owned(), payload));
        }
    }

    fn pair() -> (ReassemblyV1, Arc<RecordingSink>, ReassemblyV1) {
        let wire = Arc::new(RecordingSink::new());
        let tx = ReassemblyV1::new(wire.clone(), Duration::from_secs(120), 2);
        let rx = ReassemblyV1::new(Arc::new(RecordingSink::new()), Duration::from_secs(120), 2);
        (tx, wire, rx)
    }

    #[test]
    fn test_in_order_fragments_reassemble() {
        let (mut tx, wire, mut rx) = pair();
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        tx.send(PeerId(1), "legacy", &payload).unwrap();

        let sent = wire.take();
        assert_eq!(sent.len(), 3);
        let mut out = Collect::default();
        let now = Instant::now();
        for (_, bytes) in &sent {
            let fragment = decode_body::<ReassembledEvent>(bytes).unwrap();
            assert_eq!(fragment.total_packets, 3);
            rx.handle_packet(PeerId(9), &fragment, &mut out, now);
        }
        assert_eq!(out.0, vec![(PeerId(9), "legacy".to_owned(), payload)]);
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn test_fragment_count_limited_to_field_width() {
        let (mut tx, wire, _) = pair();
        // framed body one byte past the largest 17-bit fragment count
        let payload = vec![0u8; MAX_BODY_SIZE + 1 - 2 - "big".len()];
        assert_eq!(
            tx.send(PeerId(1), "big", &payload),
            Err(ReassemblyError::PayloadTooLarge {
                size: MAX_BODY_SIZE + 1,
                max: MAX_BODY_SIZE,
            })
        );
        assert!(wire.is_empty());
        assert_eq!(MAX_FRAGMENTS, 131_071);
    }

    #[test]
    fn test_stalled_job_dropped_after_ttl() {
        let (mut tx, wire, mut rx) = pair();
        tx.send(PeerId(1), "legacy", &[7u8; 2000]).unwrap();
        let first = decode_body::<ReassembledEvent>(&wire.take()[0].1).unwrap();

        let mut out = Collect::default();
        let start = Instant::now();
        rx.handle_packet(PeerId(9), &first, &mut out, start);
        rx.tick(start + Duration::from_secs(119));
        assert_eq!(rx.pending(), 1);
        rx.tick(start + Duration::from_secs(120));
        assert_eq!(rx.pending(), 0);
        assert!(out.0.is_empty());
    }

    #[test]
    fn test_per_peer_job_cap() {
        let (_, _, mut rx) = pair();
        let mut out = Collect::default();
        let now = Instant::now();
        for id in 0..3u64 {
            let mut fragment = ReassembledEvent {
                total_packets: 2,
                data: vec![1],
                ..Default::default()
            };
            fragment.set_event_id(id);
            rx.handle_packet(PeerId(4), &fragment, &mut out, now);
        }
        assert_eq!(rx.pending(), 2);
    }
}
