//! Reassembly of events too large for one packet (second generation).
//!
//! A payload is framed as `u16 name_len, name, payload`, split into
//! [`ReassembledEventV2::FRAGMENT_SIZE`] byte fragments and sent to each
//! target, paced by a bytes-per-second budget. Receivers acknowledge every
//! fragment with an empty-data packet; senders cycle over unacknowledged
//! fragments until every bit is set or the target leaves.
//!
//! Receivers never assemble in flight: fragments are held per index until
//! the job is complete, and each peer may only have a bounded number of
//! jobs open at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tether_net::{PacketSink, PeerId, Target, send_packet};
use tether_wire::packets::ReassembledEventV2;

use crate::ReassemblyError;

/// Pacing used when a caller passes a non-positive rate.
pub const DEFAULT_BYTES_PER_SECOND: i32 = 25_000;

/// Pending budget that never runs out; used for the server on a client.
pub const UNLIMITED_PENDING: u8 = u8::MAX;

/// Receiver of completed events.
pub trait ReassemblySink {
    /// Return `true` to drop the event from `source` instead of delivering it.
    fn limit_event(&mut self, _source: PeerId, _name: &str) -> bool {
        false
    }

    /// Hand over a fully reassembled event.
    fn deliver(&mut self, source: PeerId, name: &str, payload: Vec<u8>);
}

/// Timing knobs for [`Reassembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// How long a completed job lingers after its last ack, and how long an
    /// incomplete job, inbound or outbound, may sit idle before it is
    /// discarded. Default: 120 s.
    pub job_ttl: Duration,
    /// Pause after a full pass over a target's fragments. Default: 250 ms.
    pub cycle_pause: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(120),
            cycle_pause: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload framing
// ---------------------------------------------------------------------------

/// Frame `name` and `payload` as one reassembly body.
pub(crate) fn frame_payload(name: &str, payload: &[u8]) -> Result<Vec<u8>, ReassemblyError> {
    let name_len =
        u16::try_from(name.len()).map_err(|_| ReassemblyError::NameTooLong(name.len()))?;
    let mut body = Vec::with_capacity(2 + name.len() + payload.len());
    body.extend_from_slice(&name_len.to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(payload);
    Ok(body)
}

/// Largest framed body one event can carry: `total_packets` is a `u16`.
pub const MAX_BODY_SIZE: usize = ReassembledEventV2::FRAGMENT_SIZE * u16::MAX as usize;

/// Fragment count of a `size` byte body.
pub(crate) fn total_packets(size: usize) -> Result<u16, ReassemblyError> {
    u16::try_from(size.div_ceil(ReassembledEventV2::FRAGMENT_SIZE)).map_err(|_| {
        ReassemblyError::PayloadTooLarge {
            size,
            max: MAX_BODY_SIZE,
        }
    })
}

/// Split a reassembled body back into name and payload.
pub(crate) fn unframe_payload(mut body: Vec<u8>) -> Option<(String, Vec<u8>)> {
    let (len, rest) = body.split_first_chunk::<2>()?;
    let name_len = usize::from(u16::from_le_bytes(*len));
    let name = std::str::from_utf8(rest.get(..name_len)?).ok()?.to_owned();
    let payload = body.split_off(2 + name_len);
    Some((name, payload))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TargetProgress {
    acked: Vec<bool>,
    cursor: usize,
    last_send: Option<Instant>,
    pause_until: Option<Instant>,
}

impl TargetProgress {
    fn new(fragments: usize) -> Self {
        Self {
            acked: vec![false; fragments],
            cursor: 0,
            last_send: None,
            pause_until: None,
        }
    }
}

#[derive(Debug)]
struct SendJob {
    body: Vec<u8>,
    total_packets: u16,
    latency: Duration,
    targets: BTreeMap<PeerId, TargetProgress>,
    /// First tick after queueing, then the latest ack.
    last_activity: Option<Instant>,
}

#[derive(Debug)]
struct ReceiveJob {
    fragments: Vec<Option<Vec<u8>>>,
    missing: usize,
    completed: bool,
    last_activity: Instant,
}

/// Inbound job allowance of one registered peer.
#[derive(Debug, Clone, Copy)]
struct Budget {
    max: u8,
    remaining: u8,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Fragmenting sender and reassembling receiver for one endpoint.
pub struct Reassembly {
    sink: Arc<dyn PacketSink>,
    config: ReassemblyConfig,
    /// Registered peers and their inbound job budget.
    targets: BTreeMap<PeerId, Budget>,
    sends: BTreeMap<u64, SendJob>,
    receives: FxHashMap<(PeerId, u64), ReceiveJob>,
    next_event_id: u64,
    last_tick: Option<Instant>,
}

impl Reassembly {
    pub fn new(sink: Arc<dyn PacketSink>, config: ReassemblyConfig) -> Self {
        Self {
            sink,
            config,
            targets: BTreeMap::new(),
            sends: BTreeMap::new(),
            receives: FxHashMap::default(),
            next_event_id: 0,
            last_tick: None,
        }
    }

    /// Allow events to and from `peer`.
    ///
    /// `max_pending` bounds the inbound jobs the peer may have open at once:
    /// `0` refuses new jobs and [`UNLIMITED_PENDING`] never refuses.
    pub fn register_target(&mut self, peer: PeerId, max_pending: u8) {
        self.targets.insert(
            peer,
            Budget {
                max: max_pending,
                remaining: max_pending,
            },
        );
    }

    /// Forget `peer`, dropping its inbound jobs and its share of outbound ones.
    pub fn unregister_target(&mut self, peer: PeerId) {
        if self.targets.remove(&peer).is_none() {
            return;
        }
        self.receives.retain(|(source, _), _| *source != peer);
        for job in self.sends.values_mut() {
            job.targets.remove(&peer);
        }
        self.sends.retain(|_, job| !job.targets.is_empty());
    }

    pub fn is_target(&self, peer: PeerId) -> bool {
        self.targets.contains_key(&peer)
    }

    /// Queue `name` with `payload` for delivery to `target`.
    ///
    /// Returns the event id. Sending to [`Target::All`] with no registered
    /// peers is not an error; nothing is queued.
    pub fn trigger_event(
        &mut self,
        target: Target,
        name: &str,
        payload: &[u8],
        bytes_per_second: i32,
    ) -> Result<u64, ReassemblyError> {
        if name.len() > usize::from(u16::MAX) {
            return Err(ReassemblyError::NameTooLong(name.len()));
        }
        let total_packets = total_packets(2 + name.len() + payload.len())?;

        let peers: Vec<PeerId> = match target {
            Target::All => self.targets.keys().copied().collect(),
            Target::Peer(peer) if self.targets.contains_key(&peer) => vec![peer],
            Target::Peer(peer) => return Err(ReassemblyError::UnknownTarget(peer)),
        };

        let bytes_per_second = if bytes_per_second <= 0 {
            DEFAULT_BYTES_PER_SECOND
        } else {
            bytes_per_second
        };
        let body = frame_payload(name, payload)?;
        let latency = Duration::from_secs_f64(
            ReassembledEventV2::FRAGMENT_SIZE as f64 / f64::from(bytes_per_second),
        );

        let event_id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        let job = SendJob {
            body,
            total_packets,
            latency,
            targets: peers
                .into_iter()
                .map(|peer| (peer, TargetProgress::new(usize::from(total_packets))))
                .collect(),
            last_activity: None,
        };

        tracing::debug!(
            "Queued reassembled event '{}' ({} fragments, {} targets) as {}",
            name,
            total_packets,
            job.targets.len(),
            event_id
        );
        if !job.targets.is_empty() {
            self.sends.insert(event_id, job);
        }
        Ok(event_id)
    }

    /// Send due fragments and drop jobs that went idle past the TTL.
    pub fn tick(&mut self, now: Instant) {
        let dt = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last_tick = Some(now);

        let sink = self.sink.as_ref();
        let registered = &self.targets;
        let pause = self.config.cycle_pause;
        let ttl = self.config.job_ttl;
        self.sends.retain(|event_id, job| {
            let idle = now.saturating_duration_since(*job.last_activity.get_or_insert(now));
            if idle < ttl {
                return true;
            }
            tracing::debug!(
                "Giving up on reassembly {} after {:.0?} without an ack ({} targets left)",
                event_id,
                idle,
                job.targets.len()
            );
            false
        });
        for (&event_id, job) in self.sends.iter_mut() {
            let SendJob {
                body,
                total_packets,
                latency,
                targets,
                ..
            } = job;
            let total_packets = *total_packets;
            let body: &[u8] = body;
            let latency = *latency;
            // peers that left stop holding the job open
            targets.retain(|peer, _| registered.contains_key(peer));
            targets.retain(|&peer, progress| {
                if progress.pause_until.is_some_and(|until| until >= now) {
                    progress.last_send = Some(now);
                    return true;
                }
                if progress.last_send.is_some_and(|last| last + latency >= now) {
                    return true;
                }
                let pass = Pass {
                    sink,
                    event_id,
                    body,
                    total_packets,
                    latency,
                    peer,
                };
                !pass.burst(progress, dt, now, pause)
            });
        }
        self.sends.retain(|_, job| !job.targets.is_empty());

        self.collect_garbage(now);
    }

    fn collect_garbage(&mut self, now: Instant) {
        let ttl = self.config.job_ttl;
        let targets = &mut self.targets;
        self.receives.retain(|(source, event_id), job| {
            if now.saturating_duration_since(job.last_activity) < ttl {
                return true;
            }
            if !job.completed {
                tracing::debug!(
                    "Discarding incomplete reassembly {} from {} ({} fragments missing)",
                    event_id,
                    source,
                    job.missing
                );
                release_budget(targets, *source);
            }
            false
        });
    }

    /// Apply one fragment or acknowledgement from `source`.
    pub fn handle_packet(
        &mut self,
        source: PeerId,
        packet: &ReassembledEventV2,
        deliver: &mut dyn ReassemblySink,
        now: Instant,
    ) {
        if packet.total_packets == 0 {
            return;
        }

        if packet.is_ack() {
            let Some(job) = self.sends.get_mut(&packet.event_id) else {
                return;
            };
            if let Some(progress) = job.targets.get_mut(&source)
                && let Some(bit) = progress.acked.get_mut(usize::from(packet.packet_idx))
            {
                *bit = true;
                job.last_activity = Some(now);
            }
            return;
        }

        let key = (source, packet.event_id);
        if !self.receives.contains_key(&key) {
            let Some(budget) = self.targets.get_mut(&source) else {
                tracing::debug!("Dropping reassembly fragment from unregistered {}", source);
                return;
            };
            match budget.remaining {
                0 => {
                    tracing::warn!("{} exceeded its pending reassembly budget", source);
                    return;
                }
                UNLIMITED_PENDING => {}
                _ => budget.remaining -= 1,
            }
            self.receives.insert(
                key,
                ReceiveJob {
                    fragments: vec![None; usize::from(packet.total_packets)],
                    missing: usize::from(packet.total_packets),
                    completed: false,
                    last_activity: now,
                },
            );
        }
        let Some(job) = self.receives.get_mut(&key) else {
            return;
        };

        let index = usize::from(packet.packet_idx);
        let already = job.completed || job.fragments.get(index).is_some_and(Option::is_some);
        if !already {
            let Some(slot) = job.fragments.get_mut(index) else {
                return;
            };
            *slot = Some(packet.data.clone());
            job.missing -= 1;
        }

        let mut ack = ReassembledEventV2 {
            event_id: packet.event_id,
            packet_idx: packet.packet_idx,
            total_packets: packet.total_packets,
            data: Vec::new(),
        };
        send_packet(self.sink.as_ref(), source, &mut ack);
        job.last_activity = now;

        if already || job.missing > 0 {
            return;
        }

        job.completed = true;
        let body: Vec<u8> = std::mem::take(&mut job.fragments)
            .into_iter()
            .flatten()
            .flatten()
            .collect();
        release_budget(&mut self.targets, source);

        let Some((name, payload)) = unframe_payload(body) else {
            tracing::warn!("Malformed reassembled event {} from {}", packet.event_id, source);
            return;
        };
        if deliver.limit_event(source, &name) {
            tracing::debug!("Reassembled event '{}' from {} was rate limited", name, source);
            return;
        }
        deliver.deliver(source, &name, payload);
    }

    /// Outbound jobs still waiting on at least one target.
    pub fn pending_sends(&self) -> usize {
        self.sends.len()
    }

    /// Inbound jobs held, complete or not.
    pub fn pending_receives(&self) -> usize {
        self.receives.len()
    }

    /// Remaining inbound budget of `peer`.
    pub fn budget(&self, peer: PeerId) -> Option<u8> {
        self.targets.get(&peer).map(|budget| budget.remaining)
    }
}

fn release_budget(targets: &mut BTreeMap<PeerId, Budget>, peer: PeerId) {
    if let Some(budget) = targets.get_mut(&peer)
        && budget.remaining < budget.max
    {
        budget.remaining += 1;
    }
}

/// One sending pass over a job for a single peer.
struct Pass<'a> {
    sink: &'a dyn PacketSink,
    event_id: u64,
    body: &'a [u8],
    total_packets: u16,
    latency: Duration,
    peer: PeerId,
}

impl Pass<'_> {
    /// Send as many fragments as `dt` allows. Returns `true` once every
    /// fragment is acknowledged.
    fn burst(
        &self,
        progress: &mut TargetProgress,
        dt: Duration,
        now: Instant,
        pause: Duration,
    ) -> bool {
        let fragments = progress.acked.len();
        let start = progress.cursor;
        let mut budget = dt;

        loop {
            let cursor = progress.cursor;
            let early = progress.acked[..cursor].iter().position(|bit| !bit);
            let next = progress.acked[cursor..]
                .iter()
                .position(|bit| !bit)
                .map(|i| i + cursor);

            let wrapped = match (early, next) {
                (None, None) => return true,
                (Some(first), None) => {
                    progress.cursor = first;
                    true
                }
                (_, Some(index)) => {
                    self.send(index);
                    progress.cursor = (index + 1) % fragments;
                    if budget > self.latency {
                        budget -= self.latency;
                    }
                    false
                }
            };

            if wrapped || progress.cursor <= start {
                progress.pause_until = Some(now + pause);
                break;
            }
            if budget <= self.latency {
                break;
            }
        }
        progress.last_send = Some(now);
        false
    }

    fn send(&self, index: usize) {
        let Ok(packet_idx) = u16::try_from(index) else {
            return;
        };
        let begin = index * ReassembledEventV2::FRAGMENT_SIZE;
        let end = (begin + ReassembledEventV2::FRAGMENT_SIZE).min(self.body.len());
        let mut packet = ReassembledEventV2 {
            event_id: self.event_id,
            packet_idx,
            total_packets: self.total_packets,
            data: self.body[begin..end].to_vec(),
        };
        send_packet(self.sink, self.peer, &mut packet);
    }
}
