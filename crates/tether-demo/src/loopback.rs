//! In-process transport: one bounded channel per endpoint.
//!
//! Reassembly fragments are dropped at the configured loss rate so the
//! retransmit path gets exercised; everything else is delivered.

use std::collections::HashMap;
use std::sync::Arc;

use tether_net::{InboundPacket, PacketSink, PeerId, inbound_channel};
use tether_wire::packets::ReassembledEventV2;
use tether_wire::{Packet, peek_tag};
use tokio::sync::mpsc;

const CHANNEL_DEPTH: usize = 4096;

/// Channels for a server and `clients` clients numbered from 1.
pub struct Loopback {
    server_tx: mpsc::Sender<InboundPacket>,
    client_tx: Arc<HashMap<PeerId, mpsc::Sender<InboundPacket>>>,
    client_rx: HashMap<PeerId, mpsc::Receiver<InboundPacket>>,
    loss: f64,
}

impl Loopback {
    /// Also returns the server's receiving end.
    pub fn new(clients: u16, loss: f64) -> (Self, mpsc::Receiver<InboundPacket>) {
        let (server_tx, server_rx) = inbound_channel(CHANNEL_DEPTH);
        let mut client_tx = HashMap::new();
        let mut client_rx = HashMap::new();
        for id in 1..=clients {
            let (tx, rx) = inbound_channel(CHANNEL_DEPTH);
            client_tx.insert(PeerId(id), tx);
            client_rx.insert(PeerId(id), rx);
        }
        let net = Self {
            server_tx,
            client_tx: Arc::new(client_tx),
            client_rx,
            loss: loss.clamp(0.0, 1.0),
        };
        (net, server_rx)
    }

    /// Sink the server sends through.
    pub fn server_sink(&self) -> Arc<dyn PacketSink> {
        let routes = Arc::clone(&self.client_tx);
        let loss = self.loss;
        Arc::new(move |peer: PeerId, data: Vec<u8>| {
            if lose(&data, loss) {
                return;
            }
            let Some(tx) = routes.get(&peer) else {
                tracing::debug!("No loopback route to {}", peer);
                return;
            };
            deliver(tx, PeerId::SERVER, data);
        })
    }

    /// Sink client `me` sends through; everything goes to the server.
    pub fn client_sink(&self, me: PeerId) -> Arc<dyn PacketSink> {
        let tx = self.server_tx.clone();
        let loss = self.loss;
        Arc::new(move |peer: PeerId, data: Vec<u8>| {
            if peer != PeerId::SERVER {
                tracing::warn!("{} tried to send directly to {}", me, peer);
                return;
            }
            if !lose(&data, loss) {
                deliver(&tx, me, data);
            }
        })
    }

    /// Hand out the receiving end for client `id`.
    pub fn take_client_rx(&mut self, id: PeerId) -> Option<mpsc::Receiver<InboundPacket>> {
        self.client_rx.remove(&id)
    }
}

fn lose(data: &[u8], loss: f64) -> bool {
    loss > 0.0 && peek_tag(data) == Some(ReassembledEventV2::TAG) && rand::random::<f64>() < loss
}

fn deliver(tx: &mpsc::Sender<InboundPacket>, peer: PeerId, data: Vec<u8>) {
    if tx.try_send(InboundPacket { peer, data }).is_err() {
        tracing::warn!("Loopback queue full, dropping packet from {}", peer);
    }
}
