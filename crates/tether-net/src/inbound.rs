//! Channel bridge from transport tasks to the thread that owns replication
//! state. Packets are queued as raw bytes and dispatched when drained.

use tokio::sync::mpsc;

use crate::{Dispatcher, PeerId};

/// A whole packet (tag included) and the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Sender.
    pub peer: PeerId,
    /// Tagged packet bytes.
    pub data: Vec<u8>,
}

/// Create a bounded channel for inbound packets.
pub fn inbound_channel(
    buffer: usize,
) -> (mpsc::Sender<InboundPacket>, mpsc::Receiver<InboundPacket>) {
    mpsc::channel(buffer)
}

/// Dispatch every packet currently queued; returns how many were drained.
pub fn drain_inbound<C>(
    receiver: &mut mpsc::Receiver<InboundPacket>,
    dispatcher: &Dispatcher<C>,
    ctx: &mut C,
) -> usize {
    let mut drained = 0;
    while let Ok(packet) = receiver.try_recv() {
        dispatcher.dispatch(ctx, packet.peer, &packet.data);
        drained += 1;
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::encode_packet;
    use tether_wire::packets::ClientArrayUpdate;

    #[tokio::test]
    async fn test_channel_drains_into_dispatcher() {
        let (tx, mut rx) = inbound_channel(16);
        let mut dispatcher: Dispatcher<Vec<u32>> = Dispatcher::new();
        dispatcher
            .register(|seen: &mut Vec<u32>, _: PeerId, p: ClientArrayUpdate| seen.push(p.index))
            .unwrap();

        for index in 0..3 {
            let data = encode_packet(&mut ClientArrayUpdate {
                handler: 0,
                index,
                data: Vec::new(),
            })
            .unwrap();
            tx.send(InboundPacket {
                peer: PeerId(2),
                data,
            })
            .await
            .unwrap();
        }
        tx.send(InboundPacket {
            peer: PeerId(2),
            data: vec![1, 2],
        })
        .await
        .unwrap();

        let mut seen = Vec::new();
        assert_eq!(drain_inbound(&mut rx, &dispatcher, &mut seen), 4);
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(drain_inbound(&mut rx, &dispatcher, &mut seen), 0);
    }
}
