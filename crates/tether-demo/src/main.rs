//! Loopback session: one server and a handful of clients in one process.
//!
//! Exercises state bags, array replication, game events (plain, replied and
//! oversized; legacy addressing with `--legacy-events`) and frame
//! acknowledgement over lossy in-memory channels.
//!
//! Run with `cargo run -p tether-demo -- --clients 3 --ticks 200 --sync nak`.

mod client;
mod loopback;
mod server;

use std::time::{Duration, Instant};

use clap::Parser;
use rand::Rng;
use tether_config::{CliArgs, Config, SyncMode, default_config_dir};
use tether_net::PeerId;
use tether_replication::{ConnectionConfig, EventConfig, NetEvent, SyncStyle};
use tracing::info;

use crate::client::Client;
use crate::loopback::Loopback;
use crate::server::Server;

/// Share of simulated sync fragments and reassembly packets lost in transit.
const LOSS: f64 = 0.05;

/// World objects the server replicates.
const OBJECTS: u16 = 40;

fn sync_style(mode: SyncMode) -> SyncStyle {
    match mode {
        SyncMode::Arq => SyncStyle::Arq,
        SyncMode::Nak => SyncStyle::Nak,
    }
}

/// Event TTL from config; negative, NaN or overflowing values fall back
/// to the default.
fn event_ttl(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
        tracing::warn!("Invalid event TTL {} s, using the default", secs);
        EventConfig::default().ttl
    })
}

fn connection_config(config: &Config) -> ConnectionConfig {
    ConnectionConfig {
        events: EventConfig {
            ttl: event_ttl(config.events.ttl_secs),
            use_v2: config.events.use_v2,
            max_payload: config.events.max_payload,
            reassembly_bytes_per_second: config.reassembly.bytes_per_second,
            ..Default::default()
        },
        reassembly: tether_replication::ReassemblyConfig {
            job_ttl: Duration::from_secs(config.reassembly.job_ttl_secs),
            ..Default::default()
        },
        sync_style: sync_style(config.sync.mode),
        ..Default::default()
    }
}

/// Scripted game activity for tick `tick`.
fn script(tick: u32, clients: &mut [Client]) {
    let count = clients.len();
    let Some(first) = clients.first().map(|c| c.id) else {
        return;
    };
    let others: Vec<PeerId> = clients.iter().skip(1).map(|c| c.id).collect();

    match tick {
        1 => {
            for client in clients.iter() {
                client.set_state("ready", &[0xc3]);
            }
        }
        5 if !others.is_empty() => {
            let event = NetEvent::new("WEAPON_DAMAGE_EVENT", others.clone(), vec![7; 64]);
            clients[0].send_event(event);
        }
        10 if count > 1 => {
            // too big for one packet, goes through reassembly
            let event = NetEvent::new("SCRIPTED_GAME_EVENT", vec![first], vec![0x5a; 3000]);
            clients[1].send_event(event);
        }
        15 if !others.is_empty() => {
            let event = NetEvent::new("REQUEST_CONTROL_EVENT", others.clone(), vec![1, 0, 0, 0])
                .with_reply();
            clients[0].send_event(event);
        }
        _ => {}
    }

    for client in clients.iter_mut() {
        let mut slot = vec![0u8; 8];
        slot[..4].copy_from_slice(&(tick / 10).to_le_bytes());
        slot[4..6].copy_from_slice(&client.id.0.to_le_bytes());
        client.set_slot(slot);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    tether_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );

    if let Err(e) = run(&config, args.ticks).await {
        tracing::error!("Session failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: &Config, ticks: u32) -> Result<(), tether_wire::WireError> {
    let clients = config.network.max_peers.clamp(1, 16);
    let style = sync_style(config.sync.mode);
    let (mut net, server_rx) = Loopback::new(clients, LOSS);
    let start = Instant::now();
    let mut server = Server::new(net.server_sink(), server_rx, config, style, start)?;

    let mut players = Vec::new();
    for id in 1..=clients {
        let peer = PeerId(id);
        let Some(rx) = net.take_client_rx(peer) else {
            continue;
        };
        players.push(Client::new(
            peer,
            net.client_sink(peer),
            rx,
            connection_config(config),
            usize::from(clients) + 1,
            start,
        )?);
        server.connect(peer);
    }
    info!(
        "Loopback session: {} clients, {:?} sync, {} Hz",
        players.len(),
        style,
        config.network.tick_rate_hz
    );

    let objects: Vec<u16> = (1..=OBJECTS).collect();
    let period = Duration::from_secs_f64(1.0 / f64::from(config.network.tick_rate_hz.max(1)));
    let mut interval = tokio::time::interval(period);
    let mut rng = rand::rng();

    for tick in 0..ticks {
        interval.tick().await;
        let now = Instant::now();

        script(tick, &mut players);
        for _ in 0..3 {
            server.touch_object(rng.random_range(1..=OBJECTS));
        }

        for player in &mut players {
            player.tick(now);
        }
        server.drain(now);

        for (peer, fragments) in server.tick(now, &objects) {
            let Some(player) = players.iter_mut().find(|p| p.id == peer) else {
                continue;
            };
            for index in fragments {
                // ARQ waits for every frame; only NAK gets to lose fragments
                if style == SyncStyle::Nak && rng.random_bool(LOSS) {
                    continue;
                }
                player.observe_frame(index);
            }
        }
        for player in &mut players {
            player.drain(now);
        }
    }

    summarize(&server, &players, start.elapsed());
    Ok(())
}

fn summarize(server: &Server, players: &[Client], elapsed: Duration) {
    info!("Session ran for {:.2?}", elapsed);
    for player in players {
        let log = player.log.borrow();
        let stats = player.context().events().stats();
        info!(
            "{}: {} events in ({} largest bytes), {} replies, {} array updates, {} frame gaps",
            player.id, log.events, log.largest_event, log.replies, log.array_updates, log.missing_frames
        );
        info!(
            "{}: queued {} sent {} expired {} deduplicated {}",
            player.id, stats.queued, stats.sent, stats.expired, stats.deduplicated
        );

        let ready = players
            .iter()
            .filter(|other| other.id != player.id)
            .filter(|other| {
                player
                    .store()
                    .get_state_bag(&format!("player:{}", other.id.0))
                    .and_then(|h| h.upgrade())
                    .is_some_and(|bag| bag.has_key("ready"))
            })
            .count();
        info!("{} sees {} other players ready", player.id, ready);
    }

    for player in players {
        if let Some((owner, data)) = server
            .arrays()
            .slot(server::PLAYER_ARRAY, u32::from(player.id.0))
        {
            info!("Array slot {} owned by {}: {:?}", player.id.0, owner, data);
        }
    }
    info!("Server holds {} state bags", server.store().len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ttl_rejects_unrepresentable_values() {
        let default = EventConfig::default().ttl;
        assert_eq!(event_ttl(2.5), Duration::from_millis(2500));
        assert_eq!(event_ttl(f64::INFINITY), default);
        assert_eq!(event_ttl(f64::NAN), default);
        assert_eq!(event_ttl(-1.0), default);
    }

    #[test]
    fn test_connection_config_survives_infinite_ttl() {
        let mut config = Config::default();
        config.events.ttl_secs = f64::INFINITY;
        config.sync.mode = SyncMode::Arq;
        let mapped = connection_config(&config);
        assert_eq!(mapped.events.ttl, EventConfig::default().ttl);
        assert_eq!(mapped.sync_style, SyncStyle::Arq);
    }
}
