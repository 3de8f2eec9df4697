use std::sync::Arc;

use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use viewcast::config::ReplicationConfig;
use viewcast::metrics::{self, ReplicationMetrics};
use viewcast::net::sink::{ChannelSink, OverflowPolicy};
use viewcast::replication::{ComponentKind, ComponentStore, ReplicationEngine, ReplicationError};
use viewcast::util::vec2::Vec2;
use viewcast::world::spatial::SpatialGrid;
use viewcast::world::EntityId;

/// Half width of the square demo world
const WORLD_HALF_EXTENT: f64 = 1000.0;
/// Wandering entities spawned at startup
const ENTITY_COUNT: u64 = 2000;
/// The first N entities host an observer
const OBSERVER_COUNT: u64 = 64;
const VIEW_RADIUS: f64 = 150.0;
/// World units per tick
const MAX_SPEED: f64 = 4.0;
/// Chance per entity per tick of taking damage
const DAMAGE_CHANCE: f64 = 0.01;

struct Wanderer {
    id: EntityId,
    position: Vec2,
    velocity: Vec2,
    health: u32,
}

/// Components replicated by the demo
struct DemoComponents {
    positions: Arc<ComponentStore<Vec2>>,
    health: Arc<ComponentStore<u32>>,
    position_kind: ComponentKind,
    health_kind: ComponentKind,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Viewcast replication demo v{}", env!("CARGO_PKG_VERSION"));

    let config = ReplicationConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: {} Hz, {} workers, pending cap {}, sink capacity {}",
        config.tick_rate, config.worker_threads, config.max_pending_updates, config.sink_capacity
    );

    let metrics = Arc::new(ReplicationMetrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut engine = ReplicationEngine::new(config.clone(), SpatialGrid::default())?.with_metrics(metrics.clone());

    let positions = Arc::new(ComponentStore::<Vec2>::with_deltas());
    let health = Arc::new(ComponentStore::<u32>::with_deltas());
    let components = DemoComponents {
        position_kind: engine.register_component("position", positions.clone())?,
        health_kind: engine.register_component("health", health.clone())?,
        positions,
        health,
    };

    let mut rng = StdRng::from_entropy();
    let mut wanderers = spawn_wanderers(&mut engine, &components, &mut rng)?;

    let policy = OverflowPolicy::from_capacity(config.sink_capacity);
    let mut receivers = Vec::with_capacity(OBSERVER_COUNT as usize);
    for wanderer in wanderers.iter().take(OBSERVER_COUNT as usize) {
        let (sink, rx) = ChannelSink::new(policy);
        engine.attach_observer(wanderer.id, VIEW_RADIUS, Some(Box::new(sink)))?;
        receivers.push(rx);
    }
    info!("Spawned {} entities and {} observers", wanderers.len(), receivers.len());

    // Stand-in for the I/O layer: drain every outbound queue
    let drain_period = config.tick_interval();
    tokio::spawn(async move {
        let mut ticker = interval(drain_period);
        loop {
            ticker.tick().await;
            let (messages, bytes) = drain_receivers(&receivers);
            if messages > 0 {
                debug!("I/O drained {} messages ({} bytes)", messages, bytes);
            }
        }
    });

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    let mut ticker = interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let report_every = u64::from(config.tick_rate) * 5;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                step_world(&mut engine, &components, &mut wanderers, &mut rng)?;
                let report = tokio::task::block_in_place(|| engine.run_tick());

                if report.tick % report_every == 0 {
                    info!(
                        "Tick {}: {} observers, {} tracked, {} visible pairs, {} sent ({} bytes), {} dropped, {:?}",
                        report.tick,
                        report.observers,
                        report.tracked_entities,
                        report.compute.visible_pairs,
                        report.dispatch.messages_sent,
                        report.dispatch.bytes_sent,
                        report.dispatch.messages_dropped,
                        report.total_time
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
    }

    info!("Stopped after {} ticks", engine.tick());
    Ok(())
}

fn spawn_wanderers(
    engine: &mut ReplicationEngine,
    components: &DemoComponents,
    rng: &mut StdRng,
) -> Result<Vec<Wanderer>, ReplicationError> {
    let mut wanderers = Vec::with_capacity(ENTITY_COUNT as usize);
    for i in 0..ENTITY_COUNT {
        let wanderer = Wanderer {
            id: EntityId(i),
            position: Vec2::new(
                rng.gen_range(-WORLD_HALF_EXTENT..WORLD_HALF_EXTENT),
                rng.gen_range(-WORLD_HALF_EXTENT..WORLD_HALF_EXTENT),
            ),
            velocity: Vec2::from_angle(rng.gen_range(0.0..std::f64::consts::TAU)) * rng.gen_range(0.0..MAX_SPEED),
            health: 100,
        };

        engine.world_mut().insert(wanderer.id, wanderer.position);
        components.positions.set(wanderer.id, wanderer.position);
        components.health.set(wanderer.id, wanderer.health);
        engine.mark_outdated(wanderer.id, components.position_kind)?;
        wanderers.push(wanderer);
    }
    Ok(wanderers)
}

/// Gameplay stand-in: move everything, bounce off the world edge, and
/// occasionally deal damage
fn step_world(
    engine: &mut ReplicationEngine,
    components: &DemoComponents,
    wanderers: &mut [Wanderer],
    rng: &mut StdRng,
) -> Result<(), ReplicationError> {
    for wanderer in wanderers.iter_mut() {
        let mut next = wanderer.position + wanderer.velocity;
        if next.x.abs() > WORLD_HALF_EXTENT {
            wanderer.velocity.x = -wanderer.velocity.x;
            next.x = next.x.clamp(-WORLD_HALF_EXTENT, WORLD_HALF_EXTENT);
        }
        if next.y.abs() > WORLD_HALF_EXTENT {
            wanderer.velocity.y = -wanderer.velocity.y;
            next.y = next.y.clamp(-WORLD_HALF_EXTENT, WORLD_HALF_EXTENT);
        }

        if next != wanderer.position {
            wanderer.position = next;
            engine.world_mut().move_to(wanderer.id, next);
            components.positions.set(wanderer.id, next);
            engine.mark_outdated(wanderer.id, components.position_kind)?;
        }

        if rng.gen_bool(DAMAGE_CHANCE) {
            wanderer.health = wanderer.health.saturating_sub(rng.gen_range(1..10)).max(1);
            components.health.set(wanderer.id, wanderer.health);
            engine.mark_outdated(wanderer.id, components.health_kind)?;
        }
    }
    Ok(())
}

fn drain_receivers(receivers: &[Receiver<Vec<u8>>]) -> (usize, usize) {
    receivers
        .iter()
        .flat_map(|rx| rx.try_iter())
        .fold((0, 0), |(messages, bytes), message| (messages + 1, bytes + message.len()))
}
