//! Daemon assembly.
//!
//! Startup order:
//! 1. Open the state store under the data directory
//! 2. Build the registry, placement coordinator and fault detector
//! 3. Create the peer coordinator and reload persisted deployments
//! 4. Serve the REST API
//! 5. Discover seed peers, then resume managing restored deployments

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use provmon_core::{MonitorConfig, PROTOCOL_VERSION};
use provmon_health::{FaultDetector, ProbeSettings, check_for};
use provmon_peer::{HttpConnector, PeerCoordinator, PeerSettings};
use provmon_placement::{PlacementCoordinator, ResourceRegistry};
use provmon_state::{PeerInfo, StateStore};

use crate::api::{ApiState, build_router};
use crate::provisioner::Provisioner;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const PING_PATH: &str = "/api/v1/peer/ping";

/// Run the monitor until Ctrl-C.
pub async fn run(config: MonitorConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!(name = %config.monitor.name, "provision monitor starting");

    std::fs::create_dir_all(&config.monitor.data_dir)?;
    let db_path = config.monitor.data_dir.join("provmon.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Placement ──────────────────────────────────────────────

    let registry = Arc::new(ResourceRegistry::with_strategy(config.selector.strategy));
    let placement = Arc::new(PlacementCoordinator::new(Arc::clone(&registry)));
    info!(strategy = registry.strategy_name(), "resource registry initialized");

    // ── Peers ──────────────────────────────────────────────────

    let (detector, unreachable) = FaultDetector::new(
        check_for(config.probe.kind, PING_PATH),
        ProbeSettings::from_config(&config),
    );
    let detector = Arc::new(detector);

    let me = PeerInfo::generate(
        &config.monitor.name,
        &config.monitor.host,
        &config.advertised_endpoint(),
        PROTOCOL_VERSION,
    );
    info!(id = %me.id, endpoint = %me.endpoint, "monitor identity generated");

    let peers = Arc::new(PeerCoordinator::new(
        me,
        PeerSettings::from_config(&config),
        Arc::new(HttpConnector::new(RPC_TIMEOUT)),
        detector.clone(),
        Some(store),
    ));
    let restored = peers.restore()?;
    info!(restored, "deployment records reloaded");

    let mut tasks = peers.start(unreachable);
    let provisioner = Arc::new(Provisioner::new(placement, Arc::clone(&peers)));

    // ── API server ─────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router = build_router(ApiState {
        registry,
        peers: Arc::clone(&peers),
        provisioner: Arc::clone(&provisioner),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.monitor.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    // ── Background work ────────────────────────────────────────

    tasks.push(Arc::clone(&provisioner).run(config.retry_interval(), shutdown_rx));

    let seeds = config.seed_endpoints();
    let found = peers.rediscover(&seeds).await;
    info!(found, seeds = seeds.len(), "initial discovery complete");
    let resumed = peers.resume_managing();
    if resumed > 0 {
        info!(resumed, "resumed managing restored deployments");
    }
    if !seeds.is_empty() {
        tasks.push(peers.spawn_rediscovery(seeds, config.discovery_interval()));
    }

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in &tasks {
        task.abort();
    }
    peers.shutdown().await;
    detector.stop_all().await;
    server.await??;

    info!("provision monitor stopped");
    Ok(())
}
