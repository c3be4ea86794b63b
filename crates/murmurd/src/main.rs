//! murmurd — Murmur demo node.
//!
//! Runs the local node plus a handful of simulated peers in one in-process
//! cluster and pings them on an interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use murmur_core::config::MurmurConfig;
use murmur_core::Packet;
use murmur_services::{LocalCluster, NetworkManager, Scheduler, TokioScheduler};

mod node;
mod pinger;
mod protocol;

use protocol::Hello;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MurmurConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MurmurConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MurmurConfig::default()
    });

    let name = config.node.resolved_name();
    tracing::info!(node = %name, cluster = %config.node.cluster, "murmurd starting");

    // ── Cluster ──────────────────────────────────────────────────────────────

    let cluster = LocalCluster::new(config.node.cluster.clone());
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());

    let local = node::start(&cluster, &name, scheduler.clone(), &config.collection);
    let peers: Vec<NetworkManager> = config
        .demo
        .peers
        .iter()
        .map(|peer| node::start(&cluster, peer, scheduler.clone(), &config.collection))
        .collect();
    tracing::info!(view = %local.view(), "cluster formed");

    let hello = Packet::new(&Hello { node: name.clone() })?;
    if !local.new_builder(hello).broadcast(false).build().sneaky_transmit() {
        tracing::warn!("could not announce node");
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let pinger_task = tokio::spawn(
        pinger::Pinger::new(
            local.clone(),
            Duration::from_millis(config.demo.ping_interval_ms),
            Duration::from_millis(config.demo.ping_timeout_ms),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let status_printer = {
        let local = local.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                tracing::info!(
                    view = %local.view(),
                    pending = local.pending_collections(),
                    "cluster snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = pinger_task         => tracing::error!("pinger exited: {:?}", r),
        r = status_printer      => tracing::error!("status printer exited: {:?}", r),
    }

    for peer in &peers {
        peer.close();
    }
    local.close();

    Ok(())
}
