//! Pinger — periodically broadcasts a ping and collects a pong from every
//! other member.

use std::time::Duration;

use murmur_core::Packet;
use murmur_services::{CollectionOutcome, NetworkManager};
use tokio::sync::broadcast;

use crate::protocol::{Ping, Pong};

pub struct Pinger {
    net: NetworkManager,
    interval: Duration,
    timeout: Duration,
    seq: u64,
    shutdown: broadcast::Receiver<()>,
}

impl Pinger {
    pub fn new(
        net: NetworkManager,
        interval: Duration,
        timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            net,
            interval,
            timeout,
            seq: 0,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("pinger shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    match self.round().await {
                        Ok(outcome) => report(self.seq, &outcome),
                        Err(e) => tracing::warn!(seq = self.seq, error = %e, "ping round failed"),
                    }
                }
            }
        }
    }

    /// Broadcast one ping and wait for the collection to resolve.
    pub async fn round(&mut self) -> anyhow::Result<CollectionOutcome> {
        self.seq += 1;
        let packet = Packet::request(&Ping { seq: self.seq })?;
        let handle = self
            .net
            .new_builder(packet)
            .broadcast(false)
            .collect_all()
            .timeout(self.timeout)
            .build()
            .transmit()?;
        Ok(handle.await)
    }
}

fn responders(packets: &[Packet]) -> Vec<String> {
    packets
        .iter()
        .filter_map(|p| p.decode::<Pong>().ok())
        .map(|pong| pong.responder)
        .collect()
}

fn report(seq: u64, outcome: &CollectionOutcome) {
    match outcome {
        CollectionOutcome::Completed(packets) => {
            tracing::info!(seq, responders = ?responders(packets), "ping round complete");
        }
        CollectionOutcome::TimedOut { received } => {
            tracing::warn!(seq, responders = ?responders(received), "ping round timed out");
        }
        CollectionOutcome::Cancelled => tracing::debug!(seq, "ping round cancelled"),
        CollectionOutcome::Failed(reason) => {
            tracing::warn!(seq, reason = %reason, "ping round failed");
        }
    }
}
