//! Node bootstrap — joins a cluster and wires the demo handlers.

use std::sync::Arc;

use murmur_core::config::CollectionConfig;
use murmur_services::{LocalCluster, NetworkManager, Scheduler, TokioDispatchLoop};

use crate::protocol::{Hello, Ping, Pong};

/// Join `cluster` as `name` and answer pings from other members.
pub fn start(
    cluster: &LocalCluster,
    name: &str,
    scheduler: Arc<dyn Scheduler>,
    config: &CollectionConfig,
) -> NetworkManager {
    let transport = Arc::new(cluster.join(name));
    let dispatch = Arc::new(TokioDispatchLoop::current());
    let net = NetworkManager::new(transport, dispatch, scheduler, config);

    let responder = net.clone();
    let own_name = name.to_string();
    net.add_typed_handler(move |packet, ping: Ping| {
        responder.reply(
            packet,
            &Pong {
                seq: ping.seq,
                responder: own_name.clone(),
            },
        )?;
        Ok(())
    });

    let own_name = name.to_string();
    net.add_typed_handler(move |packet, hello: Hello| {
        if packet.sender().map(|s| s.name()) != Some(own_name.as_str()) {
            tracing::info!(node = %own_name, peer = %hello.node, "peer said hello");
        }
        Ok(())
    });

    net
}
