//! Packet bodies exchanged by demo nodes.

use murmur_core::PacketBody;
use serde::{Deserialize, Serialize};

/// Liveness probe, sent as a collectable request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq: u64,
}

impl PacketBody for Ping {
    const NAME: &'static str = "murmur.ping";
}

/// Answer to a [`Ping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u64,
    pub responder: String,
}

impl PacketBody for Pong {
    const NAME: &'static str = "murmur.pong";
}

/// Fire-and-forget announcement broadcast when a node comes up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub node: String,
}

impl PacketBody for Hello {
    const NAME: &'static str = "murmur.hello";
}
