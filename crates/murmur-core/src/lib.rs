//! murmur-core — packet model and configuration shared by all Murmur crates.

pub mod config;
pub mod packet;

pub use packet::{
    CollectableKind, CollectionId, Correlation, NodeAddress, Packet, PacketBody, PacketError,
    PacketId, PacketType,
};
