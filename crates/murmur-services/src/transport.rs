//! Group transport contract — what the messaging core needs from the layer
//! that actually moves packets between cluster members.
//!
//! The transport owns delivery and membership. The core only hands it
//! [`Envelope`]s and listens for received packets and view changes through a
//! [`Receiver`].

use std::fmt;
use std::sync::Arc;

use murmur_core::{NodeAddress, Packet, PacketError};

/// Where an envelope goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A single member.
    Unicast(NodeAddress),
    /// Every member. With `loopback == false` the sender does not receive
    /// its own envelope.
    Broadcast { loopback: bool },
}

/// An immutable send intent: packet, destination policy, relay flag.
#[derive(Debug, Clone)]
pub struct Envelope {
    packet: Packet,
    destination: Destination,
    relay: bool,
}

impl Envelope {
    pub fn new(packet: Packet, destination: Destination, relay: bool) -> Self {
        Self {
            packet,
            destination,
            relay,
        }
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether the transport may forward this envelope to linked clusters.
    pub fn relay(&self) -> bool {
        self.relay
    }
}

/// A membership view: ordered members plus a monotonically increasing id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    id: u64,
    members: Vec<NodeAddress>,
}

impl View {
    pub fn new(id: u64, members: Vec<NodeAddress>) -> Self {
        Self { id, members }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[NodeAddress] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.members.contains(address)
    }

    /// First member whose name matches.
    pub fn find_by_name(&self, name: &str) -> Option<&NodeAddress> {
        self.members.iter().find(|m| m.name() == name)
    }

    /// Number of members other than `excluding`.
    pub fn eligible(&self, excluding: Option<&NodeAddress>) -> usize {
        self.members
            .iter()
            .filter(|m| Some(*m) != excluding)
            .count()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|", self.id)?;
        for (i, member) in self.members.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{member}")?;
        }
        f.write_str("]")
    }
}

/// Callbacks a transport invokes. May be called from transport-owned threads.
pub trait Receiver: Send + Sync {
    /// A packet arrived. `sender`/`recipient` are already stamped.
    fn on_message(&self, packet: Packet);

    /// Several packets arrived together. Processed in order.
    fn on_batch(&self, packets: Vec<Packet>) {
        for packet in packets {
            self.on_message(packet);
        }
    }

    /// Membership changed.
    fn on_view_changed(&self, view: &View);
}

/// The group transport consumed by the network manager.
pub trait GroupTransport: Send + Sync {
    /// This node's address within the group.
    fn local_address(&self) -> NodeAddress;

    /// Current membership view.
    fn view(&self) -> View;

    /// Hand an envelope to the transport.
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Install the receiver. Replaces any previous receiver.
    fn set_receiver(&self, receiver: Arc<dyn Receiver>);

    /// Leave the group. Subsequent sends fail with [`TransportError::Closed`].
    fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("no member {0} in the group")]
    UnknownDestination(NodeAddress),
    #[error(transparent)]
    Packet(#[from] PacketError),
}
