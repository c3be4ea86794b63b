//! Transmission builder.
//!
//! Sending is two-phase. A [`TransmissionBuilder`] fixes the packet,
//! destination and relay flag. It then either becomes a fire-and-forget
//! [`Transmission`], or goes through a [`CollectionBuilder`] to become a
//! [`PendingCollection`] that waits for responses. Nothing is registered or
//! sent until `transmit`.

use std::time::Duration;

use murmur_core::{CollectableKind, CollectionId, NodeAddress, Packet, PacketError, PacketId};

use crate::collection::{
    CollectionError, CollectionHandle, CollectionSpec, DuplicateCollection, Target,
};
use crate::manager::NetworkManager;
use crate::transport::{Destination, Envelope, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum TransmissionError {
    #[error("no member named {0:?} in the current view")]
    AddressNotFound(String),
    #[error("send failed: {0}")]
    Send(#[from] TransportError),
    #[error("packet {0} is not a collectable request")]
    NotARequest(PacketId),
    #[error(transparent)]
    DuplicateCollection(#[from] DuplicateCollection),
    #[error("packet {0} has no sender to reply to")]
    UnknownSender(PacketId),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Collection(#[from] CollectionError),
}

// ── Stage one: destination ────────────────────────────────────────────────────

/// Created by [`NetworkManager::new_builder`]. Defaults to a loopback
/// broadcast with relay enabled.
pub struct TransmissionBuilder<'a> {
    net: &'a NetworkManager,
    packet: Packet,
    destination: Destination,
    relay: bool,
}

impl<'a> TransmissionBuilder<'a> {
    pub(crate) fn new(net: &'a NetworkManager, packet: Packet) -> Self {
        Self {
            net,
            packet,
            destination: Destination::Broadcast { loopback: true },
            relay: true,
        }
    }

    /// Send to one member.
    pub fn to(mut self, address: NodeAddress) -> Self {
        self.destination = Destination::Unicast(address);
        self
    }

    /// Send to the member called `name` in the current view.
    pub fn to_node(self, name: &str) -> Result<Self, TransmissionError> {
        let address = self
            .net
            .view()
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| TransmissionError::AddressNotFound(name.to_string()))?;
        Ok(self.to(address))
    }

    /// Send to every member, including this node when `loopback` is set.
    pub fn broadcast(mut self, loopback: bool) -> Self {
        self.destination = Destination::Broadcast { loopback };
        self
    }

    /// Allow or forbid the transport to forward beyond the local cluster.
    pub fn relay(mut self, enabled: bool) -> Self {
        self.relay = enabled;
        self
    }

    pub fn build(self) -> Transmission<'a> {
        Transmission {
            net: self.net,
            envelope: Envelope::new(self.packet, self.destination, self.relay),
        }
    }

    /// Wait for the first response.
    pub fn collect_one(self) -> CollectionBuilder<'a> {
        self.collect(Target::Exact(1))
    }

    /// Wait for exactly `n` responses.
    pub fn collect_exact(self, n: usize) -> CollectionBuilder<'a> {
        self.collect(Target::Exact(n))
    }

    /// Wait for one response from every member of the local view. The count
    /// comes from the view at build time and shrinks if members leave.
    /// Relayed copies also reach linked clusters; their answers count toward
    /// the same target, so turn relay off to hear only from the local view.
    pub fn collect_all(self) -> CollectionBuilder<'a> {
        let target = match &self.destination {
            Destination::Unicast(_) => Target::Exact(1),
            Destination::Broadcast { loopback: true } => Target::AllMembers {
                expected: self.net.member_count(),
                excluding: None,
            },
            Destination::Broadcast { loopback: false } => {
                let local = self.net.local_address();
                Target::AllMembers {
                    expected: self.net.view().eligible(Some(&local)),
                    excluding: Some(local),
                }
            }
        };
        self.collect(target)
    }

    fn collect(self, target: Target) -> CollectionBuilder<'a> {
        let mut spec = CollectionSpec::new(target);
        spec.timeout = self.net.default_timeout();
        CollectionBuilder {
            transmission: self.build(),
            spec,
        }
    }
}

// ── Fire and forget ───────────────────────────────────────────────────────────

pub struct Transmission<'a> {
    net: &'a NetworkManager,
    envelope: Envelope,
}

impl Transmission<'_> {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn transmit(self) -> Result<(), TransmissionError> {
        self.net.send_raw(self.envelope)?;
        Ok(())
    }

    /// Like [`transmit`](Self::transmit), but failures are logged and
    /// reported as `false`.
    pub fn sneaky_transmit(self) -> bool {
        quietly(self.transmit()).is_some()
    }
}

// ── Stage two: collection ─────────────────────────────────────────────────────

pub struct CollectionBuilder<'a> {
    transmission: Transmission<'a>,
    spec: CollectionSpec,
}

impl<'a> CollectionBuilder<'a> {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    /// Wait indefinitely, overriding any configured default timeout.
    pub fn no_timeout(mut self) -> Self {
        self.spec.timeout = None;
        self
    }

    pub fn on_done(mut self, f: impl FnOnce(&[Packet]) + Send + 'static) -> Self {
        self.spec.callbacks.on_done(f);
        self
    }

    /// Called with the responses received so far when the timeout fires.
    /// Without it, timeouts go to `on_error`.
    pub fn on_timeout(mut self, f: impl FnOnce(&[Packet]) + Send + 'static) -> Self {
        self.spec.callbacks.on_timeout(f);
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&CollectionError) + Send + 'static) -> Self {
        self.spec.callbacks.on_error(f);
        self
    }

    pub fn build(self) -> PendingCollection<'a> {
        PendingCollection {
            transmission: self.transmission,
            spec: self.spec,
        }
    }
}

/// A built collection, not yet registered or sent.
pub struct PendingCollection<'a> {
    transmission: Transmission<'a>,
    spec: CollectionSpec,
}

impl PendingCollection<'_> {
    pub fn envelope(&self) -> &Envelope {
        self.transmission.envelope()
    }

    pub fn target(&self) -> &Target {
        &self.spec.target
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.spec.timeout
    }

    /// The collection id responses will carry, if the packet is a request.
    pub fn collection_id(&self) -> Option<CollectionId> {
        let packet = self.transmission.envelope.packet();
        match packet.correlation() {
            Some(c) if c.kind == CollectableKind::Request => Some(c.collection_id),
            _ => None,
        }
    }

    /// Register the collection, then send the request. If the send fails the
    /// collection resolves as failed and the error is returned.
    pub fn transmit(self) -> Result<CollectionHandle, TransmissionError> {
        let Some(id) = self.collection_id() else {
            return Err(TransmissionError::NotARequest(
                self.transmission.envelope.packet().id(),
            ));
        };
        let net = self.transmission.net;
        let handle = net.engine().register(id, self.spec)?;

        if let Err(e) = net.send_raw(self.transmission.envelope) {
            net.engine().fail(id, e.to_string());
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Like [`transmit`](Self::transmit), but failures are logged and
    /// reported as `false`. The outcome is still delivered to callbacks.
    pub fn sneaky_transmit(self) -> bool {
        quietly(self.transmit()).is_some()
    }
}

fn quietly<T>(result: Result<T, TransmissionError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "transmission failed");
            None
        }
    }
}
