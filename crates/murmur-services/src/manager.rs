//! Network manager — the facade applications talk to.
//!
//! Owns the transport, the handler registry and the collection engine, and
//! installs the receiver that routes inbound packets: responses go straight
//! to the collection engine, everything else is posted to the dispatch loop
//! and handed to the registry there.

use std::sync::Arc;
use std::time::Duration;

use murmur_core::config::CollectionConfig;
use murmur_core::{CollectionId, NodeAddress, Packet, PacketBody, PacketType};

use crate::collection::CollectionEngine;
use crate::registry::{HandlerId, HandlerRegistry};
use crate::runtime::{DispatchLoop, Scheduler};
use crate::transmission::{TransmissionBuilder, TransmissionError};
use crate::transport::{Destination, Envelope, GroupTransport, Receiver, TransportError, View};

/// Cheap to clone; clones drive the same node.
#[derive(Clone)]
pub struct NetworkManager {
    transport: Arc<dyn GroupTransport>,
    registry: HandlerRegistry,
    engine: CollectionEngine,
    default_timeout: Option<Duration>,
}

impl NetworkManager {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        dispatch: Arc<dyn DispatchLoop>,
        scheduler: Arc<dyn Scheduler>,
        config: &CollectionConfig,
    ) -> Self {
        let registry = HandlerRegistry::new();
        let engine = CollectionEngine::new(scheduler);

        transport.set_receiver(Arc::new(PacketReceiver {
            registry: registry.clone(),
            engine: engine.clone(),
            dispatch,
        }));
        tracing::info!(
            node = %transport.local_address(),
            view = %transport.view(),
            "network manager ready"
        );

        Self {
            transport,
            registry,
            engine,
            default_timeout: config.default_timeout(),
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    pub fn add_handler<F>(&self, packet_type: PacketType, handler: F) -> HandlerId
    where
        F: Fn(&Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.add_handler(packet_type, handler)
    }

    pub fn add_typed_handler<B, F>(&self, handler: F) -> HandlerId
    where
        B: PacketBody,
        F: Fn(&Packet, B) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.add_typed_handler(handler)
    }

    pub fn remove_handler(&self, packet_type: PacketType, id: HandlerId) -> bool {
        self.registry.remove_handler(packet_type, id)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    pub fn new_builder(&self, packet: Packet) -> TransmissionBuilder<'_> {
        TransmissionBuilder::new(self, packet)
    }

    /// Hand an envelope straight to the transport.
    pub fn send_raw(&self, envelope: Envelope) -> Result<(), TransportError> {
        tracing::trace!(
            packet = %envelope.packet(),
            destination = ?envelope.destination(),
            relay = envelope.relay(),
            "sending packet"
        );
        self.transport.send(envelope)
    }

    /// Answer a received request with a response addressed to its sender.
    pub fn reply<B: PacketBody>(&self, request: &Packet, body: &B) -> Result<(), TransmissionError> {
        let sender = request
            .sender()
            .cloned()
            .ok_or(TransmissionError::UnknownSender(request.id()))?;
        let response = Packet::response_to(request, body)?;
        self.send_raw(Envelope::new(response, Destination::Unicast(sender), true))?;
        Ok(())
    }

    // ── Membership ────────────────────────────────────────────────────────────

    pub fn view(&self) -> View {
        self.transport.view()
    }

    pub fn member_count(&self) -> usize {
        self.transport.view().len()
    }

    pub fn local_address(&self) -> NodeAddress {
        self.transport.local_address()
    }

    // ── Collections ───────────────────────────────────────────────────────────

    /// Cancel a pending collection. False when it already resolved.
    pub fn cancel(&self, id: CollectionId) -> bool {
        self.engine.cancel(id)
    }

    pub fn pending_collections(&self) -> usize {
        self.engine.pending_count()
    }

    pub(crate) fn engine(&self) -> &CollectionEngine {
        &self.engine
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Cancel every pending collection, drop all handlers and leave the
    /// group.
    pub fn close(&self) {
        let cancelled = self.engine.cancel_all();
        self.registry.clear();
        self.transport.close();
        tracing::info!(node = %self.transport.local_address(), cancelled, "network manager closed");
    }
}

// ── Inbound routing ───────────────────────────────────────────────────────────

struct PacketReceiver {
    registry: HandlerRegistry,
    engine: CollectionEngine,
    dispatch: Arc<dyn DispatchLoop>,
}

impl Receiver for PacketReceiver {
    fn on_message(&self, packet: Packet) {
        tracing::debug!(packet = %packet, latency_ms = packet.age_ms(), "received packet");

        if packet.is_response() {
            self.engine.handle_response(packet);
            return;
        }

        let registry = self.registry.clone();
        self.dispatch
            .post(Box::new(move || registry.dispatch(&packet)));
    }

    fn on_batch(&self, packets: Vec<Packet>) {
        tracing::debug!(count = packets.len(), "received batch");

        let mut plain = Vec::with_capacity(packets.len());
        for packet in packets {
            if packet.is_response() {
                self.engine.handle_response(packet);
            } else {
                plain.push(packet);
            }
        }
        if plain.is_empty() {
            return;
        }

        let registry = self.registry.clone();
        self.dispatch.post(Box::new(move || {
            for packet in &plain {
                registry.dispatch(packet);
            }
        }));
    }

    fn on_view_changed(&self, view: &View) {
        tracing::info!(view = %view, "membership changed");
        self.engine.reconcile(view);
    }
}
