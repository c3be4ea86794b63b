//! Handler registry — routes received packets to handlers by packet type.
//!
//! Multiple handlers may be registered per type; they run in registration
//! order. A failing or panicking handler is logged and skipped, the rest of
//! the list still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use murmur_core::{Packet, PacketBody, PacketType};

/// A packet handler.
pub type HandlerFn = dyn Fn(&Packet) -> anyhow::Result<()> + Send + Sync;

/// Token returned by registration, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    handler: Arc<HandlerFn>,
}

/// Maps packet types to ordered handler lists. Cheap to clone; clones share
/// the same table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<PacketType, Vec<Registration>>>,
    next_id: Arc<AtomicU64>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every later packet of `packet_type`.
    pub fn add_handler<F>(&self, packet_type: PacketType, handler: F) -> HandlerId
    where
        F: Fn(&Packet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(packet_type)
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Register a handler that receives the decoded body alongside the packet.
    pub fn add_typed_handler<B, F>(&self, handler: F) -> HandlerId
    where
        B: PacketBody,
        F: Fn(&Packet, B) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(B::packet_type(), move |packet| {
            let body = packet.decode::<B>()?;
            handler(packet, body)
        })
    }

    /// Remove one registration. Returns false if it was never registered
    /// (or already removed).
    pub fn remove_handler(&self, packet_type: PacketType, id: HandlerId) -> bool {
        let removed = match self.handlers.get_mut(&packet_type) {
            Some(mut registrations) => {
                let before = registrations.len();
                registrations.retain(|r| r.id != id);
                registrations.len() != before
            }
            None => false,
        };
        if removed {
            self.handlers
                .remove_if(&packet_type, |_, registrations| registrations.is_empty());
        }
        removed
    }

    /// Number of handlers registered for `packet_type`.
    pub fn handler_count(&self, packet_type: PacketType) -> usize {
        self.handlers
            .get(&packet_type)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Invoke every handler registered for the packet's type.
    ///
    /// The handler list is snapshotted first, so handlers may register or
    /// remove handlers without affecting this dispatch.
    pub fn dispatch(&self, packet: &Packet) {
        let snapshot = match self.handlers.get(&packet.packet_type()) {
            Some(registrations) => registrations.clone(),
            None => return,
        };

        for registration in snapshot {
            match catch_unwind(AssertUnwindSafe(|| (registration.handler)(packet))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        packet = %packet,
                        handler = registration.id.0,
                        error = %e,
                        "could not handle packet, dropping it"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        packet = %packet,
                        handler = registration.id.0,
                        "packet handler panicked"
                    );
                }
            }
        }
    }
}
