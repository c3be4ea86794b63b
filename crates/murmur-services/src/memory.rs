//! In-process group transport.
//!
//! A [`LocalCluster`] is a named group of members living in one process.
//! Each member holds a [`MemoryTransport`]. Packets are encoded to bytes on
//! send and decoded per recipient, so every delivered packet is a fresh copy
//! with its transport addresses stamped on arrival, as over a real wire.
//!
//! Clusters can be linked; envelopes with relay enabled also reach the
//! members of linked clusters (one hop, no further forwarding).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use murmur_core::{NodeAddress, Packet};

use crate::transport::{Destination, Envelope, GroupTransport, Receiver, TransportError, View};

struct Member {
    /// Join order; views list members by it.
    seq: u64,
    receiver: Option<Arc<dyn Receiver>>,
}

struct ClusterInner {
    name: String,
    members: DashMap<NodeAddress, Member>,
    links: DashMap<String, Weak<ClusterInner>>,
    view_id: AtomicU64,
    join_seq: AtomicU64,
}

/// A named in-process cluster. Cheap to clone; clones share membership.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                name: name.into(),
                members: DashMap::new(),
                links: DashMap::new(),
                view_id: AtomicU64::new(0),
                join_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Add a member called `name` and notify everyone of the new view.
    pub fn join(&self, name: impl Into<String>) -> MemoryTransport {
        let address = NodeAddress::new(name);
        let seq = self.inner.join_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.members.insert(
            address.clone(),
            Member {
                seq,
                receiver: None,
            },
        );
        tracing::debug!(cluster = %self.inner.name, member = %address, "member joined");
        self.inner.view_changed();

        MemoryTransport {
            cluster: self.inner.clone(),
            address,
            closed: AtomicBool::new(false),
        }
    }

    /// Link two clusters in both directions.
    pub fn link(&self, other: &LocalCluster) {
        self.inner
            .links
            .insert(other.inner.name.clone(), Arc::downgrade(&other.inner));
        other
            .inner
            .links
            .insert(self.inner.name.clone(), Arc::downgrade(&self.inner));
    }

    pub fn view(&self) -> View {
        self.inner.view()
    }

    pub fn member_count(&self) -> usize {
        self.inner.members.len()
    }
}

impl ClusterInner {
    fn view(&self) -> View {
        let mut members: Vec<(u64, NodeAddress)> = self
            .members
            .iter()
            .map(|m| (m.seq, m.key().clone()))
            .collect();
        members.sort_by_key(|(seq, _)| *seq);
        View::new(
            self.view_id.load(Ordering::SeqCst),
            members.into_iter().map(|(_, a)| a).collect(),
        )
    }

    fn leave(&self, address: &NodeAddress) {
        if self.members.remove(address).is_some() {
            tracing::debug!(cluster = %self.name, member = %address, "member left");
            self.view_changed();
        }
    }

    fn view_changed(&self) {
        self.view_id.fetch_add(1, Ordering::SeqCst);
        let view = self.view();
        // Collect first so no shard lock is held while receivers run.
        let receivers: Vec<Arc<dyn Receiver>> = self
            .members
            .iter()
            .filter_map(|m| m.receiver.clone())
            .collect();
        for receiver in receivers {
            receiver.on_view_changed(&view);
        }
    }

    fn receiver_of(&self, address: &NodeAddress) -> Option<Option<Arc<dyn Receiver>>> {
        self.members.get(address).map(|m| m.receiver.clone())
    }

    fn linked(&self) -> Vec<Arc<ClusterInner>> {
        self.links.iter().filter_map(|l| l.value().upgrade()).collect()
    }

    /// Deliver to one member. Returns false when `to` is not a member.
    fn deliver(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        bytes: &[u8],
    ) -> Result<bool, TransportError> {
        let Some(receiver) = self.receiver_of(to) else {
            return Ok(false);
        };
        let mut packet = Packet::from_bytes(bytes)?;
        packet.mark_delivered(from.clone(), to.clone());
        match receiver {
            Some(receiver) => receiver.on_message(packet),
            None => tracing::trace!(member = %to, packet = %packet, "member has no receiver, dropping packet"),
        }
        Ok(true)
    }

    fn deliver_all(
        &self,
        from: &NodeAddress,
        skip: Option<&NodeAddress>,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        for member in self.view().members() {
            if Some(member) == skip {
                continue;
            }
            self.deliver(from, member, bytes)?;
        }
        Ok(())
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// One member's handle on a [`LocalCluster`].
pub struct MemoryTransport {
    cluster: Arc<ClusterInner>,
    address: NodeAddress,
    closed: AtomicBool,
}

impl GroupTransport for MemoryTransport {
    fn local_address(&self) -> NodeAddress {
        self.address.clone()
    }

    fn view(&self) -> View {
        self.cluster.view()
    }

    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let bytes = envelope.packet().to_bytes()?;
        let from = &self.address;

        match envelope.destination() {
            Destination::Unicast(to) => {
                if self.cluster.deliver(from, to, &bytes)? {
                    return Ok(());
                }
                if envelope.relay() {
                    for cluster in self.cluster.linked() {
                        if cluster.deliver(from, to, &bytes)? {
                            return Ok(());
                        }
                    }
                }
                Err(TransportError::UnknownDestination(to.clone()))
            }
            Destination::Broadcast { loopback } => {
                let skip = if *loopback { None } else { Some(from) };
                self.cluster.deliver_all(from, skip, &bytes)?;
                if envelope.relay() {
                    for cluster in self.cluster.linked() {
                        cluster.deliver_all(from, None, &bytes)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        if let Some(mut member) = self.cluster.members.get_mut(&self.address) {
            member.receiver = Some(receiver);
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cluster.leave(&self.address);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
