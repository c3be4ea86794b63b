//! Packet model — the unit of transmission between cluster nodes.
//!
//! A packet is an envelope (id, creation time, transport addresses) around a
//! typed JSON body. Bodies implement [`PacketBody`]; the packet carries the
//! BLAKE3 hash of the body's canonical name so receivers can route it without
//! decoding the payload.
//!
//! Collectable packets additionally carry a [`Correlation`]: a REQUEST mints a
//! fresh [`CollectionId`], and every RESPONSE built from it copies that id.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Process-wide unique packet identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId(Uuid);

impl PacketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PacketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_uuid(&self.0))
    }
}

/// Correlation key shared by a request and all of its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(Uuid);

impl CollectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&short_uuid(&self.0))
    }
}

/// First group of the hyphenated UUID, enough to tell packets apart in logs.
fn short_uuid(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[..8].to_string()
}

/// Transport-level address of a cluster member.
///
/// Two members may share a name across restarts; the `uid` tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    name: String,
    uid: Uuid,
}

impl NodeAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uuid::new_v4(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ── Packet types ──────────────────────────────────────────────────────────────

/// Packet type identifier: BLAKE3 hash of a canonical body name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketType([u8; 32]);

impl PacketType {
    /// Compute a PacketType from a canonical name.
    pub fn of(name: &str) -> Self {
        Self(*blake3::hash(name.as_bytes()).as_bytes())
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A typed packet body.
///
/// `NAME` is the protocol-level name of the body and must never change for a
/// given body once nodes exchange it.
pub trait PacketBody: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    fn packet_type() -> PacketType {
        PacketType::of(Self::NAME)
    }
}

// ── Correlation ───────────────────────────────────────────────────────────────

/// Role of a collectable packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectableKind {
    /// Follows the normal handler path on the receiving node.
    Request,
    /// Routed to the collection engine of the requesting node.
    Response,
}

impl fmt::Display for CollectableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectableKind::Request => f.write_str("REQUEST"),
            CollectableKind::Response => f.write_str("RESPONSE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub kind: CollectableKind,
    pub collection_id: CollectionId,
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// The unit of transmission.
///
/// `sender` and `recipient` are never serialized: the sending node does not
/// know its own address at construction time, so the transport fills them in
/// on delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    id: PacketId,
    /// Unix timestamp in milliseconds. Used for latency logging only.
    created_at: u64,
    packet_type: PacketType,
    type_name: String,
    correlation: Option<Correlation>,
    #[serde(skip)]
    sender: Option<NodeAddress>,
    #[serde(skip)]
    recipient: Option<NodeAddress>,
    body: serde_json::Value,
}

impl Packet {
    /// Create a plain (non-collectable) packet.
    pub fn new<B: PacketBody>(body: &B) -> Result<Self, PacketError> {
        Self::build(body, None)
    }

    /// Create a REQUEST packet with a freshly minted collection id.
    pub fn request<B: PacketBody>(body: &B) -> Result<Self, PacketError> {
        Self::build(
            body,
            Some(Correlation {
                kind: CollectableKind::Request,
                collection_id: CollectionId::new(),
            }),
        )
    }

    /// Create a RESPONSE packet answering `request`.
    pub fn response_to<B: PacketBody>(request: &Packet, body: &B) -> Result<Self, PacketError> {
        let collection_id = match request.correlation {
            Some(Correlation {
                kind: CollectableKind::Request,
                collection_id,
            }) => collection_id,
            _ => return Err(PacketError::NotARequest(request.id)),
        };
        Self::build(
            body,
            Some(Correlation {
                kind: CollectableKind::Response,
                collection_id,
            }),
        )
    }

    fn build<B: PacketBody>(body: &B, correlation: Option<Correlation>) -> Result<Self, PacketError> {
        Ok(Self {
            id: PacketId::new(),
            created_at: now_ms(),
            packet_type: B::packet_type(),
            type_name: B::NAME.to_string(),
            correlation,
            sender: None,
            recipient: None,
            body: serde_json::to_value(body).map_err(PacketError::Encode)?,
        })
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Milliseconds since creation, clamped at zero for skewed clocks.
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.created_at)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn correlation(&self) -> Option<&Correlation> {
        self.correlation.as_ref()
    }

    pub fn kind(&self) -> Option<CollectableKind> {
        self.correlation.map(|c| c.kind)
    }

    pub fn collection_id(&self) -> Option<CollectionId> {
        self.correlation.map(|c| c.collection_id)
    }

    pub fn is_request(&self) -> bool {
        self.kind() == Some(CollectableKind::Request)
    }

    pub fn is_response(&self) -> bool {
        self.kind() == Some(CollectableKind::Response)
    }

    pub fn sender(&self) -> Option<&NodeAddress> {
        self.sender.as_ref()
    }

    pub fn recipient(&self) -> Option<&NodeAddress> {
        self.recipient.as_ref()
    }

    /// Does this packet carry a body of type `B`?
    pub fn is<B: PacketBody>(&self) -> bool {
        self.packet_type == B::packet_type()
    }

    /// Decode the body as `B`.
    pub fn decode<B: PacketBody>(&self) -> Result<B, PacketError> {
        if !self.is::<B>() {
            return Err(PacketError::TypeMismatch {
                expected: B::NAME,
                found: self.type_name.clone(),
            });
        }
        B::deserialize(&self.body).map_err(PacketError::Decode)
    }

    /// Fill in transport addresses on delivery. Write-once: addresses that are
    /// already set are kept.
    pub fn mark_delivered(&mut self, sender: NodeAddress, recipient: NodeAddress) {
        if self.sender.is_none() {
            self.sender = Some(sender);
        }
        if self.recipient.is_none() {
            self.recipient = Some(recipient);
        }
    }

    /// Serialize for transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(PacketError::Encode)
    }

    /// Deserialize a received packet. Addresses are unset.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        serde_json::from_slice(data).map_err(PacketError::Decode)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.id)?;
        if let Some(kind) = self.kind() {
            write!(f, "_c({kind})")?;
        }
        if let (Some(sender), Some(recipient)) = (&self.sender, &self.recipient) {
            write!(f, "-s({sender})-r({recipient})")?;
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("failed to encode packet: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode packet: {0}")]
    Decode(serde_json::Error),
    #[error("expected {expected} body, found {found}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("packet {0} is not a collectable request")]
    NotARequest(PacketId),
}
