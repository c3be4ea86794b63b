//! murmur-services — request/broadcast messaging on top of a group transport.
//!
//! [`NetworkManager`] is the entry point: register handlers, build
//! transmissions, and collect correlated responses.

pub mod collection;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod transmission;
pub mod transport;

pub use collection::{
    CollectionEngine, CollectionError, CollectionHandle, CollectionOutcome, CollectionSpec,
    DuplicateCollection, Target,
};
pub use manager::NetworkManager;
pub use memory::{LocalCluster, MemoryTransport};
pub use registry::{HandlerId, HandlerRegistry};
pub use runtime::{DispatchLoop, Job, Scheduler, TimerHandle, TokioDispatchLoop, TokioScheduler};
pub use transmission::{
    CollectionBuilder, PendingCollection, Transmission, TransmissionBuilder, TransmissionError,
};
pub use transport::{Destination, Envelope, GroupTransport, Receiver, TransportError, View};
