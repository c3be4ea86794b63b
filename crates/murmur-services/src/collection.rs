//! Collection engine — tracks outstanding scatter-gather requests and
//! resolves each of them exactly once.
//!
//! Every pending collection lives in a shared table keyed by its
//! [`CollectionId`]. A collection ends when one of four things happens first:
//! enough responses arrive, its timeout fires, it is cancelled, or the send
//! that started it fails. Whichever cause removes the entry from the table
//! owns the resolution; every other cause finds nothing and does nothing.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use murmur_core::{CollectionId, NodeAddress, Packet};
use tokio::sync::oneshot;

use crate::runtime::{Scheduler, TimerHandle};
use crate::transport::View;

// ── Targets ───────────────────────────────────────────────────────────────────

/// How many responses complete a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A fixed number of responses. Membership changes never lower it.
    Exact(usize),
    /// One response per member expected to receive the request. When the
    /// view shrinks the target shrinks with it.
    AllMembers {
        expected: usize,
        excluding: Option<NodeAddress>,
    },
}

impl Target {
    /// Responses needed under the view the request was sent in.
    pub fn required(&self) -> usize {
        match self {
            Target::Exact(n) => *n,
            Target::AllMembers { expected, .. } => *expected,
        }
    }

    /// Lower a collect-all target to the members still present in `view`.
    /// Fixed targets are left alone, and no target ever grows.
    pub fn shrink_to(&mut self, view: &View) {
        if let Target::AllMembers {
            expected,
            excluding,
        } = self
        {
            *expected = (*expected).min(view.eligible(excluding.as_ref()));
        }
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Terminal state of a collection.
#[derive(Debug, Clone)]
pub enum CollectionOutcome {
    /// Enough responses arrived. Responses are in arrival order.
    Completed(Vec<Packet>),
    /// The timeout fired first. Carries whatever had arrived.
    TimedOut { received: Vec<Packet> },
    Cancelled,
    /// The collection could not proceed, e.g. the request was never sent.
    Failed(String),
}

impl CollectionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CollectionOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<Vec<Packet>, CollectionError> {
        match self {
            CollectionOutcome::Completed(packets) => Ok(packets),
            CollectionOutcome::TimedOut { received } => Err(CollectionError::TimedOut {
                received: received.len(),
            }),
            CollectionOutcome::Cancelled => Err(CollectionError::Cancelled),
            CollectionOutcome::Failed(reason) => Err(CollectionError::Failed(reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("collection timed out after {received} responses")]
    TimedOut { received: usize },
    #[error("collection cancelled")]
    Cancelled,
    #[error("collection failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("collection {0} is already pending")]
pub struct DuplicateCollection(pub CollectionId);

// ── Callbacks ─────────────────────────────────────────────────────────────────

type DoneFn = Box<dyn FnOnce(&[Packet]) + Send>;
type TimeoutFn = Box<dyn FnOnce(&[Packet]) + Send>;
type ErrorFn = Box<dyn FnOnce(&CollectionError) + Send>;

/// Callbacks attached at build time. Run on whichever thread resolves the
/// collection, after it has left the table.
#[derive(Default)]
pub struct Callbacks {
    on_done: Vec<DoneFn>,
    on_timeout: Option<TimeoutFn>,
    on_error: Option<ErrorFn>,
}

impl Callbacks {
    pub fn on_done(&mut self, f: impl FnOnce(&[Packet]) + Send + 'static) {
        self.on_done.push(Box::new(f));
    }

    pub fn on_timeout(&mut self, f: impl FnOnce(&[Packet]) + Send + 'static) {
        self.on_timeout = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl FnOnce(&CollectionError) + Send + 'static) {
        self.on_error = Some(Box::new(f));
    }

    fn run(self, id: CollectionId, outcome: &CollectionOutcome) {
        match outcome {
            CollectionOutcome::Completed(packets) => {
                for f in self.on_done {
                    guarded(id, "on_done", || f(packets));
                }
            }
            CollectionOutcome::TimedOut { received } => {
                if let Some(f) = self.on_timeout {
                    guarded(id, "on_timeout", || f(received));
                } else if let Some(f) = self.on_error {
                    let err = CollectionError::TimedOut {
                        received: received.len(),
                    };
                    guarded(id, "on_error", || f(&err));
                }
            }
            CollectionOutcome::Cancelled => {
                if let Some(f) = self.on_error {
                    guarded(id, "on_error", || f(&CollectionError::Cancelled));
                }
            }
            CollectionOutcome::Failed(reason) => {
                if let Some(f) = self.on_error {
                    let err = CollectionError::Failed(reason.clone());
                    guarded(id, "on_error", || f(&err));
                }
            }
        }
    }
}

fn guarded(id: CollectionId, callback: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(collection = %id, callback, "collection callback panicked");
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_done", &self.on_done.len())
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Everything the engine needs to register a collection.
#[derive(Debug)]
pub struct CollectionSpec {
    pub target: Target,
    pub timeout: Option<Duration>,
    pub callbacks: Callbacks,
}

impl CollectionSpec {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            timeout: None,
            callbacks: Callbacks::default(),
        }
    }
}

// ── Result handle ─────────────────────────────────────────────────────────────

/// Resolves once with the collection's outcome. Await it, poll it with
/// [`try_outcome`](Self::try_outcome), or block on it from a non-async thread.
/// Polling first and awaiting afterwards yields the same outcome.
#[derive(Debug)]
pub struct CollectionHandle {
    id: CollectionId,
    rx: oneshot::Receiver<CollectionOutcome>,
    /// Set once `try_outcome` has taken the outcome off the channel.
    outcome: Option<CollectionOutcome>,
}

impl CollectionHandle {
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// The outcome if the collection has already resolved.
    pub fn try_outcome(&mut self) -> Option<CollectionOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Some(dropped()),
            };
        }
        self.outcome.clone()
    }

    /// Block the current thread until the outcome is known.
    /// Panics when called from inside an async context.
    pub fn wait_blocking(self) -> CollectionOutcome {
        match self.outcome {
            Some(outcome) => outcome,
            None => self.rx.blocking_recv().unwrap_or_else(|_| dropped()),
        }
    }
}

impl Future for CollectionHandle {
    type Output = CollectionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome.take() {
            return Poll::Ready(outcome);
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| dropped()))
    }
}

fn dropped() -> CollectionOutcome {
    CollectionOutcome::Failed("collection dropped without an outcome".to_string())
}

// ── Engine ────────────────────────────────────────────────────────────────────

struct PendingEntry {
    target: Target,
    responses: Vec<Packet>,
    // Never locked; taken whole by `finish`. Lets callbacks be `Send` only.
    callbacks: Mutex<Callbacks>,
    reply: oneshot::Sender<CollectionOutcome>,
    timer: Option<TimerHandle>,
}

impl PendingEntry {
    fn satisfied(&self) -> bool {
        self.responses.len() >= self.target.required()
    }

    /// Consume the entry and deliver `outcome`. Only ever called on an entry
    /// that has already been removed from the table.
    fn finish(mut self, id: CollectionId, outcome: CollectionOutcome) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        let callbacks = self
            .callbacks
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        callbacks.run(id, &outcome);
        // The caller may have dropped the handle; callbacks still ran.
        let _ = self.reply.send(outcome);
    }
}

type PendingTable = Arc<DashMap<CollectionId, PendingEntry>>;

/// The pending-collection table plus the scheduler that drives timeouts.
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct CollectionEngine {
    pending: PendingTable,
    scheduler: Arc<dyn Scheduler>,
}

impl CollectionEngine {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            scheduler,
        }
    }

    /// Insert a collection and arm its timeout.
    pub fn register(
        &self,
        id: CollectionId,
        spec: CollectionSpec,
    ) -> Result<CollectionHandle, DuplicateCollection> {
        let CollectionSpec {
            target,
            timeout,
            callbacks,
        } = spec;
        let (reply, rx) = oneshot::channel();

        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(DuplicateCollection(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    target,
                    responses: Vec::new(),
                    callbacks: Mutex::new(callbacks),
                    reply,
                    timer: None,
                });
            }
        }
        tracing::trace!(collection = %id, ?timeout, "collection registered");

        if let Some(timeout) = timeout {
            let pending = self.pending.clone();
            let timer = self
                .scheduler
                .schedule(timeout, Box::new(move || expire(&pending, id)));
            match self.pending.get_mut(&id) {
                Some(mut entry) => entry.timer = Some(timer),
                // Already resolved before the timer was attached.
                None => timer.cancel(),
            }
        }

        // A target of zero is met before anything is sent.
        self.complete_if(id, PendingEntry::satisfied);

        Ok(CollectionHandle {
            id,
            rx,
            outcome: None,
        })
    }

    /// Route a RESPONSE packet to its collection. Responses for unknown or
    /// already-resolved collections are dropped.
    pub fn handle_response(&self, packet: Packet) {
        let Some(id) = packet.collection_id() else {
            tracing::trace!(packet = %packet, "response without a collection id, dropping it");
            return;
        };

        let satisfied = match self.pending.get_mut(&id) {
            Some(mut entry) => {
                entry.responses.push(packet);
                entry.satisfied()
            }
            None => {
                tracing::trace!(collection = %id, packet = %packet, "no pending collection, dropping response");
                return;
            }
        };

        if satisfied {
            self.complete_if(id, PendingEntry::satisfied);
        }
    }

    /// Re-evaluate every pending collection against a new membership view.
    pub fn reconcile(&self, view: &View) {
        let mut ready = Vec::new();
        for mut entry in self.pending.iter_mut() {
            entry.target.shrink_to(view);
            if entry.satisfied() {
                ready.push(*entry.key());
            }
        }

        for id in ready {
            tracing::debug!(collection = %id, view = %view, "collection satisfied after membership change");
            self.complete_if(id, PendingEntry::satisfied);
        }
    }

    /// Resolve a collection as cancelled. Returns false when it is no longer
    /// pending.
    pub fn cancel(&self, id: CollectionId) -> bool {
        self.resolve(id, CollectionOutcome::Cancelled)
    }

    /// Cancel every pending collection.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CollectionId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Resolve a collection as failed. Returns false when it is no longer
    /// pending.
    pub fn fail(&self, id: CollectionId, reason: impl Into<String>) -> bool {
        self.resolve(id, CollectionOutcome::Failed(reason.into()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: CollectionId) -> bool {
        self.pending.contains_key(&id)
    }

    fn resolve(&self, id: CollectionId, outcome: CollectionOutcome) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                tracing::debug!(collection = %id, ?outcome, "collection resolved");
                entry.finish(id, outcome);
                true
            }
            None => false,
        }
    }

    fn complete_if(&self, id: CollectionId, ready: impl Fn(&PendingEntry) -> bool) {
        if let Some((_, mut entry)) = self.pending.remove_if(&id, |_, entry| ready(entry)) {
            let responses = std::mem::take(&mut entry.responses);
            tracing::debug!(collection = %id, responses = responses.len(), "collection completed");
            entry.finish(id, CollectionOutcome::Completed(responses));
        }
    }
}

/// Timer job: resolve as timed out if nothing else got there first.
fn expire(pending: &PendingTable, id: CollectionId) {
    if let Some((_, mut entry)) = pending.remove(&id) {
        // This job is the timer; detach rather than cancel it.
        drop(entry.timer.take());
        let received = std::mem::take(&mut entry.responses);
        tracing::debug!(collection = %id, received = received.len(), "collection timed out");
        entry.finish(id, CollectionOutcome::TimedOut { received });
    }
}
