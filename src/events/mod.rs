//! # Progress Event Bus
//!
//! Fans progress events out from the job thread to any number of listeners.
//!
//! ## Delivery Model
//!
//! - every subscriber owns an unbounded channel; publishing never waits on
//!   a subscriber, and a slow or abandoned one cannot starve the others
//! - the bus remembers the latest event per job, even with no subscribers
//! - a new subscriber is seeded with that latest event, then receives
//!   everything published afterwards, in order
//!
//! Seeding and registration happen under the same lock as publishing, so a
//! late subscriber never misses or duplicates an event.
//!
//! ## Example
//!
//! ```
//! use uuid::Uuid;
//! use wainlux::events::{EventBus, Phase};
//!
//! let bus = EventBus::new();
//! let job = Uuid::new_v4();
//! bus.emit(job, Phase::Setup, 0, "queued");
//!
//! let mut sub = bus.subscribe(job);
//! let first = sub.try_recv().unwrap();
//! assert_eq!(first.phase, Phase::Setup);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Named stage of a burn job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Connect,
    Prepare,
    Upload,
    Burning,
    Wait,
    Finalize,
    Complete,
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error | Phase::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Connect => "connect",
            Phase::Prepare => "prepare",
            Phase::Upload => "upload",
            Phase::Burning => "burning",
            Phase::Wait => "wait",
            Phase::Finalize => "finalize",
            Phase::Complete => "complete",
            Phase::Error => "error",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    /// Per-job sequence number, assigned by the bus
    pub seq: u64,
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
    /// Stable error kind on terminal failures
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_kind: Option<String>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: Uuid, phase: Phase, percent: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            seq: 0,
            phase,
            percent: percent.min(100),
            message: message.into(),
            error_kind: None,
            at: Utc::now(),
        }
    }

    pub fn with_error_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

struct Subscriber {
    id: u64,
    tx: UnboundedSender<ProgressEvent>,
}

#[derive(Default)]
struct BusInner {
    next_subscriber: u64,
    latest: HashMap<Uuid, ProgressEvent>,
    next_seq: HashMap<Uuid, u64>,
    subscribers: HashMap<Uuid, Vec<Subscriber>>,
}

/// Cloneable handle to the bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventBus")
            .field("jobs", &inner.latest.len())
            .field(
                "subscribers",
                &inner.subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an event to a job's stream. The bus stamps the sequence
    /// number and returns the event as stored.
    pub fn publish(&self, job_id: Uuid, mut event: ProgressEvent) -> ProgressEvent {
        event.job_id = job_id;
        let mut inner = self.lock();

        let seq = inner.next_seq.entry(job_id).or_insert(0);
        event.seq = *seq;
        *seq += 1;

        inner.latest.insert(job_id, event.clone());

        if let Some(subs) = inner.subscribers.get_mut(&job_id) {
            subs.retain(|sub| sub.tx.send(event.clone()).is_ok());
        }

        log::debug!(
            "[{}] #{} {} {}% {}",
            job_id,
            event.seq,
            event.phase,
            event.percent,
            event.message
        );
        event
    }

    /// Shorthand for publishing a fresh [`ProgressEvent`].
    pub fn emit(
        &self,
        job_id: Uuid,
        phase: Phase,
        percent: u8,
        message: impl Into<String>,
    ) -> ProgressEvent {
        self.publish(job_id, ProgressEvent::new(job_id, phase, percent, message))
    }

    /// Open an isolated channel for `job_id`, seeded with its latest event.
    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if let Some(latest) = inner.latest.get(&job_id) {
            // rx is alive, send cannot fail
            let _ = tx.send(latest.clone());
        }

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner
            .subscribers
            .entry(job_id)
            .or_default()
            .push(Subscriber { id, tx });

        Subscription {
            job_id,
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Detach a subscriber. Dropping the [`Subscription`] does the same.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Latest event recorded for a job.
    pub fn latest(&self, job_id: Uuid) -> Option<ProgressEvent> {
        self.lock().latest.get(&job_id).cloned()
    }

    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        self.lock()
            .subscribers
            .get(&job_id)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Drop everything recorded for a finished job.
    pub fn forget(&self, job_id: Uuid) {
        let mut inner = self.lock();
        inner.latest.remove(&job_id);
        inner.next_seq.remove(&job_id);
        inner.subscribers.remove(&job_id);
    }
}

fn remove_subscriber(inner: &Mutex<BusInner>, job_id: Uuid, id: u64) {
    let mut inner = inner.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(subs) = inner.subscribers.get_mut(&job_id) {
        subs.retain(|s| s.id != id);
        if subs.is_empty() {
            inner.subscribers.remove(&job_id);
        }
    }
}

/// One subscriber's private stream.
pub struct Subscription {
    job_id: Uuid,
    id: u64,
    rx: UnboundedReceiver<ProgressEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event; `None` once the bus is gone or the job was forgotten.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive for non-async callers. Must not be called from
    /// inside a tokio runtime.
    pub fn blocking_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.blocking_recv()
    }

    /// Poll for the next event until `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            remove_subscriber(&inner, self.job_id, self.id);
        }
    }
}
