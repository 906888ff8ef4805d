//! Concurrent scheduler of reoccurring events.
//!
//! Each registered [`ReocEvent`] runs on its own tokio task: a one-shot
//! delay until the first firing, then a fixed-interval ticker. Within one
//! event, callbacks are strictly sequential; across events they may run in
//! parallel. Cancellation flows through watch channels: one root shutdown
//! for the whole scheduler plus one cancel handle per event for removal.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Callback invoked on every firing with the current time and the event.
///
/// Callbacks are synchronous; anything that needs the async world sends
/// through an unbounded channel instead of blocking the event task.
pub type Callback<T> = Arc<dyn Fn(DateTime<Utc>, &ReocEvent<T>) + Send + Sync>;

/// Errors from event construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PerioderError {
    /// The interval must be strictly positive.
    #[error("event interval must be > 0")]
    ZeroInterval,
}

/// A reoccurring event: fires every `interval` from `start`, optionally
/// until `stop`.
pub struct ReocEvent<T> {
    /// First (or reference) firing instant; may lie in the past.
    pub start: DateTime<Utc>,
    /// Firing period, strictly positive.
    pub interval: Duration,
    /// Optional deadline; the event never fires at or after this instant.
    pub stop: Option<DateTime<Utc>>,
    /// Human-readable description, shown in listings.
    pub desc: String,
    /// Caller-supplied payload, cloned into persistence records.
    pub meta: T,
    callback: Callback<T>,
    stopped: AtomicBool,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl<T> fmt::Debug for ReocEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReocEvent")
            .field("start", &self.start)
            .field("interval", &self.interval)
            .field("stop", &self.stop)
            .field("desc", &self.desc)
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for ReocEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (every {}s", self.desc, self.interval.as_secs())?;
        if let Some(stop) = self.stop {
            write!(f, ", until {}", stop.format("%Y-%m-%d %H:%M:%S"))?;
        }
        write!(f, ")")
    }
}

impl<T> ReocEvent<T> {
    /// Build an event.
    ///
    /// # Errors
    ///
    /// [`PerioderError::ZeroInterval`] when `interval` is zero.
    pub fn new(
        start: DateTime<Utc>,
        interval: Duration,
        stop: Option<DateTime<Utc>>,
        desc: impl Into<String>,
        meta: T,
        callback: Callback<T>,
    ) -> Result<Self, PerioderError> {
        if interval.is_zero() {
            return Err(PerioderError::ZeroInterval);
        }
        Ok(Self {
            start,
            interval,
            stop,
            desc: desc.into(),
            meta,
            callback,
            stopped: AtomicBool::new(false),
            cancel: Mutex::new(None),
        })
    }

    /// The caller-supplied payload.
    pub fn metadata(&self) -> &T {
        &self.meta
    }

    /// Whether the event has terminated (removed, deadline passed, or
    /// scheduler shut down).
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Request cancellation. Idempotent; a never-started event is marked
    /// stopped directly.
    fn cancel(&self) {
        let sender = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => {
                // The event task marks itself stopped when it observes this.
                let _ = tx.send(true);
            }
            None => self.mark_stopped(),
        }
    }
}

impl<T: Send + Sync + 'static> ReocEvent<T> {
    /// Launch the periodic task for this event.
    ///
    /// Stores the cancel handle on the event, then runs the schedule until
    /// cancel, root shutdown, or deadline.
    fn run_async(self: &Arc<Self>, root: watch::Receiver<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = Some(cancel_tx);
        }
        let event = Arc::clone(self);
        tokio::spawn(async move {
            event.run(root, cancel_rx).await;
        });
    }

    /// The per-event schedule loop.
    async fn run(
        self: Arc<Self>,
        mut root: watch::Receiver<bool>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let now = Utc::now();
        let first = first_fire(self.start, self.interval, now);

        let deadline = async {
            match self.stop {
                Some(stop) => tokio::time::sleep(until(stop, Utc::now())).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let first_at = tokio::time::Instant::now()
            .checked_add(until(first, now))
            .unwrap_or_else(tokio::time::Instant::now);
        let mut ticker = tokio::time::interval_at(first_at, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    (self.callback)(Utc::now(), &self);
                }
                _ = cancel.changed() => {
                    debug!(event = %self, "event cancelled");
                    break;
                }
                _ = root.changed() => {
                    debug!(event = %self, "scheduler shutdown reached event");
                    break;
                }
                _ = &mut deadline => {
                    debug!(event = %self, "event deadline reached");
                    break;
                }
            }
        }
        self.mark_stopped();
    }
}

/// Delay from `now` until `target`; zero when the target is already past.
fn until(target: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    target.signed_duration_since(now).to_std().unwrap_or_default()
}

/// First firing instant.
///
/// A future `start` fires at `start`. A past `start` is advanced by the
/// smallest whole number of intervals that lands at or after `now`.
fn first_fire(start: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let behind = now.signed_duration_since(start);
    if behind <= chrono::Duration::zero() {
        return start;
    }
    let interval_ns = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX).max(1);
    let behind_ns = behind.num_nanoseconds().unwrap_or(i64::MAX);
    let rem = behind_ns.rem_euclid(interval_ns);
    if rem == 0 {
        now
    } else {
        let gap = interval_ns.saturating_sub(rem);
        now.checked_add_signed(chrono::Duration::nanoseconds(gap))
            .unwrap_or(now)
    }
}

/// Persistable image of a [`ReocEvent`]: everything but the callback.
///
/// Callbacks cannot survive serialization; on restore the owner re-binds
/// each record to the current process's injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: DeserializeOwned"
))]
pub struct ReocEventRecord<T> {
    /// Event description.
    pub desc: String,
    /// Caller payload.
    pub meta: T,
    /// First firing instant.
    pub start: DateTime<Utc>,
    /// Firing period.
    pub interval: Duration,
    /// Optional deadline; absent means "no deadline".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<DateTime<Utc>>,
}

impl<T: Clone> ReocEventRecord<T> {
    /// Capture the persistable fields of a live event.
    pub fn of(event: &ReocEvent<T>) -> Self {
        Self {
            desc: event.desc.clone(),
            meta: event.meta.clone(),
            start: event.start,
            interval: event.interval,
            stop: event.stop,
        }
    }

    /// Re-animate the record with a freshly bound callback.
    ///
    /// # Errors
    ///
    /// [`PerioderError::ZeroInterval`] when the persisted interval is zero.
    pub fn into_event(self, callback: Callback<T>) -> Result<ReocEvent<T>, PerioderError> {
        ReocEvent::new(
            self.start,
            self.interval,
            self.stop,
            self.desc,
            self.meta,
            callback,
        )
    }
}

type EventMap<T> = Arc<RwLock<HashMap<u64, Arc<ReocEvent<T>>>>>;

/// Cloneable handle for registering, removing and listing events from any
/// task.
pub struct PerioderHandle<T> {
    add_tx: mpsc::UnboundedSender<ReocEvent<T>>,
    remove_tx: mpsc::UnboundedSender<u64>,
    events: EventMap<T>,
}

impl<T> Clone for PerioderHandle<T> {
    fn clone(&self) -> Self {
        Self {
            add_tx: self.add_tx.clone(),
            remove_tx: self.remove_tx.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<T> PerioderHandle<T> {
    /// Enqueue an event for registration; the scheduler assigns its id.
    pub fn add(&self, event: ReocEvent<T>) {
        if self.add_tx.send(event).is_err() {
            warn!("perioder is gone, dropping event registration");
        }
    }

    /// Cancel and deregister the event with `id`.
    pub fn remove(&self, id: u64) {
        if self.remove_tx.send(id).is_err() {
            warn!(id, "perioder is gone, dropping event removal");
        }
    }

    /// Snapshot of the live events: a fresh copy excluding any event that
    /// already terminated.
    pub fn events(&self) -> HashMap<u64, Arc<ReocEvent<T>>> {
        match self.events.read() {
            Ok(map) => map
                .iter()
                .filter(|(_, ev)| !ev.stopped())
                .map(|(id, ev)| (*id, Arc::clone(ev)))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }
}

impl<T: Clone + Serialize> PerioderHandle<T> {
    /// Persistable snapshot of the live events, ordered by id.
    pub fn snapshot(&self) -> BTreeMap<u64, ReocEventRecord<T>> {
        self.events()
            .iter()
            .map(|(id, ev)| (*id, ReocEventRecord::of(ev)))
            .collect()
    }
}

/// The scheduler. Owns the event map; runs until shutdown.
pub struct Perioder<T> {
    add_rx: mpsc::UnboundedReceiver<ReocEvent<T>>,
    remove_rx: mpsc::UnboundedReceiver<u64>,
    events: EventMap<T>,
    next_id: u64,
    root_tx: watch::Sender<bool>,
}

impl<T: Send + Sync + 'static> Perioder<T> {
    /// Create a scheduler and its cloneable handle.
    pub fn new() -> (Self, PerioderHandle<T>) {
        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (root_tx, _) = watch::channel(false);
        let events: EventMap<T> = Arc::new(RwLock::new(HashMap::new()));
        let handle = PerioderHandle {
            add_tx,
            remove_tx,
            events: Arc::clone(&events),
        };
        (
            Self {
                add_rx,
                remove_rx,
                events,
                next_id: 0,
                root_tx,
            },
            handle,
        )
    }

    /// Scheduler loop: serializes add/remove against the event map until
    /// `shutdown` signals, then cancels every event.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("perioder started");
        loop {
            tokio::select! {
                Some(event) = self.add_rx.recv() => self.register(event),
                Some(id) = self.remove_rx.recv() => self.deregister(id),
                _ = shutdown.changed() => break,
            }
        }
        // Fan the shutdown out to every event task.
        let _ = self.root_tx.send(true);
        info!("perioder stopped");
    }

    fn register(&mut self, event: ReocEvent<T>) {
        if let Some(stop) = event.stop {
            if stop <= Utc::now() {
                warn!(event = %event, "deadline already passed, not starting event");
                return;
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        let event = Arc::new(event);
        event.run_async(self.root_tx.subscribe());
        if let Ok(mut map) = self.events.write() {
            map.insert(id, Arc::clone(&event));
        }
        info!(id, event = %event, "event registered");
    }

    fn deregister(&mut self, id: u64) {
        let removed = match self.events.write() {
            Ok(mut map) => map.remove(&id),
            Err(_) => None,
        };
        match removed {
            Some(event) => {
                event.cancel();
                info!(id, event = %event, "event removed");
            }
            None => debug!(id, "removal for unknown event id"),
        }
    }
}
