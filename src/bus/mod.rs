//! Event Bus and Worker Pool
//!
//! Typed, filtered publish/subscribe with async fanout, drop-on-overflow and
//! latency tracking.
//!
//! # Delivery Contract
//!
//! - At-most-once delivery to each active subscription whose type and filter
//!   match the published event.
//! - Sync handlers run inline on a worker; within one subscription they see
//!   events in publication order.
//! - Async handlers run on a fresh task per event; panics are isolated,
//!   counted in `processing_errors` and never affect other subscribers.
//! - No ordering guarantee across subscriptions or across async handlers of
//!   the same subscription. Consumers that need temporal causality use a
//!   single sync subscription.
//!
//! # Backpressure
//!
//! `publish` never blocks: when the queue is saturated the event is dropped
//! and `events_dropped` is incremented. Sustained load surfaces via counters,
//! not paused producers. Admission control belongs upstream.

pub mod cancel;
pub mod events;

pub use cancel::CancelToken;
pub use events::{
    AlertSeverity, BalanceUpdate, BusEvent, EventPayload, EventType, ExecutionReport,
    HeartbeatEvent, KillSwitchEvent, PnlUpdate, RiskAlert,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::BusError;

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Number of dispatch workers.
    pub num_workers: usize,
    /// Bounded queue capacity; publishes beyond it are dropped.
    pub buffer_size: usize,
    /// Grace period for draining in-flight events on `stop`.
    pub drain_grace: Duration,
    /// Sliding window size for latency percentiles.
    pub latency_sample_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            num_workers: 16,
            buffer_size: 100_000,
            drain_grace: Duration::from_secs(5),
            latency_sample_size: 10_000,
        }
    }
}

/// Predicate applied to events before delivery to a subscription.
pub type EventFilter = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;

/// Subscription handler. Async subscriptions run the same callable on a
/// fresh task per event.
pub type EventHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Subscription options.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub filter: Option<EventFilter>,
    /// Dispatch each event on a fresh task instead of inline on a worker.
    pub async_handler: bool,
    /// Maximum concurrently running handler tasks for an async subscription.
    pub buffer_size: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: None,
            async_handler: false,
            buffer_size: 1024,
        }
    }
}

impl SubscribeOptions {
    pub fn asynchronous() -> Self {
        Self {
            async_handler: true,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Filter to a single symbol.
    pub fn for_symbol(self, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        self.with_filter(Arc::new(move |event: &BusEvent| {
            event.payload.symbol() == Some(symbol.as_str())
        }))
    }
}

/// Opaque subscription identifier returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

struct SubscriptionEntry {
    id: SubscriptionId,
    /// `None` matches every event type.
    event_type: Option<EventType>,
    filter: Option<EventFilter>,
    handler: EventHandler,
    async_handler: bool,
    permits: Option<Arc<Semaphore>>,
    active: AtomicBool,
}

impl SubscriptionEntry {
    fn matches(&self, event: &BusEvent) -> bool {
        if let Some(event_type) = self.event_type {
            if event_type != event.event_type() {
                return false;
            }
        }
        match &self.filter {
            Some(filter) => filter(event),
            None => true,
        }
    }
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStatsSnapshot {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub processing_errors: u64,
    pub in_flight: u64,
    pub active_subscriptions: usize,
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Sliding window of publish-to-handler latencies.
struct LatencyWindow {
    samples: VecDeque<u64>,
    cap: usize,
    sum: u128,
}

impl LatencyWindow {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
            sum: 0,
        }
    }

    fn record(&mut self, micros: u64) {
        if self.samples.len() == self.cap {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted as u128;
            }
        }
        self.samples.push_back(micros);
        self.sum += micros as u128;
    }

    fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum as f64 / self.samples.len() as f64
    }

    fn p99(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() * 99) / 100;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// State shared between the bus handle, workers and spawned handler tasks.
struct BusShared {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicU64,
    max_latency_us: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl BusShared {
    fn new(latency_cap: usize) -> Self {
        Self {
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_latency_us: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(latency_cap)),
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
        self.latency.lock().record(micros);
    }
}

struct QueuedEvent {
    event: BusEvent,
    enqueued_at: Instant,
}

type SubList = Vec<Arc<SubscriptionEntry>>;

/// The event bus. Cheap to share behind an `Arc`.
pub struct EventBus {
    config: EventBusConfig,
    tx: mpsc::Sender<QueuedEvent>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedEvent>>>,
    subs: Arc<ArcSwap<SubList>>,
    subs_write: Mutex<()>,
    shared: Arc<BusShared>,
    cancel: CancelToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopping: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let shared = Arc::new(BusShared::new(config.latency_sample_size));
        Self {
            config,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            subs: Arc::new(ArcSwap::from_pointee(Vec::new())),
            subs_write: Mutex::new(()),
            shared,
            cancel: CancelToken::new(),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the dispatch workers. Idempotent; must run inside a tokio
    /// runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.num_workers.max(1) {
            let rx = Arc::clone(&self.rx);
            let subs = Arc::clone(&self.subs);
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker_id, "bus worker started");
                loop {
                    let queued = tokio::select! {
                        _ = cancel.cancelled() => break,
                        queued = async { rx.lock().await.recv().await } => queued,
                    };
                    match queued {
                        Some(queued) => dispatch(&queued, &subs.load(), &shared),
                        None => break,
                    }
                }
                debug!(worker_id, "bus worker stopped");
            }));
        }
    }

    /// Non-blocking publish. Drops the event and increments `events_dropped`
    /// when the queue is saturated.
    pub fn publish(&self, event: BusEvent) -> Result<(), BusError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(QueuedEvent {
            event,
            enqueued_at: Instant::now(),
        }) {
            Ok(()) => {
                self.shared.in_flight.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BusError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Err(BusError::Stopped)
            }
        }
    }

    /// Blocking publish: the event is dispatched inline on the caller, so
    /// sync handlers observe publication order within the call chain.
    pub fn publish_sync(&self, event: BusEvent) -> Result<(), BusError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedEvent {
            event,
            enqueued_at: Instant::now(),
        };
        dispatch(&queued, &self.subs.load(), &self.shared);
        Ok(())
    }

    /// Subscribe to a single event type.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.add_subscription(Some(event_type), handler, options)
    }

    /// Subscribe to every event type.
    pub fn subscribe_all(&self, handler: EventHandler, options: SubscribeOptions) -> SubscriptionId {
        self.add_subscription(None, handler, options)
    }

    fn add_subscription(
        &self,
        event_type: Option<EventType>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let permits = options
            .async_handler
            .then(|| Arc::new(Semaphore::new(options.buffer_size.max(1))));
        let entry = Arc::new(SubscriptionEntry {
            id,
            event_type,
            filter: options.filter,
            handler,
            async_handler: options.async_handler,
            permits,
            active: AtomicBool::new(true),
        });

        let _guard = self.subs_write.lock();
        let mut list: SubList = (**self.subs.load()).clone();
        list.push(entry);
        self.subs.store(Arc::new(list));
        id
    }

    /// Remove a subscription. In-flight dispatches observe the inactive flag
    /// and skip delivery.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _guard = self.subs_write.lock();
        let current = self.subs.load();
        let mut found = false;
        let list: SubList = current
            .iter()
            .filter(|entry| {
                if entry.id == id {
                    entry.active.store(false, Ordering::SeqCst);
                    found = true;
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        if found {
            self.subs.store(Arc::new(list));
        }
        found
    }

    /// Current statistics.
    pub fn stats(&self) -> BusStatsSnapshot {
        let latency = self.shared.latency.lock();
        BusStatsSnapshot {
            events_published: self.shared.published.load(Ordering::Relaxed),
            events_processed: self.shared.processed.load(Ordering::Relaxed),
            events_dropped: self.shared.dropped.load(Ordering::Relaxed),
            processing_errors: self.shared.errors.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            active_subscriptions: self.subs.load().len(),
            avg_latency_us: latency.avg(),
            max_latency_us: self.shared.max_latency_us.load(Ordering::Relaxed),
            p99_latency_us: latency.p99(),
        }
    }

    /// Stop the bus: reject new publishes, drain in-flight events for up to
    /// the configured grace period, then cancel the workers. Events still
    /// queued after the grace period are reported as drops.
    pub async fn stop(&self) -> BusStatsSnapshot {
        self.stopping.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.drain_grace;
        while self.shared.in_flight.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        let remaining = self.shared.in_flight.swap(0, Ordering::SeqCst);
        if remaining > 0 {
            self.shared.dropped.fetch_add(remaining, Ordering::Relaxed);
            warn!(remaining, "bus drain timed out, undelivered events dropped");
        }
        self.stats()
    }

    /// Spawn a heartbeat task publishing bus stats at `interval` until the
    /// bus stops.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = bus.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let stats = bus.stats();
                let mut details = std::collections::BTreeMap::new();
                details.insert("published".into(), stats.events_published.to_string());
                details.insert("processed".into(), stats.events_processed.to_string());
                details.insert("dropped".into(), stats.events_dropped.to_string());
                details.insert("errors".into(), stats.processing_errors.to_string());
                let now = chrono::Utc::now();
                let _ = bus.publish(BusEvent::new(
                    EventPayload::Heartbeat(HeartbeatEvent {
                        component: "event_bus".into(),
                        timestamp: now,
                        details,
                    }),
                    now,
                ));
            }
        })
    }
}

/// Deliver one event to every matching active subscription.
fn dispatch(queued: &QueuedEvent, subs: &SubList, shared: &Arc<BusShared>) {
    shared.record_latency(queued.enqueued_at.elapsed());

    for entry in subs.iter() {
        if !entry.active.load(Ordering::SeqCst) || !entry.matches(&queued.event) {
            continue;
        }
        if entry.async_handler {
            spawn_handler(entry, &queued.event, shared);
        } else {
            run_handler(entry, &queued.event, shared);
        }
    }

    shared.processed.fetch_add(1, Ordering::Relaxed);
    // publish_sync dispatches without enqueueing; saturating keeps the
    // counter consistent for both paths.
    let _ = shared
        .in_flight
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

fn run_handler(entry: &SubscriptionEntry, event: &BusEvent, shared: &Arc<BusShared>) {
    let result = catch_unwind(AssertUnwindSafe(|| (entry.handler)(event)));
    if result.is_err() {
        shared.errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            subscription = %entry.id.0,
            event_id = %event.id,
            event_type = %event.event_type(),
            "subscriber panicked, isolated"
        );
    }
}

fn spawn_handler(entry: &Arc<SubscriptionEntry>, event: &BusEvent, shared: &Arc<BusShared>) {
    let entry_task = Arc::clone(entry);
    let event_task = event.clone();
    let shared_task = Arc::clone(shared);
    let task = async move {
        let _permit = match &entry_task.permits {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };
        run_handler(&entry_task, &event_task, &shared_task);
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        // No runtime on this thread (publish_sync from sync code): degrade
        // to inline execution, keeping the at-most-once guarantee.
        Err(_) => run_handler(entry, event, shared),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bar, Side, Signal};
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2023-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn bar_event(symbol: &str) -> BusEvent {
        BusEvent::new(
            EventPayload::Bar(Bar {
                symbol: symbol.into(),
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100.5),
                volume: dec!(10),
                timestamp: t0(),
            }),
            t0(),
        )
    }

    fn signal_event(symbol: &str) -> BusEvent {
        BusEvent::new(
            EventPayload::Signal(Signal::new(symbol, Side::Buy, 0.5, "test", t0())),
            t0(),
        )
    }

    async fn settle(bus: &EventBus) {
        for _ in 0..500 {
            if bus.stats().in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_typed_delivery_and_filtering() {
        let bus = EventBus::new(EventBusConfig {
            num_workers: 2,
            ..Default::default()
        });
        bus.start();

        let bars = Arc::new(AtomicUsize::new(0));
        let sol_bars = Arc::new(AtomicUsize::new(0));
        let everything = Arc::new(AtomicUsize::new(0));

        {
            let bars = Arc::clone(&bars);
            bus.subscribe(
                EventType::Bar,
                Arc::new(move |_| {
                    bars.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            );
        }
        {
            let sol_bars = Arc::clone(&sol_bars);
            bus.subscribe(
                EventType::Bar,
                Arc::new(move |_| {
                    sol_bars.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default().for_symbol("SOL/USDT"),
            );
        }
        {
            let everything = Arc::clone(&everything);
            bus.subscribe_all(
                Arc::new(move |_| {
                    everything.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            );
        }

        bus.publish(bar_event("SOL/USDT")).unwrap();
        bus.publish(bar_event("ETH/USDT")).unwrap();
        bus.publish(signal_event("SOL/USDT")).unwrap();
        settle(&bus).await;

        assert_eq!(bars.load(Ordering::SeqCst), 2);
        assert_eq!(sol_bars.load(Ordering::SeqCst), 1);
        assert_eq!(everything.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panic_isolation() {
        let bus = EventBus::new(EventBusConfig {
            num_workers: 2,
            ..Default::default()
        });
        bus.start();

        let delivered = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventType::Bar,
            Arc::new(|_| panic!("handler bug")),
            SubscribeOptions::default(),
        );
        {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(
                EventType::Bar,
                Arc::new(move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            );
        }

        bus.publish(bar_event("SOL/USDT")).unwrap();
        settle(&bus).await;

        let stats = bus.stats();
        assert_eq!(stats.processing_errors, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(stats.events_processed, 1);
    }

    #[tokio::test]
    async fn test_drop_on_overflow() {
        // Workers never started, so the queue fills up.
        let bus = EventBus::new(EventBusConfig {
            num_workers: 1,
            buffer_size: 8,
            ..Default::default()
        });

        for _ in 0..8 {
            bus.publish(bar_event("SOL/USDT")).unwrap();
        }
        let result = bus.publish(bar_event("SOL/USDT"));
        assert_eq!(result, Err(BusError::QueueFull));

        let stats = bus.stats();
        assert_eq!(stats.events_published, 9);
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.in_flight, 8);
        // Conservation: published == processed + dropped + in_flight
        assert_eq!(
            stats.events_published,
            stats.events_processed + stats.events_dropped + stats.in_flight
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_publish_sync_inline_ordering() {
        let bus = EventBus::new(EventBusConfig::default());
        // No workers needed for the sync path.
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            bus.subscribe_all(
                Arc::new(move |event| {
                    order.lock().push(event.event_type());
                }),
                SubscribeOptions::default(),
            );
        }

        bus.publish_sync(bar_event("SOL/USDT")).unwrap();
        bus.publish_sync(signal_event("SOL/USDT")).unwrap();
        bus.publish_sync(bar_event("SOL/USDT")).unwrap();

        assert_eq!(
            *order.lock(),
            vec![EventType::Bar, EventType::Signal, EventType::Bar]
        );
        let stats = bus.stats();
        assert_eq!(stats.events_published, 3);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unsubscribe() {
        let bus = EventBus::new(EventBusConfig {
            num_workers: 1,
            ..Default::default()
        });
        bus.start();

        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            bus.subscribe(
                EventType::Bar,
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            )
        };

        bus.publish(bar_event("SOL/USDT")).unwrap();
        settle(&bus).await;
        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        bus.publish(bar_event("SOL/USDT")).unwrap();
        settle(&bus).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().active_subscriptions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_sustained_load_conservation() {
        // Scaled-down soak: four subscribers, tens of thousands of events.
        let bus = Arc::new(EventBus::new(EventBusConfig {
            num_workers: 16,
            buffer_size: 100_000,
            ..Default::default()
        }));
        bus.start();

        let received = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let received = Arc::clone(&received);
            bus.subscribe(
                EventType::Bar,
                Arc::new(move |_| {
                    received.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            );
        }

        const TOTAL: u64 = 50_000;
        for _ in 0..TOTAL {
            let _ = bus.publish(bar_event("SOL/USDT"));
        }
        settle(&bus).await;
        let stats = bus.stop().await;

        assert_eq!(stats.events_published, TOTAL);
        assert_eq!(stats.events_processed + stats.events_dropped, TOTAL);
        assert_eq!(stats.processing_errors, 0);
        assert_eq!(
            received.load(Ordering::SeqCst) as u64,
            stats.events_processed * 4
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_rejects_publishers() {
        let bus = EventBus::new(EventBusConfig {
            num_workers: 2,
            ..Default::default()
        });
        bus.start();
        bus.publish(bar_event("SOL/USDT")).unwrap();
        let _ = bus.stop().await;

        assert_eq!(bus.publish(bar_event("SOL/USDT")), Err(BusError::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_heartbeat_publishes_stats() {
        let bus = Arc::new(EventBus::new(EventBusConfig {
            num_workers: 2,
            ..Default::default()
        }));
        bus.start();

        let beats = Arc::new(AtomicUsize::new(0));
        {
            let beats = Arc::clone(&beats);
            bus.subscribe(
                EventType::Heartbeat,
                Arc::new(move |event| {
                    if let EventPayload::Heartbeat(hb) = &event.payload {
                        assert_eq!(hb.component, "event_bus");
                        assert!(hb.details.contains_key("published"));
                    }
                    beats.fetch_add(1, Ordering::SeqCst);
                }),
                SubscribeOptions::default(),
            );
        }

        let handle = bus.spawn_heartbeat(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = bus.stop().await;
        let _ = handle.await;
        assert!(beats.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_latency_window_percentiles() {
        let mut window = LatencyWindow::new(100);
        for i in 1..=100 {
            window.record(i);
        }
        assert_eq!(window.p99(), 100);
        assert!((window.avg() - 50.5).abs() < 1e-9);

        // Eviction keeps the window bounded
        window.record(1000);
        assert_eq!(window.samples.len(), 100);
    }
}
