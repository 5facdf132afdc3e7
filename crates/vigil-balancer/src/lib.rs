//! Synchronization engine between the health-checking core and the load
//! balancer.
//!
//! The core reports real-server transitions as they happen; the balancer
//! accepts batched, idempotent updates. This crate bridges the two: events
//! are coalesced in an [`EventRegistry`] keyed by (service, real), a flush
//! loop drains the net effect at a fixed cadence, and an optional state
//! sync loop mirrors the balancer's own view so that reals can be gated on
//! their appearance downstream.

pub mod state;
pub mod yanet;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use vigil_common::{BalancerKey, Event, EventRegistry, Weight};

pub use state::{BalancerState, StateTracker};

/// Errors returned by load balancer clients.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("malformed control plane response: {0}")]
    MalformedResponse(String),
}

/// Client driving real-server state in the load balancer.
///
/// `enable_real` and `disable_real` are idempotent; `flush` commits the
/// updates buffered by the previous calls.
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn enable_real(&self, key: &BalancerKey, weight: Weight) -> Result<(), BalancerError>;
    async fn disable_real(&self, key: &BalancerKey) -> Result<(), BalancerError>;
    async fn flush(&self) -> Result<(), BalancerError>;
}

/// Optional client capability: fetching the balancer's current view of
/// services and reals. Enables admission gating for new reals.
#[async_trait]
pub trait BalancerStater: Send + Sync {
    async fn state(&self) -> Result<BalancerState, BalancerError>;
}

const DEFAULT_FLUSH_PERIOD: f64 = 0.05;
const DEFAULT_SYNC_PERIOD: f64 = 5.0;

/// Balancer synchronization settings, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Interval between applying pending events to the balancer.
    pub flush_period: f64,
    /// Interval between balancer state fetches.
    pub sync_states_period: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        BalancerConfig {
            flush_period: DEFAULT_FLUSH_PERIOD,
            sync_states_period: DEFAULT_SYNC_PERIOD,
        }
    }
}

impl BalancerConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs_f64(self.flush_period.max(0.0))
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs_f64(self.sync_states_period.max(0.0))
    }
}

struct Stater {
    client: Arc<dyn BalancerStater>,
    state: StateTracker,
}

/// Coalesces real-server events and keeps the load balancer in sync.
pub struct Balancer {
    config: BalancerConfig,
    client: Arc<dyn LoadBalancerClient>,
    stater: Option<Arc<Stater>>,
    events: EventRegistry<BalancerKey, Event>,
    cancel: CancellationToken,
}

impl Balancer {
    /// Creates a balancer without downstream state tracking; admission
    /// lookups will report every key as ready.
    pub fn new(config: BalancerConfig, client: Arc<dyn LoadBalancerClient>) -> Self {
        Balancer {
            config,
            client,
            stater: None,
            events: EventRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a balancer with state tracking. The caller decides the
    /// capability here, with a concrete client type in hand, so the engine
    /// never needs to probe for it at runtime.
    pub fn with_stater(
        config: BalancerConfig,
        client: Arc<dyn LoadBalancerClient>,
        stater: Arc<dyn BalancerStater>,
    ) -> Self {
        Balancer {
            config,
            client,
            stater: Some(Arc::new(Stater {
                client: stater,
                state: StateTracker::new(),
            })),
            events: EventRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Whether downstream state is being tracked.
    pub fn supports_state(&self) -> bool {
        self.stater.is_some()
    }

    /// Queues a real-server transition for the next flush. Consecutive
    /// transitions of one key collapse to their net effect.
    pub fn handle_event(&self, event: Event) {
        self.events.store(event.key(), event);
    }

    /// Runs the flush loop and, when state tracking is enabled, the state
    /// sync loop. Returns after [`stop`] once the final batch has drained.
    ///
    /// [`stop`]: Balancer::stop
    pub async fn run(&self) {
        tokio::join!(self.updater(), self.state_sync());
    }

    /// Initiates shutdown: the flush loop pushes one final batch so reals
    /// disabled during teardown are disabled downstream too.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Number of events queued for the next flush.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Returns a waiter resolving when the given key appears in the
    /// balancer state, or `None` when the key needs no waiting: state is
    /// untracked, or the key is already present.
    pub fn lookup_subscription(&self, key: BalancerKey) -> Option<AdmissionWaiter> {
        let stater = self.stater.as_ref()?;
        if stater.state.lookup(&key) {
            return None;
        }

        Some(AdmissionWaiter {
            stater: Arc::clone(stater),
            key,
            engine_cancel: self.cancel.clone(),
        })
    }

    async fn updater(&self) {
        let period = self.config.flush_period();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Push whatever is still pending before going away.
                    self.sync_pending().await;
                    return;
                }
                _ = ticker.tick() => self.sync_pending().await,
            }
        }
    }

    /// Applies pending events to the client. Failed events are put back
    /// and retried on the next tick; a single flush commits the batch.
    async fn sync_pending(&self) {
        let pending = self.events.flush();
        if pending.is_empty() {
            return;
        }

        let mut processed = 0;
        for (key, event) in pending {
            let result = if event.new.enable {
                self.client.enable_real(&key, event.new.weight).await
            } else {
                self.client.disable_real(&key).await
            };

            match result {
                Ok(()) => processed += 1,
                Err(err) => {
                    error!(
                        service = %key.service,
                        real = %key.real,
                        error = %err,
                        "failed to update real in the balancer",
                    );
                    self.events.restore(key, event);
                }
            }
        }

        if processed > 0 {
            debug!(processed, "flushing balancer updates");
            if let Err(err) = self.client.flush().await {
                error!(error = %err, "failed to flush balancer updates");
            }
        }
    }

    async fn state_sync(&self) {
        let Some(stater) = &self.stater else {
            warn!("balancer client does not support state sync");
            return;
        };

        // Fetch the state once up front so early admission lookups see it.
        match stater.client.state().await {
            Ok(state) => stater.state.update(state),
            Err(err) => error!(error = %err, "failed to get balancer state"),
        }

        let period = self.config.sync_period();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => match stater.client.state().await {
                    Ok(state) => stater.state.update(state),
                    Err(err) => error!(error = %err, "failed to get balancer state"),
                },
            }
        }
    }
}

/// An armed subscription for one (service, real) key.
pub struct AdmissionWaiter {
    stater: Arc<Stater>,
    key: BalancerKey,
    engine_cancel: CancellationToken,
}

impl AdmissionWaiter {
    /// Waits until the key appears in a state snapshot. Returns `false`
    /// when the wait is cancelled or the balancer engine shuts down first.
    pub async fn wait(self, cancel: &CancellationToken) -> bool {
        let mut updates = self.stater.state.subscribe();
        loop {
            if self.stater.state.lookup(&self.key) {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.engine_cancel.cancelled() => return false,
                changed = updates.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use vigil_common::{EventKind, Port, Protocol, RealKey, ServiceKey, Status};

    #[derive(Default)]
    struct MockClient {
        fail: AtomicBool,
        flushes: AtomicUsize,
        calls: Mutex<Vec<(BalancerKey, Option<Weight>)>>,
    }

    #[async_trait]
    impl LoadBalancerClient for MockClient {
        async fn enable_real(
            &self,
            key: &BalancerKey,
            weight: Weight,
        ) -> Result<(), BalancerError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BalancerError::MalformedResponse("mock failure".into()));
            }
            self.calls.lock().unwrap().push((*key, Some(weight)));
            Ok(())
        }

        async fn disable_real(&self, key: &BalancerKey) -> Result<(), BalancerError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BalancerError::MalformedResponse("mock failure".into()));
            }
            self.calls.lock().unwrap().push((*key, None));
            Ok(())
        }

        async fn flush(&self) -> Result<(), BalancerError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockStater;

    #[async_trait]
    impl BalancerStater for MockStater {
        async fn state(&self) -> Result<BalancerState, BalancerError> {
            Ok(BalancerState::new())
        }
    }

    fn default_key() -> BalancerKey {
        BalancerKey {
            service: ServiceKey {
                addr: "127.0.0.1".parse::<IpAddr>().unwrap(),
                port: Port::new(80),
                proto: Protocol::Tcp,
            },
            real: RealKey {
                addr: "127.0.0.2".parse().unwrap(),
                port: Port::new(80),
            },
        }
    }

    fn status(enable: bool, weight: i32) -> Status {
        Status {
            enable,
            weight: Weight::new(weight),
        }
    }

    fn event(key: BalancerKey, kind: EventKind, init: Status, new: Status) -> Event {
        Event {
            kind,
            service: key.service,
            real: key.real,
            init,
            new,
        }
    }

    fn state_with(key: BalancerKey) -> BalancerState {
        let mut services: HashMap<ServiceKey, HashSet<RealKey>> = HashMap::new();
        services.entry(key.service).or_default().insert(key.real);
        HashMap::from([("module1".to_string(), services)])
    }

    fn stateless_balancer(client: Arc<MockClient>) -> Balancer {
        Balancer::new(BalancerConfig::default(), client)
    }

    fn stateful_balancer(client: Arc<MockClient>) -> Balancer {
        Balancer::with_stater(BalancerConfig::default(), client, Arc::new(MockStater))
    }

    #[test]
    fn test_handle_event_stores() {
        let balancer = stateless_balancer(Arc::default());
        let key = default_key();
        let init = status(true, 90);
        let new = status(true, 100);

        balancer.handle_event(event(key, EventKind::Enable, init, new));

        let events = balancer.events.entries();
        assert_eq!(events[&key].new, new);
        assert_eq!(events[&key].init, init);
    }

    #[test]
    fn test_handle_event_updates_keep_init() {
        let balancer = stateless_balancer(Arc::default());
        let key = default_key();

        balancer.handle_event(event(key, EventKind::Enable, status(true, 90), status(true, 100)));
        balancer.handle_event(event(key, EventKind::Enable, status(true, 100), status(true, 110)));

        let events = balancer.events.entries();
        assert_eq!(events[&key].new, status(true, 110));
        assert_eq!(events[&key].init, status(true, 90));
    }

    #[test]
    fn test_handle_event_cancels_on_return_to_init() {
        let balancer = stateless_balancer(Arc::default());
        let key = default_key();

        balancer.handle_event(event(key, EventKind::Enable, status(true, 90), status(true, 100)));
        balancer.handle_event(event(key, EventKind::Enable, status(true, 100), status(true, 90)));

        assert!(balancer.events.entries().is_empty());
    }

    #[test]
    fn test_handle_event_disable_then_enable_cancels() {
        let balancer = stateless_balancer(Arc::default());
        let key = default_key();

        balancer.handle_event(event(key, EventKind::Disable, status(true, 90), status(false, 0)));
        balancer.handle_event(event(key, EventKind::Enable, status(false, 0), status(true, 90)));

        assert!(balancer.events.entries().is_empty());
    }

    #[tokio::test]
    async fn test_sync_pending_routes_by_enable_flag() {
        let client = Arc::new(MockClient::default());
        let balancer = stateless_balancer(client.clone());
        let key = default_key();

        balancer.handle_event(event(key, EventKind::Enable, status(false, 0), status(true, 10)));
        balancer.sync_pending().await;

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(key, Some(Weight::new(10)))]);

        balancer.handle_event(event(
            key,
            EventKind::Disable,
            status(true, 10),
            Status {
                enable: false,
                weight: Weight::OMITTED,
            },
        ));
        balancer.sync_pending().await;

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls.last().unwrap(), &(key, None));
    }

    #[tokio::test]
    async fn test_flush_idempotence() {
        let client = Arc::new(MockClient::default());
        let balancer = stateless_balancer(client.clone());

        balancer.handle_event(event(
            default_key(),
            EventKind::Enable,
            status(false, 0),
            status(true, 10),
        ));

        // First pass processes the event and flushes exactly once.
        balancer.sync_pending().await;
        assert_eq!(client.flushes.load(Ordering::SeqCst), 1);

        // A second pass with nothing pending must not flush again.
        balancer.sync_pending().await;
        assert_eq!(client.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_events_are_retried() {
        let client = Arc::new(MockClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let balancer = stateless_balancer(client.clone());
        let key = default_key();

        balancer.handle_event(event(key, EventKind::Enable, status(false, 0), status(true, 10)));

        balancer.sync_pending().await;
        // Nothing succeeded: no flush, event still queued.
        assert_eq!(client.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(balancer.events.len(), 1);

        client.fail.store(false, Ordering::SeqCst);
        balancer.sync_pending().await;
        assert_eq!(client.flushes.load(Ordering::SeqCst), 1);
        assert!(balancer.events.is_empty());
    }

    #[test]
    fn test_lookup_subscription_without_state() {
        let balancer = stateless_balancer(Arc::default());
        assert!(balancer.lookup_subscription(default_key()).is_none());
    }

    #[test]
    fn test_lookup_subscription_key_present() {
        let balancer = stateful_balancer(Arc::default());
        let key = default_key();
        balancer.stater.as_ref().unwrap().state.update(state_with(key));

        assert!(balancer.lookup_subscription(key).is_none());
    }

    #[tokio::test]
    async fn test_subscription_resolves_on_state_update() {
        let balancer = Arc::new(stateful_balancer(Arc::default()));
        let key = default_key();

        let waiter = balancer.lookup_subscription(key).unwrap();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn({
            let cancel = cancel.clone();
            async move { waiter.wait(&cancel).await }
        });

        balancer.stater.as_ref().unwrap().state.update(state_with(key));
        assert!(wait.await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_cancelled() {
        let balancer = stateful_balancer(Arc::default());

        let waiter = balancer.lookup_subscription(default_key()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!waiter.wait(&cancel).await);
    }

    #[tokio::test]
    async fn test_subscription_unblocked_by_engine_stop() {
        let balancer = stateful_balancer(Arc::default());

        let waiter = balancer.lookup_subscription(default_key()).unwrap();
        balancer.stop();
        assert!(!waiter.wait(&CancellationToken::new()).await);
    }
}
