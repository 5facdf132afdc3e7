//! Virtual service: aggregates reals and decides announce quorum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_announcer::{Announcer, ServiceStatus as AnnounceStatus};
use vigil_balancer::Balancer;
use vigil_common::{BalancerKey, Event, EventKind, RealEvent, RealKey, ServiceKey, Weight};

use crate::check::TlsSettings;
use crate::config::ServiceConfig;
use crate::real::{ActivationGate, Real};
use crate::status::ServiceStatus;

/// Service-level state.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub alive: bool,
    /// Aggregate weight over the alive reals; inhibited reals count as
    /// zero.
    pub weight: Weight,
    pub reals_alive: i64,
    pub transitions: u64,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState {
            alive: false,
            weight: Weight::ZERO,
            reals_alive: 0,
            transitions: 0,
        }
    }
}

/// Which way the quorum decision points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quorum {
    Hold,
    Up,
    Down,
}

struct RealHandle {
    real: Arc<Real>,
    task: JoinHandle<()>,
}

/// A virtual service: a set of reals whose aggregate weight decides, with
/// hysteresis, whether the service's prefix should be announced. Every
/// real transition is forwarded to the balancer; announce flips go to the
/// announcer.
pub struct Service {
    key: ServiceKey,
    config: Mutex<Arc<ServiceConfig>>,
    state: Mutex<ServiceState>,
    reals: tokio::sync::Mutex<HashMap<RealKey, RealHandle>>,
    real_tx: Mutex<Option<mpsc::UnboundedSender<RealEvent>>>,
    real_rx: Mutex<Option<mpsc::UnboundedReceiver<RealEvent>>>,
    announcer: Arc<Announcer>,
    balancer: Arc<Balancer>,
    tls: TlsSettings,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(
        config: Arc<ServiceConfig>,
        announcer: Arc<Announcer>,
        balancer: Arc<Balancer>,
        tls: TlsSettings,
    ) -> Self {
        let (real_tx, real_rx) = mpsc::unbounded_channel();
        let service = Service {
            key: config.key(),
            config: Mutex::new(config),
            state: Mutex::new(ServiceState::default()),
            reals: tokio::sync::Mutex::new(HashMap::new()),
            real_tx: Mutex::new(Some(real_tx)),
            real_rx: Mutex::new(Some(real_rx)),
            announcer,
            balancer,
            tls,
            cancel: CancellationToken::new(),
        };
        info!(service = %service.key, "service created");
        service
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn state(&self) -> ServiceState {
        self.state.lock().expect("service state poisoned").clone()
    }

    /// Runs the service: starts the configured reals and drains their
    /// events until stopped.
    pub async fn run(self: Arc<Self>) {
        info!(service = %self.key, "running service");
        let config = Arc::clone(&self.config.lock().expect("service config poisoned"));
        self.apply_config(&config).await;

        let receiver = self.real_rx.lock().expect("service channel poisoned").take();
        let Some(mut receiver) = receiver else { return };
        while let Some(event) = receiver.recv().await {
            self.handle_event(event);
        }
        info!(service = %self.key, "service stopped");
    }

    /// Applies a new configuration, then re-evaluates announce
    /// eligibility, which may have changed with the quorum settings or the
    /// announce group.
    pub async fn reload(&self, config: Arc<ServiceConfig>) {
        *self.config.lock().expect("service config poisoned") = Arc::clone(&config);
        self.apply_config(&config).await;
        self.process_announce();
    }

    async fn apply_config(&self, config: &ServiceConfig) {
        let mut reals = self.reals.lock().await;

        let mut current = std::mem::take(&mut *reals);
        let mut next = HashMap::new();
        for real_config in &config.reals {
            if self.cancel.is_cancelled() {
                warn!(service = %self.key, "reload aborted");
                current.extend(next);
                *reals = current;
                return;
            }

            let key = real_config.key();
            let real_config = Arc::new(real_config.clone());
            if let Some(handle) = current.remove(&key) {
                handle.real.reload(real_config).await;
                next.insert(key, handle);
                continue;
            }

            let sender = self.real_tx.lock().expect("service channel poisoned").clone();
            let Some(sender) = sender else {
                current.extend(next);
                *reals = current;
                return;
            };

            // When the balancer tracks downstream state, a new real waits
            // until the balancer has admitted it before probing starts.
            let activation = self
                .balancer
                .supports_state()
                .then(|| self.activation_gate(key));

            let real = Arc::new(Real::new(real_config, sender, self.tls, activation));
            let task = tokio::spawn(Arc::clone(&real).run());
            next.insert(key, RealHandle { real, task });
        }

        // Reals absent from the new configuration stop; their checkers'
        // Shutdown events cascade and settle the aggregate weight.
        for (_, handle) in current {
            handle.real.stop().await;
            let _ = handle.task.await;
        }

        *reals = next;
    }

    /// Stops the service and all its reals; their terminal events are
    /// drained before this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut reals = self.reals.lock().await;
        for (_, handle) in reals.drain() {
            handle.real.stop().await;
            let _ = handle.task.await;
        }
        drop(reals);

        self.real_tx.lock().expect("service channel poisoned").take();
    }

    /// Folds one real transition into the aggregate, forwards it to the
    /// balancer, and notifies the announcer when the quorum decision
    /// flipped.
    pub fn handle_event(&self, event: RealEvent) {
        let (quorum, hysteresis, announce_group) = {
            let config = self.config.lock().expect("service config poisoned");
            (config.quorum, config.hysteresis, config.announce_group.clone())
        };

        let (alive, announce_changed) = {
            let mut state = self.state.lock().expect("service state poisoned");

            match event.kind {
                EventKind::Enable => Self::process_success(&mut state, &event),
                EventKind::Disable | EventKind::Shutdown => {
                    Self::process_failure(&mut state, &event)
                }
            }

            let changed = self.update_announce(&mut state, quorum, hysteresis);
            (state.alive, changed)
        };

        // Every real-state delta goes to the balancer.
        self.balancer.handle_event(Event {
            kind: event.kind,
            service: self.key,
            real: event.real,
            init: event.init,
            new: event.new,
        });

        if announce_changed && !announce_group.is_empty() {
            self.notify_announcer(alive);
        }
    }

    fn process_success(state: &mut ServiceState, event: &RealEvent) {
        let delta = if event.init.enable {
            event.new.weight - event.init.weight
        } else {
            state.reals_alive += 1;
            event.new.weight
        };
        state.weight += delta;
    }

    fn process_failure(state: &mut ServiceState, event: &RealEvent) {
        // A disable carries no new weight; the reversed contribution is
        // the initial status.
        state.weight -= event.init.weight;
        state.reals_alive -= 1;
    }

    /// Applies the quorum decision to the service's alive flag. Returns
    /// whether the flag flipped.
    fn update_announce(&self, state: &mut ServiceState, quorum: i32, hysteresis: i32) -> bool {
        let decision = Self::quorum_state(state.weight, quorum, hysteresis);

        match decision {
            Quorum::Up if !state.alive => {
                state.alive = true;
                state.transitions += 1;
                info!(service = %self.key, quorum, hysteresis, "service enabled");
                true
            }
            Quorum::Down if state.alive => {
                state.alive = false;
                state.transitions += 1;
                info!(service = %self.key, quorum, hysteresis, "service disabled");
                true
            }
            _ => false,
        }
    }

    /// The quorum band: up above `quorum + hysteresis`, down below
    /// `quorum - hysteresis` or at zero aggregate weight, hold in between.
    fn quorum_state(weight: Weight, quorum: i32, hysteresis: i32) -> Quorum {
        let weight = weight.value();
        if weight >= quorum + hysteresis {
            Quorum::Up
        } else if weight < quorum - hysteresis || weight == 0 {
            Quorum::Down
        } else {
            Quorum::Hold
        }
    }

    /// Re-evaluates the quorum against the current config and pushes the
    /// service's announce status. Used after reloads, where the announcer
    /// may have rebuilt the prefix state from scratch.
    fn process_announce(&self) {
        let (quorum, hysteresis, announce_group) = {
            let config = self.config.lock().expect("service config poisoned");
            (config.quorum, config.hysteresis, config.announce_group.clone())
        };

        let alive = {
            let mut state = self.state.lock().expect("service state poisoned");
            self.update_announce(&mut state, quorum, hysteresis);
            state.alive
        };

        if announce_group.is_empty() {
            return;
        }
        self.notify_announcer(alive);
    }

    fn notify_announcer(&self, alive: bool) {
        let status = if alive {
            AnnounceStatus::Enabled
        } else {
            AnnounceStatus::Disabled
        };
        if let Err(err) = self.announcer.update_service(self.key, status) {
            error!(service = %self.key, error = %err, "failed to set up announce");
        }
    }

    fn activation_gate(&self, real: RealKey) -> ActivationGate {
        let balancer = Arc::clone(&self.balancer);
        let key = BalancerKey {
            service: self.key,
            real,
        };
        Box::new(
            move |cancel: CancellationToken| -> futures::future::BoxFuture<'static, bool> {
                let balancer = Arc::clone(&balancer);
                Box::pin(async move {
                    match balancer.lookup_subscription(key) {
                        // No tracking, or the key is already downstream.
                        None => true,
                        Some(waiter) => waiter.wait(&cancel).await,
                    }
                })
            },
        )
    }

    /// Snapshot for the management surface.
    pub async fn status(&self) -> ServiceStatus {
        let config = Arc::clone(&self.config.lock().expect("service config poisoned"));
        let state = self.state();

        let reals = self.reals.lock().await;
        let mut real_statuses = Vec::with_capacity(reals.len());
        for handle in reals.values() {
            real_statuses.push(handle.real.status().await);
        }

        ServiceStatus {
            vip: self.key.addr,
            vport: self.key.port.as_option(),
            proto: self.key.proto.to_string(),
            lvs_method: config.forwarding_method.to_string(),
            alive: state.alive,
            weight: state.weight.value(),
            reals_alive: state.reals_alive.max(0) as usize,
            transitions: state.transitions,
            reals: real_statuses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use async_trait::async_trait;
    use ipnet::IpNet;
    use vigil_announcer::{AnnounceClient, AnnounceError, AnnouncerConfig, PrefixStatus};
    use vigil_balancer::{BalancerConfig, BalancerError, LoadBalancerClient};
    use vigil_common::{Port, Protocol, Status};

    struct NopBalancerClient;

    #[async_trait]
    impl LoadBalancerClient for NopBalancerClient {
        async fn enable_real(&self, _: &BalancerKey, _: Weight) -> Result<(), BalancerError> {
            Ok(())
        }
        async fn disable_real(&self, _: &BalancerKey) -> Result<(), BalancerError> {
            Ok(())
        }
        async fn flush(&self) -> Result<(), BalancerError> {
            Ok(())
        }
    }

    struct NopAnnounceClient;

    #[async_trait]
    impl AnnounceClient for NopAnnounceClient {
        async fn raise_announce(&self, _: &str, _: IpNet) -> Result<(), AnnounceError> {
            Ok(())
        }
        async fn remove_announce(&self, _: &str, _: IpNet) -> Result<(), AnnounceError> {
            Ok(())
        }
        async fn process_batch(
            &self,
            _: &str,
            _: &StdHashMap<IpNet, PrefixStatus>,
        ) -> Result<(), AnnounceError> {
            Ok(())
        }
        async fn shutdown(&self) {}
    }

    fn announcer(groups: &[&str]) -> Arc<Announcer> {
        Arc::new(Announcer::new(
            AnnouncerConfig {
                announce_group: groups.iter().map(|g| g.to_string()).collect(),
                ..AnnouncerConfig::default()
            },
            Arc::new(NopAnnounceClient),
        ))
    }

    fn balancer() -> Arc<Balancer> {
        Arc::new(Balancer::new(
            BalancerConfig::default(),
            Arc::new(NopBalancerClient),
        ))
    }

    fn service_config(quorum: i32, hysteresis: i32, group: &str) -> Arc<ServiceConfig> {
        Arc::new(ServiceConfig {
            vip: "192.0.2.1".parse().unwrap(),
            vport: Port::new(80),
            protocol: Protocol::Tcp,
            quorum,
            hysteresis,
            announce_group: group.to_string(),
            ..ServiceConfig::default()
        })
    }

    fn real_key(addr: &str) -> RealKey {
        RealKey {
            addr: addr.parse().unwrap(),
            port: Port::new(80),
        }
    }

    fn status(enable: bool, weight: i32) -> Status {
        Status {
            enable,
            weight: Weight::new(weight),
        }
    }

    fn enable(real: RealKey, init: Status, new: Status) -> RealEvent {
        RealEvent {
            kind: EventKind::Enable,
            real,
            init,
            new,
        }
    }

    fn disable(real: RealKey, init: Status) -> RealEvent {
        RealEvent {
            kind: EventKind::Disable,
            real,
            init,
            new: Status {
                enable: false,
                weight: Weight::OMITTED,
            },
        }
    }

    #[test]
    fn test_single_real_reaches_quorum() {
        let service = Service::new(
            service_config(1, 0, ""),
            announcer(&["default"]),
            balancer(),
            TlsSettings::default(),
        );

        service.handle_event(enable(real_key("10.0.0.1"), status(false, 0), status(true, 1)));

        let state = service.state();
        assert!(state.alive);
        assert_eq!(state.weight, Weight::new(1));
        assert_eq!(state.reals_alive, 1);
        assert_eq!(state.transitions, 1);
    }

    #[test]
    fn test_hysteresis_holds_within_band() {
        let service = Service::new(
            service_config(5, 1, ""),
            announcer(&["default"]),
            balancer(),
            TlsSettings::default(),
        );
        let real = real_key("10.0.0.1");

        // Weight ramps 6 -> 5 -> 4 -> 3; the service goes up at 6, holds
        // through 5 and 4, and drops only below quorum - hysteresis.
        service.handle_event(enable(real, status(false, 0), status(true, 6)));
        assert!(service.state().alive);

        service.handle_event(enable(real, status(true, 6), status(true, 5)));
        assert!(service.state().alive);

        service.handle_event(enable(real, status(true, 5), status(true, 4)));
        assert!(service.state().alive);

        service.handle_event(enable(real, status(true, 4), status(true, 3)));
        assert!(!service.state().alive);
        assert_eq!(service.state().transitions, 2);
    }

    #[test]
    fn test_zero_aggregate_always_down() {
        let service = Service::new(
            service_config(0, 0, ""),
            announcer(&["default"]),
            balancer(),
            TlsSettings::default(),
        );
        let real = real_key("10.0.0.1");

        service.handle_event(enable(real, status(false, 0), status(true, 2)));
        assert!(service.state().alive);

        service.handle_event(disable(real, status(true, 2)));
        // 0 >= quorum + hysteresis would hold it up, but a zero aggregate
        // is always down.
        assert!(!service.state().alive);
    }

    #[test]
    fn test_inhibited_real_contributes_zero() {
        let service = Service::new(
            service_config(1, 0, ""),
            announcer(&["default"]),
            balancer(),
            TlsSettings::default(),
        );
        let real = real_key("10.0.0.1");

        service.handle_event(enable(real, status(false, 0), status(true, 10)));
        assert_eq!(service.state().weight, Weight::new(10));

        // The inhibit rewrite: still an Enable, drained to zero weight.
        service.handle_event(enable(real, status(true, 10), status(true, 0)));
        let state = service.state();
        assert_eq!(state.weight, Weight::ZERO);
        assert_eq!(state.reals_alive, 1);
        assert!(!state.alive);
    }

    #[test]
    fn test_aggregate_over_multiple_reals() {
        let service = Service::new(
            service_config(3, 0, ""),
            announcer(&["default"]),
            balancer(),
            TlsSettings::default(),
        );
        let first = real_key("10.0.0.1");
        let second = real_key("10.0.0.2");

        service.handle_event(enable(first, status(false, 0), status(true, 2)));
        assert!(!service.state().alive);

        service.handle_event(enable(second, status(false, 0), status(true, 2)));
        let state = service.state();
        assert_eq!(state.weight, Weight::new(4));
        assert_eq!(state.reals_alive, 2);
        assert!(state.alive);

        service.handle_event(disable(second, status(true, 2)));
        let state = service.state();
        assert_eq!(state.weight, Weight::new(2));
        assert_eq!(state.reals_alive, 1);
        assert!(!state.alive);
    }

    #[test]
    fn test_announce_flip_reaches_announcer() {
        let announcer = announcer(&["g-1"]);
        let config = service_config(1, 0, "g-1");
        let key = config.key();
        announcer
            .reload_services(&StdHashMap::from([(key, "g-1".to_string())]))
            .unwrap();

        let service = Service::new(config, Arc::clone(&announcer), balancer(), TlsSettings::default());

        service.handle_event(enable(real_key("10.0.0.1"), status(false, 0), status(true, 1)));
        let status_map = announcer.status_for("g-1", &[key.prefix()]).unwrap();
        assert_eq!(status_map[&key.prefix()], PrefixStatus::Ready);

        service.handle_event(disable(real_key("10.0.0.1"), status(true, 1)));
        let status_map = announcer.status_for("g-1", &[key.prefix()]).unwrap();
        assert_eq!(status_map[&key.prefix()], PrefixStatus::Unready);
    }

    #[test]
    fn test_all_events_reach_balancer() {
        let balancer = balancer();
        let service = Service::new(
            service_config(1, 0, ""),
            announcer(&["default"]),
            Arc::clone(&balancer),
            TlsSettings::default(),
        );
        let real = real_key("10.0.0.1");

        // Both the enable and the weight-only update are queued for the
        // balancer's next flush, coalesced per key.
        service.handle_event(enable(real, status(false, 0), status(true, 1)));
        assert_eq!(balancer.pending_events(), 1);

        service.handle_event(enable(real, status(true, 1), status(true, 2)));
        assert_eq!(balancer.pending_events(), 1);

        let other = real_key("10.0.0.2");
        service.handle_event(enable(other, status(false, 0), status(true, 1)));
        assert_eq!(balancer.pending_events(), 2);
    }
}
