//! Synchronization engine between the health-checking core and the route
//! announce daemon.
//!
//! Services report their announce eligibility as it changes; the external
//! daemon wants per-prefix Ready/Unready batches per announce group. This
//! crate keeps a prefix registry per group, translates service updates into
//! prefix transitions, ships batches at a fixed cadence, and answers the
//! daemon's state-pull requests.

pub mod bird;
pub mod prefix;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use vigil_common::ServiceKey;

pub use prefix::{PrefixStatus, Prefixes, ServiceStatus};

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown announce group {0:?}")]
    UnknownGroup(String),

    #[error("duplicate announce group prefix: {0}")]
    DuplicatePrefix(IpNet),

    #[error("failed to determine announce group for prefix of service {0}")]
    NoGroupForService(ServiceKey),

    #[error(transparent)]
    PrefixNotFound(#[from] prefix::PrefixNotFound),

    #[error("announce client is shut down")]
    Shutdown,
}

/// Client driving route announcements in the external daemon.
#[async_trait]
pub trait AnnounceClient: Send + Sync {
    async fn raise_announce(&self, group: &str, prefix: IpNet) -> Result<(), AnnounceError>;
    async fn remove_announce(&self, group: &str, prefix: IpNet) -> Result<(), AnnounceError>;
    async fn process_batch(
        &self,
        group: &str,
        prefixes: &HashMap<IpNet, PrefixStatus>,
    ) -> Result<(), AnnounceError>;
    async fn shutdown(&self);
}

/// Optional client capability: blocking on state-pull requests from the
/// external daemon.
///
/// Implementations must return [`AnnounceError::Shutdown`] once the client
/// has been shut down, so the per-group listener workers can exit.
#[async_trait]
pub trait AnnounceStater: Send + Sync {
    async fn listen_state_request(&self, group: &str) -> Result<(), AnnounceError>;
}

const DEFAULT_UPDATE_PERIOD: f64 = 0.05;

/// Announcer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnnouncerConfig {
    /// Interval, in seconds, between shipping prefix updates.
    pub update_period: f64,
    /// Declared announce groups.
    pub announce_group: Vec<String>,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        AnnouncerConfig {
            update_period: DEFAULT_UPDATE_PERIOD,
            announce_group: vec!["default".to_string()],
        }
    }
}

impl AnnouncerConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(self.update_period.max(0.0))
    }
}

/// Tracks prefix quorum across announce groups and keeps the external
/// announce daemon in sync.
pub struct Announcer {
    config: AnnouncerConfig,
    client: Arc<dyn AnnounceClient>,
    stater: Option<Arc<dyn AnnounceStater>>,
    groups: HashMap<String, Arc<Prefixes>>,
    group_by_prefix: RwLock<HashMap<IpNet, String>>,
    cancel: CancellationToken,
}

impl Announcer {
    /// Creates an announcer without state-pull support.
    pub fn new(config: AnnouncerConfig, client: Arc<dyn AnnounceClient>) -> Self {
        Self::build(config, client, None)
    }

    /// Creates an announcer whose client also answers state-pull requests.
    pub fn with_stater(
        config: AnnouncerConfig,
        client: Arc<dyn AnnounceClient>,
        stater: Arc<dyn AnnounceStater>,
    ) -> Self {
        Self::build(config, client, Some(stater))
    }

    fn build(
        config: AnnouncerConfig,
        client: Arc<dyn AnnounceClient>,
        stater: Option<Arc<dyn AnnounceStater>>,
    ) -> Self {
        let groups = config
            .announce_group
            .iter()
            .map(|group| (group.clone(), Arc::new(Prefixes::new())))
            .collect();

        Announcer {
            config,
            client,
            stater,
            groups,
            group_by_prefix: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Rebinds services to announce groups.
    ///
    /// Validates that every referenced group is declared and that no two
    /// services map one prefix to different groups, then reloads each
    /// group's prefix registry. Services that disappeared stop counting
    /// toward their prefixes immediately, which queues the corresponding
    /// withdrawals.
    pub fn reload_services(
        &self,
        services: &HashMap<ServiceKey, String>,
    ) -> Result<(), AnnounceError> {
        for group in services.values() {
            if !self.groups.contains_key(group) {
                return Err(AnnounceError::UnknownGroup(group.clone()));
            }
        }

        let mut group_by_prefix: HashMap<IpNet, String> = HashMap::new();
        for (service, group) in services {
            let prefix = service.prefix();
            match group_by_prefix.get(&prefix) {
                Some(known) if known != group => {
                    return Err(AnnounceError::DuplicatePrefix(prefix));
                }
                _ => {
                    group_by_prefix.insert(prefix, group.clone());
                }
            }
        }

        {
            let mut lookup = self.group_by_prefix.write().expect("prefix lookup poisoned");
            *lookup = group_by_prefix;
        }

        for (group, prefixes) in &self.groups {
            // A group may well end up with no services at all.
            let group_services: Vec<ServiceKey> = services
                .iter()
                .filter(|(_, service_group)| *service_group == group)
                .map(|(service, _)| *service)
                .collect();
            prefixes.reload_services(&group_services);
        }

        Ok(())
    }

    /// Routes a service's announce eligibility to its prefix. The effect on
    /// the external daemon is deferred to the group's next update tick.
    pub fn update_service(
        &self,
        service: ServiceKey,
        status: ServiceStatus,
    ) -> Result<(), AnnounceError> {
        let prefix = service.prefix();
        let group = {
            let lookup = self.group_by_prefix.read().expect("prefix lookup poisoned");
            lookup
                .get(&prefix)
                .cloned()
                .ok_or(AnnounceError::NoGroupForService(service))?
        };

        let prefixes = self
            .groups
            .get(&group)
            .ok_or(AnnounceError::UnknownGroup(group))?;
        prefixes.update_service(service, status)?;
        Ok(())
    }

    /// Current status of the requested prefixes within one group.
    pub fn status_for(
        &self,
        group: &str,
        prefixes: &[IpNet],
    ) -> Result<HashMap<IpNet, PrefixStatus>, AnnounceError> {
        let registry = self
            .groups
            .get(group)
            .ok_or_else(|| AnnounceError::UnknownGroup(group.to_string()))?;
        Ok(registry.status_for(prefixes))
    }

    /// Runs the per-group update loops and, when the client supports it,
    /// the per-group state-request workers. Returns once [`stop`] has been
    /// called.
    ///
    /// [`stop`]: Announcer::stop
    pub async fn run(&self) {
        let updaters = self
            .groups
            .iter()
            .map(|(group, prefixes)| self.group_updater(group, prefixes));

        let listeners: Vec<_> = match &self.stater {
            Some(stater) => self
                .groups
                .iter()
                .map(|(group, prefixes)| self.state_request_worker(stater, group, prefixes))
                .collect(),
            None => Vec::new(),
        };

        tokio::join!(join_all(updaters), join_all(listeners));
    }

    /// Shuts the announcer down: stops the loops, withdraws every known
    /// prefix with one final batch per group, and closes the client.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.remove_all().await;
        self.client.shutdown().await;
    }

    async fn group_updater(&self, group: &str, prefixes: &Prefixes) {
        let period = self.config.update_period();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let events = prefixes.take_events();
            if events.is_empty() {
                continue;
            }

            debug!(group, updates = events.len(), "shipping announce updates");
            if let Err(err) = self.client.process_batch(group, &events).await {
                error!(group, error = %err, "failed to sync announce state");
                // Leave the updates queued for the next tick.
                for (prefix, status) in events {
                    prefixes.restore_event(prefix, status);
                }
            }
        }
    }

    async fn state_request_worker(
        &self,
        stater: &Arc<dyn AnnounceStater>,
        group: &str,
        prefixes: &Prefixes,
    ) {
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => return,
                request = stater.listen_state_request(group) => request,
            };

            match request {
                Ok(()) => {}
                Err(AnnounceError::Shutdown) => return,
                Err(err) => {
                    error!(group, error = %err, "failed to handle state request");
                    continue;
                }
            }

            // Answer with the full current status of the group's prefixes.
            let status = prefixes.status_all();
            if let Err(err) = self.client.process_batch(group, &status).await {
                error!(group, error = %err, "failed to sync announce state");
            }
        }
    }

    /// Withdraws every known prefix so the external daemon stops
    /// announcing anything on our behalf.
    async fn remove_all(&self) {
        for (group, prefixes) in &self.groups {
            let mut status = prefixes.status_all();
            if status.is_empty() {
                continue;
            }
            for state in status.values_mut() {
                *state = PrefixStatus::Unready;
            }

            if let Err(err) = self.client.process_batch(group, &status).await {
                error!(group, error = %err, "failed to remove announces");
            }
        }
    }
}
