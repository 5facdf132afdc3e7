//! Per-prefix quorum tracking.
//!
//! A prefix is announced only while every service bound to it is alive:
//! the quorum of a prefix equals the number of its services. The registry
//! below keeps that state per announce group and records Ready/Unready
//! transitions as merging events for the update loop to ship.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use ipnet::IpNet;
use thiserror::Error;

use vigil_common::{EventRegistry, Merge, ServiceKey};

#[derive(Debug, Error)]
#[error("prefix not found for service {0}")]
pub struct PrefixNotFound(pub ServiceKey);

/// Readiness of a prefix to be announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixStatus {
    Ready,
    Unready,
}

impl Merge for PrefixStatus {
    /// A status change immediately undone cancels to "no change".
    fn merge(self, newer: Self) -> (Self, bool) {
        if self != newer {
            return (PrefixStatus::Unready, true);
        }
        (newer, false)
    }
}

/// Most recent announce eligibility reported by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Enabled,
    Disabled,
}

impl Merge for ServiceStatus {
    fn merge(self, newer: Self) -> (Self, bool) {
        if self != newer {
            // The merged value is irrelevant when the entry cancels; report
            // the safe side.
            return (ServiceStatus::Disabled, true);
        }
        (newer, false)
    }
}

/// The prefix registry of one announce group.
#[derive(Debug, Default)]
pub struct Prefixes {
    /// State of each prefix. The outer lock is written only on reload;
    /// service updates take it shared and go through the inner per-prefix
    /// lock.
    prefixes: RwLock<HashMap<IpNet, PrefixState>>,
    /// Pending Ready/Unready transitions.
    events: EventRegistry<IpNet, PrefixStatus>,
}

impl Prefixes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set of services backing this group's prefixes.
    ///
    /// Prefixes still referenced keep the enabled flag of every service
    /// they retain; prefixes no longer referenced are dropped, with an
    /// Unready event recorded when they were announced.
    pub fn reload_services(&self, services: &[ServiceKey]) {
        let mut prefixes = self.prefixes.write().expect("prefix registry poisoned");

        let mut incoming: HashMap<IpNet, Vec<ServiceKey>> = HashMap::new();
        for service in services {
            incoming.entry(service.prefix()).or_default().push(*service);
        }

        prefixes.retain(|prefix, state| match incoming.remove(prefix) {
            Some(new_services) => {
                let old_status = state.status();
                state.apply_services(&new_services);
                let new_status = state.status();
                if new_status != old_status {
                    self.events.store(*prefix, new_status);
                }
                true
            }
            None => {
                if state.status() == PrefixStatus::Ready {
                    self.events.store(*prefix, PrefixStatus::Unready);
                }
                false
            }
        });

        for (prefix, new_services) in incoming {
            prefixes.insert(prefix, PrefixState::new(&new_services));
        }
    }

    /// Updates the announce eligibility of one service and records a
    /// prefix event when the prefix status flips because of it.
    pub fn update_service(
        &self,
        service: ServiceKey,
        status: ServiceStatus,
    ) -> Result<(), PrefixNotFound> {
        let prefixes = self.prefixes.read().expect("prefix registry poisoned");

        let prefix = service.prefix();
        let state = prefixes.get(&prefix).ok_or(PrefixNotFound(service))?;

        let old_status = state.status();
        let new_status = state.update_service(service, status);
        if new_status != old_status {
            self.events.store(prefix, new_status);
        }

        Ok(())
    }

    /// Current status of the requested prefixes; unknown prefixes report
    /// Unready.
    pub fn status_for(&self, requested: &[IpNet]) -> HashMap<IpNet, PrefixStatus> {
        let prefixes = self.prefixes.read().expect("prefix registry poisoned");
        requested
            .iter()
            .map(|prefix| {
                let status = prefixes
                    .get(prefix)
                    .map(PrefixState::status)
                    .unwrap_or(PrefixStatus::Unready);
                (*prefix, status)
            })
            .collect()
    }

    /// Current status of every known prefix.
    pub fn status_all(&self) -> HashMap<IpNet, PrefixStatus> {
        let prefixes = self.prefixes.read().expect("prefix registry poisoned");
        prefixes
            .iter()
            .map(|(prefix, state)| (*prefix, state.status()))
            .collect()
    }

    /// Drains the pending prefix events.
    pub fn take_events(&self) -> HashMap<IpNet, PrefixStatus> {
        self.events.flush()
    }

    /// Puts back an event whose delivery failed so the next tick retries
    /// it; a status flip recorded meanwhile cancels against it.
    pub fn restore_event(&self, prefix: IpNet, status: PrefixStatus) {
        self.events.restore(prefix, status);
    }

    #[cfg(test)]
    fn snapshot(&self, prefix: &IpNet) -> Option<(HashMap<ServiceKey, ServiceStatus>, usize)> {
        let prefixes = self.prefixes.read().unwrap();
        prefixes.get(prefix).map(|state| {
            let inner = state.inner.lock().unwrap();
            (inner.services.clone(), inner.active)
        })
    }
}

/// State of a single prefix: its services, how many of them are alive,
/// and the quorum required to announce.
#[derive(Debug)]
struct PrefixState {
    inner: Mutex<PrefixServices>,
}

#[derive(Debug)]
struct PrefixServices {
    services: HashMap<ServiceKey, ServiceStatus>,
    active: usize,
    quorum: usize,
}

impl PrefixServices {
    fn status(&self) -> PrefixStatus {
        if self.active == self.quorum && self.active != 0 {
            PrefixStatus::Ready
        } else {
            PrefixStatus::Unready
        }
    }
}

impl PrefixState {
    fn new(services: &[ServiceKey]) -> Self {
        let services: HashMap<_, _> = services
            .iter()
            .map(|service| (*service, ServiceStatus::Disabled))
            .collect();
        // The quorum is the service count: the announce must not be raised
        // until every dependent service is ready.
        let quorum = services.len();
        PrefixState {
            inner: Mutex::new(PrefixServices {
                services,
                active: 0,
                quorum,
            }),
        }
    }

    /// Replaces the service set, keeping the enabled flag of services that
    /// remain bound to this prefix.
    fn apply_services(&self, new_services: &[ServiceKey]) {
        let mut inner = self.inner.lock().expect("prefix state poisoned");

        let mut active = 0;
        let services = new_services
            .iter()
            .map(|service| {
                let status = match inner.services.get(service) {
                    Some(ServiceStatus::Enabled) => {
                        active += 1;
                        ServiceStatus::Enabled
                    }
                    _ => ServiceStatus::Disabled,
                };
                (*service, status)
            })
            .collect();

        inner.services = services;
        inner.active = active;
        inner.quorum = new_services.len();
    }

    fn update_service(&self, service: ServiceKey, status: ServiceStatus) -> PrefixStatus {
        let mut inner = self.inner.lock().expect("prefix state poisoned");

        match inner.services.get(&service) {
            None => return inner.status(),
            Some(current) if *current == status => return inner.status(),
            Some(_) => {}
        }

        match status {
            ServiceStatus::Enabled => inner.active += 1,
            ServiceStatus::Disabled => inner.active -= 1,
        }
        inner.services.insert(service, status);

        inner.status()
    }

    fn status(&self) -> PrefixStatus {
        self.inner.lock().expect("prefix state poisoned").status()
    }
}
