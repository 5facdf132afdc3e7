//! Snapshot of the downstream balancer's real-server state.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::watch;

use vigil_common::{BalancerKey, RealKey, ServiceKey};

/// Reals known to the balancer, per service, per balancer module.
pub type BalancerState = HashMap<String, HashMap<ServiceKey, HashSet<RealKey>>>;

/// Tracks the last fetched balancer state and notifies subscribers when it
/// is replaced.
///
/// The snapshot is read-mostly: the single writer is the periodic state
/// sync loop, readers are presence lookups and armed subscriptions.
#[derive(Debug)]
pub struct StateTracker {
    state: RwLock<BalancerState>,
    notify: watch::Sender<u64>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        StateTracker {
            state: RwLock::new(BalancerState::new()),
            notify,
        }
    }

    /// Replaces the snapshot wholesale and wakes all subscribers.
    pub fn update(&self, state: BalancerState) {
        {
            let mut current = self.state.write().expect("balancer state poisoned");
            *current = state;
        }
        self.notify.send_modify(|generation| *generation += 1);
    }

    /// Whether the given (service, real) pair is present in the snapshot.
    pub fn lookup(&self, key: &BalancerKey) -> bool {
        let state = self.state.read().expect("balancer state poisoned");
        state.values().any(|services| {
            services
                .get(&key.service)
                .is_some_and(|reals| reals.contains(&key.real))
        })
    }

    /// A receiver that observes a change every time the snapshot is
    /// replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}
