//! State-transition events flowing checker → real → service → balancer.

use crate::key::{BalancerKey, RealKey, ServiceKey};
use crate::registry::Merge;
use crate::weight::Weight;

/// What kind of transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The subject became (or stays) eligible for traffic.
    Enable,
    /// The subject became ineligible for traffic.
    Disable,
    /// The subject is being torn down; terminal for its emitter.
    Shutdown,
}

/// An (enabled, weight) pair describing a subject at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub enable: bool,
    pub weight: Weight,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            enable: false,
            weight: Weight::ZERO,
        }
    }
}

/// Event emitted by a checker towards its parent real.
///
/// Carries only the new status; the real fills in the initial status and
/// its own identity when it forwards the transition upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerEvent {
    pub kind: EventKind,
    pub new: Status,
}

/// Event emitted by a real towards its parent service, with the real's
/// pre-transition status attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealEvent {
    pub kind: EventKind,
    pub real: RealKey,
    pub init: Status,
    pub new: Status,
}

/// Fully-qualified event as handed to the balancer sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub service: ServiceKey,
    pub real: RealKey,
    pub init: Status,
    pub new: Status,
}

impl Event {
    /// The balancer registry key for this event.
    pub fn key(&self) -> BalancerKey {
        BalancerKey {
            service: self.service,
            real: self.real,
        }
    }
}

impl Merge for Event {
    /// Collapses consecutive transitions of one (service, real) pair into
    /// their net effect.
    ///
    /// When a newer event lands the subject exactly where the pending event
    /// started, the pair cancels and nothing needs to reach the balancer.
    /// Otherwise the pending event keeps its original `init` and adopts the
    /// newer target, so an Enable→Disable chain survives as one Disable
    /// against the original initial status.
    fn merge(mut self, newer: Self) -> (Self, bool) {
        if newer.new == self.init {
            return (self, true);
        }

        self.kind = newer.kind;
        self.new = newer.new;
        (self, false)
    }
}
