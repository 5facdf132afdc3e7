//! Shared vocabulary of the vigil control plane.
//!
//! This crate holds the types every other vigil crate agrees on: optional
//! weights and ports, the service/real identity keys, the state-transition
//! event model, and the generic merging event registry that both downstream
//! sync engines are built on.

pub mod event;
pub mod key;
pub mod port;
pub mod registry;
pub mod weight;

pub use event::{CheckerEvent, Event, EventKind, RealEvent, Status};
pub use key::{BalancerKey, Protocol, RealKey, ServiceKey};
pub use port::Port;
pub use registry::{EventRegistry, Merge};
pub use weight::Weight;
