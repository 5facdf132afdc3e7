//! Health probe implementations.
//!
//! All probe variants share one contract: dial the target through the
//! tunnel-aware [`Dialer`], decide liveness, and fill a [`Metadata`] with
//! the observed status and, when supported, the backend-advertised weight.
//! Probe failures are data for the checker state machine, never faults.

pub mod dialer;
pub mod grpc;
pub mod http;
pub mod tcp;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;

use vigil_common::Weight;

pub use dialer::{Dialer, ForwardingData};
pub use grpc::GrpcProbe;
pub use http::HttpProbe;
pub use tcp::TcpProbe;
pub use tls::{TlsSettings, TlsVersion};

/// Identifies the prober to the backends it probes.
pub const USER_AGENT: &str = "vigil";

/// Outcome of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub alive: bool,
    pub weight: Weight,
    /// Process the result even when nothing changed.
    pub force: bool,
}

impl Metadata {
    /// Metadata seeded from the checker's current state, so probes can
    /// report it to the backend.
    pub fn from_state(alive: bool, weight: Weight) -> Self {
        Metadata {
            alive,
            weight,
            force: false,
        }
    }

    /// Marks the probe target inactive with no weight information.
    pub fn set_inactive(&mut self) {
        self.alive = false;
        self.weight = Weight::OMITTED;
    }

    pub fn inactive() -> Self {
        Metadata {
            alive: false,
            weight: Weight::OMITTED,
            force: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to process request: {0}")]
    Request(String),

    #[error("check timed out")]
    Timeout,

    #[error("status code does not match: {0}")]
    StatusMismatch(u16),

    #[error("digest does not match")]
    DigestMismatch,

    #[error("status does not match: {0}")]
    ServingStatusMismatch(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// A single health probe bound to one target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Runs the probe once. On success `metadata` reflects the observed
    /// status; on failure it is reset to inactive.
    async fn probe(&self, metadata: &mut Metadata) -> Result<(), ProbeError>;

    /// Human-readable probe target for logs.
    fn uri(&self) -> String;
}

/// Extracts a dynamic weight from a response body: the first line must be
/// `rs_weight=<value>`. Only the first line is examined.
pub(crate) fn weight_from_body(body: &[u8]) -> Weight {
    let first_line = body.split(|&b| b == b'\n').next().unwrap_or_default();
    let Some(value) = first_line.strip_prefix(b"rs_weight=") else {
        return Weight::OMITTED;
    };
    std::str::from_utf8(value)
        .map(|value| value.parse().expect("weight parsing is infallible"))
        .unwrap_or(Weight::OMITTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_from_body() {
        assert_eq!(weight_from_body(b"rs_weight=42\nrest"), Weight::new(42));
        assert_eq!(weight_from_body(b"rs_weight= 7 \n"), Weight::new(7));
        assert_eq!(weight_from_body(b"rs_weight=42"), Weight::new(42));
    }

    #[test]
    fn test_weight_from_body_missing_prefix() {
        assert_eq!(weight_from_body(b"weight=42"), Weight::OMITTED);
        assert_eq!(weight_from_body(b""), Weight::OMITTED);
        // The prefix on a later line does not count.
        assert_eq!(weight_from_body(b"hello\nrs_weight=42"), Weight::OMITTED);
    }

    #[test]
    fn test_weight_from_body_garbage_value() {
        assert_eq!(weight_from_body(b"rs_weight=abc"), Weight::OMITTED);
        assert_eq!(weight_from_body(b"rs_weight=-3"), Weight::OMITTED);
    }
}
