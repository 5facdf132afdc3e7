//! TCP connect probe.

use std::net::SocketAddr;

use async_trait::async_trait;

use vigil_common::Weight;

use super::{Dialer, ForwardingData, Metadata, Probe, ProbeError};
use crate::config::CheckerConfig;

/// Probes a backend by opening a TCP connection and closing it right away.
/// A TCP probe cannot carry a dynamic weight by design.
pub struct TcpProbe {
    target: SocketAddr,
    dialer: Dialer,
}

impl TcpProbe {
    pub fn new(config: &CheckerConfig, forwarding: ForwardingData) -> Self {
        let addr = config.net.connect_ip.unwrap_or(forwarding.real_ip);
        TcpProbe {
            target: SocketAddr::new(addr, config.net.connect_port.value()),
            dialer: Dialer::new(config.net.bind_ip, config.net.connect_timeout(), forwarding),
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, metadata: &mut Metadata) -> Result<(), ProbeError> {
        let stream = match self.dialer.connect(self.target).await {
            Ok(stream) => stream,
            Err(err) => {
                metadata.set_inactive();
                return Err(ProbeError::Connect(err));
            }
        };
        // Lingering is off, so the drop closes the socket immediately.
        drop(stream);

        metadata.alive = true;
        metadata.weight = Weight::OMITTED;
        Ok(())
    }

    fn uri(&self) -> String {
        self.target.to_string()
    }
}
