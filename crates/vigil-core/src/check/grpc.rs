//! gRPC health probe.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Endpoint, Uri};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tower::service_fn;

use vigil_common::Weight;

use super::{Dialer, ForwardingData, Metadata, Probe, ProbeError, TlsSettings, USER_AGENT};
use crate::config::CheckerConfig;

const WEIGHT_METADATA_KEY: &str = "x-rs-weight";
const ALIVE_METADATA_KEY: &str = "x-rs-alive";

/// Probes a backend with the standard `grpc.health.v1` Check call over
/// TLS. The virtualhost, when set, names the service to check.
pub struct GrpcProbe {
    config: CheckerConfig,
    target: SocketAddr,
    dialer: Arc<Dialer>,
    tls: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl GrpcProbe {
    pub fn new(
        config: &CheckerConfig,
        forwarding: ForwardingData,
        tls_settings: &TlsSettings,
    ) -> Self {
        let addr = config.net.connect_ip.unwrap_or(forwarding.real_ip);
        let target = SocketAddr::new(addr, config.net.connect_port.value());

        GrpcProbe {
            config: config.clone(),
            target,
            dialer: Arc::new(Dialer::new(
                config.net.bind_ip,
                config.net.connect_timeout(),
                forwarding,
            )),
            tls: Arc::new(tls_settings.client_config(&[b"h2"])),
            server_name: tls_settings.server_name(config.url.virtualhost.as_deref(), addr),
        }
    }

    async fn check(&self, metadata: &Metadata) -> Result<(i32, MetadataMap), ProbeError> {
        let dialer = Arc::clone(&self.dialer);
        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let server_name = self.server_name.clone();
        let target = self.target;

        // The endpoint URI is a placeholder; the connector below dials the
        // configured target through the tunnel-aware dialer.
        let channel = Endpoint::from_static("http://probe.internal")
            .user_agent(USER_AGENT)
            .map_err(|err| ProbeError::Request(err.to_string()))?
            .connect_with_connector(service_fn(move |_: Uri| {
                let dialer = Arc::clone(&dialer);
                let connector = connector.clone();
                let server_name = server_name.clone();
                async move {
                    let stream = dialer.connect(target).await?;
                    let stream = connector.connect(server_name, stream).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|err| ProbeError::Request(err.to_string()))?;

        let service = self.config.url.virtualhost.clone().unwrap_or_default();
        let mut request = tonic::Request::new(HealthCheckRequest { service });

        let alive = if metadata.alive { "1" } else { "0" };
        request
            .metadata_mut()
            .insert(ALIVE_METADATA_KEY, MetadataValue::from_static(alive));
        if self.config.weight.dynamic_weight {
            if let Ok(value) = MetadataValue::try_from(metadata.weight.to_string()) {
                request.metadata_mut().insert(WEIGHT_METADATA_KEY, value);
            }
        }

        let response = HealthClient::new(channel)
            .check(request)
            .await
            .map_err(|status| ProbeError::Request(status.to_string()))?;

        let headers = response.metadata().clone();
        Ok((response.into_inner().status, headers))
    }

    fn weight_from_headers(&self, headers: &MetadataMap) -> Weight {
        if !self.config.weight.dynamic_weight {
            return Weight::OMITTED;
        }
        headers
            .get(WEIGHT_METADATA_KEY)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.parse().expect("weight parsing is infallible"))
            .unwrap_or(Weight::OMITTED)
    }
}

#[async_trait]
impl Probe for GrpcProbe {
    async fn probe(&self, metadata: &mut Metadata) -> Result<(), ProbeError> {
        let timeout = self.config.net.check_timeout();
        let outcome = if timeout.is_zero() {
            self.check(metadata).await
        } else {
            match tokio::time::timeout(timeout, self.check(metadata)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            }
        };

        let (status, headers) = match outcome {
            Ok(response) => response,
            Err(err) => {
                metadata.set_inactive();
                return Err(err);
            }
        };

        if status != ServingStatus::Serving as i32 {
            metadata.set_inactive();
            let name = ServingStatus::try_from(status)
                .map(|status| status.as_str_name().to_string())
                .unwrap_or_else(|_| status.to_string());
            return Err(ProbeError::ServingStatusMismatch(name));
        }

        metadata.alive = true;
        metadata.weight = self.weight_from_headers(&headers);
        Ok(())
    }

    fn uri(&self) -> String {
        self.target.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardingMethod;

    fn probe(dynamic_weight: bool) -> GrpcProbe {
        let mut config = CheckerConfig::default();
        config.net.connect_ip = Some("10.0.0.1".parse().unwrap());
        config.net.connect_port = vigil_common::Port::new(50051);
        config.weight.dynamic_weight = dynamic_weight;

        GrpcProbe::new(
            &config,
            ForwardingData {
                real_ip: "10.0.0.1".parse().unwrap(),
                method: ForwardingMethod::Tun,
            },
            &TlsSettings::default(),
        )
    }

    #[test]
    fn test_weight_from_headers() {
        let mut headers = MetadataMap::new();
        headers.insert(WEIGHT_METADATA_KEY, "33".parse().unwrap());

        assert_eq!(
            probe(true).weight_from_headers(&headers),
            Weight::new(33)
        );
        assert_eq!(
            probe(true).weight_from_headers(&MetadataMap::new()),
            Weight::OMITTED
        );
        // Without dynamic weight the header is ignored entirely.
        assert_eq!(
            probe(false).weight_from_headers(&headers),
            Weight::OMITTED
        );
    }

    #[test]
    fn test_uri() {
        assert_eq!(probe(false).uri(), "10.0.0.1:50051");
    }
}
