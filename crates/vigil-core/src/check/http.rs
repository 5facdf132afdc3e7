//! HTTP and HTTPS probes.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, USER_AGENT as USER_AGENT_HEADER};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty, Limited};
use hyper_util::rt::TokioIo;
use md5::{Digest, Md5};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

use vigil_common::Weight;

use super::{
    weight_from_body, Dialer, ForwardingData, Metadata, Probe, ProbeError, TlsSettings,
    USER_AGENT,
};
use crate::config::CheckerConfig;

/// Bound on the response body read. Weight extraction needs only the first
/// line; digests are computed over the bounded body.
const BODY_LIMIT: usize = 1 << 20;

/// Response header carrying the backend's advertised weight.
const WEIGHT_RESPONSE_HEADER: &str = "RS-Weight";

/// Probes a backend with a GET request, optionally over TLS. Redirects are
/// not followed and the connection is closed after each request.
pub struct HttpProbe {
    config: CheckerConfig,
    target: SocketAddr,
    uri: String,
    dialer: Dialer,
    tls: Option<TlsContext>,
}

struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl HttpProbe {
    /// Creates an HTTP probe; passing TLS settings turns it into HTTPS.
    pub fn new(
        config: &CheckerConfig,
        forwarding: ForwardingData,
        tls_settings: Option<&TlsSettings>,
    ) -> Self {
        let addr = config.net.connect_ip.unwrap_or(forwarding.real_ip);
        let target = SocketAddr::new(addr, config.net.connect_port.value());

        let tls = tls_settings.map(|settings| TlsContext {
            connector: TlsConnector::from(Arc::new(settings.client_config(&[b"http/1.1"]))),
            server_name: settings.server_name(config.url.virtualhost.as_deref(), addr),
        });

        let scheme = if tls.is_some() { "https" } else { "http" };
        let uri = format!("{scheme}://{target}{}", config.url.path);

        HttpProbe {
            config: config.clone(),
            target,
            uri,
            dialer: Dialer::new(config.net.bind_ip, config.net.connect_timeout(), forwarding),
            tls,
        }
    }

    /// Dials, performs the request and returns the raw response parts.
    /// The whole exchange is bounded by the check timeout.
    async fn exchange(
        &self,
        metadata: &Metadata,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProbeError> {
        let timeout = self.config.net.check_timeout();
        if timeout.is_zero() {
            return self.exchange_inner(metadata).await;
        }
        match tokio::time::timeout(timeout, self.exchange_inner(metadata)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    async fn exchange_inner(
        &self,
        metadata: &Metadata,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProbeError> {
        let stream = self
            .dialer
            .connect(self.target)
            .await
            .map_err(ProbeError::Connect)?;

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|err| ProbeError::Request(format!("tls handshake: {err}")))?;
                self.send_request(stream, metadata).await
            }
            None => self.send_request(stream, metadata).await,
        }
    }

    async fn send_request<S>(
        &self,
        stream: S,
        metadata: &Metadata,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| ProbeError::Request(err.to_string()))?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let response = sender
            .send_request(self.build_request(metadata)?)
            .await
            .map_err(|err| ProbeError::Request(err.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = Limited::new(response.into_body(), BODY_LIMIT)
            .collect()
            .await
            .map_err(|err| ProbeError::Body(err.to_string()))?
            .to_bytes();

        Ok((status, headers, body))
    }

    fn build_request(&self, metadata: &Metadata) -> Result<Request<Empty<Bytes>>, ProbeError> {
        let path = match self.config.url.path.as_str() {
            "" => "/",
            path => path,
        };
        let host = self
            .config
            .url
            .virtualhost
            .clone()
            .unwrap_or_else(|| self.target.to_string());

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, host)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .header(CONNECTION, "close");

        if self.config.weight.dynamic_weight {
            // Report our current view so the backend can answer relative
            // to it.
            builder = builder
                .header("X-RS-Weight", metadata.weight.to_string())
                .header("X-RS-Alive", if metadata.alive { "1" } else { "0" });
        }

        builder
            .body(Empty::new())
            .map_err(|err| ProbeError::Request(err.to_string()))
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, metadata: &mut Metadata) -> Result<(), ProbeError> {
        let result = self
            .exchange(metadata)
            .await
            .and_then(|(status, headers, body)| {
                evaluate_response(&self.config, status, &headers, &body, metadata)
            });
        if result.is_err() {
            metadata.set_inactive();
        }
        result
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }
}

/// Decides the probe outcome from a response: the status code must match
/// when configured, the body digest must match when configured, and the
/// advertised weight is extracted when dynamic weight is enabled.
fn evaluate_response(
    config: &CheckerConfig,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    metadata: &mut Metadata,
) -> Result<(), ProbeError> {
    if let Some(expected) = config.url.status_code {
        if status.as_u16() != expected {
            return Err(ProbeError::StatusMismatch(status.as_u16()));
        }
    }

    if let Some(digest) = config.url.digest.as_deref() {
        if !digest.is_empty() && digest != hex_md5(body) {
            return Err(ProbeError::DigestMismatch);
        }
    }

    metadata.alive = true;
    metadata.weight = extract_weight(config, headers, body);
    Ok(())
}

fn extract_weight(config: &CheckerConfig, headers: &HeaderMap, body: &[u8]) -> Weight {
    if !config.weight.dynamic_weight {
        return Weight::OMITTED;
    }

    if config.weight.dynamic_weight_header {
        return headers
            .get(WEIGHT_RESPONSE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.parse().expect("weight parsing is infallible"))
            .unwrap_or(Weight::OMITTED);
    }

    weight_from_body(body)
}

fn hex_md5(body: &[u8]) -> String {
    Md5::digest(body)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
