//! TLS configuration for HTTPS and gRPC probes.
//!
//! Probes are monitoring, not a trust anchor: certificate verification is
//! disabled. The key-exchange list is restricted to classical curves so
//! the ClientHello stays small; post-quantum hybrid key shares produce
//! handshake records larger than the 1500-byte cap of the NFQUEUE path the
//! probe packets traverse, and would be dropped there.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

/// Minimum accepted TLS protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_0,
    V1_1,
    #[default]
    V1_2,
    V1_3,
}

impl FromStr for TlsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(TlsVersion::V1_0),
            "1.1" => Ok(TlsVersion::V1_1),
            "1.2" => Ok(TlsVersion::V1_2),
            "1.3" => Ok(TlsVersion::V1_3),
            "" => Err("TLS version is empty, using default 1.2".to_string()),
            other => Err(format!("unknown TLS version {other:?}, using default 1.2")),
        }
    }
}

/// Probe TLS settings, fixed at startup and threaded through the checker
/// constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsSettings {
    pub min_version: TlsVersion,
    /// Use the virtualhost as SNI server name.
    pub sni_enabled: bool,
}

impl TlsSettings {
    /// Builds a rustls client config for probe connections.
    pub(crate) fn client_config(&self, alpn: &[&[u8]]) -> ClientConfig {
        let provider = probe_crypto_provider();
        let verifier = NoVerification(provider.clone());

        // rustls does not implement TLS 1.0/1.1; configured floors below
        // 1.2 clamp to 1.2.
        let versions: &[&rustls::SupportedProtocolVersion] = match self.min_version {
            TlsVersion::V1_3 => &[&rustls::version::TLS13],
            _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
        };

        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(versions)
            .expect("protocol versions supported by the provider")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
        config
    }

    /// The TLS server name for a probe connection: the virtualhost when
    /// SNI is enabled and set, the target address otherwise.
    pub(crate) fn server_name(
        &self,
        virtualhost: Option<&str>,
        addr: IpAddr,
    ) -> ServerName<'static> {
        if self.sni_enabled {
            if let Some(host) = virtualhost {
                if let Ok(name) = ServerName::try_from(host.to_string()) {
                    return name;
                }
            }
        }
        ServerName::IpAddress(addr.into())
    }
}

/// The ring provider with key exchange restricted to classical curves.
fn probe_crypto_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.kx_groups = vec![
        rustls::crypto::ring::kx_group::X25519,
        rustls::crypto::ring::kx_group::SECP256R1,
        rustls::crypto::ring::kx_group::SECP384R1,
    ];
    provider
}

/// Accepts any server certificate while still verifying handshake
/// signatures against it.
#[derive(Debug)]
struct NoVerification(CryptoProvider);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::V1_2);
        assert_eq!("1.3".parse::<TlsVersion>().unwrap(), TlsVersion::V1_3);
        assert!("".parse::<TlsVersion>().is_err());
        assert!("2.0".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_server_name_prefers_virtualhost_with_sni() {
        let settings = TlsSettings {
            sni_enabled: true,
            ..TlsSettings::default()
        };
        let addr: IpAddr = "10.0.0.1".parse().unwrap();

        let name = settings.server_name(Some("example.com"), addr);
        assert!(matches!(name, ServerName::DnsName(_)));

        let name = settings.server_name(None, addr);
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_server_name_ignores_virtualhost_without_sni() {
        let settings = TlsSettings::default();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let name = settings.server_name(Some("example.com"), addr);
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn test_client_config_builds() {
        let settings = TlsSettings::default();
        let config = settings.client_config(&[b"h2"]);
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
