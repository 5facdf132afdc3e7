//! Client for the YANET control plane.
//!
//! The control plane listens on a UNIX stream socket and speaks a minimal
//! RPC protocol: an [`proto::RpcMeta`] header naming the target service and
//! method, followed by the request message, each serialized with protobuf
//! and length-prefixed with a little-endian u64. The response is a single
//! message framed the same way.

pub mod proto;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use async_trait::async_trait;
use prost::Message;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use vigil_common::{BalancerKey, Port, Protocol, RealKey, ServiceKey, Weight};

use crate::{BalancerError, BalancerState, BalancerStater, LoadBalancerClient};

const SERVICE_NAME: &str = "BalancerService";

/// Balancer module addressed by real updates.
const MODULE: &str = "balancer0";

/// Upper bound on a single control-plane response.
const MAX_MESSAGE_SIZE: u64 = 64 << 20;

fn default_sock_path() -> PathBuf {
    PathBuf::from("/var/run/yanet/control_plane.sock")
}

/// YANET client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YanetConfig {
    /// Path to the control plane UNIX socket.
    pub control_plane_sock_path: PathBuf,
}

impl Default for YanetConfig {
    fn default() -> Self {
        YanetConfig {
            control_plane_sock_path: default_sock_path(),
        }
    }
}

/// Client for the YANET balancer service.
///
/// Each invocation opens a fresh connection; the control plane treats
/// connections as per-call and the call rate here is bounded by the flush
/// and sync periods.
pub struct YanetClient {
    sock_path: PathBuf,
}

impl YanetClient {
    pub fn new(config: &YanetConfig) -> Self {
        YanetClient {
            sock_path: config.control_plane_sock_path.clone(),
        }
    }

    async fn invoke<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, BalancerError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let mut stream = UnixStream::connect(&self.sock_path).await?;

        let meta = proto::RpcMeta {
            service_name: SERVICE_NAME.to_string(),
            method_name: method.to_string(),
        };
        write_message(&mut stream, &meta).await?;
        write_message(&mut stream, request).await?;

        read_message(&mut stream).await
    }

    async fn update_real(
        &self,
        key: &BalancerKey,
        enable: bool,
        weight: Weight,
    ) -> Result<(), BalancerError> {
        let update = proto::RealUpdate {
            module: MODULE.to_string(),
            virtual_ip: Some(to_proto_addr(key.service.addr)),
            proto: to_proto_proto(key.service.proto) as i32,
            virtual_port: key.service.port.as_option().map(u32::from),
            real_ip: Some(to_proto_addr(key.real.addr)),
            real_port: key.real.port.as_option().map(u32::from),
            enable,
            // The weight only matters for enable requests.
            weight: enable.then(|| weight.as_u32()),
        };

        let request = proto::BalancerRealRequest {
            reals: vec![update],
        };
        let _: proto::Empty = self.invoke("Real", &request).await?;
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerClient for YanetClient {
    async fn enable_real(&self, key: &BalancerKey, weight: Weight) -> Result<(), BalancerError> {
        self.update_real(key, true, weight).await
    }

    async fn disable_real(&self, key: &BalancerKey) -> Result<(), BalancerError> {
        self.update_real(key, false, Weight::OMITTED).await
    }

    async fn flush(&self) -> Result<(), BalancerError> {
        let _: proto::Empty = self.invoke("RealFlush", &proto::Empty {}).await?;
        Ok(())
    }
}

#[async_trait]
impl BalancerStater for YanetClient {
    async fn state(&self) -> Result<BalancerState, BalancerError> {
        let response: proto::BalancerRealFindResponse = self
            .invoke("RealFind", &proto::BalancerRealFindRequest {})
            .await?;

        let mut state = BalancerState::new();
        for balancer in response.balancers {
            let mut services: HashMap<ServiceKey, HashSet<RealKey>> = HashMap::new();
            for service in balancer.services {
                let key = service
                    .key
                    .ok_or_else(|| {
                        BalancerError::MalformedResponse("service entry without key".into())
                    })
                    .and_then(from_proto_service)?;

                let reals = service
                    .reals
                    .into_iter()
                    .map(from_proto_real)
                    .collect::<Result<HashSet<_>, _>>()?;
                services.insert(key, reals);
            }
            state.insert(balancer.module, services);
        }

        Ok(state)
    }
}

async fn write_message<M: Message>(
    stream: &mut UnixStream,
    message: &M,
) -> Result<(), BalancerError> {
    let buf = message.encode_to_vec();
    stream.write_all(&(buf.len() as u64).to_le_bytes()).await?;
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_message<M: Message + Default>(stream: &mut UnixStream) -> Result<M, BalancerError> {
    let mut size_buf = [0u8; 8];
    stream.read_exact(&mut size_buf).await?;

    let size = u64::from_le_bytes(size_buf);
    if size > MAX_MESSAGE_SIZE {
        return Err(BalancerError::MalformedResponse(format!(
            "response of {size} bytes exceeds the message size limit"
        )));
    }

    let mut buf = vec![0u8; size as usize];
    stream.read_exact(&mut buf).await?;
    Ok(M::decode(buf.as_slice())?)
}

fn to_proto_addr(addr: IpAddr) -> proto::IpAddr {
    let addr = match addr {
        IpAddr::V4(v4) => proto::ip_addr::Addr::Ipv4(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => proto::ip_addr::Addr::Ipv6(v6.octets().to_vec()),
    };
    proto::IpAddr { addr: Some(addr) }
}

fn from_proto_addr(addr: Option<proto::IpAddr>) -> Result<IpAddr, BalancerError> {
    let addr = addr
        .and_then(|addr| addr.addr)
        .ok_or_else(|| BalancerError::MalformedResponse("entry without an address".into()))?;

    match addr {
        proto::ip_addr::Addr::Ipv4(value) => {
            Ok(IpAddr::V4(Ipv4Addr::from(value.to_be_bytes())))
        }
        proto::ip_addr::Addr::Ipv6(bytes) => {
            let octets: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                BalancerError::MalformedResponse(format!(
                    "IPv6 address of {} bytes",
                    bytes.len()
                ))
            })?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

fn to_proto_proto(proto: Protocol) -> proto::NetProto {
    match proto {
        Protocol::Tcp => proto::NetProto::Tcp,
        Protocol::Udp => proto::NetProto::Udp,
        Protocol::Undefined => proto::NetProto::Undefined,
    }
}

fn from_proto_proto(proto: i32) -> Protocol {
    match proto::NetProto::try_from(proto) {
        Ok(proto::NetProto::Tcp) => Protocol::Tcp,
        Ok(proto::NetProto::Udp) => Protocol::Udp,
        _ => Protocol::Undefined,
    }
}

fn from_proto_service(entry: proto::ServiceKeyEntry) -> Result<ServiceKey, BalancerError> {
    Ok(ServiceKey {
        addr: from_proto_addr(entry.ip)?,
        port: entry
            .port
            .map(|port| Port::new(port as u16))
            .unwrap_or(Port::OMITTED),
        proto: from_proto_proto(entry.proto),
    })
}

fn from_proto_real(entry: proto::RealEntry) -> Result<RealKey, BalancerError> {
    Ok(RealKey {
        addr: from_proto_addr(entry.ip)?,
        port: entry
            .port
            .map(|port| Port::new(port as u16))
            .unwrap_or(Port::OMITTED),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_addr_round_trip() {
        for text in ["192.0.2.33", "2001:db8::17"] {
            let addr: IpAddr = text.parse().unwrap();
            assert_eq!(from_proto_addr(Some(to_proto_addr(addr))).unwrap(), addr);
        }
    }

    #[test]
    fn test_omitted_port_encodes_as_absent() {
        let update = proto::RealUpdate {
            module: MODULE.to_string(),
            virtual_ip: Some(to_proto_addr("192.0.2.1".parse().unwrap())),
            proto: proto::NetProto::Tcp as i32,
            virtual_port: None,
            real_ip: Some(to_proto_addr("10.0.0.1".parse().unwrap())),
            real_port: Some(0),
            enable: true,
            weight: Some(1),
        };

        let decoded = proto::RealUpdate::decode(update.encode_to_vec().as_slice()).unwrap();
        // Absent and zero ports must stay distinguishable over the wire.
        assert_eq!(decoded.virtual_port, None);
        assert_eq!(decoded.real_port, Some(0));
    }

    /// Fake control plane accepting one connection, verifying the frames
    /// and answering with the given response message.
    async fn serve_once<M: Message>(
        listener: UnixListener,
        expected_method: &'static str,
        response: M,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let meta: proto::RpcMeta = read_message(&mut stream).await.unwrap();
        assert_eq!(meta.service_name, SERVICE_NAME);
        assert_eq!(meta.method_name, expected_method);

        // The request itself; discarded after framing is verified.
        let mut size_buf = [0u8; 8];
        stream.read_exact(&mut size_buf).await.unwrap();
        let mut buf = vec![0u8; u64::from_le_bytes(size_buf) as usize];
        stream.read_exact(&mut buf).await.unwrap();

        write_message(&mut stream, &response).await.unwrap();
    }

    #[tokio::test]
    async fn test_state_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("control_plane.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let response = proto::BalancerRealFindResponse {
            balancers: vec![proto::BalancerEntry {
                module: MODULE.to_string(),
                services: vec![proto::ServiceEntry {
                    key: Some(proto::ServiceKeyEntry {
                        ip: Some(to_proto_addr("192.0.2.1".parse().unwrap())),
                        proto: proto::NetProto::Tcp as i32,
                        port: Some(80),
                    }),
                    reals: vec![proto::RealEntry {
                        ip: Some(to_proto_addr("10.0.0.1".parse().unwrap())),
                        port: Some(8080),
                    }],
                }],
            }],
        };
        let server = tokio::spawn(serve_once(listener, "RealFind", response));

        let client = YanetClient::new(&YanetConfig {
            control_plane_sock_path: sock_path,
        });
        let state = client.state().await.unwrap();
        server.await.unwrap();

        let service = ServiceKey {
            addr: "192.0.2.1".parse().unwrap(),
            port: Port::new(80),
            proto: Protocol::Tcp,
        };
        let real = RealKey {
            addr: "10.0.0.1".parse().unwrap(),
            port: Port::new(8080),
        };
        assert_eq!(state[MODULE][&service], HashSet::from([real]));
    }

    #[tokio::test]
    async fn test_flush_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("control_plane.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        let server = tokio::spawn(serve_once(listener, "RealFlush", proto::Empty {}));

        let client = YanetClient::new(&YanetConfig {
            control_plane_sock_path: sock_path,
        });
        client.flush().await.unwrap();
        server.await.unwrap();
    }
}
