//! Identity keys for services and reals.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::port::Port;

/// Transport protocol of a virtual service.
///
/// `Undefined` is a valid value for L3 services; it must survive wire
/// round-trips as "absent" rather than defaulting to TCP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Undefined,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Undefined => "",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    /// Parses a protocol name case-insensitively; anything that is not TCP
    /// or UDP maps to [`Protocol::Undefined`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            _ => Protocol::Undefined,
        })
    }
}

impl Serialize for Protocol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("protocol parsing is infallible"))
    }
}

/// Unique identity of a virtual service: VIP, virtual port and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub addr: IpAddr,
    pub port: Port,
    pub proto: Protocol,
}

impl ServiceKey {
    /// The host prefix (/32 or /128) derived from the VIP. All services
    /// sharing a VIP share this prefix, and announcements are made per
    /// prefix rather than per service.
    pub fn prefix(&self) -> IpNet {
        IpNet::from(self.addr)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.addr, self.port, self.proto)
    }
}

/// Unique identity of a real server within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RealKey {
    pub addr: IpAddr,
    pub port: Port,
}

impl fmt::Display for RealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Identity of a (service, real) pair as the load balancer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalancerKey {
    pub service: ServiceKey,
    pub real: RealKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("".parse::<Protocol>().unwrap(), Protocol::Undefined);
        assert_eq!("sctp".parse::<Protocol>().unwrap(), Protocol::Undefined);
    }

    #[test]
    fn test_service_prefix_is_host_length() {
        let v4 = ServiceKey {
            addr: "10.0.0.1".parse().unwrap(),
            port: Port::new(80),
            proto: Protocol::Tcp,
        };
        assert_eq!(v4.prefix().to_string(), "10.0.0.1/32");

        let v6 = ServiceKey {
            addr: "2001:db8::1".parse().unwrap(),
            port: Port::OMITTED,
            proto: Protocol::Tcp,
        };
        assert_eq!(v6.prefix().to_string(), "2001:db8::1/128");
    }

    #[test]
    fn test_services_with_same_vip_share_prefix() {
        let addr: IpAddr = "192.0.2.7".parse().unwrap();
        let a = ServiceKey {
            addr,
            port: Port::new(80),
            proto: Protocol::Tcp,
        };
        let b = ServiceKey {
            addr,
            port: Port::new(443),
            proto: Protocol::Tcp,
        };
        assert_eq!(a.prefix(), b.prefix());
    }
}
