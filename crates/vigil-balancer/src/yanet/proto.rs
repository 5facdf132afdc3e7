//! Control-plane message definitions.
//!
//! Hand-maintained prost messages for the balancer service of the YANET
//! control plane, kept in one place so the build needs no protoc step.
//! Optional ports and weights use field presence: an absent port means
//! "omitted" and is not the same as port 0.

/// Routing header sent before every request; the control plane dispatches
/// on the service and method names.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcMeta {
    #[prost(string, tag = "1")]
    pub service_name: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub method_name: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpAddr {
    #[prost(oneof = "ip_addr::Addr", tags = "1, 2")]
    pub addr: ::core::option::Option<ip_addr::Addr>,
}

pub mod ip_addr {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Addr {
        /// IPv4 address as a big-endian integer.
        #[prost(uint32, tag = "1")]
        Ipv4(u32),
        /// IPv6 address as 16 raw octets.
        #[prost(bytes, tag = "2")]
        Ipv6(::prost::alloc::vec::Vec<u8>),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum NetProto {
    Undefined = 0,
    Tcp = 1,
    Udp = 2,
}

/// A single real-server update within a batch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RealUpdate {
    #[prost(string, tag = "1")]
    pub module: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub virtual_ip: ::core::option::Option<IpAddr>,
    #[prost(enumeration = "NetProto", tag = "3")]
    pub proto: i32,
    #[prost(uint32, optional, tag = "4")]
    pub virtual_port: ::core::option::Option<u32>,
    #[prost(message, optional, tag = "5")]
    pub real_ip: ::core::option::Option<IpAddr>,
    #[prost(uint32, optional, tag = "6")]
    pub real_port: ::core::option::Option<u32>,
    #[prost(bool, tag = "7")]
    pub enable: bool,
    #[prost(uint32, optional, tag = "8")]
    pub weight: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BalancerRealRequest {
    #[prost(message, repeated, tag = "1")]
    pub reals: ::prost::alloc::vec::Vec<RealUpdate>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BalancerRealFindRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BalancerRealFindResponse {
    #[prost(message, repeated, tag = "1")]
    pub balancers: ::prost::alloc::vec::Vec<BalancerEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BalancerEntry {
    #[prost(string, tag = "1")]
    pub module: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub services: ::prost::alloc::vec::Vec<ServiceEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceEntry {
    #[prost(message, optional, tag = "1")]
    pub key: ::core::option::Option<ServiceKeyEntry>,
    #[prost(message, repeated, tag = "2")]
    pub reals: ::prost::alloc::vec::Vec<RealEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceKeyEntry {
    #[prost(message, optional, tag = "1")]
    pub ip: ::core::option::Option<IpAddr>,
    #[prost(enumeration = "NetProto", tag = "2")]
    pub proto: i32,
    #[prost(uint32, optional, tag = "3")]
    pub port: ::core::option::Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RealEntry {
    #[prost(message, optional, tag = "1")]
    pub ip: ::core::option::Option<IpAddr>,
    #[prost(uint32, optional, tag = "2")]
    pub port: ::core::option::Option<u32>,
}
