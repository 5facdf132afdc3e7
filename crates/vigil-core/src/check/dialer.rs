//! Tunnel-aware TCP dialer for probe sockets.
//!
//! Probe packets must reach the real server through the balancer's
//! encapsulation path, not directly. Every probe socket therefore carries
//! per-packet metadata for the external tunneling daemon: an experimental
//! IP option (IPv4) or destination option (IPv6) encoding the real's
//! address and the LVS encapsulation method, plus a firewall mark that
//! netfilter matches to divert the packets into the daemon's NFQUEUE. The
//! hop limit is kept at 2 so stray packets cannot travel far, and lingering
//! is disabled so probe sockets close without TIME_WAIT.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::ForwardingMethod;

/// Maximum number of hops for probe packets.
const HOP_LIMIT: u32 = 2;

/// Firewall mark diverting probe packets to the tunneling daemon.
const FWMARK: u32 = u32::MAX;

/// IP option type 30, "for experimentation" per RFC 4727.
const EXP_OPTION_TYPE: u8 = 30;

/// Where and how probe packets are to be tunneled.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingData {
    /// The real server the tunnel terminates at.
    pub real_ip: IpAddr,
    /// Encapsulation used on the balancer path.
    pub method: ForwardingMethod,
}

/// Builds probe sockets with the tunneling metadata applied.
#[derive(Debug, Clone)]
pub struct Dialer {
    bind_ip: Option<IpAddr>,
    connect_timeout: Duration,
    forwarding: ForwardingData,
}

impl Dialer {
    pub fn new(
        bind_ip: Option<IpAddr>,
        connect_timeout: Duration,
        forwarding: ForwardingData,
    ) -> Self {
        Dialer {
            bind_ip,
            connect_timeout,
            forwarding,
        }
    }

    /// Opens a TCP connection to `addr` with all probe socket options set.
    /// A zero connect timeout means no explicit bound.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = self.build_socket(&addr)?;
        let socket = TcpSocket::from_std_stream(socket.into());

        if self.connect_timeout.is_zero() {
            return socket.connect(addr).await;
        }
        match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    fn build_socket(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match addr {
            SocketAddr::V4(_) => socket.set_ttl(HOP_LIMIT)?,
            SocketAddr::V6(_) => socket.set_unicast_hops_v6(HOP_LIMIT)?,
        }

        #[cfg(target_os = "linux")]
        self.set_tunnel_options(&socket, addr)?;

        // Close immediately, skipping TIME_WAIT.
        socket.set_linger(Some(Duration::ZERO))?;

        if let Some(bind_ip) = self.bind_ip {
            socket.bind(&SocketAddr::new(bind_ip, 0).into())?;
        }

        Ok(socket)
    }

    #[cfg(target_os = "linux")]
    fn set_tunnel_options(&self, socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
        let method = self.forwarding.method.lvs_method_byte();
        match addr {
            SocketAddr::V4(_) => {
                let header = ipv4_probe_option(self.forwarding.real_ip, method);
                set_raw_option(socket, libc::IPPROTO_IP, libc::IP_OPTIONS, &header)?;
            }
            SocketAddr::V6(_) => {
                let header = ipv6_probe_dstopts(self.forwarding.real_ip, method);
                set_raw_option(socket, libc::IPPROTO_IPV6, libc::IPV6_DSTOPTS, &header)?;
            }
        }
        socket.set_mark(FWMARK)
    }
}

#[cfg(target_os = "linux")]
fn set_raw_option(
    socket: &Socket,
    level: libc::c_int,
    optname: libc::c_int,
    value: &[u8],
) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            optname,
            value.as_ptr().cast(),
            value.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn real_ip_octets(real_ip: IpAddr) -> Vec<u8> {
    match real_ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// IPv4 option in type-length-value form:
/// `[type=30][len][real_ip][lvs_method]`. The length is 7 for an IPv4
/// real and 19 for an IPv6 real.
fn ipv4_probe_option(real_ip: IpAddr, lvs_method: u8) -> Vec<u8> {
    let ip = real_ip_octets(real_ip);
    let mut option = Vec::with_capacity(2 + ip.len() + 1);
    option.push(EXP_OPTION_TYPE);
    option.push((2 + ip.len() + 1) as u8);
    option.extend_from_slice(&ip);
    option.push(lvs_method);
    option
}

/// IPv6 destination options extension header (RFC 8200 §4.6) carrying one
/// TLV option `[type=30][len][real_ip][lvs_method]`, padded with Pad1/PadN
/// to 8-byte alignment.
fn ipv6_probe_dstopts(real_ip: IpAddr, lvs_method: u8) -> Vec<u8> {
    let ip = real_ip_octets(real_ip);
    let payload_len = 2 + 2 + ip.len() + 1;
    let pad = (8 - payload_len % 8) % 8;
    let total = payload_len + pad;

    let mut header = Vec::with_capacity(total);
    // Next-header is filled in by the kernel.
    header.push(0);
    header.push((total / 8 - 1) as u8);
    header.push(EXP_OPTION_TYPE);
    header.push((ip.len() + 1) as u8);
    header.extend_from_slice(&ip);
    header.push(lvs_method);

    match pad {
        0 => {}
        1 => header.push(0), // Pad1
        n => {
            // PadN: type 1, then the number of zero octets.
            header.push(1);
            header.push((n - 2) as u8);
            header.resize(total, 0);
        }
    }

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_option_with_ipv4_real() {
        let option = ipv4_probe_option("10.0.0.1".parse().unwrap(), 0x02);
        assert_eq!(option.len(), 7);
        assert_eq!(option[0], EXP_OPTION_TYPE);
        assert_eq!(option[1], 7);
        assert_eq!(&option[2..6], &[10, 0, 0, 1]);
        assert_eq!(option[6], 0x02);
    }

    #[test]
    fn test_ipv4_option_with_ipv6_real() {
        let option = ipv4_probe_option("2001:db8::1".parse().unwrap(), 0x05);
        assert_eq!(option.len(), 19);
        assert_eq!(option[1], 19);
        assert_eq!(option[18], 0x05);
    }

    #[test]
    fn test_ipv6_dstopts_alignment() {
        // IPv6 real: 2+2+16+1 = 21 payload bytes, padded to 24.
        let header = ipv6_probe_dstopts("2001:db8::1".parse().unwrap(), 0x02);
        assert_eq!(header.len() % 8, 0);
        assert_eq!(header.len(), 24);
        assert_eq!(header[1], 2); // extension length in octets minus one
        assert_eq!(header[2], EXP_OPTION_TYPE);
        assert_eq!(header[3], 17); // real ip + method byte

        // PadN with one zero octet of padding data.
        assert_eq!(header[21], 1);
        assert_eq!(header[22], 1);
        assert_eq!(header[23], 0);
    }

    #[test]
    fn test_ipv6_dstopts_with_ipv4_real() {
        // IPv4 real: 2+2+4+1 = 9 payload bytes, padded to 16.
        let header = ipv6_probe_dstopts("10.0.0.1".parse().unwrap(), 0x05);
        assert_eq!(header.len(), 16);
        assert_eq!(header[1], 1);
        assert_eq!(header[3], 5);
        assert_eq!(&header[4..8], &[10, 0, 0, 1]);
        assert_eq!(header[8], 0x05);
    }
}
