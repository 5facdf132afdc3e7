//! Wire format of the BIRD announce protocol.

use ipnet::IpNet;

use crate::PrefixStatus;

/// Encoded size of one record.
pub const MESSAGE_SIZE: usize = 19;

const IP_VERSION_4: u8 = 0x04;
const IP_VERSION_6: u8 = 0x06;

const STATUS_ENABLE: u8 = 0x01;
const STATUS_DISABLE: u8 = 0x00;

/// One fixed-layout record sent to the BIRD daemon:
///
/// ```text
/// +--------+-----------------+------------+--------+
/// | ip_ver |  ip_addr (16B)  | prefix_len | status |
/// +--------+-----------------+------------+--------+
/// ```
///
/// The address occupies the leading octets and is right-padded with zeros
/// to 16 bytes for IPv4. Records are concatenated into datagrams without
/// any separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    ip_version: u8,
    ip_addr: [u8; 16],
    prefix_len: u8,
    status: u8,
}

impl Message {
    /// Builds a record for the given prefix and status.
    pub fn new(prefix: IpNet, status: PrefixStatus) -> Self {
        let mut ip_addr = [0u8; 16];
        let ip_version = match prefix {
            IpNet::V4(net) => {
                ip_addr[..4].copy_from_slice(&net.addr().octets());
                IP_VERSION_4
            }
            IpNet::V6(net) => {
                ip_addr.copy_from_slice(&net.addr().octets());
                IP_VERSION_6
            }
        };

        Message {
            ip_version,
            ip_addr,
            prefix_len: prefix.prefix_len(),
            status: match status {
                PrefixStatus::Ready => STATUS_ENABLE,
                PrefixStatus::Unready => STATUS_DISABLE,
            },
        }
    }

    /// Appends the record's wire form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.ip_version);
        buf.extend_from_slice(&self.ip_addr);
        buf.push(self.prefix_len);
        buf.push(self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ipv4() {
        let prefix: IpNet = "192.0.2.1/32".parse().unwrap();
        let mut buf = Vec::new();
        Message::new(prefix, PrefixStatus::Ready).encode(&mut buf);

        assert_eq!(buf.len(), MESSAGE_SIZE);
        assert_eq!(buf[0], IP_VERSION_4);
        assert_eq!(&buf[1..5], &[192, 0, 2, 1]);
        assert!(buf[5..17].iter().all(|&b| b == 0));
        assert_eq!(buf[17], 32);
        assert_eq!(buf[18], STATUS_ENABLE);
    }

    #[test]
    fn test_encode_ipv6() {
        let prefix: IpNet = "2001:db8::1/128".parse().unwrap();
        let mut buf = Vec::new();
        Message::new(prefix, PrefixStatus::Unready).encode(&mut buf);

        assert_eq!(buf.len(), MESSAGE_SIZE);
        assert_eq!(buf[0], IP_VERSION_6);
        assert_eq!(&buf[1..3], &[0x20, 0x01]);
        assert_eq!(buf[16], 1);
        assert_eq!(buf[17], 128);
        assert_eq!(buf[18], STATUS_DISABLE);
    }

    #[test]
    fn test_records_concatenate() {
        let mut buf = Vec::new();
        Message::new("10.0.0.1/32".parse().unwrap(), PrefixStatus::Ready).encode(&mut buf);
        Message::new("10.0.0.2/32".parse().unwrap(), PrefixStatus::Ready).encode(&mut buf);
        assert_eq!(buf.len(), 2 * MESSAGE_SIZE);
    }
}
