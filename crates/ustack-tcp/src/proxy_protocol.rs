//! HAProxy PROXY protocol v2 header (binary form, `PROXY` command, TCP over IPv4/IPv6).

use core::net::{IpAddr, Ipv6Addr};

pub const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];
/// Version 2, command PROXY.
const V2_CMD_PROXY: u8 = 0x21;
const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;

const V2_PREFIX_LEN: usize = V2_SIGNATURE.len() + 1;
const V4_ADDR_BLOCK_LEN: u16 = 12;
const V6_ADDR_BLOCK_LEN: u16 = 36;

/// Describes the original client connection of a translated flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProtocolHelper {
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    /// The header has been sent to the backend.
    pub sent: bool,
}

impl ProxyProtocolHelper {
    /// Mixed families are reconciled towards the family of `src_ip` when the other side is
    /// a mapped address, and towards IPv6 otherwise.
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16) -> Self {
        let (src_ip, dst_ip) = match (src_ip, dst_ip) {
            (IpAddr::V4(src), IpAddr::V6(dst)) => match dst.to_ipv4_mapped() {
                Some(dst) => (IpAddr::V4(src), IpAddr::V4(dst)),
                None => (IpAddr::V6(src.to_ipv6_mapped()), IpAddr::V6(dst)),
            },
            (IpAddr::V6(src), IpAddr::V4(dst)) => (IpAddr::V6(src), IpAddr::V6(dst.to_ipv6_mapped())),
            same => same,
        };
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            sent: false,
        }
    }

    pub fn v2_header_len(&self) -> usize {
        let block = match self.src_ip {
            IpAddr::V4(_) => V4_ADDR_BLOCK_LEN,
            IpAddr::V6(_) => V6_ADDR_BLOCK_LEN,
        };
        V2_PREFIX_LEN + 3 + block as usize
    }

    pub fn build_v2_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.v2_header_len());
        out.extend_from_slice(&V2_SIGNATURE);
        out.push(V2_CMD_PROXY);
        match (self.src_ip, self.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                out.push(AF_INET_STREAM);
                out.extend_from_slice(&V4_ADDR_BLOCK_LEN.to_be_bytes());
                out.extend_from_slice(&src.octets());
                out.extend_from_slice(&dst.octets());
            }
            (src, dst) => {
                out.push(AF_INET6_STREAM);
                out.extend_from_slice(&V6_ADDR_BLOCK_LEN.to_be_bytes());
                out.extend_from_slice(&v6(src).octets());
                out.extend_from_slice(&v6(dst).octets());
            }
        }
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out
    }
}

fn v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
