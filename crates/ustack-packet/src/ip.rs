use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::checksum::ipv4_header_checksum;
use super::{ensure_len, PacketError, TcpPacket};

pub const IPPROTO_TCP: u8 = 6;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub identification: u16,
    pub tcp: TcpPacket,
}

impl Ipv4Packet {
    pub const HEADER_LEN: usize = 20;

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(buf, Self::HEADER_LEN)?;
        let version = buf[0] >> 4;
        let ihl = (buf[0] & 0x0f) as usize;
        if version != 4 || ihl < 5 {
            return Err(PacketError::Malformed("invalid IPv4 header"));
        }
        let header_len = ihl * 4;
        ensure_len(buf, header_len)?;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(buf, total_len)?;

        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);
        // MF set or a non-zero offset: fragments are not reassembled here.
        if flags_fragment & 0x3fff != 0 {
            return Err(PacketError::Unsupported("fragmented IPv4 packet"));
        }
        if buf[9] != IPPROTO_TCP {
            return Err(PacketError::Unsupported("non-TCP IPv4 payload"));
        }

        Ok(Self {
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            ttl: buf[8],
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            tcp: TcpPacket::parse(&buf[header_len..total_len])?,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let segment = self
            .tcp
            .serialize(IpAddr::V4(self.src), IpAddr::V4(self.dst))?;
        let total_len = Self::HEADER_LEN + segment.len();
        if total_len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 packet too large"));
        }
        let mut out = vec![0u8; Self::HEADER_LEN];
        out[0] = (4u8 << 4) | 5; // version + IHL
        out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
        out[8] = self.ttl;
        out[9] = IPPROTO_TCP;
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let csum = ipv4_header_checksum(&out);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out.extend_from_slice(&segment);
        Ok(out)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub hop_limit: u8,
    pub tcp: TcpPacket,
}

impl Ipv6Packet {
    pub const HEADER_LEN: usize = 40;

    /// Parses a fixed IPv6 header directly followed by TCP. Extension headers are not walked.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(buf, Self::HEADER_LEN)?;
        if buf[0] >> 4 != 6 {
            return Err(PacketError::Malformed("invalid IPv6 header"));
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        ensure_len(buf, Self::HEADER_LEN + payload_len)?;
        if buf[6] != IPPROTO_TCP {
            return Err(PacketError::Unsupported("IPv6 next header is not TCP"));
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&buf[24..40]);
        Ok(Self {
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
            hop_limit: buf[7],
            tcp: TcpPacket::parse(&buf[Self::HEADER_LEN..Self::HEADER_LEN + payload_len])?,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let segment = self
            .tcp
            .serialize(IpAddr::V6(self.src), IpAddr::V6(self.dst))?;
        if segment.len() > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv6 payload too large"));
        }
        let mut out = vec![0u8; Self::HEADER_LEN];
        out[0] = 6u8 << 4;
        out[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
        out[6] = IPPROTO_TCP;
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src.octets());
        out[24..40].copy_from_slice(&self.dst.octets());
        out.extend_from_slice(&segment);
        Ok(out)
    }
}

/// An IP packet carrying a TCP segment, as seen and produced by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpPacket {
    V4(Ipv4Packet),
    V6(Ipv6Packet),
}

impl IpPacket {
    pub fn new(src: IpAddr, dst: IpAddr, hop_limit: u8, tcp: TcpPacket) -> Result<Self, PacketError> {
        match (src, dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Ok(IpPacket::V4(Ipv4Packet {
                src,
                dst,
                ttl: hop_limit,
                identification: 0,
                tcp,
            })),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Ok(IpPacket::V6(Ipv6Packet {
                src,
                dst,
                hop_limit,
                tcp,
            })),
            _ => Err(PacketError::AddressFamilyMismatch),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 1)?;
        match buf[0] >> 4 {
            4 => Ipv4Packet::parse(buf).map(IpPacket::V4),
            6 => Ipv6Packet::parse(buf).map(IpPacket::V6),
            _ => Err(PacketError::Malformed("unknown IP version")),
        }
    }

    pub fn src(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => IpAddr::V4(p.src),
            IpPacket::V6(p) => IpAddr::V6(p.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpPacket::V4(p) => IpAddr::V4(p.dst),
            IpPacket::V6(p) => IpAddr::V6(p.dst),
        }
    }

    pub fn src_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.src(), self.tcp().src_port)
    }

    pub fn dst_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.dst(), self.tcp().dst_port)
    }

    pub fn hop_limit(&self) -> u8 {
        match self {
            IpPacket::V4(p) => p.ttl,
            IpPacket::V6(p) => p.hop_limit,
        }
    }

    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        match self {
            IpPacket::V4(p) => p.ttl = hop_limit,
            IpPacket::V6(p) => p.hop_limit = hop_limit,
        }
    }

    pub fn tcp(&self) -> &TcpPacket {
        match self {
            IpPacket::V4(p) => &p.tcp,
            IpPacket::V6(p) => &p.tcp,
        }
    }

    pub fn tcp_mut(&mut self) -> &mut TcpPacket {
        match self {
            IpPacket::V4(p) => &mut p.tcp,
            IpPacket::V6(p) => &mut p.tcp,
        }
    }

    pub fn into_tcp(self) -> TcpPacket {
        match self {
            IpPacket::V4(p) => p.tcp,
            IpPacket::V6(p) => p.tcp,
        }
    }

    /// Rewrites the source address and port. The family must match the packet's.
    pub fn set_src(&mut self, endpoint: SocketAddr) -> Result<(), PacketError> {
        match (self, endpoint.ip()) {
            (IpPacket::V4(p), IpAddr::V4(ip)) => {
                p.src = ip;
                p.tcp.src_port = endpoint.port();
            }
            (IpPacket::V6(p), IpAddr::V6(ip)) => {
                p.src = ip;
                p.tcp.src_port = endpoint.port();
            }
            _ => return Err(PacketError::AddressFamilyMismatch),
        }
        Ok(())
    }

    /// Rewrites the destination address and port. The family must match the packet's.
    pub fn set_dst(&mut self, endpoint: SocketAddr) -> Result<(), PacketError> {
        match (self, endpoint.ip()) {
            (IpPacket::V4(p), IpAddr::V4(ip)) => {
                p.dst = ip;
                p.tcp.dst_port = endpoint.port();
            }
            (IpPacket::V6(p), IpAddr::V6(ip)) => {
                p.dst = ip;
                p.tcp.dst_port = endpoint.port();
            }
            _ => return Err(PacketError::AddressFamilyMismatch),
        }
        Ok(())
    }

    pub fn swap_src_dst(&mut self) {
        match self {
            IpPacket::V4(p) => core::mem::swap(&mut p.src, &mut p.dst),
            IpPacket::V6(p) => core::mem::swap(&mut p.src, &mut p.dst),
        }
        let tcp = self.tcp_mut();
        core::mem::swap(&mut tcp.src_port, &mut tcp.dst_port);
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        match self {
            IpPacket::V4(p) => p.serialize(),
            IpPacket::V6(p) => p.serialize(),
        }
    }
}
