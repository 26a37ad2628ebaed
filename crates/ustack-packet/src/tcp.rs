use core::net::IpAddr;

use super::{checksum, ensure_len, PacketError, IPPROTO_TCP};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x0001);
    pub const SYN: TcpFlags = TcpFlags(0x0002);
    pub const RST: TcpFlags = TcpFlags(0x0004);
    pub const PSH: TcpFlags = TcpFlags(0x0008);
    pub const ACK: TcpFlags = TcpFlags(0x0010);
    pub const URG: TcpFlags = TcpFlags(0x0020);
    pub const ECE: TcpFlags = TcpFlags(0x0040);
    pub const CWR: TcpFlags = TcpFlags(0x0080);
    pub const NS: TcpFlags = TcpFlags(0x0100);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: TcpFlags) {
        self.0 |= rhs.0;
    }
}

pub const TCP_OPTION_END: u8 = 0;
pub const TCP_OPTION_NOP: u8 = 1;
pub const TCP_OPTION_MSS: u8 = 2;
pub const TCP_OPTION_WINDOW_SCALE: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    /// Shift count, the effective multiplier is `1 << shift`.
    WindowScale(u8),
    Raw { kind: u8, data: Vec<u8> },
}

impl TcpOption {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::Mss(mss) => {
                out.extend_from_slice(&[TCP_OPTION_MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.extend_from_slice(&[TCP_OPTION_NOP, TCP_OPTION_WINDOW_SCALE, 3, *shift]);
            }
            TcpOption::Raw { kind, data } => {
                out.push(*kind);
                out.push((data.len() + 2) as u8);
                out.extend_from_slice(data);
            }
        }
    }
}

/// A TCP segment with owned options and payload.
///
/// Sequence and acknowledgement numbers are the raw 32-bit wire values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpPacket {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    pub const MIN_HEADER_LEN: usize = 20;

    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            ..Self::default()
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;

        let ns = (data[12] & 0x01) as u16;
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags((ns << 8) | data[13] as u16),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            options: parse_options(&data[Self::MIN_HEADER_LEN..header_len])?,
            payload: data[header_len..].to_vec(),
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn is_psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            TcpOption::Mss(mss) => Some(*mss),
            _ => None,
        })
    }

    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|opt| match opt {
            TcpOption::WindowScale(shift) => Some(*shift),
            _ => None,
        })
    }

    fn encode_options(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for opt in &self.options {
            opt.encode_into(&mut out);
        }
        while out.len() % 4 != 0 {
            out.push(TCP_OPTION_END);
        }
        out
    }

    pub fn header_len(&self) -> Result<usize, PacketError> {
        let header_len = Self::MIN_HEADER_LEN + self.encode_options().len();
        if header_len / 4 > 0x0f {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(header_len)
    }

    pub fn len(&self) -> Result<usize, PacketError> {
        Ok(self.header_len()? + self.payload.len())
    }

    /// Serializes the segment, computing the checksum over the `src`/`dst` pseudo header.
    pub fn serialize(&self, src: IpAddr, dst: IpAddr) -> Result<Vec<u8>, PacketError> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(PacketError::AddressFamilyMismatch);
        }
        let options = self.encode_options();
        let header_len = Self::MIN_HEADER_LEN + options.len();
        if header_len / 4 > 0x0f {
            return Err(PacketError::Malformed("TCP header too large"));
        }

        let mut out = vec![0u8; header_len];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        let ns = if self.flags.contains(TcpFlags::NS) { 1u8 } else { 0u8 };
        out[12] = (((header_len / 4) as u8) << 4) | ns;
        out[13] = (self.flags.0 & 0xff) as u8;
        out[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[20..header_len].copy_from_slice(&options);
        out.extend_from_slice(&self.payload);

        // TCP has no "checksum disabled" sentinel; a computed 0x0000 is written as-is.
        let csum = checksum::transport_checksum(src, dst, IPPROTO_TCP, &out);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(out)
    }
}

fn parse_options(mut raw: &[u8]) -> Result<Vec<TcpOption>, PacketError> {
    let mut options = Vec::new();
    while let Some(&kind) = raw.first() {
        match kind {
            TCP_OPTION_END => break,
            TCP_OPTION_NOP => {
                raw = &raw[1..];
                continue;
            }
            _ => {}
        }
        let len = *raw
            .get(1)
            .ok_or(PacketError::Malformed("TCP option without length"))? as usize;
        if len < 2 || len > raw.len() {
            return Err(PacketError::Malformed("TCP option length out of range"));
        }
        let data = &raw[2..len];
        let opt = match (kind, data.len()) {
            (TCP_OPTION_MSS, 2) => TcpOption::Mss(u16::from_be_bytes([data[0], data[1]])),
            (TCP_OPTION_WINDOW_SCALE, 1) => TcpOption::WindowScale(data[0]),
            _ => TcpOption::Raw {
                kind,
                data: data.to_vec(),
            },
        };
        options.push(opt);
        raw = &raw[len..];
    }
    Ok(options)
}
