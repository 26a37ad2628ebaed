#![forbid(unsafe_code)]

//! Owned IPv4/IPv6/TCP packet model used by the `ustack` TCP engine.
//!
//! The engine never touches raw frames: host glue parses bytes into [`IpPacket`] values,
//! hands them to the engine, and serializes whatever packets come back. All multi-byte fields
//! are big-endian on the wire. Checksums are computed on [`IpPacket::serialize`], never stored.

pub mod checksum;
pub mod ip;
pub mod tcp;

pub use ip::{IpPacket, Ipv4Packet, Ipv6Packet, IPPROTO_TCP};
pub use tcp::{TcpFlags, TcpOption, TcpPacket};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("truncated packet: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    #[error("source and destination addresses belong to different families")]
    AddressFamilyMismatch,
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}
