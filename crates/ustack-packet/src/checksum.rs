//! Internet checksum helpers (RFC 1071) with IPv4/IPv6 pseudo headers.

use core::net::IpAddr;

fn sum_u16_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&last) = chunks.remainder().first() {
        sum += (last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_u16_words(data, 0))
}

/// Checksum of an IPv4 header whose checksum field is zeroed.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// Transport checksum over the pseudo header of `src`/`dst` plus `segment`.
///
/// Returns 0 when `segment` already carries a correct checksum. Mixed address families are
/// summed as-is; callers are expected to reject them earlier.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = sum_u16_words(&src.octets(), sum);
            sum = sum_u16_words(&dst.octets(), sum);
            sum += protocol as u32;
            sum += segment.len() as u32;
        }
        _ => {
            sum = sum_u16_words(&ipv6_octets(src), sum);
            sum = sum_u16_words(&ipv6_octets(dst), sum);
            let len = segment.len() as u32;
            sum += len >> 16;
            sum += len & 0xffff;
            sum += protocol as u32;
        }
    }
    sum = sum_u16_words(segment, sum);
    fold(sum)
}

fn ipv6_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
