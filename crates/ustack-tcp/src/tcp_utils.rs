//! Builders for the packets a locally terminated connection sends.

use ustack_packet::{IpPacket, PacketError, TcpFlags, TcpOption, TcpPacket};

use crate::entry::TcpEntry;
use crate::seq;

pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Header shared by every response: ports from the tuple, SEQ/ACK/window from the queues.
pub fn build_common_tcp_response(entry: &TcpEntry) -> TcpPacket {
    let mut tcp = TcpPacket::new(entry.local.port(), entry.remote.port());
    tcp.seq_number = seq::to_wire(entry.sending.fetch_seq());
    tcp.ack_number = seq::to_wire(entry.receiving.acked_seq());
    tcp.flags = TcpFlags::ACK;
    let window = entry.receiving.window() / entry.receiving.window_scale();
    tcp.window_size = window.min(u16::MAX as usize) as u16;
    tcp
}

pub fn build_ack_response(entry: &TcpEntry) -> TcpPacket {
    build_common_tcp_response(entry)
}

pub fn build_rst_response(entry: &TcpEntry) -> TcpPacket {
    let mut tcp = build_common_tcp_response(entry);
    tcp.flags = TcpFlags::RST | TcpFlags::ACK;
    tcp.window_size = 0;
    tcp
}

/// SYN-ACK advertising `rcv_mss` and our receive window scale.
///
/// Must be built before the sending queue accounts for the SYN, so SEQ is the ISN.
pub fn build_syn_ack(entry: &TcpEntry, rcv_mss: u16) -> TcpPacket {
    let mut tcp = build_common_tcp_response(entry);
    tcp.flags = TcpFlags::SYN | TcpFlags::ACK;
    tcp.window_size = u16::MAX;
    tcp.options.push(TcpOption::Mss(rcv_mss));
    let shift = entry.receiving.window_scale().trailing_zeros() as u8;
    if shift != 0 {
        tcp.options.push(TcpOption::WindowScale(shift));
    }
    tcp
}

/// RST answering `ip` when no connection state exists: SEQ is its ACK, ACK is its SEQ.
pub fn build_rst_for(ip: &IpPacket) -> IpPacket {
    let input = ip.tcp();
    let mut tcp = TcpPacket::new(input.dst_port, input.src_port);
    tcp.seq_number = input.ack_number;
    tcp.ack_number = input.seq_number;
    tcp.flags = TcpFlags::RST;
    tcp.window_size = 0;

    let mut out = ip.clone();
    out.swap_src_dst();
    out.set_hop_limit(DEFAULT_HOP_LIMIT);
    *out.tcp_mut() = tcp;
    out
}

/// Wraps `tcp` in an IP header from the entry's local endpoint to its remote endpoint.
pub fn build_ip_response(entry: &TcpEntry, tcp: TcpPacket) -> Result<IpPacket, PacketError> {
    IpPacket::new(entry.local.ip(), entry.remote.ip(), DEFAULT_HOP_LIMIT, tcp)
}
