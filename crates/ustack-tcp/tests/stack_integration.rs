use ustack_packet::{IpPacket, TcpFlags, TcpOption, TcpPacket};
use ustack_tcp::{
    Action, Endpoint, StackConfig, TcpError, TcpStack, TcpState, TcpTimeout, Tuple, RMEM_MAX,
};

const SERVER: &str = "10.0.0.1:80";
const CLIENT: &str = "10.0.0.2:5000";
const CLIENT_ISN: u32 = 1000;

fn new_stack(cfg: StackConfig) -> TcpStack {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    TcpStack::new(cfg)
}

fn ep(s: &str) -> Endpoint {
    s.parse().unwrap()
}

fn segment(from: Endpoint, to: Endpoint, flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> IpPacket {
    let mut tcp = TcpPacket::new(from.port(), to.port());
    tcp.flags = flags;
    tcp.seq_number = seq;
    tcp.ack_number = ack;
    tcp.window_size = 65535;
    tcp.payload = payload.to_vec();
    IpPacket::new(from.ip(), to.ip(), 64, tcp).unwrap()
}

fn from_client(flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> IpPacket {
    segment(ep(CLIENT), ep(SERVER), flags, seq, ack, payload)
}

fn syn(port: u16) -> IpPacket {
    let mut ip = segment(
        Endpoint::new(ep(CLIENT).ip(), port),
        ep(SERVER),
        TcpFlags::SYN,
        CLIENT_ISN,
        0,
        &[],
    );
    ip.tcp_mut().options.push(TcpOption::Mss(1000));
    ip
}

fn emitted(actions: &[Action]) -> Vec<&TcpPacket> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Emit(ip) => Some(ip.tcp()),
            _ => None,
        })
        .collect()
}

struct Conn {
    stack: TcpStack,
    tuple: Tuple,
    /// Next sequence number the server will send.
    server_seq: u32,
}

fn handshake(stack: &mut TcpStack) -> (Tuple, u32) {
    let out = stack.handle_packet(syn(ep(CLIENT).port()), 0);
    let syn_ack = emitted(&out)[0].clone();
    assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(syn_ack.ack_number, CLIENT_ISN + 1);
    let isn = syn_ack.seq_number;

    let out = stack.handle_packet(from_client(TcpFlags::ACK, CLIENT_ISN + 1, isn + 1, &[]), 1);
    assert_eq!(out, vec![Action::ListenReadable { listening: ep(SERVER) }]);
    (Tuple::new(ep(CLIENT), ep(SERVER)), isn + 1)
}

fn established() -> Conn {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    let (tuple, server_seq) = handshake(&mut stack);
    assert_eq!(stack.accept(ep(SERVER), 7), Some(tuple));
    Conn {
        stack,
        tuple,
        server_seq,
    }
}

#[test]
fn handshake_negotiates_options() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep("0.0.0.0:80"));
    let out = stack.handle_packet(syn(5000), 0);
    let syn_ack = emitted(&out)[0];
    assert_eq!(syn_ack.window_size, 65535);
    assert_eq!(syn_ack.mss(), Some(1360));
    assert_eq!(syn_ack.window_scale(), Some(6));

    let tuple = Tuple::new(ep(CLIENT), ep(SERVER));
    let entry = stack.entry(tuple).unwrap();
    assert_eq!(entry.state(), TcpState::SynReceived);
    assert_eq!(entry.sending.mss(), 1000);
    assert_eq!(entry.receiving.expecting_seq(), u64::from(CLIENT_ISN) + 1);
}

#[test]
fn accept_hands_out_completed_connections() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    assert_eq!(stack.accept(ep(SERVER), 1), None);
    let (tuple, _) = handshake(&mut stack);
    assert_eq!(stack.entry(tuple).unwrap().state(), TcpState::Established);
    assert_eq!(stack.accept(ep(SERVER), 1), Some(tuple));
    assert_eq!(stack.accept(ep(SERVER), 1), None);
}

#[test]
fn retransmitted_syn_gets_the_same_syn_ack() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    let first = stack.handle_packet(syn(5000), 0);
    let again = stack.handle_packet(syn(5000), 100);
    assert_eq!(emitted(&first), emitted(&again));
}

#[test]
fn data_is_acked_after_the_application_reads_it() {
    let Conn { mut stack, tuple, server_seq } = established();
    let out = stack.handle_packet(
        from_client(TcpFlags::PSH | TcpFlags::ACK, CLIENT_ISN + 1, server_seq, b"hello"),
        10,
    );
    assert_eq!(out, vec![Action::Readable { tuple }]);
    assert_eq!(stack.next_deadline(), Some(30));

    let out = stack.poll_timers(30);
    assert_eq!(emitted(&out)[0].ack_number, CLIENT_ISN + 1);

    let (data, out) = stack.read(tuple, 100, 40).unwrap();
    assert_eq!(data, b"hello");
    assert!(out.is_empty());
    let out = stack.poll_timers(60);
    let ack = emitted(&out)[0];
    assert_eq!(ack.ack_number, CLIENT_ISN + 6);
    assert_eq!(ack.seq_number, server_seq);
    assert!(stack.next_deadline().is_none());
}

#[test]
fn write_is_sent_and_acked() {
    let Conn { mut stack, tuple, server_seq } = established();
    let (wrote, out) = stack.write(tuple, b"world", 10).unwrap();
    assert_eq!(wrote, 5);
    let sent = emitted(&out)[0];
    assert_eq!(sent.flags, TcpFlags::PSH | TcpFlags::ACK);
    assert_eq!(sent.seq_number, server_seq);
    assert_eq!(sent.payload, b"world");

    let out = stack.handle_packet(from_client(TcpFlags::ACK, CLIENT_ISN + 1, server_seq + 5, &[]), 20);
    assert_eq!(out, vec![Action::Writable { tuple }]);
    assert!(stack.next_deadline().is_none());
    assert_eq!(stack.entry(tuple).unwrap().sending.current_size(), 0);
}

#[test]
fn retransmission_backs_off() {
    let Conn { mut stack, tuple, server_seq } = established();
    stack.write(tuple, b"lost", 0).unwrap();
    assert_eq!(stack.next_deadline(), Some(200));

    let out = stack.poll_timers(200);
    assert_eq!(emitted(&out)[0].seq_number, server_seq);
    assert_eq!(stack.next_deadline(), Some(600));

    let out = stack.poll_timers(600);
    assert_eq!(emitted(&out)[0].payload, b"lost");
    assert_eq!(stack.next_deadline(), Some(1400));
}

fn with_window(mut ip: IpPacket, window: u16) -> IpPacket {
    ip.tcp_mut().window_size = window;
    ip
}

#[test]
fn partial_ack_sends_only_new_data() {
    let Conn { mut stack, tuple, server_seq } = established();
    let update = with_window(from_client(TcpFlags::ACK, CLIENT_ISN + 1, server_seq, &[]), 9000);
    let out = stack.handle_packet(update, 5);
    assert!(out.is_empty());

    let (wrote, out) = stack.write(tuple, &[0x5a; 10_000], 10).unwrap();
    assert_eq!(wrote, 10_000);
    let flight = emitted(&out);
    assert_eq!(flight.len(), 9);
    assert!(flight.iter().all(|tcp| tcp.payload.len() == 1000));
    assert_eq!(flight[8].seq_number, server_seq + 8000);

    let ack = with_window(from_client(TcpFlags::ACK, CLIENT_ISN + 1, server_seq + 1000, &[]), 9000);
    let out = stack.handle_packet(ack, 20);
    let sent = emitted(&out);
    assert_eq!(sent.len(), 1, "only the byte range opened by the ACK goes out");
    assert_eq!(sent[0].seq_number, server_seq + 9000);
    assert_eq!(sent[0].payload.len(), 1000);
    assert!(out.contains(&Action::Writable { tuple }));
    assert_eq!(stack.next_deadline(), Some(220));

    // The retransmission timeout still resends everything unacknowledged.
    let out = stack.poll_timers(220);
    let resent = emitted(&out);
    assert_eq!(resent.len(), 9);
    assert_eq!(resent[0].seq_number, server_seq + 1000);
    assert_eq!(stack.next_deadline(), Some(620));
}

#[test]
fn write_while_in_flight_sends_only_the_new_bytes() {
    let Conn { mut stack, tuple, server_seq } = established();
    stack.write(tuple, b"first", 0).unwrap();
    let (_, out) = stack.write(tuple, b"second", 50).unwrap();
    let sent = emitted(&out);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq_number, server_seq + 5);
    assert_eq!(sent[0].payload, b"second");
    assert_eq!(stack.next_deadline(), Some(200));
}

#[test]
fn data_beyond_receive_buffer_is_clamped() {
    let Conn { mut stack, tuple, server_seq } = established();
    let chunk = vec![0x42; 60_000];
    let outs: Vec<Vec<Action>> = (0..4u32)
        .map(|i| {
            let seq = CLIENT_ISN + 1 + i * chunk.len() as u32;
            stack.handle_packet(from_client(TcpFlags::ACK, seq, server_seq, &chunk), 10)
        })
        .collect();
    let entry = stack.entry(tuple).unwrap();
    assert_eq!(entry.receiving.current_size(), RMEM_MAX);
    assert_eq!(entry.receiving.window(), 0);
    let stored_end = CLIENT_ISN + 1 + RMEM_MAX as u32;
    assert_eq!(entry.receiving.expecting_seq(), u64::from(stored_end));

    // A closed window is announced right away.
    let ack = emitted(&outs[3])[0];
    assert_eq!(ack.window_size, 0);

    // The peer resending the cut off tail is refused while nothing has been read.
    stack.handle_packet(from_client(TcpFlags::ACK, stored_end, server_seq, &chunk), 20);
    assert_eq!(stack.entry(tuple).unwrap().receiving.current_size(), RMEM_MAX);
}

#[test]
fn passive_close() {
    let Conn { mut stack, tuple, server_seq } = established();
    let out = stack.handle_packet(from_client(TcpFlags::FIN | TcpFlags::ACK, CLIENT_ISN + 1, server_seq, &[]), 10);
    assert_eq!(out, vec![Action::Readable { tuple }]);
    assert_eq!(stack.entry(tuple).unwrap().state(), TcpState::CloseWait);
    let out = stack.poll_timers(30);
    assert_eq!(emitted(&out)[0].ack_number, CLIENT_ISN + 2);

    let out = stack.close(tuple, 40).unwrap();
    let fin = emitted(&out)[0];
    assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin.seq_number, server_seq);
    assert_eq!(stack.entry(tuple).unwrap().state(), TcpState::LastAck);

    let out = stack.handle_packet(from_client(TcpFlags::ACK, CLIENT_ISN + 2, server_seq + 1, &[]), 50);
    assert_eq!(out, vec![Action::Destroyed { tuple }]);
    assert!(stack.entry(tuple).is_none());
    assert!(stack.next_deadline().is_none());
}

#[test]
fn active_close() {
    let Conn { mut stack, tuple, server_seq } = established();
    let out = stack.close(tuple, 10).unwrap();
    assert!(emitted(&out)[0].is_fin());
    assert_eq!(stack.entry(tuple).unwrap().state(), TcpState::FinWait1);

    stack.handle_packet(from_client(TcpFlags::ACK, CLIENT_ISN + 1, server_seq + 1, &[]), 20);
    assert_eq!(stack.entry(tuple).unwrap().state(), TcpState::FinWait2);

    let out = stack.handle_packet(
        from_client(TcpFlags::FIN | TcpFlags::ACK, CLIENT_ISN + 1, server_seq + 1, &[]),
        30,
    );
    let rst = emitted(&out)[0];
    assert!(rst.is_rst());
    assert_eq!(rst.ack_number, CLIENT_ISN + 2);
    assert!(out.contains(&Action::Readable { tuple }));
    assert!(out.contains(&Action::Destroyed { tuple }));
    assert!(stack.entry(tuple).is_none());
}

#[test]
fn close_in_wrong_state_is_rejected() {
    let Conn { mut stack, tuple, .. } = established();
    stack.close(tuple, 0).unwrap();
    assert_eq!(
        stack.close(tuple, 0),
        Err(TcpError::InvalidState {
            tuple,
            state: TcpState::FinWait1
        })
    );
}

#[test]
fn peer_reset_destroys_connection() {
    let Conn { mut stack, tuple, server_seq } = established();
    let out = stack.handle_packet(from_client(TcpFlags::RST, CLIENT_ISN + 5, server_seq, &[]), 10);
    assert!(out.is_empty(), "out of window RST is ignored");
    let out = stack.handle_packet(from_client(TcpFlags::RST, CLIENT_ISN + 1, server_seq, &[]), 10);
    assert_eq!(out, vec![Action::Destroyed { tuple }]);
    assert_eq!(stack.conntrack().count_tcp_entries(), 0);
}

#[test]
fn close_when_flushed_without_data_resets() {
    let Conn { mut stack, tuple, .. } = established();
    let out = stack.close_when_flushed(tuple, 0).unwrap();
    assert!(emitted(&out)[0].is_rst());
    assert!(out.contains(&Action::Destroyed { tuple }));
}

#[test]
fn close_when_flushed_waits_for_ack() {
    let Conn { mut stack, tuple, server_seq } = established();
    stack.write(tuple, b"bye", 0).unwrap();
    let out = stack.close_when_flushed(tuple, 1).unwrap();
    assert!(out.is_empty());
    let out = stack.handle_packet(from_client(TcpFlags::ACK, CLIENT_ISN + 1, server_seq + 3, &[]), 5);
    assert!(emitted(&out).iter().any(|tcp| tcp.is_rst()));
    assert!(out.contains(&Action::Destroyed { tuple }));
}

#[test]
fn abort_resets() {
    let Conn { mut stack, tuple, .. } = established();
    let out = stack.abort(tuple).unwrap();
    assert!(emitted(&out)[0].is_rst());
    assert_eq!(stack.abort(tuple), Err(TcpError::NoSuchConnection(tuple)));
}

#[test]
fn api_requires_accepted_connection() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    let (tuple, _) = handshake(&mut stack);
    assert_eq!(stack.write(tuple, b"x", 0), Err(TcpError::NotAccepted(tuple)));
    let other = Tuple::new(ep("10.0.0.3:1"), ep(SERVER));
    assert_eq!(stack.read(other, 1, 0), Err(TcpError::NoSuchConnection(other)));
}

#[test]
fn syn_backlog_overflow_drops_syn() {
    let cfg = StackConfig {
        max_syn_backlog: 1,
        ..StackConfig::default()
    };
    let mut stack = new_stack(cfg);
    stack.listen(ep(SERVER));
    assert_eq!(emitted(&stack.handle_packet(syn(5000), 0)).len(), 1);
    assert!(stack.handle_packet(syn(5001), 0).is_empty());
    assert_eq!(stack.conntrack().count_tcp_entries(), 1);
}

#[test]
fn unfinished_handshake_is_reaped() {
    let cfg = StackConfig {
        max_syn_backlog: 1,
        tcp_timeout: TcpTimeout {
            syn_recv: 2,
            ..TcpTimeout::default()
        },
        ..StackConfig::default()
    };
    let mut stack = new_stack(cfg);
    stack.listen(ep(SERVER));
    stack.handle_packet(syn(5000), 0);
    assert!(stack.handle_packet(syn(5001), 0).is_empty());
    assert_eq!(stack.next_deadline(), Some(2_000));

    assert!(stack.poll_timers(2_000).is_empty());
    assert_eq!(stack.conntrack().count_tcp_entries(), 0);
    assert!(emitted(&stack.handle_packet(syn(5001), 2_001))[0].is_syn());
}

#[test]
fn completed_handshake_stops_the_handshake_timer() {
    let Conn { stack, .. } = established();
    assert!(stack.next_deadline().is_none());
}

#[test]
fn only_a_bare_syn_opens_a_connection() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    for flags in [TcpFlags::SYN | TcpFlags::FIN, TcpFlags::SYN | TcpFlags::PSH] {
        let out = stack.handle_packet(from_client(flags, CLIENT_ISN, 0, &[]), 0);
        assert!(emitted(&out)[0].is_rst());
        assert_eq!(stack.conntrack().count_tcp_entries(), 0);
    }
}

#[test]
fn unknown_tuple_is_reset() {
    let mut stack = new_stack(StackConfig::default());
    let out = stack.handle_packet(from_client(TcpFlags::ACK, 77, 99, &[]), 0);
    let rst = emitted(&out)[0];
    assert!(rst.is_rst());
    assert_eq!((rst.seq_number, rst.ack_number), (99, 77));
    assert_eq!((rst.src_port, rst.dst_port), (80, 5000));

    assert!(stack.handle_packet(from_client(TcpFlags::RST, 1, 0, &[]), 0).is_empty());
    assert_eq!(stack.conntrack().count_tcp_entries(), 0);
}

#[test]
fn unlisten_resets_pending_connections() {
    let mut stack = new_stack(StackConfig::default());
    stack.listen(ep(SERVER));
    stack.handle_packet(syn(5000), 0);
    let out = stack.unlisten(ep(SERVER));
    assert!(emitted(&out)[0].is_rst());
    assert_eq!(stack.conntrack().count_tcp_entries(), 0);
    assert!(!emitted(&stack.handle_packet(syn(5000), 0))[0].is_syn());
}

#[test]
fn shutdown_destroys_accepted_connections() {
    let Conn { mut stack, tuple, .. } = established();
    let out = stack.shutdown();
    assert_eq!(out, vec![Action::Destroyed { tuple }]);
    assert!(stack.next_deadline().is_none());
}
