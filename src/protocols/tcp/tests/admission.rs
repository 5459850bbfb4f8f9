// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Admission gates, per-port statistics, and backlog behavior. Per-port limits
// are driven by environment variables; every test here uses its own port so
// parallel test threads never observe each other's environment.

//==============================================================================
// Imports
//==============================================================================

use crate::protocols::tcp::{
    listener::Listener,
    tests::setup::{
        ack_header,
        gather_all,
        inject,
        listen_on,
        open_connection,
        syn_header,
        test_manager,
        LOCAL_IP,
        REMOTE_IP,
    },
    FlowKey,
    SeqNumber,
    State,
    TcbManager,
    TcpSegment,
};
use ::anyhow::Result;
use ::std::{
    net::SocketAddrV4,
    rc::Rc,
};

//==============================================================================
// Unit Tests
//==============================================================================

/// Two connections fit under a global cap of two; the third SYN is answered
/// with a RST acknowledging the SYN's sequence number.
#[test]
fn global_limit_rejects_with_rst() -> Result<()> {
    let tcp: TcbManager = TcbManager::with_max_connections(2);
    let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30000);
    listen_on(&tcp, 30000);

    for port in [50001, 50002] {
        let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, port);
        inject(&tcp, remote, local, syn_header(remote, local, 100), &[])?;
    }
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 2);
    crate::ensure_eq!(segments.iter().all(|s| s.header.syn && s.header.ack), true);
    crate::ensure_eq!(tcp.current_connections(), 2);
    crate::ensure_eq!(tcp.is_at_capacity(), true);

    // Third connection: no control block, a RST on the wire.
    let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50003);
    inject(&tcp, remote, local, syn_header(remote, local, 777), &[])?;
    crate::ensure_eq!(tcp.current_connections(), 2);

    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    let rst: &TcpSegment = &segments[0];
    crate::ensure_eq!(rst.header.rst, true);
    crate::ensure_eq!(rst.header.seq_num, SeqNumber::from(0));
    crate::ensure_eq!(rst.header.ack, true);
    // The SYN consumes one sequence number.
    crate::ensure_eq!(rst.header.ack_num, SeqNumber::from(778));
    crate::ensure_eq!(rst.remote, remote);

    crate::ensure_eq!(tcp.port_stats(30000).total_rejected, 1);
    crate::ensure_eq!(tcp.peak_connections(), 2);
    crate::ensure_eq!(tcp.total_connections_created(), 2);
    Ok(())
}

/// A per-port cap rejects the second connection on that port while another
/// port keeps admitting.
#[test]
fn per_port_limit_is_independent() -> Result<()> {
    ::std::env::set_var("MAX_CONNECTIONS_PORT_30081", "1");
    let tcp: TcbManager = TcbManager::with_max_connections(100);
    listen_on(&tcp, 30081);
    listen_on(&tcp, 30082);
    let capped: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30081);
    let open: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30082);

    let first: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50010);
    inject(&tcp, first, capped, syn_header(first, capped, 100), &[])?;
    crate::ensure_eq!(tcp.port_stats(30081).current, 1);

    let second: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50011);
    inject(&tcp, second, capped, syn_header(second, capped, 100), &[])?;
    crate::ensure_eq!(tcp.port_stats(30081).current, 1);
    crate::ensure_eq!(tcp.port_stats(30081).total_rejected, 1);

    // The other port is unaffected by the capped one.
    let third: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50012);
    inject(&tcp, third, open, syn_header(third, open, 100), &[])?;
    crate::ensure_eq!(tcp.port_stats(30082).current, 1);
    crate::ensure_eq!(tcp.port_stats(30082).total_rejected, 0);

    let segments: Vec<TcpSegment> = gather_all(&tcp);
    let rst_count: usize = segments.iter().filter(|s| s.header.rst).count();
    let syn_ack_count: usize = segments.iter().filter(|s| s.header.syn && s.header.ack).count();
    crate::ensure_eq!(rst_count, 1);
    crate::ensure_eq!(syn_ack_count, 2);

    ::std::env::remove_var("MAX_CONNECTIONS_PORT_30081");
    Ok(())
}

/// With a backlog of one and no application accepting, the second completed
/// handshake is counted as rejected and its connection reaped.
#[test]
fn backlog_overflow_reaps_connection() -> Result<()> {
    ::std::env::set_var("MAX_BACKLOG_PORT_30091", "1");
    let tcp: TcbManager = test_manager();
    let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30091);
    let listener: Rc<Listener> = listen_on(&tcp, 30091);

    let first: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50020);
    open_connection(&tcp, first, local)?;
    crate::ensure_eq!(listener.backlog_stats().current, 1);

    // Second handshake completes on the wire but the acceptor queue is full.
    let second: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50021);
    inject(&tcp, second, local, syn_header(second, local, 100), &[])?;
    gather_all(&tcp);
    inject(
        &tcp,
        second,
        local,
        ack_header(second, local, SeqNumber::from(101), SeqNumber::from(1)),
        &[],
    )?;

    let stats = listener.backlog_stats();
    crate::ensure_eq!(stats.current, 1);
    crate::ensure_eq!(stats.peak, 1);
    crate::ensure_eq!(stats.total_queued, 1);
    crate::ensure_eq!(stats.total_rejected, 1);

    let key: FlowKey = FlowKey { remote: second, local };
    crate::ensure_eq!(tcp.get_tcb(&key).map(|ccb| ccb.state()), Some(State::Closed));
    crate::ensure_eq!(tcp.cleanup_closed_connections(), 1);
    crate::ensure_eq!(tcp.get_tcb(&key).is_none(), true);
    crate::ensure_eq!(tcp.port_stats(30091).current, 1);

    ::std::env::remove_var("MAX_BACKLOG_PORT_30091");
    Ok(())
}

/// Segments for flows nobody listens on are answered with a RST derived from
/// the offending segment's ACK number.
#[test]
fn unknown_flow_gets_rst() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50030);
    let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 9); // nobody listens here

    inject(
        &tcp,
        remote,
        local,
        ack_header(remote, local, SeqNumber::from(42), SeqNumber::from(7000)),
        &[],
    )?;
    crate::ensure_eq!(tcp.current_connections(), 0);

    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.rst, true);
    // RFC 793: a reset for an ACK-bearing segment takes its sequence number
    // from the ACK field.
    crate::ensure_eq!(segments[0].header.seq_num, SeqNumber::from(7000));
    Ok(())
}

/// The per-port `current` counters track exactly the set of unswept,
/// non-CLOSED connections.
#[test]
fn port_counters_match_live_connections() -> Result<()> {
    let tcp: TcbManager = test_manager();
    listen_on(&tcp, 30101);
    listen_on(&tcp, 30102);
    let port_a: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30101);
    let port_b: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30102);

    let r1: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50040);
    let r2: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50041);
    let r3: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 50042);
    open_connection(&tcp, r1, port_a)?;
    open_connection(&tcp, r2, port_a)?;
    open_connection(&tcp, r3, port_b)?;

    let live: u32 = tcp.port_stats(30101).current + tcp.port_stats(30102).current;
    crate::ensure_eq!(live as usize, tcp.current_connections());
    crate::ensure_eq!(tcp.port_stats(30101).peak, 2);

    // Reset one connection; after the sweep the counters still agree.
    inject(
        &tcp,
        r1,
        port_a,
        crate::protocols::tcp::tests::setup::rst_header(r1, port_a, SeqNumber::from(101)),
        &[],
    )?;
    tcp.cleanup_closed_connections();
    let live: u32 = tcp.port_stats(30101).current + tcp.port_stats(30102).current;
    crate::ensure_eq!(live as usize, tcp.current_connections());
    crate::ensure_eq!(tcp.port_stats(30101).current, 1);
    Ok(())
}
