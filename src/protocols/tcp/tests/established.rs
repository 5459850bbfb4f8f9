// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// Data transfer, loss recovery, and teardown on established connections. The
// test peer at REMOTE_IP speaks ISN 100, so its first payload byte is 101;
// our side (ISN 0 under test) starts sending at 1.

//==============================================================================
// Imports
//==============================================================================

use crate::protocols::tcp::{
    tests::setup::{
        ack_header,
        check_flight_invariant,
        fin_header,
        gather_all,
        inject,
        listen_on,
        open_connection,
        rst_header,
        test_manager,
        LOCAL_IP,
        MSS,
        REMOTE_IP,
    },
    ControlBlock,
    SeqNumber,
    State,
    TcbManager,
    TcpSegment,
};
use crate::runtime::memory::DataBuffer;
use ::anyhow::Result;
use ::std::{
    net::SocketAddrV4,
    rc::Rc,
};

//==============================================================================
// Helper Functions
//==============================================================================

fn endpoints(local_port: u16, remote_port: u16) -> (SocketAddrV4, SocketAddrV4) {
    (
        SocketAddrV4::new(REMOTE_IP, remote_port),
        SocketAddrV4::new(LOCAL_IP, local_port),
    )
}

fn read_all(ccb: &Rc<ControlBlock>) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let mut buf: [u8; 4096] = [0; 4096];
    while let Some(len) = ccb.pop(&mut buf) {
        if len == 0 {
            break;
        }
        out.extend_from_slice(&buf[..len]);
    }
    out
}

//==============================================================================
// Unit Tests
//==============================================================================

/// In-order payload is delivered, acknowledged once, and readable exactly
/// once.
#[test]
fn in_order_data_is_delivered_and_acked() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40000);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    let events = inject(
        &tcp,
        remote,
        local,
        ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(1)),
        b"HELLO",
    )?;
    crate::ensure_eq!(events.is_empty(), false);
    crate::ensure_eq!(ccb.receive_next(), SeqNumber::from(106));

    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.ack, true);
    crate::ensure_eq!(segments[0].header.ack_num, SeqNumber::from(106));
    crate::ensure_eq!(segments[0].data.is_none(), true);

    crate::ensure_eq!(read_all(&ccb), b"HELLO".to_vec());
    Ok(())
}

/// An out-of-order segment does not advance RCV.NXT and provokes exactly one
/// ACK of the expected sequence number.
#[test]
fn out_of_order_segment_is_dropped_and_reacked() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40001);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    // A hole: this segment starts 100 bytes past what we expect.
    inject(
        &tcp,
        remote,
        local,
        ack_header(remote, local, SeqNumber::from(201), SeqNumber::from(1)),
        b"FUTURE",
    )?;
    crate::ensure_eq!(ccb.receive_next(), SeqNumber::from(101));
    crate::ensure_eq!(ccb.has_unread_data(), false);

    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.ack_num, SeqNumber::from(101));
    Ok(())
}

/// Re-feeding a segment that was already processed changes neither RCV.NXT
/// nor the receive queue.
#[test]
fn duplicate_segment_is_idempotent() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40002);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    let header = ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(1));
    inject(&tcp, remote, local, header.clone(), b"HELLO")?;
    crate::ensure_eq!(ccb.receive_next(), SeqNumber::from(106));

    // The retransmitted copy is acknowledged but not delivered again.
    inject(&tcp, remote, local, header, b"HELLO")?;
    crate::ensure_eq!(ccb.receive_next(), SeqNumber::from(106));
    crate::ensure_eq!(read_all(&ccb), b"HELLO".to_vec());
    crate::ensure_eq!(ccb.has_unread_data(), false);
    Ok(())
}

/// Three duplicate ACKs retransmit the segment at SND.UNA exactly once and
/// move congestion control into fast recovery with the RFC 5681 window
/// arithmetic.
#[test]
fn triple_duplicate_ack_triggers_fast_retransmit() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40003);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;
    let mss: u32 = MSS as u32;

    // Two single-segment round trips grow cwnd from one MSS to three.
    for round in 0..2u32 {
        ccb.push(DataBuffer::from_slice(&vec![0xAA; MSS]))?;
        let segments: Vec<TcpSegment> = gather_all(&tcp);
        crate::ensure_eq!(segments.len(), 1);
        check_flight_invariant(&ccb)?;
        let acked: SeqNumber = SeqNumber::from(1 + (round + 1) * mss);
        inject(&tcp, remote, local, ack_header(remote, local, SeqNumber::from(101), acked), &[])?;
    }
    crate::ensure_eq!(ccb.sender().congestion().cwnd(), 3 * mss);

    // Queue four more segments; only three fit into the congestion window.
    for _ in 0..4 {
        ccb.push(DataBuffer::from_slice(&vec![0xBB; MSS]))?;
    }
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 3);
    check_flight_invariant(&ccb)?;

    // Acknowledging the first opens the window to four MSS and releases the
    // fourth segment.
    let s1_end: SeqNumber = SeqNumber::from(1 + 3 * mss);
    inject(&tcp, remote, local, ack_header(remote, local, SeqNumber::from(101), s1_end), &[])?;
    crate::ensure_eq!(ccb.sender().congestion().cwnd(), 4 * mss);
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    check_flight_invariant(&ccb)?;

    // Three duplicate ACKs for the same point in the stream.
    for _ in 0..3 {
        inject(&tcp, remote, local, ack_header(remote, local, SeqNumber::from(101), s1_end), &[])?;
    }

    // Exactly one retransmission, of the segment at SND.UNA.
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    let retransmissions: Vec<&TcpSegment> = segments.iter().filter(|s| s.retransmit).collect();
    crate::ensure_eq!(retransmissions.len(), 1);
    crate::ensure_eq!(retransmissions[0].header.seq_num, s1_end);
    crate::ensure_eq!(ccb.sender().retransmit_count(s1_end), Some(1));

    // RFC 5681: ssthresh floors at 2*MSS, cwnd reopens by the three
    // duplicates.
    crate::ensure_eq!(ccb.sender().congestion().ssthresh(), 2 * mss);
    crate::ensure_eq!(ccb.sender().congestion().cwnd(), 2 * mss + 3 * mss);
    crate::ensure_eq!(ccb.sender().congestion().in_fast_recovery(), true);

    // The ACK that repairs the stream (six segments sent in total) deflates
    // the window back to ssthresh.
    let all_end: SeqNumber = SeqNumber::from(1 + 6 * mss);
    inject(&tcp, remote, local, ack_header(remote, local, SeqNumber::from(101), all_end), &[])?;
    crate::ensure_eq!(ccb.sender().congestion().cwnd(), 2 * mss);
    crate::ensure_eq!(ccb.sender().congestion().in_fast_recovery(), false);
    crate::ensure_eq!(ccb.sender().bytes_in_flight(), 0);
    crate::ensure_eq!(ccb.sender().unacked_len(), 0);
    Ok(())
}

/// Passive close: the peer's FIN moves us to CLOSE_WAIT and surfaces end of
/// stream to the reader; our own close then walks LAST_ACK to CLOSED.
#[test]
fn passive_close_walks_close_wait_and_last_ack() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40004);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    inject(
        &tcp,
        remote,
        local,
        fin_header(remote, local, SeqNumber::from(101), SeqNumber::from(1)),
        &[],
    )?;
    crate::ensure_eq!(ccb.state(), State::CloseWait);
    crate::ensure_eq!(ccb.receive_next(), SeqNumber::from(102));

    // The FIN is acknowledged immediately and the reader sees end of stream.
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.ack_num, SeqNumber::from(102));
    let mut buf: [u8; 8] = [0; 8];
    crate::ensure_eq!(ccb.pop(&mut buf), Some(0));

    // Our close queues a FIN; emitting it commits LAST_ACK.
    ccb.close()?;
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.fin, true);
    crate::ensure_eq!(ccb.state(), State::LastAck);

    // The peer's ACK of our FIN closes the connection; the sweep reaps it.
    inject(
        &tcp,
        remote,
        local,
        ack_header(remote, local, SeqNumber::from(102), SeqNumber::from(2)),
        &[],
    )?;
    crate::ensure_eq!(ccb.state(), State::Closed);
    crate::ensure_eq!(tcp.cleanup_closed_connections(), 1);
    crate::ensure_eq!(tcp.port_stats(30000).current, 0);
    Ok(())
}

/// Active close: FIN_WAIT_1 on our FIN, FIN_WAIT_2 when it is acknowledged,
/// TIME_WAIT when the peer's FIN lands.
#[test]
fn active_close_walks_fin_wait_states() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40005);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    ccb.close()?;
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.fin, true);
    crate::ensure_eq!(ccb.state(), State::FinWait1);

    // Writes after close are refused.
    crate::ensure_eq!(ccb.push(DataBuffer::from_slice(b"late")).is_err(), true);

    inject(
        &tcp,
        remote,
        local,
        ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(2)),
        &[],
    )?;
    crate::ensure_eq!(ccb.state(), State::FinWait2);

    inject(
        &tcp,
        remote,
        local,
        fin_header(remote, local, SeqNumber::from(101), SeqNumber::from(2)),
        &[],
    )?;
    crate::ensure_eq!(ccb.state(), State::TimeWait);
    let segments: Vec<TcpSegment> = gather_all(&tcp);
    crate::ensure_eq!(segments.len(), 1);
    crate::ensure_eq!(segments[0].header.ack_num, SeqNumber::from(102));

    // TIME_WAIT is held, not swept.
    crate::ensure_eq!(tcp.cleanup_closed_connections(), 0);
    Ok(())
}

/// A RST tears the connection down without ceremony.
#[test]
fn reset_closes_connection() -> Result<()> {
    let tcp: TcbManager = test_manager();
    let (remote, local) = endpoints(30000, 40006);
    listen_on(&tcp, 30000);
    let ccb: Rc<ControlBlock> = open_connection(&tcp, remote, local)?;

    inject(&tcp, remote, local, rst_header(remote, local, SeqNumber::from(101)), &[])?;
    crate::ensure_eq!(ccb.state(), State::Closed);
    crate::ensure_eq!(gather_all(&tcp).is_empty(), true);
    crate::ensure_eq!(tcp.cleanup_closed_connections(), 1);
    Ok(())
}
