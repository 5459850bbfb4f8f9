// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::tcp::{
        congestion_control::Reno,
        segment::TcpHeader,
        SeqNumber,
    },
    runtime::memory::DataBuffer,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    fmt,
    time::{
        Duration,
        Instant,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Entry on the retransmission queue. Owns a deep copy of the payload, since
/// the buffer on the segment itself is consumed by the framing layer.
pub struct UnackedSegment {
    pub seq_no: SeqNumber,
    pub bytes: DataBuffer,
    pub sent_time: Instant,
    pub retransmit_count: u16,
}

/// Send-side state of a connection.
///
///
/// Send Sequence Space:
///
///              send_unacked               send_next
///                   v                         v
/// ... --------------|-------------------------|--------------------------
///     acknowledged  |      unacknowledged     |  future sequence space
///
/// In RFC 793 terms, send_unacked is SND.UNA, send_next is SND.NXT, and
/// send_window is SND.WND.
pub struct Sender {
    send_unacked: Cell<SeqNumber>,
    send_next: Cell<SeqNumber>,

    // Window advertised by our peer.
    send_window: Cell<u32>,

    // Payload bytes sent but not yet acknowledged. Equal to
    // send_next - send_unacked while the connection is established.
    bytes_in_flight: Cell<u32>,

    mss: usize,

    // User data we have not yet put on the wire. An empty buffer on this
    // queue is the end-of-send marker and goes out as a FIN.
    unsent_queue: RefCell<VecDeque<DataBuffer>>,

    // RFC 793 calls this the "retransmission queue". Ordered by seq_no.
    unacked_queue: RefCell<VecDeque<UnackedSegment>>,

    congestion: Reno,

    // Retransmission timing state. Default-initialized: no timer fires in
    // this stack, loss recovery is duplicate-ACK driven.
    rto: Cell<Duration>,
    srtt: Cell<Duration>,
    rttvar: Cell<Duration>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Sender {
    pub fn new(seq_no: SeqNumber, mss: usize) -> Self {
        Self {
            send_unacked: Cell::new(seq_no),
            send_next: Cell::new(seq_no),
            send_window: Cell::new(0),
            bytes_in_flight: Cell::new(0),
            mss,
            unsent_queue: RefCell::new(VecDeque::new()),
            unacked_queue: RefCell::new(VecDeque::new()),
            congestion: Reno::new(mss),
            rto: Cell::new(Duration::from_secs(1)),
            srtt: Cell::new(Duration::ZERO),
            rttvar: Cell::new(Duration::ZERO),
        }
    }

    pub fn send_unacked(&self) -> SeqNumber {
        self.send_unacked.get()
    }

    pub fn set_send_unacked(&self, seq_no: SeqNumber) {
        self.send_unacked.set(seq_no);
    }

    pub fn send_next(&self) -> SeqNumber {
        self.send_next.get()
    }

    pub fn modify_send_next(&self, f: impl FnOnce(SeqNumber) -> SeqNumber) {
        self.send_next.set(f(self.send_next.get()));
    }

    pub fn send_window(&self) -> u32 {
        self.send_window.get()
    }

    pub fn set_send_window(&self, window: u32) {
        self.send_window.set(window);
    }

    /// Updates SND.WND from an acceptable incoming segment. There is no
    /// window scaling, so the header field is the window.
    pub fn update_send_window(&self, header: &TcpHeader) {
        self.send_window.set(header.window_size as u32);
        trace!("send window -> {}", header.window_size);
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight.get()
    }

    pub fn sub_bytes_in_flight(&self, nbytes: u32) {
        self.bytes_in_flight.set(self.bytes_in_flight.get().saturating_sub(nbytes));
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn congestion(&self) -> &Reno {
        &self.congestion
    }

    pub fn rto(&self) -> Duration {
        self.rto.get()
    }

    pub fn srtt(&self) -> Duration {
        self.srtt.get()
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar.get()
    }

    /// Called on entry to ESTABLISHED.
    pub fn init_congestion_control(&self) {
        self.congestion.initialize();
        self.bytes_in_flight.set(0);
    }

    /// True when congestion control admits more data onto the wire. A zero
    /// window means the handshake has not finished; the very first segment is
    /// always allowed out.
    pub fn can_send(&self) -> bool {
        let cwnd: u32 = self.congestion.cwnd();
        if cwnd == 0 {
            return true;
        }
        self.bytes_in_flight.get() < cwnd
    }

    pub fn push_unsent(&self, buf: DataBuffer) {
        self.unsent_queue.borrow_mut().push_back(buf);
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent_queue.borrow().is_empty()
    }

    /// Pops up to `max_bytes` off the unsent queue, splitting the front
    /// buffer when it is larger. An empty buffer (the end-of-send marker)
    /// comes back whole.
    pub fn pop_unsent(&self, max_bytes: usize) -> Option<DataBuffer> {
        let mut unsent_queue = self.unsent_queue.borrow_mut();
        let mut buf: DataBuffer = unsent_queue.pop_front()?;
        if buf.len() > max_bytes {
            let front: DataBuffer = buf
                .split_front(max_bytes)
                .expect("unsent buffer is longer than max_bytes");
            unsent_queue.push_front(buf);
            buf = front;
        }
        Some(buf)
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked_queue.borrow().is_empty()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked_queue.borrow().len()
    }

    pub fn first_unacked_seq(&self) -> Option<SeqNumber> {
        self.unacked_queue.borrow().front().map(|entry| entry.seq_no)
    }

    /// Records a deep copy of a sent data segment for possible retransmission
    /// and charges it against the congestion window.
    pub fn track_sent(&self, seq_no: SeqNumber, bytes: &DataBuffer) {
        let data_len: u32 = bytes.len() as u32;
        self.unacked_queue.borrow_mut().push_back(UnackedSegment {
            seq_no,
            bytes: bytes.clone(),
            sent_time: Instant::now(),
            retransmit_count: 0,
        });
        self.bytes_in_flight.set(self.bytes_in_flight.get() + data_len);
        trace!(
            "tracking segment (seq={}, len={}, in_flight={})",
            seq_no,
            data_len,
            self.bytes_in_flight.get()
        );
    }

    /// Discards entries wholly covered by `ack_no` from the retransmission
    /// queue.
    pub fn remove_acked_segments(&self, ack_no: SeqNumber) {
        let mut unacked_queue = self.unacked_queue.borrow_mut();
        while let Some(entry) = unacked_queue.front() {
            let seg_end: SeqNumber = entry.seq_no + SeqNumber::from(entry.bytes.len() as u32);
            if seg_end <= ack_no {
                trace!("acked segment (seq={}, len={})", entry.seq_no, entry.bytes.len());
                unacked_queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Finds the tracked segment starting at `seq_no`, bumps its retransmit
    /// accounting, and returns a fresh copy of its payload.
    pub fn retransmit_copy(&self, seq_no: SeqNumber) -> Option<DataBuffer> {
        let mut unacked_queue = self.unacked_queue.borrow_mut();
        for entry in unacked_queue.iter_mut() {
            if entry.seq_no == seq_no {
                entry.retransmit_count += 1;
                entry.sent_time = Instant::now();
                debug!(
                    "retransmitting segment (seq={}, len={}, count={})",
                    seq_no,
                    entry.bytes.len(),
                    entry.retransmit_count
                );
                return Some(entry.bytes.clone());
            }
        }
        None
    }

    pub fn retransmit_count(&self, seq_no: SeqNumber) -> Option<u16> {
        self.unacked_queue
            .borrow()
            .iter()
            .find(|entry| entry.seq_no == seq_no)
            .map(|entry| entry.retransmit_count)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("send_unacked", &self.send_unacked.get())
            .field("send_next", &self.send_next.get())
            .field("send_window", &self.send_window.get())
            .field("bytes_in_flight", &self.bytes_in_flight.get())
            .field("mss", &self.mss)
            .finish()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
