// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::tcp::{
        constants::{
            DUP_ACK_THRESHOLD,
            RECEIVE_BUFFER_SIZE,
        },
        listener::Listener,
        peer::FlowKey,
        segment::{
            TcpHeader,
            TcpSegment,
        },
        sender::Sender,
        SeqNumber,
    },
    runtime::{
        fail::Fail,
        memory::DataBuffer,
    },
};
use ::libc::{
    EINVAL,
    ENOTCONN,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    cmp::min,
    collections::VecDeque,
    net::SocketAddrV4,
    rc::{
        Rc,
        Weak,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Queue of connections with pending transmit work, shared between the
/// manager and every control block it owns.
pub type ActiveQueue = Rc<RefCell<VecDeque<Rc<ControlBlock>>>>;

/// TCP connection state (RFC 793).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Receive-side state of a connection.
///
/// In RFC 793 terms, receive_next is RCV.NXT. The advertised window is the
/// receive buffer size minus whatever the application has not read yet.
struct Receiver {
    receive_next: Cell<SeqNumber>,
    buffer_size: u32,
    unread_bytes: Cell<u32>,
    // MSS advertised by the peer's SYN. Informational: our segments are sized
    // by our own MSS.
    peer_mss: Cell<u16>,
    // In-order data ready for the application. An empty buffer marks the end
    // of the stream (peer sent FIN).
    recv_queue: RefCell<VecDeque<DataBuffer>>,
}

impl Receiver {
    fn new() -> Self {
        Self {
            receive_next: Cell::new(SeqNumber::from(0)),
            buffer_size: RECEIVE_BUFFER_SIZE,
            unread_bytes: Cell::new(0),
            peer_mss: Cell::new(0),
            recv_queue: RefCell::new(VecDeque::new()),
        }
    }

    fn receive_next(&self) -> SeqNumber {
        self.receive_next.get()
    }

    fn set_receive_next(&self, seq_no: SeqNumber) {
        self.receive_next.set(seq_no);
    }

    /// Appends in-order payload and advances RCV.NXT past it.
    fn push(&self, buf: DataBuffer) {
        let buf_len: u32 = buf.len() as u32;
        self.recv_queue.borrow_mut().push_back(buf);
        self.receive_next.set(self.receive_next.get() + SeqNumber::from(buf_len));
        self.unread_bytes.set(self.unread_bytes.get() + buf_len);
    }

    /// Appends the end-of-stream marker. RCV.NXT is advanced over the FIN by
    /// the caller; the marker itself consumes no sequence space.
    fn push_eof(&self) {
        self.recv_queue.borrow_mut().push_back(DataBuffer::empty());
    }

    /// Pops up to `size` bytes of in-order data, splitting the front buffer
    /// when it is larger. The end-of-stream marker comes back as an empty
    /// buffer.
    fn pop(&self, size: usize) -> Option<DataBuffer> {
        let mut recv_queue = self.recv_queue.borrow_mut();
        let front: &mut DataBuffer = recv_queue.front_mut()?;
        let buf: DataBuffer = if front.len() > size {
            front.split_front(size).expect("front buffer is longer than size")
        } else {
            recv_queue.pop_front().expect("queue cannot be empty")
        };
        self.unread_bytes.set(self.unread_bytes.get() - buf.len() as u32);
        Some(buf)
    }

    fn has_unread(&self) -> bool {
        !self.recv_queue.borrow().is_empty()
    }

    fn window_size(&self) -> u16 {
        min(self.buffer_size.saturating_sub(self.unread_bytes.get()), u16::MAX as u32) as u16
    }
}

/// Per-connection control block.
///
/// Owns the full state machine for one flow: sequence state on both sides,
/// the unsent/retransmission/receive queues, congestion control, and a queue
/// of prebuilt control segments (SYN-ACK, pure ACKs, retransmissions) that
/// take priority over fresh data when the manager asks for the next segment.
///
/// Single-threaded: shared through `Rc` with interior mutability, never
/// across threads.
pub struct ControlBlock {
    local: SocketAddrV4,
    remote: SocketAddrV4,

    state: Cell<State>,
    // State to commit when the next gathered segment is emitted.
    next_state: Cell<State>,

    // Whether the user has called close.
    user_is_done_sending: Cell<bool>,

    sender: Sender,
    receiver: Receiver,

    // Prebuilt segments that jump the data queue.
    ctl_queue: RefCell<VecDeque<TcpSegment>>,

    // Back reference to the listener that gave birth to this connection. Weak
    // on purpose: the listener reaches connections through its acceptor
    // queue, and the only owning path is manager -> control block.
    listener: Option<Weak<Listener>>,

    // Manager's ready-to-transmit FIFO; we enqueue ourselves whenever new
    // work shows up.
    active_queue: ActiveQueue,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl ControlBlock {
    pub fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        isn: SeqNumber,
        mss: usize,
        active_queue: ActiveQueue,
        listener: Option<Weak<Listener>>,
    ) -> Self {
        Self {
            local,
            remote,
            state: Cell::new(State::Closed),
            next_state: Cell::new(State::Closed),
            user_is_done_sending: Cell::new(false),
            sender: Sender::new(isn, mss),
            receiver: Receiver::new(),
            ctl_queue: RefCell::new(VecDeque::new()),
            listener,
            active_queue,
        }
    }

    pub fn get_local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn get_remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            remote: self.remote,
            local: self.local,
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receive_next(&self) -> SeqNumber {
        self.receiver.receive_next()
    }

    pub fn has_unread_data(&self) -> bool {
        self.receiver.has_unread()
    }

    pub fn peer_mss(&self) -> u16 {
        self.receiver.peer_mss.get()
    }

    /// Forces a newly-created control block into LISTEN so the SYN that
    /// caused its creation can be fed through the regular receive path.
    pub fn force_listen(&self) {
        self.state.set(State::Listen);
        self.next_state.set(State::Listen);
    }

    fn set_state(&self, state: State) {
        trace!("{} -> {}: {:?} -> {:?}", self.remote, self.local, self.state.get(), state);
        self.state.set(state);
        self.next_state.set(state);
    }

    fn activate(self: &Rc<Self>) {
        self.active_queue.borrow_mut().push_back(self.clone());
    }

    /// True when this connection has a segment it could emit right now.
    pub fn wants_transmit(&self) -> bool {
        if !self.ctl_queue.borrow().is_empty() {
            return true;
        }
        match self.state.get() {
            State::Established | State::CloseWait => self.sender.has_unsent() && self.sender.can_send(),
            _ => false,
        }
    }

    //==========================================================================
    // Application side
    //==========================================================================

    /// Enqueues application bytes for transmission and marks the connection
    /// active. Callers chop their buffers to MSS-sized pieces.
    pub fn push(self: &Rc<Self>, buf: DataBuffer) -> Result<(), Fail> {
        if self.user_is_done_sending.get() {
            return Err(Fail::new(EINVAL, "connection is closing"));
        }
        match self.state.get() {
            State::Established | State::CloseWait => (),
            _ => return Err(Fail::new(ENOTCONN, "connection not established")),
        }
        self.sender.push_unsent(buf);
        self.activate();
        Ok(())
    }

    /// Copies up to `buf.len()` bytes of received data out of the connection.
    /// Returns zero at end of stream.
    pub fn pop(&self, buf: &mut [u8]) -> Option<usize> {
        let data: DataBuffer = self.receiver.pop(buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Some(data.len())
    }

    /// The user is done sending. Queues a FIN behind any pending data; the
    /// state transition happens when the FIN actually goes out.
    pub fn close(self: &Rc<Self>) -> Result<(), Fail> {
        if self.user_is_done_sending.get() {
            return Ok(());
        }
        match self.state.get() {
            State::Established | State::CloseWait => {
                self.sender.push_unsent(DataBuffer::empty());
                self.user_is_done_sending.set(true);
                self.activate();
            },
            // Nothing on the wire worth shutting down in an orderly way.
            _ => self.set_state(State::Closed),
        }
        Ok(())
    }

    //==========================================================================
    // Segment build (egress)
    //==========================================================================

    /// Fetches a TCP header filled out from current state. Once past LISTEN
    /// we always acknowledge, so the ACK field is valid on every segment.
    fn tcp_header(&self) -> TcpHeader {
        let mut header: TcpHeader = TcpHeader::new(self.local.port(), self.remote.port());
        header.ack = true;
        header.ack_num = self.receiver.receive_next();
        header.window_size = self.receiver.window_size();
        header
    }

    fn enqueue_ctl(self: &Rc<Self>, header: TcpHeader, data: Option<DataBuffer>, retransmit: bool) {
        self.ctl_queue.borrow_mut().push_back(TcpSegment {
            remote: self.remote,
            local: self.local,
            header,
            data,
            retransmit,
        });
        self.activate();
    }

    /// Queues a pure ACK reflecting our current state.
    fn enqueue_ack(self: &Rc<Self>) {
        let mut header: TcpHeader = self.tcp_header();
        header.seq_num = self.sender.send_next();
        self.enqueue_ctl(header, None, false);
    }

    /// Rebuilds the tracked segment at `seq_no` and queues it on the priority
    /// path with its original sequence number.
    fn retransmit_segment(self: &Rc<Self>, seq_no: SeqNumber) {
        match self.sender.retransmit_copy(seq_no) {
            Some(bytes) => {
                let mut header: TcpHeader = self.tcp_header();
                header.seq_num = seq_no;
                self.enqueue_ctl(header, Some(bytes), true);
            },
            None => warn!("no tracked segment at {} to retransmit", seq_no),
        }
    }

    /// Commits a pending state transition at segment emission.
    fn commit_state(&self) {
        let next: State = self.next_state.get();
        if next != self.state.get() {
            debug!("{} -> {}: {:?} -> {:?}", self.remote, self.local, self.state.get(), next);
            self.state.set(next);
        }
    }

    /// Returns the next segment this connection wants on the wire, if any:
    /// first anything on the control queue, then a fresh data (or FIN)
    /// segment when congestion control allows.
    pub fn gather_segment(&self) -> Option<TcpSegment> {
        if let Some(segment) = self.ctl_queue.borrow_mut().pop_front() {
            self.commit_state();
            return Some(segment);
        }

        match self.state.get() {
            State::Established | State::CloseWait => (),
            _ => return None,
        }
        if !self.sender.can_send() {
            return None;
        }

        // Size the segment so it never overdraws the congestion window.
        let budget: usize = {
            let cwnd: u32 = self.sender.congestion().cwnd();
            if cwnd == 0 {
                self.sender.mss()
            } else {
                min(self.sender.mss(), (cwnd - self.sender.bytes_in_flight()) as usize)
            }
        };
        let buf: DataBuffer = self.sender.pop_unsent(budget)?;

        let mut header: TcpHeader = self.tcp_header();
        header.seq_num = self.sender.send_next();

        let consumed: u32 = if buf.is_empty() {
            // End-of-send marker: this segment is our FIN.
            header.fin = true;
            1
        } else {
            buf.len() as u32
        };
        self.sender.modify_send_next(|s| s + SeqNumber::from(consumed));

        self.commit_state();
        if header.fin {
            match self.state.get() {
                // Active close.
                State::Established => self.set_state(State::FinWait1),
                // Passive close.
                State::CloseWait => self.set_state(State::LastAck),
                state => warn!("sent FIN in state {:?}", state),
            }
        }

        let data: Option<DataBuffer> = if buf.is_empty() { None } else { Some(buf) };
        Some(TcpSegment {
            remote: self.remote,
            local: self.local,
            header,
            data,
            retransmit: false,
        })
    }

    /// Records an emitted data segment on the retransmission queue.
    /// Retransmissions and dataless segments are not re-tracked.
    pub fn track_sent_segment(&self, segment: &TcpSegment) {
        if segment.retransmit {
            return;
        }
        if let Some(data) = &segment.data {
            self.sender.track_sent(segment.header.seq_num, data);
        }
    }

    //==========================================================================
    // Segment fold (ingress)
    //==========================================================================

    /// Folds an incoming segment into the connection. This is the main TCP
    /// receive routine, dispatching on the current state.
    pub fn receive(self: &Rc<Self>, header: &TcpHeader, data: DataBuffer) {
        debug!(
            "{:?} receiving {} bytes (seq={}, ack={}, flags={}{}{}{})",
            self.state.get(),
            data.len(),
            header.seq_num,
            header.ack_num,
            if header.syn { "S" } else { "" },
            if header.ack { "A" } else { "" },
            if header.fin { "F" } else { "" },
            if header.rst { "R" } else { "" },
        );

        match self.state.get() {
            State::Listen => return self.receive_syn(header),
            State::SynReceived => return self.receive_handshake_ack(header, data),
            State::SynSent => {
                // Active open is not wired up to the socket surface.
                warn!("segment in SYN_SENT dropped");
                return;
            },
            State::Closed => {
                debug!("segment for closed connection dropped");
                return;
            },
            _ => (),
        }

        // Synchronized states from here on.

        if header.rst {
            info!("received RST from {}", self.remote);
            self.set_state(State::Closed);
            return;
        }

        if header.syn {
            warn!("in-window SYN on synchronized connection");
            return;
        }

        if !header.ack {
            warn!("segment without ACK on synchronized connection");
            return;
        }

        if self.process_ack(header, data.is_empty()) {
            return;
        }

        self.process_payload_and_fin(header, data);
    }

    /// LISTEN: an incoming SYN starts the handshake. Records the peer's
    /// sequence state, queues our SYN-ACK, and moves to SYN_RECEIVED when it
    /// goes out.
    fn receive_syn(self: &Rc<Self>, header: &TcpHeader) {
        if header.rst {
            self.set_state(State::Closed);
            return;
        }
        if !header.syn || header.ack {
            warn!(
                "invalid flags in LISTEN (syn={}, ack={}, rst={})",
                header.syn, header.ack, header.rst
            );
            return;
        }

        self.receiver.set_receive_next(header.seq_num + SeqNumber::from(1));
        self.sender.set_send_window(header.window_size as u32);
        if let Some(mss) = header.mss {
            self.receiver.peer_mss.set(mss);
        }

        let mut out: TcpHeader = self.tcp_header();
        out.seq_num = self.sender.send_next();
        out.syn = true;
        out.mss = Some(self.sender.mss() as u16);
        // The SYN consumes one sequence number.
        self.sender.modify_send_next(|s| s + SeqNumber::from(1));

        self.next_state.set(State::SynReceived);
        self.enqueue_ctl(out, None, false);
    }

    /// SYN_RECEIVED: the ACK that completes the three-way handshake.
    fn receive_handshake_ack(self: &Rc<Self>, header: &TcpHeader, data: DataBuffer) {
        if header.rst {
            info!("handshake aborted by RST from {}", self.remote);
            self.set_state(State::Closed);
            return;
        }
        if header.syn {
            // The peer did not see our SYN-ACK yet; it is either still queued
            // or lost. Either way there is nothing new to record.
            debug!("duplicate SYN in SYN_RECEIVED dropped");
            return;
        }
        if !header.ack || header.ack_num != self.sender.send_next() {
            warn!("invalid handshake ACK (ack={}, expected={})", header.ack_num, self.sender.send_next());
            return;
        }

        self.sender.set_send_unacked(header.ack_num);
        self.sender.init_congestion_control();
        self.sender.congestion().record_ack(header.ack_num);
        self.sender.update_send_window(header);
        self.set_state(State::Established);
        info!("connection established ({} -> {})", self.remote, self.local);

        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            if listener.push_acceptor(self.clone()).is_err() {
                warn!(
                    "acceptor backlog full on {}, dropping connection from {}",
                    self.local, self.remote
                );
                self.set_state(State::Closed);
                return;
            }
        }

        // The handshake ACK may already carry data.
        if !data.is_empty() || header.fin {
            self.process_payload_and_fin(header, data);
        }
    }

    /// Processes the acknowledgement field of an incoming segment. Returns
    /// true when the segment is fully consumed (pure duplicate ACK or an ACK
    /// for data we never sent).
    fn process_ack(self: &Rc<Self>, header: &TcpHeader, data_is_empty: bool) -> bool {
        let send_unacked: SeqNumber = self.sender.send_unacked();
        let send_next: SeqNumber = self.sender.send_next();
        let ack_no: SeqNumber = header.ack_num;
        let congestion = self.sender.congestion();

        // Duplicate ACK: same ACK number as last time, nothing else in the
        // segment, and data of ours still outstanding.
        if ack_no == congestion.last_ack_no() && data_is_empty && !header.fin && self.sender.has_unacked() {
            let dupacks: u16 = congestion.on_duplicate_ack();
            debug!("duplicate ACK #{} (ack={})", dupacks, ack_no);
            if dupacks == DUP_ACK_THRESHOLD {
                info!("fast retransmit (seq={})", send_unacked);
                self.retransmit_segment(send_unacked);
                congestion.enter_fast_recovery();
            }
            return true;
        }

        if send_unacked < ack_no {
            if ack_no <= send_next {
                // This segment acknowledges new data (possibly also our FIN).
                let bytes_acked: u32 = (ack_no - send_unacked).into();
                self.sender.remove_acked_segments(ack_no);
                self.sender.set_send_unacked(ack_no);
                self.sender.sub_bytes_in_flight(bytes_acked);
                congestion.on_new_ack(ack_no, bytes_acked);
                self.sender.update_send_window(header);

                if ack_no == send_next {
                    // Everything we ever sent is acknowledged. If a FIN was
                    // outstanding, it is now acknowledged too.
                    match self.state.get() {
                        State::FinWait1 => self.set_state(State::FinWait2),
                        State::Closing => self.set_state(State::TimeWait),
                        State::LastAck => self.set_state(State::Closed),
                        _ => (),
                    }
                }

                // The window may have opened; get queued data moving again.
                if self.sender.has_unsent() && self.sender.can_send() {
                    self.activate();
                }
            } else {
                warn!("segment acknowledges data we have yet to send (ack={})", ack_no);
                self.enqueue_ack();
                return true;
            }
        }
        // An older ACK that is not a duplicate signal carries no news.

        false
    }

    /// Processes payload bytes and the FIN bit of an in-window segment.
    fn process_payload_and_fin(self: &Rc<Self>, header: &TcpHeader, data: DataBuffer) {
        let data_len: u32 = data.len() as u32;

        if !data.is_empty() {
            let seg_start: SeqNumber = header.seq_num;
            let receive_next: SeqNumber = self.receiver.receive_next();
            if seg_start == receive_next {
                match self.state.get() {
                    State::Established | State::FinWait1 | State::FinWait2 => {
                        trace!("{} bytes in order at {}", data_len, seg_start);
                        self.receiver.push(data);
                        self.enqueue_ack();
                    },
                    state => warn!("ignoring data received after FIN (state {:?})", state),
                }
            } else if seg_start > receive_next {
                // Out of order. There is no reassembly buffer: drop it and
                // re-assert where we are; the peer will retransmit.
                debug!("out-of-order segment (seq={}, expected={})", seg_start, receive_next);
                self.enqueue_ack();
                return;
            } else {
                // Entirely old data. Re-ACK so the peer moves on.
                debug!("duplicate segment (seq={}, expected={})", seg_start, receive_next);
                self.enqueue_ack();
                return;
            }
        }

        if header.fin {
            // The FIN sits right after any payload it arrived with.
            if header.seq_num + SeqNumber::from(data_len) == self.receiver.receive_next() {
                trace!("received FIN");
                self.receiver
                    .set_receive_next(self.receiver.receive_next() + SeqNumber::from(1));
                match self.state.get() {
                    State::Established => self.set_state(State::CloseWait),
                    State::FinWait1 => {
                        // Had our FIN been acknowledged we would already be in
                        // FIN_WAIT_2, so this is a simultaneous close.
                        self.set_state(State::Closing)
                    },
                    State::FinWait2 => {
                        // No TIME_WAIT dwell: state is held but never timed.
                        self.set_state(State::TimeWait)
                    },
                    State::CloseWait | State::Closing | State::LastAck | State::TimeWait => (),
                    state => warn!("FIN in state {:?}", state),
                }
                self.receiver.push_eof();
                self.enqueue_ack();
            } else {
                // Out-of-order or duplicate FIN.
                self.enqueue_ack();
            }
        }
    }
}
