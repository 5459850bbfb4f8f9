// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::tcp::{
        ctrlblk::{
            ActiveQueue,
            ControlBlock,
            State,
        },
        isn_generator::IsnGenerator,
        listener::Listener,
        segment::{
            TcpHeader,
            TcpSegment,
        },
        SeqNumber,
    },
    runtime::{
        fail::Fail,
        limits,
        memory::DataBuffer,
    },
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
        VecDeque,
    },
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    rc::Rc,
};

//==============================================================================
// Structures
//==============================================================================

/// Identity of a connection: the four-tuple, remote end first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub remote: SocketAddrV4,
    pub local: SocketAddrV4,
}

/// Per-port connection statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortStats {
    pub current: u32,
    pub max: u32,
    pub peak: u32,
    pub total_created: u32,
    pub total_rejected: u32,
}

/// Readiness raised by ingress processing, for the socket surface to fan out
/// to the application.
pub enum TcpEvent {
    /// The connection has unread data (or an end-of-stream marker).
    Readable(Rc<ControlBlock>),
    /// The listener has connections awaiting `accept`.
    Acceptable(Rc<Listener>),
}

/// Process-wide connection registry.
///
/// Owns every control block (keyed by four-tuple) and listener (keyed by
/// local endpoint), admits or rejects incoming connections against the
/// global and per-port limits, and drains the ready-to-transmit FIFO on
/// behalf of the event loop. One logical instance per process, owned by the
/// stack and passed by reference.
pub struct TcbManager {
    tcbs: RefCell<HashMap<FlowKey, Rc<ControlBlock>>>,
    listeners: RefCell<HashMap<SocketAddrV4, Rc<Listener>>>,
    active_endpoints: RefCell<HashSet<SocketAddrV4>>,

    // Connections with pending transmit work, in activation order.
    active_tcbs: ActiveQueue,

    // Resets owed to peers whose segments did not reach any connection.
    pending_resets: RefCell<VecDeque<TcpSegment>>,

    isn_generator: RefCell<IsnGenerator>,

    max_connections: usize,
    total_connections_created: Cell<u32>,
    peak_connections: Cell<u32>,
    port_stats: RefCell<BTreeMap<u16, PortStats>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TcbManager {
    /// Creates a manager with limits resolved from the environment.
    pub fn new() -> Self {
        Self::with_max_connections(limits::max_connections())
    }

    /// Creates a manager with an explicit global connection cap.
    pub fn with_max_connections(max_connections: usize) -> Self {
        info!("connection limit: {}", max_connections);
        Self {
            tcbs: RefCell::new(HashMap::new()),
            listeners: RefCell::new(HashMap::new()),
            active_endpoints: RefCell::new(HashSet::new()),
            active_tcbs: Rc::new(RefCell::new(VecDeque::new())),
            pending_resets: RefCell::new(VecDeque::new()),
            isn_generator: RefCell::new(IsnGenerator::new(rand::random())),
            max_connections,
            total_connections_created: Cell::new(0),
            peak_connections: Cell::new(0),
            port_stats: RefCell::new(BTreeMap::new()),
        }
    }

    //==========================================================================
    // Listeners
    //==========================================================================

    /// Starts accepting connections on the listener's endpoint.
    pub fn listen(&self, listener: Rc<Listener>) {
        let endpoint: SocketAddrV4 = listener.endpoint();
        self.listeners.borrow_mut().insert(endpoint, listener);
        self.active_endpoints.borrow_mut().insert(endpoint);
    }

    /// Tears a listener down and sweeps whatever its connections left behind.
    pub fn unlisten(&self, endpoint: SocketAddrV4) {
        self.listeners.borrow_mut().remove(&endpoint);
        self.active_endpoints.borrow_mut().remove(&endpoint);
        self.cleanup_closed_connections();
    }

    pub fn listener(&self, endpoint: SocketAddrV4) -> Option<Rc<Listener>> {
        self.listeners.borrow().get(&endpoint).cloned()
    }

    //==========================================================================
    // Ingress
    //==========================================================================

    /// Feeds one TCP segment (header still attached) into the registry,
    /// returning the readiness events it raised.
    pub fn receive(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, buf: DataBuffer) -> Result<Vec<TcpEvent>, Fail> {
        let (header, data): (TcpHeader, DataBuffer) = TcpHeader::parse(src_addr, dst_addr, buf)?;
        let remote: SocketAddrV4 = SocketAddrV4::new(src_addr, header.src_port);
        let local: SocketAddrV4 = SocketAddrV4::new(dst_addr, header.dst_port);
        let key: FlowKey = FlowKey { remote, local };

        let mut events: Vec<TcpEvent> = Vec::new();

        let known: Option<Rc<ControlBlock>> = self.tcbs.borrow().get(&key).cloned();
        if let Some(ccb) = known {
            ccb.receive(&header, data);
            self.collect_events(&ccb, &mut events);
        } else if self.active_endpoints.borrow().contains(&local) {
            if !header.syn || header.ack || header.rst {
                warn!(
                    "invalid flags for new connection (remote={}, syn={}, ack={}, rst={})",
                    remote, header.syn, header.ack, header.rst
                );
                self.enqueue_reset(&header, remote, local, data.len());
                return Ok(events);
            }
            let listener: Rc<Listener> = self
                .listeners
                .borrow()
                .get(&local)
                .cloned()
                .expect("active endpoint must have a listener");
            match self.register_tcb(key, &listener) {
                Some(ccb) => {
                    // Born CLOSED, forced to LISTEN, then the SYN moves it on.
                    ccb.force_listen();
                    ccb.receive(&header, data);
                    self.collect_events(&ccb, &mut events);
                },
                None => {
                    warn!("rejecting connection from {} (limit exceeded)", remote);
                    self.enqueue_reset(&header, remote, local, data.len());
                },
            }
        } else {
            warn!("segment for unknown flow ({} -> {})", remote, local);
            self.enqueue_reset(&header, remote, local, data.len());
        }

        Ok(events)
    }

    fn collect_events(&self, ccb: &Rc<ControlBlock>, events: &mut Vec<TcpEvent>) {
        if ccb.has_unread_data() {
            events.push(TcpEvent::Readable(ccb.clone()));
        }
        if let Some(listener) = self.listeners.borrow().get(&ccb.get_local()) {
            if listener.has_pending() {
                events.push(TcpEvent::Acceptable(listener.clone()));
            }
        }
    }

    //==========================================================================
    // Admission
    //==========================================================================

    /// Creates and registers a control block for an incoming connection,
    /// subject to the global and per-port gates. Returns `None` (with the
    /// rejection counted) when either gate refuses.
    fn register_tcb(&self, key: FlowKey, listener: &Rc<Listener>) -> Option<Rc<ControlBlock>> {
        let port: u16 = key.local.port();

        {
            let mut port_stats = self.port_stats.borrow_mut();
            let stats: &mut PortStats = port_stats.entry(port).or_insert_with(|| {
                let max: u32 = limits::port_connection_limit(port) as u32;
                info!("port {} connection limit: {}", port, max);
                PortStats {
                    max,
                    ..Default::default()
                }
            });

            if self.tcbs.borrow().len() >= self.max_connections {
                warn!(
                    "global connection limit exceeded (current={}, max={}, remote={})",
                    self.tcbs.borrow().len(),
                    self.max_connections,
                    key.remote
                );
                stats.total_rejected += 1;
                return None;
            }

            if stats.current >= stats.max {
                warn!(
                    "port {} connection limit exceeded (current={}, max={}, remote={})",
                    port, stats.current, stats.max, key.remote
                );
                stats.total_rejected += 1;
                return None;
            }
        }

        let isn: SeqNumber = self.isn_generator.borrow_mut().generate(&key.local, &key.remote);
        let ccb: Rc<ControlBlock> = Rc::new(ControlBlock::new(
            key.local,
            key.remote,
            isn,
            crate::protocols::tcp::constants::DEFAULT_MSS,
            self.active_tcbs.clone(),
            Some(Rc::downgrade(listener)),
        ));
        self.tcbs.borrow_mut().insert(key, ccb.clone());

        self.total_connections_created.set(self.total_connections_created.get() + 1);
        let current: u32 = self.tcbs.borrow().len() as u32;
        if current > self.peak_connections.get() {
            self.peak_connections.set(current);
        }

        let mut port_stats = self.port_stats.borrow_mut();
        let stats: &mut PortStats = port_stats.get_mut(&port).expect("stats entry created above");
        stats.current += 1;
        stats.total_created += 1;
        if stats.current > stats.peak {
            stats.peak = stats.current;
        }
        debug!(
            "registered connection {} -> {} (global {}/{}, port {} {}/{})",
            key.remote, key.local, current, self.max_connections, port, stats.current, stats.max
        );

        Some(ccb)
    }

    /// Queues a reset for a segment that reached no connection (RFC 793
    /// reset generation).
    fn enqueue_reset(&self, header: &TcpHeader, remote: SocketAddrV4, local: SocketAddrV4, data_len: usize) {
        let mut seg_len: u32 = data_len as u32;
        if header.syn {
            seg_len += 1;
        }
        if header.fin {
            seg_len += 1;
        }

        let mut out: TcpHeader = TcpHeader::new(local.port(), remote.port());
        out.rst = true;
        if header.ack {
            out.seq_num = header.ack_num;
        } else {
            out.seq_num = SeqNumber::from(0);
            out.ack = true;
            out.ack_num = header.seq_num + SeqNumber::from(seg_len);
        }
        debug!("queueing RST to {} (seq={}, ack={})", remote, out.seq_num, out.ack_num);
        self.pending_resets.borrow_mut().push_back(TcpSegment {
            remote,
            local,
            header: out,
            data: None,
            retransmit: false,
        });
    }

    //==========================================================================
    // Egress
    //==========================================================================

    /// Returns the next segment to put on the wire: owed resets first, then
    /// segments from connections with pending work. A connection that yields
    /// nothing is not re-queued; one that yields and still has work is.
    pub fn gather_packet(&self) -> Option<TcpSegment> {
        if let Some(segment) = self.pending_resets.borrow_mut().pop_front() {
            return Some(segment);
        }

        loop {
            let next: Option<Rc<ControlBlock>> = self.active_tcbs.borrow_mut().pop_front();
            let ccb: Rc<ControlBlock> = next?;
            if let Some(segment) = ccb.gather_segment() {
                ccb.track_sent_segment(&segment);
                if ccb.wants_transmit() {
                    self.active_tcbs.borrow_mut().push_back(ccb);
                }
                return Some(segment);
            }
        }
    }

    //==========================================================================
    // Cleanup
    //==========================================================================

    /// Sweeps CLOSED connections out of the registry, releasing their port
    /// slots. Returns how many were removed.
    pub fn cleanup_closed_connections(&self) -> usize {
        let mut removed: usize = 0;
        self.tcbs.borrow_mut().retain(|key, ccb| {
            if ccb.state() == State::Closed {
                debug!("sweeping closed connection {} -> {}", key.remote, key.local);
                if let Some(stats) = self.port_stats.borrow_mut().get_mut(&key.local.port()) {
                    if stats.current > 0 {
                        stats.current -= 1;
                    }
                }
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!("swept {} closed connections", removed);
        }
        removed
    }

    //==========================================================================
    // Statistics
    //==========================================================================

    pub fn current_connections(&self) -> usize {
        self.tcbs.borrow().len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn is_at_capacity(&self) -> bool {
        self.tcbs.borrow().len() >= self.max_connections
    }

    pub fn peak_connections(&self) -> u32 {
        self.peak_connections.get()
    }

    pub fn total_connections_created(&self) -> u32 {
        self.total_connections_created.get()
    }

    /// Statistics for `port`; zeroes if the port has never seen a connection.
    pub fn port_stats(&self, port: u16) -> PortStats {
        self.port_stats.borrow().get(&port).copied().unwrap_or_default()
    }

    /// Looks up the control block for a flow.
    pub fn get_tcb(&self, key: &FlowKey) -> Option<Rc<ControlBlock>> {
        self.tcbs.borrow().get(key).cloned()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for TcbManager {
    fn default() -> Self {
        Self::new()
    }
}
