// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::tcp::{
        ControlBlock,
        FlowKey,
        Listener,
        TcbManager,
        TcpEvent,
    },
    runtime::{
        fail::Fail,
        memory::DataBuffer,
    },
};
use ::libc::{
    EADDRINUSE,
    EBADF,
    EINVAL,
    EPROTONOSUPPORT,
    EWOULDBLOCK,
    IPPROTO_TCP,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::{
        BTreeSet,
        HashMap,
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

/// What a socket handle resolves to. A handle is exactly one of these, never
/// both a connection and a listener.
enum Socket {
    /// Bound but neither listening nor connected.
    Inactive { local: SocketAddrV4 },
    /// Passive socket.
    Listening { listener: Rc<Listener> },
    /// Accepted connection.
    Established { ccb: Rc<ControlBlock> },
}

/// The socket surface: translates integer handles into connections and
/// listeners, and turns protocol readiness into per-tick sets the event loop
/// fans out to application callbacks.
///
/// Every call is non-blocking; "try again" comes back as `EWOULDBLOCK`.
pub struct SocketTable {
    next_fd: Cell<i32>,
    sockets: RefCell<HashMap<i32, Socket>>,
    // Reverse maps from protocol objects to handles, for the mark hooks.
    flows: RefCell<HashMap<FlowKey, i32>>,
    endpoints: RefCell<HashMap<SocketAddrV4, i32>>,
    // Per-tick readiness, cleared by the event loop at each iteration.
    readable_sockets: RefCell<BTreeSet<i32>>,
    acceptable_listeners: RefCell<BTreeSet<i32>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl SocketTable {
    pub fn new() -> Self {
        Self {
            next_fd: Cell::new(1),
            sockets: RefCell::new(HashMap::new()),
            flows: RefCell::new(HashMap::new()),
            endpoints: RefCell::new(HashMap::new()),
            readable_sockets: RefCell::new(BTreeSet::new()),
            acceptable_listeners: RefCell::new(BTreeSet::new()),
        }
    }

    fn alloc_fd(&self) -> i32 {
        let fd: i32 = self.next_fd.get();
        self.next_fd.set(fd + 1);
        fd
    }

    /// Creates a socket bound to `ipv4_addr`:`port`.
    pub fn socket(&self, proto: i32, ipv4_addr: Ipv4Addr, port: u16) -> Result<i32, Fail> {
        if proto != IPPROTO_TCP {
            return Err(Fail::new(EPROTONOSUPPORT, "only TCP is supported"));
        }
        let local: SocketAddrV4 = SocketAddrV4::new(ipv4_addr, port);
        let fd: i32 = self.alloc_fd();
        self.sockets.borrow_mut().insert(fd, Socket::Inactive { local });
        debug!("socket {} bound to {}", fd, local);
        Ok(fd)
    }

    /// Turns a bound socket into a listener and registers its endpoint with
    /// the connection manager.
    pub fn listen(&self, fd: i32, tcp: &TcbManager) -> Result<(), Fail> {
        let local: SocketAddrV4 = {
            let sockets = self.sockets.borrow();
            match sockets.get(&fd) {
                Some(Socket::Inactive { local }) => *local,
                Some(_) => return Err(Fail::new(EINVAL, "socket is not inactive")),
                None => return Err(Fail::new(EBADF, "no such socket")),
            }
        };
        if self.endpoints.borrow().contains_key(&local) {
            return Err(Fail::new(EADDRINUSE, "endpoint already has a listener"));
        }

        let listener: Rc<Listener> = Rc::new(Listener::new(local));
        tcp.listen(listener.clone());
        self.endpoints.borrow_mut().insert(local, fd);
        self.sockets.borrow_mut().insert(fd, Socket::Listening { listener });
        Ok(())
    }

    /// Pops the next fully-established connection off a listener, wrapping it
    /// in a fresh handle.
    pub fn accept(&self, fd: i32) -> Result<i32, Fail> {
        let listener: Rc<Listener> = {
            let sockets = self.sockets.borrow();
            match sockets.get(&fd) {
                Some(Socket::Listening { listener }) => listener.clone(),
                Some(_) => return Err(Fail::new(EINVAL, "socket is not listening")),
                None => return Err(Fail::new(EBADF, "no such socket")),
            }
        };
        let ccb: Rc<ControlBlock> = match listener.pop_acceptor() {
            Some(ccb) => ccb,
            None => return Err(Fail::new(EWOULDBLOCK, "no connection to accept")),
        };

        let new_fd: i32 = self.alloc_fd();
        self.flows.borrow_mut().insert(ccb.flow_key(), new_fd);
        debug!("accepted {} -> {} as socket {}", ccb.get_remote(), ccb.get_local(), new_fd);
        self.sockets.borrow_mut().insert(new_fd, Socket::Established { ccb });
        Ok(new_fd)
    }

    /// Copies received bytes into `buf`. Returns zero at end of stream and
    /// `EWOULDBLOCK` when nothing has arrived.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, Fail> {
        let ccb: Rc<ControlBlock> = self.established(fd)?;
        match ccb.pop(buf) {
            Some(len) => Ok(len),
            None => Err(Fail::new(EWOULDBLOCK, "no data available")),
        }
    }

    /// Enqueues `buf` for transmission, chopped into MSS-sized segments.
    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize, Fail> {
        let ccb: Rc<ControlBlock> = self.established(fd)?;
        let mss: usize = ccb.sender().mss();
        for chunk in buf.chunks(mss) {
            ccb.push(DataBuffer::from_slice(chunk))?;
        }
        Ok(buf.len())
    }

    /// Closes a handle. Connections get an orderly FIN; listeners are torn
    /// down immediately.
    pub fn close(&self, fd: i32, tcp: &TcbManager) -> Result<(), Fail> {
        let socket: Socket = match self.sockets.borrow_mut().remove(&fd) {
            Some(socket) => socket,
            None => return Err(Fail::new(EBADF, "no such socket")),
        };
        match socket {
            Socket::Established { ccb } => {
                self.flows.borrow_mut().remove(&ccb.flow_key());
                ccb.close()
            },
            Socket::Listening { listener } => {
                self.endpoints.borrow_mut().remove(&listener.endpoint());
                tcp.unlisten(listener.endpoint());
                Ok(())
            },
            Socket::Inactive { .. } => Ok(()),
        }
    }

    fn established(&self, fd: i32) -> Result<Rc<ControlBlock>, Fail> {
        let sockets = self.sockets.borrow();
        match sockets.get(&fd) {
            Some(Socket::Established { ccb }) => Ok(ccb.clone()),
            Some(_) => Err(Fail::new(EINVAL, "socket is not a connection")),
            None => Err(Fail::new(EBADF, "no such socket")),
        }
    }

    //==========================================================================
    // Readiness
    //==========================================================================

    /// Protocol-side hook: `ccb` has data for its socket. Idempotent within a
    /// tick. Connections not yet wrapped by a handle are skipped; their data
    /// waits in the receive queue until `accept` wires them up.
    pub fn mark_socket_readable(&self, ccb: &Rc<ControlBlock>) {
        if let Some(fd) = self.flows.borrow().get(&ccb.flow_key()) {
            self.readable_sockets.borrow_mut().insert(*fd);
        }
    }

    /// Protocol-side hook: `listener` has connections awaiting `accept`.
    pub fn mark_listener_acceptable(&self, listener: &Rc<Listener>) {
        if let Some(fd) = self.endpoints.borrow().get(&listener.endpoint()) {
            self.acceptable_listeners.borrow_mut().insert(*fd);
        }
    }

    /// Routes a readiness event from ingress processing to the mark hooks.
    pub fn handle_event(&self, event: &TcpEvent) {
        match event {
            TcpEvent::Readable(ccb) => self.mark_socket_readable(ccb),
            TcpEvent::Acceptable(listener) => self.mark_listener_acceptable(listener),
        }
    }

    /// Clears the per-tick readiness sets.
    pub fn clear_ready(&self) {
        self.readable_sockets.borrow_mut().clear();
        self.acceptable_listeners.borrow_mut().clear();
    }

    /// Drains the readiness sets: (acceptable listeners, readable sockets).
    pub fn take_ready(&self) -> (Vec<i32>, Vec<i32>) {
        let acceptable: Vec<i32> = self.acceptable_listeners.borrow_mut().iter().copied().collect();
        let readable: Vec<i32> = self.readable_sockets.borrow_mut().iter().copied().collect();
        self.clear_ready();
        (acceptable, readable)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::SocketTable;
    use crate::protocols::tcp::{
        tests::setup::{
            ack_header,
            gather_all,
            inject,
            syn_header,
            LOCAL_IP,
            REMOTE_IP,
        },
        SeqNumber,
        TcbManager,
        TcpEvent,
        TcpSegment,
    };
    use ::anyhow::Result;
    use ::libc::{
        EWOULDBLOCK,
        IPPROTO_TCP,
    };
    use ::std::net::SocketAddrV4;

    fn mark_all(table: &SocketTable, events: &[TcpEvent]) {
        for event in events {
            table.handle_event(event);
        }
    }

    /// The full passive-open path through the surface: the handshake raises
    /// acceptability, `accept` hands out a fresh handle, and a single data
    /// segment delivers exactly its payload to `read`.
    #[test]
    fn accept_then_read_delivers_payload() -> Result<()> {
        let tcp: TcbManager = TcbManager::with_max_connections(8);
        let table: SocketTable = SocketTable::new();

        let listen_fd: i32 = table.socket(IPPROTO_TCP, LOCAL_IP, 30201)?;
        table.listen(listen_fd, &tcp)?;
        crate::ensure_eq!(table.accept(listen_fd).unwrap_err().errno, EWOULDBLOCK);

        let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 51000);
        let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30201);
        let events: Vec<TcpEvent> = inject(&tcp, remote, local, syn_header(remote, local, 100), &[])?;
        mark_all(&table, &events);
        gather_all(&tcp);

        // Nothing is acceptable until the handshake completes.
        crate::ensure_eq!(table.take_ready().0.is_empty(), true);

        let events: Vec<TcpEvent> = inject(
            &tcp,
            remote,
            local,
            ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(1)),
            &[],
        )?;
        mark_all(&table, &events);
        let (acceptable, readable): (Vec<i32>, Vec<i32>) = table.take_ready();
        crate::ensure_eq!(acceptable, vec![listen_fd]);
        crate::ensure_eq!(readable.is_empty(), true);

        let conn_fd: i32 = table.accept(listen_fd)?;
        crate::ensure_eq!(table.accept(listen_fd).unwrap_err().errno, EWOULDBLOCK);

        // One data segment, one readable mark, exactly five bytes out.
        let events: Vec<TcpEvent> = inject(
            &tcp,
            remote,
            local,
            ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(1)),
            b"HELLO",
        )?;
        mark_all(&table, &events);
        let (_, readable): (Vec<i32>, Vec<i32>) = table.take_ready();
        crate::ensure_eq!(readable.contains(&conn_fd), true);

        let mut buf: [u8; 32] = [0; 32];
        crate::ensure_eq!(table.read(conn_fd, &mut buf)?, 5);
        crate::ensure_eq!(&buf[..5], b"HELLO");
        crate::ensure_eq!(table.read(conn_fd, &mut buf).unwrap_err().errno, EWOULDBLOCK);
        Ok(())
    }

    /// `write` chops application buffers into MSS-sized segments and the
    /// transport carries them out in order.
    #[test]
    fn write_emits_mss_sized_segments() -> Result<()> {
        let tcp: TcbManager = TcbManager::with_max_connections(8);
        let table: SocketTable = SocketTable::new();

        let listen_fd: i32 = table.socket(IPPROTO_TCP, LOCAL_IP, 30202)?;
        table.listen(listen_fd, &tcp)?;

        let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 51001);
        let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30202);
        inject(&tcp, remote, local, syn_header(remote, local, 100), &[])?;
        gather_all(&tcp);
        inject(
            &tcp,
            remote,
            local,
            ack_header(remote, local, SeqNumber::from(101), SeqNumber::from(1)),
            &[],
        )?;
        let conn_fd: i32 = table.accept(listen_fd)?;

        crate::ensure_eq!(table.write(conn_fd, b"WORLD")?, 5);
        let segments: Vec<TcpSegment> = gather_all(&tcp);
        crate::ensure_eq!(segments.len(), 1);
        crate::ensure_eq!(segments[0].header.seq_num, SeqNumber::from(1));
        let payload = segments[0].data.as_ref().unwrap();
        crate::ensure_eq!(&payload[..], b"WORLD");
        Ok(())
    }

    /// Closing a listener tears its endpoint down; later SYNs are refused.
    #[test]
    fn closed_listener_stops_admitting() -> Result<()> {
        let tcp: TcbManager = TcbManager::with_max_connections(8);
        let table: SocketTable = SocketTable::new();

        let listen_fd: i32 = table.socket(IPPROTO_TCP, LOCAL_IP, 30203)?;
        table.listen(listen_fd, &tcp)?;
        table.close(listen_fd, &tcp)?;

        let remote: SocketAddrV4 = SocketAddrV4::new(REMOTE_IP, 51002);
        let local: SocketAddrV4 = SocketAddrV4::new(LOCAL_IP, 30203);
        inject(&tcp, remote, local, syn_header(remote, local, 100), &[])?;
        crate::ensure_eq!(tcp.current_connections(), 0);

        let segments: Vec<TcpSegment> = gather_all(&tcp);
        crate::ensure_eq!(segments.len(), 1);
        crate::ensure_eq!(segments[0].header.rst, true);
        Ok(())
    }
}
