// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod event_loop;
pub mod socket;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    nic::TunTapDevice,
    protocols::{
        arp::{
            ArpPacket,
            ArpPeer,
            ARP_PACKET_SIZE,
        },
        ethernet2::{
            EtherType2,
            Ethernet2Header,
            ETHERNET2_HEADER_SIZE,
        },
        icmpv4,
        ip::IpProtocol,
        ipv4::{
            Ipv4Header,
            IPV4_HEADER_SIZE,
        },
        tcp::{
            TcbManager,
            TcpEvent,
            TcpSegment,
        },
    },
    runtime::{
        fail::Fail,
        logging,
        macaddr::MacAddress,
        memory::DataBuffer,
    },
    stack::{
        event_loop::EventLoop,
        socket::SocketTable,
    },
};
use ::libc::EHOSTUNREACH;
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    net::Ipv4Addr,
    rc::Rc,
};

//==============================================================================
// Constants
//==============================================================================

/// Largest frame we expect from the device (1500 MTU plus Ethernet header,
/// rounded up).
const MAX_FRAME_SIZE: usize = 2048;

/// Readiness poll timeout, which is also the loop's housekeeping tick.
const POLL_TIMEOUT_MS: i32 = 100;

//==============================================================================
// Structures
//==============================================================================

struct StackInner {
    device: TunTapDevice,
    local_link_addr: MacAddress,
    local_ipv4_addr: Ipv4Addr,
    arp: ArpPeer,
    tcp: TcbManager,
    sockets: SocketTable,
    event_loop: EventLoop,
    // Fully-framed packets awaiting a writable device (ARP and ICMP replies,
    // plus any TCP frame that hit a would-block write).
    outbox: RefCell<VecDeque<DataBuffer>>,
}

/// The assembled stack: TAP device at the bottom, Ethernet/ARP/IPv4/ICMPv4
/// framing, the TCP transport core, and the socket surface on top, all driven
/// by a single poll-based event loop.
///
/// Cheap to clone; clones share the same stack instance. Single-threaded by
/// design, so there are no locks anywhere below.
#[derive(Clone)]
pub struct TapStack {
    inner: Rc<StackInner>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TapStack {
    /// Opens the TAP interface `iface` and assembles the stack on it.
    pub fn new(iface: &str, local_link_addr: MacAddress, local_ipv4_addr: Ipv4Addr) -> Result<Self, Fail> {
        logging::initialize();
        let device: TunTapDevice = TunTapDevice::open(iface)?;
        info!("stack on {} ({}, {})", iface, local_ipv4_addr, local_link_addr);
        Ok(Self {
            inner: Rc::new(StackInner {
                device,
                local_link_addr,
                local_ipv4_addr,
                arp: ArpPeer::new(local_link_addr, local_ipv4_addr),
                tcp: TcbManager::new(),
                sockets: SocketTable::new(),
                event_loop: EventLoop::new(),
                outbox: RefCell::new(VecDeque::new()),
            }),
        })
    }

    //==========================================================================
    // Application API
    //==========================================================================

    pub fn socket(&self, proto: i32, ipv4_addr: Ipv4Addr, port: u16) -> Result<i32, Fail> {
        self.inner.sockets.socket(proto, ipv4_addr, port)
    }

    pub fn listen(&self, fd: i32) -> Result<(), Fail> {
        self.inner.sockets.listen(fd, &self.inner.tcp)
    }

    pub fn accept(&self, fd: i32) -> Result<i32, Fail> {
        self.inner.sockets.accept(fd)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, Fail> {
        self.inner.sockets.read(fd, buf)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize, Fail> {
        self.inner.sockets.write(fd, buf)
    }

    pub fn close(&self, fd: i32) -> Result<(), Fail> {
        self.inner.event_loop.unregister_callbacks(fd);
        self.inner.sockets.close(fd, &self.inner.tcp)
    }

    pub fn register_accept_callback(&self, fd: i32, cb: impl FnMut() + 'static) {
        self.inner.event_loop.register_accept_callback(fd, Box::new(cb));
    }

    pub fn register_read_callback(&self, fd: i32, cb: impl FnMut() + 'static) {
        self.inner.event_loop.register_read_callback(fd, Box::new(cb));
    }

    /// Requests the event loop to exit at the next iteration boundary.
    pub fn stop(&self) {
        self.inner.event_loop.stop();
    }

    //==========================================================================
    // Event loop
    //==========================================================================

    /// Runs the event loop until `stop` is called. One iteration: poll the
    /// device (100 ms tick), drain ingress frames, drain egress segments,
    /// sweep closed connections, then fire application callbacks for
    /// whatever became ready.
    pub fn run(&self) {
        self.inner.event_loop.set_running(true);
        info!("event loop started");

        let mut frame: Vec<u8> = vec![0; MAX_FRAME_SIZE];
        while self.inner.event_loop.is_running() {
            self.inner.sockets.clear_ready();

            let mut pollfd: libc::pollfd = libc::pollfd {
                fd: self.inner.device.fd(),
                events: libc::POLLIN | libc::POLLOUT,
                revents: 0,
            };
            let nfds: i32 = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
            if nfds < 0 {
                error!("poll failed: {:?}", Fail::last_os_error("poll"));
                break;
            }
            if nfds > 0 {
                if pollfd.revents & libc::POLLIN != 0 {
                    self.poll_ingress(&mut frame);
                }
                if pollfd.revents & libc::POLLOUT != 0 {
                    self.poll_egress();
                }
            }

            self.inner.tcp.cleanup_closed_connections();

            let (acceptable, readable): (Vec<i32>, Vec<i32>) = self.inner.sockets.take_ready();
            self.inner.event_loop.dispatch(&acceptable, &readable);
        }

        info!("event loop stopped");
    }

    fn poll_ingress(&self, frame: &mut [u8]) {
        loop {
            match self.inner.device.recv(frame) {
                Ok(0) => break,
                Ok(len) => {
                    if let Err(e) = self.process_frame(&frame[..len]) {
                        debug!("dropped frame: {:?}", e);
                    }
                },
                Err(e) if e.errno == libc::EWOULDBLOCK => break,
                Err(e) => {
                    warn!("device receive failed: {:?}", e);
                    break;
                },
            }
        }
    }

    /// Demultiplexes one frame up the layers.
    fn process_frame(&self, frame: &[u8]) -> Result<(), Fail> {
        let (eth_header, payload): (Ethernet2Header, DataBuffer) =
            Ethernet2Header::parse(DataBuffer::from_slice(frame))?;
        if eth_header.dst_addr() != self.inner.local_link_addr && !eth_header.dst_addr().is_broadcast() {
            return Ok(());
        }

        match eth_header.ether_type() {
            EtherType2::Arp => {
                let pkt: ArpPacket = ArpPacket::parse(&payload)?;
                if let Some(reply) = self.inner.arp.receive(pkt) {
                    let frame: DataBuffer = self.frame_arp(&reply);
                    self.inner.outbox.borrow_mut().push_back(frame);
                }
                Ok(())
            },
            EtherType2::Ipv4 => {
                let (ip_header, payload): (Ipv4Header, DataBuffer) = Ipv4Header::parse(payload)?;
                if ip_header.get_dest_addr() != self.inner.local_ipv4_addr {
                    return Ok(());
                }
                // Remember the sender's link address so egress to it never
                // has to wait on an ARP exchange.
                self.inner.arp.insert(ip_header.get_src_addr(), eth_header.src_addr());

                match ip_header.get_protocol() {
                    IpProtocol::ICMPv4 => {
                        if let Some(reply) = icmpv4::receive(payload)? {
                            let frame: DataBuffer =
                                self.frame_ipv4(ip_header.get_src_addr(), IpProtocol::ICMPv4, &reply)?;
                            self.inner.outbox.borrow_mut().push_back(frame);
                        }
                        Ok(())
                    },
                    IpProtocol::TCP => {
                        let events: Vec<TcpEvent> =
                            self.inner
                                .tcp
                                .receive(ip_header.get_src_addr(), ip_header.get_dest_addr(), payload)?;
                        for event in &events {
                            self.inner.sockets.handle_event(event);
                        }
                        Ok(())
                    },
                }
            },
        }
    }

    /// Drains pending frames, then the transport's segment queue, until the
    /// device pushes back or there is nothing left to send.
    fn poll_egress(&self) {
        loop {
            let pending: Option<DataBuffer> = self.inner.outbox.borrow_mut().pop_front();
            match pending {
                Some(frame) => {
                    if !self.send_frame(frame) {
                        return;
                    }
                },
                None => break,
            }
        }

        while let Some(segment) = self.inner.tcp.gather_packet() {
            match self.frame_tcp_segment(&segment) {
                Ok(frame) => {
                    if !self.send_frame(frame) {
                        return;
                    }
                },
                Err(e) => warn!("dropping segment to {}: {:?}", segment.remote, e),
            }
        }
    }

    /// Writes one frame to the device. On a would-block, parks the frame on
    /// the outbox and reports false so the caller stops draining.
    fn send_frame(&self, frame: DataBuffer) -> bool {
        match self.inner.device.send(&frame) {
            Ok(_) => true,
            Err(e) if e.errno == libc::EWOULDBLOCK => {
                self.inner.outbox.borrow_mut().push_front(frame);
                false
            },
            Err(e) => {
                warn!("device send failed: {:?}", e);
                false
            },
        }
    }

    //==========================================================================
    // Framing
    //==========================================================================

    fn frame_arp(&self, pkt: &ArpPacket) -> DataBuffer {
        let mut frame: DataBuffer = DataBuffer::new(ETHERNET2_HEADER_SIZE + ARP_PACKET_SIZE);
        let eth_header: Ethernet2Header =
            Ethernet2Header::new(pkt.target_hardware_addr, self.inner.local_link_addr, EtherType2::Arp);
        eth_header.serialize(&mut frame[..ETHERNET2_HEADER_SIZE]);
        pkt.serialize(&mut frame[ETHERNET2_HEADER_SIZE..]);
        frame
    }

    /// Wraps `payload` in IPv4 and Ethernet headers bound for `dst_addr`.
    fn frame_ipv4(&self, dst_addr: Ipv4Addr, protocol: IpProtocol, payload: &[u8]) -> Result<DataBuffer, Fail> {
        let dst_link_addr: MacAddress = self
            .inner
            .arp
            .try_query(dst_addr)
            .ok_or_else(|| Fail::new(EHOSTUNREACH, "no ARP entry for destination"))?;

        let mut frame: DataBuffer = DataBuffer::new(ETHERNET2_HEADER_SIZE + IPV4_HEADER_SIZE + payload.len());
        let eth_header: Ethernet2Header =
            Ethernet2Header::new(dst_link_addr, self.inner.local_link_addr, EtherType2::Ipv4);
        eth_header.serialize(&mut frame[..ETHERNET2_HEADER_SIZE]);
        let ip_header: Ipv4Header = Ipv4Header::new(self.inner.local_ipv4_addr, dst_addr, protocol);
        ip_header.serialize(&mut frame[ETHERNET2_HEADER_SIZE..], payload.len());
        frame[ETHERNET2_HEADER_SIZE + IPV4_HEADER_SIZE..].copy_from_slice(payload);
        Ok(frame)
    }

    /// Serializes a TCP segment (header checksum included) and wraps it for
    /// the wire.
    fn frame_tcp_segment(&self, segment: &TcpSegment) -> Result<DataBuffer, Fail> {
        let dst_link_addr: MacAddress = self
            .inner
            .arp
            .try_query(*segment.remote.ip())
            .ok_or_else(|| Fail::new(EHOSTUNREACH, "no ARP entry for destination"))?;

        let tcp_hdr_size: usize = segment.header.compute_size();
        let data: &[u8] = match &segment.data {
            Some(buf) => &buf[..],
            None => &[],
        };
        let total: usize = ETHERNET2_HEADER_SIZE + IPV4_HEADER_SIZE + tcp_hdr_size + data.len();
        let mut frame: DataBuffer = DataBuffer::new(total);

        let eth_header: Ethernet2Header =
            Ethernet2Header::new(dst_link_addr, self.inner.local_link_addr, EtherType2::Ipv4);
        eth_header.serialize(&mut frame[..ETHERNET2_HEADER_SIZE]);

        let ip_header: Ipv4Header =
            Ipv4Header::new(*segment.local.ip(), *segment.remote.ip(), IpProtocol::TCP);
        ip_header.serialize(&mut frame[ETHERNET2_HEADER_SIZE..], tcp_hdr_size + data.len());

        let tcp_start: usize = ETHERNET2_HEADER_SIZE + IPV4_HEADER_SIZE;
        frame[tcp_start + tcp_hdr_size..].copy_from_slice(data);
        let (tcp_buf, data_buf) = frame[tcp_start..].split_at_mut(tcp_hdr_size);
        segment
            .header
            .serialize(tcp_buf, *segment.local.ip(), *segment.remote.ip(), data_buf);

        Ok(frame)
    }
}
