// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::ip::IpProtocol,
    runtime::{
        fail::Fail,
        memory::DataBuffer,
    },
};
use ::libc::{
    EBADMSG,
    ENOTSUP,
};
use ::std::{
    convert::{
        TryFrom,
        TryInto,
    },
    net::Ipv4Addr,
};

//==============================================================================
// Constants
//==============================================================================

/// Size of an IPv4 header without options (in bytes). This stack neither emits
/// nor accepts IPv4 options.
pub const IPV4_HEADER_SIZE: usize = 20;

/// IPv4 header length in 32-bit words when no options are present.
const IPV4_IHL_NO_OPTIONS: u8 = (IPV4_HEADER_SIZE as u8) / 4;

/// Default time to live value.
const DEFAULT_IPV4_TTL: u8 = 255;

/// Version number for IPv4.
const IPV4_VERSION: u8 = 4;

/// IPv4 Control Flag: Don't Fragment.
const IPV4_CTRL_FLAG_DF: u8 = 0x2;

/// IPv4 Control Flag: More Fragments.
const IPV4_CTRL_FLAG_MF: u8 = 0x1;

//==============================================================================
// Structures
//==============================================================================

/// IPv4 datagram header.
#[derive(Debug, Copy, Clone)]
pub struct Ipv4Header {
    /// Internet header length (4 bits), in 32-bit words.
    ihl: u8,
    /// Control flags (3 bits).
    flags: u8,
    /// Time to live (8 bits).
    ttl: u8,
    /// Protocol carried in the data portion (8 bits).
    protocol: IpProtocol,
    /// Source IP address (32 bits).
    src_addr: Ipv4Addr,
    /// Destination IP address (32 bits).
    dst_addr: Ipv4Addr,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Ipv4Header {
    /// Instantiates a header for an outgoing datagram.
    pub fn new(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, protocol: IpProtocol) -> Self {
        Self {
            ihl: IPV4_IHL_NO_OPTIONS,
            flags: IPV4_CTRL_FLAG_DF,
            ttl: DEFAULT_IPV4_TTL,
            protocol,
            src_addr,
            dst_addr,
        }
    }

    pub fn compute_size(&self) -> usize {
        (self.ihl as usize) << 2
    }

    /// Parses a buffer into an IPv4 header and payload.
    pub fn parse(mut buf: DataBuffer) -> Result<(Self, DataBuffer), Fail> {
        if buf.len() < IPV4_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too small"));
        }

        let version: u8 = buf[0] >> 4;
        if version != IPV4_VERSION {
            return Err(Fail::new(ENOTSUP, "unsupported IP version"));
        }

        let ihl: u8 = buf[0] & 0xF;
        let hdr_size: usize = (ihl as usize) << 2;
        if hdr_size < IPV4_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "ipv4 IHL is too small"));
        }
        if buf.len() < hdr_size {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too small to fit in header"));
        }
        let hdr_buf: &[u8] = &buf[..hdr_size];

        let total_length: usize = u16::from_be_bytes([hdr_buf[2], hdr_buf[3]]) as usize;
        if total_length < hdr_size {
            return Err(Fail::new(EBADMSG, "ipv4 datagram smaller than header"));
        }
        // Note: the link layer may have padded the frame past total_length.
        if total_length > buf.len() {
            return Err(Fail::new(EBADMSG, "ipv4 datagram size mismatch"));
        }

        let flags: u8 = hdr_buf[6] >> 5;
        let fragment_offset: u16 = u16::from_be_bytes([hdr_buf[6], hdr_buf[7]]) & 0x1fff;
        if flags & IPV4_CTRL_FLAG_MF != 0 || fragment_offset != 0 {
            return Err(Fail::new(ENOTSUP, "ipv4 fragmentation is not supported"));
        }

        let ttl: u8 = hdr_buf[8];
        if ttl == 0 {
            return Err(Fail::new(EBADMSG, "ipv4 datagram too old"));
        }

        let protocol: IpProtocol = IpProtocol::try_from(hdr_buf[9])?;

        let header_checksum: u16 = u16::from_be_bytes([hdr_buf[10], hdr_buf[11]]);
        if header_checksum != Self::compute_checksum(hdr_buf) {
            return Err(Fail::new(EBADMSG, "ipv4 checksum mismatch"));
        }

        let src_addr: Ipv4Addr = Ipv4Addr::new(hdr_buf[12], hdr_buf[13], hdr_buf[14], hdr_buf[15]);
        let dst_addr: Ipv4Addr = Ipv4Addr::new(hdr_buf[16], hdr_buf[17], hdr_buf[18], hdr_buf[19]);

        let padding_bytes: usize = buf.len() - total_length;
        buf.adjust(hdr_size)?;
        buf.trim(padding_bytes)?;

        let header: Ipv4Header = Self {
            ihl,
            flags,
            ttl,
            protocol,
            src_addr,
            dst_addr,
        };

        Ok((header, buf))
    }

    /// Serializes the header into the first 20 bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8], payload_len: usize) {
        let buf: &mut [u8; IPV4_HEADER_SIZE] = (&mut buf[..IPV4_HEADER_SIZE])
            .try_into()
            .expect("buffer should be large enough to hold an IPv4 header");

        buf[0] = (IPV4_VERSION << 4) | self.ihl;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&((IPV4_HEADER_SIZE + payload_len) as u16).to_be_bytes());
        // Identification.
        buf[4..6].copy_from_slice(&0u16.to_be_bytes());
        buf[6..8].copy_from_slice(&((self.flags as u16) << 13).to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol as u8;
        // Skip the checksum (bytes 10..12) until the header is complete.
        buf[12..16].copy_from_slice(&self.src_addr.octets());
        buf[16..20].copy_from_slice(&self.dst_addr.octets());

        let checksum: u16 = Self::compute_checksum(buf);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn get_src_addr(&self) -> Ipv4Addr {
        self.src_addr
    }

    pub fn get_dest_addr(&self) -> Ipv4Addr {
        self.dst_addr
    }

    pub fn get_protocol(&self) -> IpProtocol {
        self.protocol
    }

    /// Computes the internet checksum over an option-less IPv4 header, skipping
    /// the checksum field itself.
    pub fn compute_checksum(buf: &[u8]) -> u16 {
        let mut state: u32 = 0xffff;
        for i in 0..5 {
            state += u16::from_be_bytes([buf[2 * i], buf[2 * i + 1]]) as u32;
        }
        for i in 6..10 {
            state += u16::from_be_bytes([buf[2 * i], buf[2 * i + 1]]) as u32;
        }
        while state > 0xffff {
            state -= 0xffff;
        }
        !state as u16
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
