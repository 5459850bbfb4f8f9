// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    macaddr::MacAddress,
    memory::DataBuffer,
};
use ::libc::EBADMSG;
use ::std::convert::{
    TryFrom,
    TryInto,
};

//==============================================================================
// Constants
//==============================================================================

pub const ETHERNET2_HEADER_SIZE: usize = 14;

//==============================================================================
// Structures
//==============================================================================

/// EtherType values understood by this stack.
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EtherType2 {
    Arp = 0x806,
    Ipv4 = 0x800,
}

/// Ethernet II frame header.
#[derive(Clone, Copy, Debug)]
pub struct Ethernet2Header {
    // Bytes 0..6.
    dst_addr: MacAddress,
    // Bytes 6..12.
    src_addr: MacAddress,
    // Bytes 12..14.
    ether_type: EtherType2,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Ethernet2Header {
    pub fn new(dst_addr: MacAddress, src_addr: MacAddress, ether_type: EtherType2) -> Self {
        Self {
            dst_addr,
            src_addr,
            ether_type,
        }
    }

    pub fn compute_size(&self) -> usize {
        ETHERNET2_HEADER_SIZE
    }

    /// Strips an Ethernet II header off the front of `buf`.
    pub fn parse(mut buf: DataBuffer) -> Result<(Self, DataBuffer), Fail> {
        if buf.len() < ETHERNET2_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "frame too small"));
        }
        let hdr_buf: &[u8] = &buf[..ETHERNET2_HEADER_SIZE];
        let dst_addr: MacAddress = MacAddress::from_bytes(&hdr_buf[0..6]);
        let src_addr: MacAddress = MacAddress::from_bytes(&hdr_buf[6..12]);
        let ether_type: EtherType2 = EtherType2::try_from(u16::from_be_bytes([hdr_buf[12], hdr_buf[13]]))?;
        let hdr: Ethernet2Header = Self {
            dst_addr,
            src_addr,
            ether_type,
        };

        buf.adjust(ETHERNET2_HEADER_SIZE)?;
        Ok((hdr, buf))
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        let buf: &mut [u8; ETHERNET2_HEADER_SIZE] = (&mut buf[..ETHERNET2_HEADER_SIZE]).try_into().unwrap();
        buf[0..6].copy_from_slice(&self.dst_addr.octets());
        buf[6..12].copy_from_slice(&self.src_addr.octets());
        buf[12..14].copy_from_slice(&(self.ether_type as u16).to_be_bytes());
    }

    pub fn dst_addr(&self) -> MacAddress {
        self.dst_addr
    }

    pub fn src_addr(&self) -> MacAddress {
        self.src_addr
    }

    pub fn ether_type(&self) -> EtherType2 {
        self.ether_type
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl TryFrom<u16> for EtherType2 {
    type Error = Fail;

    fn try_from(n: u16) -> Result<Self, Fail> {
        match n {
            0x806 => Ok(EtherType2::Arp),
            0x800 => Ok(EtherType2::Ipv4),
            _ => Err(Fail::new(libc::ENOTSUP, "unsupported ether type")),
        }
    }
}
