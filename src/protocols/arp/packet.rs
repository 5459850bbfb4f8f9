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
use ::libc::{
    EBADMSG,
    ENOTSUP,
};
use ::std::net::Ipv4Addr;

//==============================================================================
// Constants
//==============================================================================

/// Size of an ARP packet for IPv4 over Ethernet (in bytes).
pub const ARP_PACKET_SIZE: usize = 28;

/// Hardware type for Ethernet.
const ARP_HTYPE_ETHER2: u16 = 1;

/// Protocol type for IPv4.
const ARP_PTYPE_IPV4: u16 = 0x800;

//==============================================================================
// Structures
//==============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

/// ARP packet for IPv4 over Ethernet.
#[derive(Copy, Clone, Debug)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_hardware_addr: MacAddress,
    pub sender_protocol_addr: Ipv4Addr,
    pub target_hardware_addr: MacAddress,
    pub target_protocol_addr: Ipv4Addr,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl ArpPacket {
    pub fn parse(buf: &DataBuffer) -> Result<Self, Fail> {
        if buf.len() < ARP_PACKET_SIZE {
            return Err(Fail::new(EBADMSG, "arp packet too small"));
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != ARP_HTYPE_ETHER2 {
            return Err(Fail::new(ENOTSUP, "unsupported ARP hardware type"));
        }
        if u16::from_be_bytes([buf[2], buf[3]]) != ARP_PTYPE_IPV4 {
            return Err(Fail::new(ENOTSUP, "unsupported ARP protocol type"));
        }
        if buf[4] != 6 || buf[5] != 4 {
            return Err(Fail::new(EBADMSG, "bad ARP address lengths"));
        }
        let operation: ArpOperation = match u16::from_be_bytes([buf[6], buf[7]]) {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            _ => return Err(Fail::new(ENOTSUP, "unsupported ARP operation")),
        };
        Ok(Self {
            operation,
            sender_hardware_addr: MacAddress::from_bytes(&buf[8..14]),
            sender_protocol_addr: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            target_hardware_addr: MacAddress::from_bytes(&buf[18..24]),
            target_protocol_addr: Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]),
        })
    }

    pub fn serialize(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&ARP_HTYPE_ETHER2.to_be_bytes());
        buf[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_hardware_addr.octets());
        buf[14..18].copy_from_slice(&self.sender_protocol_addr.octets());
        buf[18..24].copy_from_slice(&self.target_hardware_addr.octets());
        buf[24..28].copy_from_slice(&self.target_protocol_addr.octets());
    }
}
