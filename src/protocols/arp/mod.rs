// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod packet;

pub use self::packet::{
    ArpOperation,
    ArpPacket,
    ARP_PACKET_SIZE,
};

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::macaddr::MacAddress;
use ::std::{
    cell::RefCell,
    collections::HashMap,
    net::Ipv4Addr,
};

//==============================================================================
// Structures
//==============================================================================

/// Address resolution for the local segment.
///
/// Replies to requests that target our protocol address and opportunistically
/// learns the sender mapping of every ARP packet that goes by. There is no
/// entry expiration: the peer on the far side of a TAP device is stable for
/// the lifetime of the process.
pub struct ArpPeer {
    local_link_addr: MacAddress,
    local_ipv4_addr: Ipv4Addr,
    cache: RefCell<HashMap<Ipv4Addr, MacAddress>>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl ArpPeer {
    pub fn new(local_link_addr: MacAddress, local_ipv4_addr: Ipv4Addr) -> Self {
        Self {
            local_link_addr,
            local_ipv4_addr,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Processes an incoming ARP packet, returning the reply to send, if any.
    pub fn receive(&self, pkt: ArpPacket) -> Option<ArpPacket> {
        // Learn the sender mapping regardless of operation (RFC 826 merge).
        self.insert(pkt.sender_protocol_addr, pkt.sender_hardware_addr);

        match pkt.operation {
            ArpOperation::Request if pkt.target_protocol_addr == self.local_ipv4_addr => {
                debug!("replying to ARP request from {}", pkt.sender_protocol_addr);
                Some(ArpPacket {
                    operation: ArpOperation::Reply,
                    sender_hardware_addr: self.local_link_addr,
                    sender_protocol_addr: self.local_ipv4_addr,
                    target_hardware_addr: pkt.sender_hardware_addr,
                    target_protocol_addr: pkt.sender_protocol_addr,
                })
            },
            ArpOperation::Request => None,
            ArpOperation::Reply => {
                debug!(
                    "learned ARP mapping {} -> {}",
                    pkt.sender_protocol_addr, pkt.sender_hardware_addr
                );
                None
            },
        }
    }

    pub fn insert(&self, ipv4_addr: Ipv4Addr, link_addr: MacAddress) {
        self.cache.borrow_mut().insert(ipv4_addr, link_addr);
    }

    /// Looks up the hardware address for `ipv4_addr` in the cache.
    pub fn try_query(&self, ipv4_addr: Ipv4Addr) -> Option<MacAddress> {
        self.cache.borrow().get(&ipv4_addr).copied()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{
        ArpOperation,
        ArpPacket,
        ArpPeer,
    };
    use crate::runtime::macaddr::MacAddress;
    use ::anyhow::Result;
    use ::std::net::Ipv4Addr;

    const LOCAL_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    const PEER_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

    #[test]
    fn request_for_local_address_yields_reply_and_learns_sender() -> Result<()> {
        let local_ip: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
        let peer_ip: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
        let peer: ArpPeer = ArpPeer::new(LOCAL_MAC, local_ip);

        let request: ArpPacket = ArpPacket {
            operation: ArpOperation::Request,
            sender_hardware_addr: PEER_MAC,
            sender_protocol_addr: peer_ip,
            target_hardware_addr: MacAddress::broadcast(),
            target_protocol_addr: local_ip,
        };

        let reply: ArpPacket = peer.receive(request).expect("request targeted our address");
        crate::ensure_eq!(reply.operation, ArpOperation::Reply);
        crate::ensure_eq!(reply.sender_hardware_addr, LOCAL_MAC);
        crate::ensure_eq!(reply.target_protocol_addr, peer_ip);
        crate::ensure_eq!(peer.try_query(peer_ip), Some(PEER_MAC));
        Ok(())
    }

    #[test]
    fn request_for_other_address_is_ignored() -> Result<()> {
        let peer: ArpPeer = ArpPeer::new(LOCAL_MAC, Ipv4Addr::new(192, 168, 1, 1));
        let request: ArpPacket = ArpPacket {
            operation: ArpOperation::Request,
            sender_hardware_addr: PEER_MAC,
            sender_protocol_addr: Ipv4Addr::new(192, 168, 1, 2),
            target_hardware_addr: MacAddress::broadcast(),
            target_protocol_addr: Ipv4Addr::new(192, 168, 1, 3),
        };
        crate::ensure_eq!(peer.receive(request).is_none(), true);
        Ok(())
    }
}
