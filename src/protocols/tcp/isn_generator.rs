// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::protocols::tcp::SeqNumber;
#[allow(unused_imports)]
use ::std::{
    net::SocketAddrV4,
    num::Wrapping,
};

/// Initial sequence number generator.
///
/// Hashes the four-tuple together with a per-process nonce, so distinct flows
/// start far apart while reincarnations of the same flow stay predictable
/// within a process. Not RFC 6528; good enough for a userspace stack that does
/// not face the open internet.
#[allow(dead_code)]
pub struct IsnGenerator {
    nonce: u32,
    counter: Wrapping<u16>,
}

impl IsnGenerator {
    pub fn new(nonce: u32) -> Self {
        Self {
            nonce,
            counter: Wrapping(0),
        }
    }

    #[cfg(test)]
    pub fn generate(&mut self, _local: &SocketAddrV4, _remote: &SocketAddrV4) -> SeqNumber {
        SeqNumber::from(0)
    }

    #[cfg(not(test))]
    pub fn generate(&mut self, local: &SocketAddrV4, remote: &SocketAddrV4) -> SeqNumber {
        let crc: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_CKSUM);
        let mut digest = crc.digest();
        digest.update(&remote.ip().octets());
        digest.update(&remote.port().to_be_bytes());
        digest.update(&local.ip().octets());
        digest.update(&local.port().to_be_bytes());
        digest.update(&self.nonce.to_be_bytes());
        let digest: u32 = digest.finalize();
        let isn: SeqNumber = SeqNumber::from(digest.wrapping_add(self.counter.0 as u32));
        self.counter += Wrapping(1);
        isn
    }
}
