// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::{
        ip::IpProtocol,
        tcp::SeqNumber,
    },
    runtime::{
        fail::Fail,
        memory::DataBuffer,
    },
};
use ::libc::EBADMSG;
use ::std::{
    convert::TryInto,
    net::{
        Ipv4Addr,
        SocketAddrV4,
    },
    slice::ChunksExact,
};

//==============================================================================
// Constants
//==============================================================================

pub const MIN_TCP_HEADER_SIZE: usize = 20;
pub const MAX_TCP_HEADER_SIZE: usize = 60;

//==============================================================================
// Structures
//==============================================================================

/// TCP segment header. The only option this stack understands (or emits) is
/// maximum segment size; anything else is skipped on parse.
#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: SeqNumber,
    pub ack_num: SeqNumber,

    // Octet 13: [ CWR ] [ ECE ] [ URG ] [ ACK ] [ PSH ] [ RST ] [ SYN ] [ FIN ]
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,

    pub window_size: u16,
    pub urgent_pointer: u16,

    /// Maximum segment size option, when present.
    pub mss: Option<u16>,
}

/// A TCP segment ready to cross the framing boundary, in either direction.
/// Framing below this layer prepends (or has stripped) the IPv4 and Ethernet
/// headers.
#[derive(Debug)]
pub struct TcpSegment {
    pub remote: SocketAddrV4,
    pub local: SocketAddrV4,
    pub header: TcpHeader,
    pub data: Option<DataBuffer>,
    /// Set on segments rebuilt from the retransmission queue so they are not
    /// tracked a second time.
    pub retransmit: bool,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num: SeqNumber::from(0),
            ack_num: SeqNumber::from(0),
            urg: false,
            ack: false,
            psh: false,
            rst: false,
            syn: false,
            fin: false,
            window_size: 0,
            urgent_pointer: 0,
            mss: None,
        }
    }

    /// Size of this header on the wire. The MSS option is exactly four bytes,
    /// so the result is always 32-bit aligned.
    pub fn compute_size(&self) -> usize {
        match self.mss {
            Some(_) => MIN_TCP_HEADER_SIZE + 4,
            None => MIN_TCP_HEADER_SIZE,
        }
    }

    /// Parses and strips a TCP header off the front of `buf`, verifying the
    /// checksum against the pseudo-header for `src_addr`/`dst_addr`.
    pub fn parse(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, mut buf: DataBuffer) -> Result<(Self, DataBuffer), Fail> {
        if buf.len() < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "tcp segment too small"));
        }
        let data_offset: usize = (buf[12] >> 4) as usize * 4;
        if data_offset < MIN_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "tcp data offset too small"));
        }
        if data_offset > MAX_TCP_HEADER_SIZE {
            return Err(Fail::new(EBADMSG, "tcp data offset too large"));
        }
        if buf.len() < data_offset {
            return Err(Fail::new(EBADMSG, "tcp segment smaller than data offset"));
        }
        let (hdr_buf, data_buf): (&[u8], &[u8]) = buf[..].split_at(data_offset);

        let src_port: u16 = u16::from_be_bytes([hdr_buf[0], hdr_buf[1]]);
        let dst_port: u16 = u16::from_be_bytes([hdr_buf[2], hdr_buf[3]]);
        let seq_num: SeqNumber = SeqNumber::from(u32::from_be_bytes([hdr_buf[4], hdr_buf[5], hdr_buf[6], hdr_buf[7]]));
        let ack_num: SeqNumber =
            SeqNumber::from(u32::from_be_bytes([hdr_buf[8], hdr_buf[9], hdr_buf[10], hdr_buf[11]]));

        let urg: bool = (hdr_buf[13] & (1 << 5)) != 0;
        let ack: bool = (hdr_buf[13] & (1 << 4)) != 0;
        let psh: bool = (hdr_buf[13] & (1 << 3)) != 0;
        let rst: bool = (hdr_buf[13] & (1 << 2)) != 0;
        let syn: bool = (hdr_buf[13] & (1 << 1)) != 0;
        let fin: bool = (hdr_buf[13] & (1 << 0)) != 0;

        let window_size: u16 = u16::from_be_bytes([hdr_buf[14], hdr_buf[15]]);

        let checksum: u16 = u16::from_be_bytes([hdr_buf[16], hdr_buf[17]]);
        if checksum != tcp_checksum(src_addr, dst_addr, hdr_buf, data_buf) {
            return Err(Fail::new(EBADMSG, "tcp checksum mismatch"));
        }

        let urgent_pointer: u16 = u16::from_be_bytes([hdr_buf[18], hdr_buf[19]]);

        let mut mss: Option<u16> = None;
        let mut i: usize = MIN_TCP_HEADER_SIZE;
        while i < data_offset {
            match hdr_buf[i] {
                // End of options list.
                0 => break,
                // No-operation.
                1 => i += 1,
                // Maximum segment size.
                2 => {
                    if i + 4 > data_offset || hdr_buf[i + 1] != 4 {
                        return Err(Fail::new(EBADMSG, "malformed MSS option"));
                    }
                    mss = Some(u16::from_be_bytes([hdr_buf[i + 2], hdr_buf[i + 3]]));
                    i += 4;
                },
                kind => {
                    // Skip options we do not understand.
                    if i + 1 >= data_offset {
                        return Err(Fail::new(EBADMSG, "truncated TCP option"));
                    }
                    let len: usize = hdr_buf[i + 1] as usize;
                    if len < 2 || i + len > data_offset {
                        return Err(Fail::new(EBADMSG, "malformed TCP option"));
                    }
                    trace!("skipping TCP option (kind={})", kind);
                    i += len;
                },
            }
        }

        let header: TcpHeader = Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            urg,
            ack,
            psh,
            rst,
            syn,
            fin,
            window_size,
            urgent_pointer,
            mss,
        };

        buf.adjust(data_offset)?;
        Ok((header, buf))
    }

    /// Serializes the header (including checksum over `data`) into the first
    /// `compute_size()` bytes of `buf`.
    pub fn serialize(&self, buf: &mut [u8], src_addr: Ipv4Addr, dst_addr: Ipv4Addr, data: &[u8]) {
        let hdr_size: usize = self.compute_size();
        let fixed_buf: &mut [u8; MIN_TCP_HEADER_SIZE] = (&mut buf[..MIN_TCP_HEADER_SIZE]).try_into().unwrap();

        fixed_buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        fixed_buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        fixed_buf[4..8].copy_from_slice(&u32::from(self.seq_num).to_be_bytes());
        fixed_buf[8..12].copy_from_slice(&u32::from(self.ack_num).to_be_bytes());
        fixed_buf[12] = ((hdr_size / 4) as u8) << 4;
        fixed_buf[13] = 0;
        if self.urg {
            fixed_buf[13] |= 1 << 5;
        }
        if self.ack {
            fixed_buf[13] |= 1 << 4;
        }
        if self.psh {
            fixed_buf[13] |= 1 << 3;
        }
        if self.rst {
            fixed_buf[13] |= 1 << 2;
        }
        if self.syn {
            fixed_buf[13] |= 1 << 1;
        }
        if self.fin {
            fixed_buf[13] |= 1 << 0;
        }
        fixed_buf[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        // Write the checksum (bytes 16..18) once the header is complete.
        fixed_buf[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        if let Some(mss) = self.mss {
            buf[20] = 2;
            buf[21] = 4;
            buf[22..24].copy_from_slice(&mss.to_be_bytes());
        }

        let checksum: u16 = tcp_checksum(src_addr, dst_addr, &buf[..hdr_size], data);
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
    }
}

impl TcpSegment {
    /// Sequence space consumed by this segment: payload bytes plus one each
    /// for SYN and FIN.
    pub fn segment_length(&self) -> u32 {
        let mut len: u32 = match &self.data {
            Some(buf) => buf.len() as u32,
            None => 0,
        };
        if self.header.syn {
            len += 1;
        }
        if self.header.fin {
            len += 1;
        }
        len
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// One's-complement checksum over the RFC 793 pseudo-header, the TCP header
/// (with a zeroed checksum field), and the payload.
pub fn tcp_checksum(src_addr: Ipv4Addr, dst_addr: Ipv4Addr, header: &[u8], data: &[u8]) -> u16 {
    let mut state: u32 = 0xffff;

    // Pseudo-header: source address, destination address, zero byte plus
    // protocol number, and TCP segment length.
    let src_octets: [u8; 4] = src_addr.octets();
    state += u16::from_be_bytes([src_octets[0], src_octets[1]]) as u32;
    state += u16::from_be_bytes([src_octets[2], src_octets[3]]) as u32;
    let dst_octets: [u8; 4] = dst_addr.octets();
    state += u16::from_be_bytes([dst_octets[0], dst_octets[1]]) as u32;
    state += u16::from_be_bytes([dst_octets[2], dst_octets[3]]) as u32;
    state += u16::from_be_bytes([0, IpProtocol::TCP as u8]) as u32;
    state += (header.len() + data.len()) as u32;

    // The header, skipping the checksum field (bytes 16..18). The data offset
    // is 32-bit aligned, so there is no remainder to deal with.
    for (i, chunk) in header.chunks_exact(2).enumerate() {
        if i == 8 {
            continue;
        }
        state += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // The payload, padding a trailing odd byte with zero.
    let mut chunks_iter: ChunksExact<u8> = data.chunks_exact(2);
    for chunk in chunks_iter.by_ref() {
        state += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&b) = chunks_iter.remainder().first() {
        state += u16::from_be_bytes([b, 0]) as u32;
    }

    while state > 0xffff {
        state -= 0xffff;
    }
    !state as u16
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{
        TcpHeader,
        MIN_TCP_HEADER_SIZE,
    };
    use crate::{
        protocols::tcp::SeqNumber,
        runtime::memory::DataBuffer,
    };
    use ::anyhow::Result;
    use ::std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    #[test]
    fn syn_with_mss_option() -> Result<()> {
        let mut hdr: TcpHeader = TcpHeader::new(12345, 30000);
        hdr.seq_num = SeqNumber::from(89);
        hdr.syn = true;
        hdr.window_size = 65535;
        hdr.mss = Some(1460);

        let mut bytes: DataBuffer = DataBuffer::new(hdr.compute_size());
        hdr.serialize(&mut bytes, SRC, DST, &[]);
        crate::ensure_eq!(bytes.len(), MIN_TCP_HEADER_SIZE + 4);

        let (parsed, payload) = TcpHeader::parse(SRC, DST, bytes)?;
        crate::ensure_eq!(parsed.src_port, 12345);
        crate::ensure_eq!(parsed.dst_port, 30000);
        crate::ensure_eq!(parsed.seq_num, SeqNumber::from(89));
        crate::ensure_eq!(parsed.syn, true);
        crate::ensure_eq!(parsed.ack, false);
        crate::ensure_eq!(parsed.mss, Some(1460));
        crate::ensure_eq!(payload.len(), 0);
        Ok(())
    }

    #[test]
    fn checksum_covers_payload() -> Result<()> {
        let mut hdr: TcpHeader = TcpHeader::new(1, 2);
        hdr.ack = true;
        hdr.ack_num = SeqNumber::from(100);

        // Odd payload length exercises the trailing-byte padding.
        let payload: &[u8] = b"HELLO";
        let mut bytes: DataBuffer = DataBuffer::new(hdr.compute_size() + payload.len());
        let hdr_size: usize = hdr.compute_size();
        bytes[hdr_size..].copy_from_slice(payload);
        let (hdr_bytes, data_bytes) = bytes.split_at_mut(hdr_size);
        hdr.serialize(hdr_bytes, SRC, DST, data_bytes);

        let (parsed, data) = TcpHeader::parse(SRC, DST, bytes.clone())?;
        crate::ensure_eq!(parsed.ack_num, SeqNumber::from(100));
        crate::ensure_eq!(&data[..], payload);

        // Flipping a payload bit must break the checksum.
        bytes[hdr_size] ^= 0x01;
        crate::ensure_eq!(TcpHeader::parse(SRC, DST, bytes).is_err(), true);
        Ok(())
    }
}
