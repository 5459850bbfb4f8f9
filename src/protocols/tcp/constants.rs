// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum segment size assumed for connections (1500 MTU minus 40 bytes of
/// IP/TCP headers).
pub const DEFAULT_MSS: usize = 1460;

/// Initial slow start threshold (RFC 5681 says "arbitrarily high"; 64 KiB
/// gives a reasonable slow start phase at this stack's scale).
pub const INITIAL_SSTHRESH: u32 = 65536;

/// Number of consecutive duplicate ACKs that triggers fast retransmit.
pub const DUP_ACK_THRESHOLD: u16 = 3;

/// Receive buffer size, which is also the largest window we ever advertise
/// (there is no window scaling).
pub const RECEIVE_BUFFER_SIZE: u32 = 65535;
