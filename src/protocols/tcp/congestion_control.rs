// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// TCP Reno congestion control (RFC 5681) with NewReno-free fast recovery:
// slow start and congestion avoidance on new ACKs, fast retransmit after three
// duplicate ACKs, window inflation while in fast recovery, deflation back to
// ssthresh on the ACK that ends it. Loss is only ever detected through
// duplicate ACKs; there is no retransmission timer.

//==============================================================================
// Imports
//==============================================================================

use crate::protocols::tcp::{
    constants::{
        DUP_ACK_THRESHOLD,
        INITIAL_SSTHRESH,
    },
    SeqNumber,
};
use ::std::{
    cell::Cell,
    cmp::{
        max,
        min,
    },
};

//==============================================================================
// Structures
//==============================================================================

#[derive(Debug)]
pub struct Reno {
    pub mss: u32, // Just for convenience, everything else here is in bytes.

    // Slow start / congestion avoidance state.
    pub cwnd: Cell<u32>,     // Congestion window: max bytes allowed in flight.
    pub ssthresh: Cell<u32>, // Window size at which slow start hands over to congestion avoidance.

    // Fast retransmit / fast recovery state.
    pub dupacks: Cell<u16>,           // Consecutive duplicate ACKs seen.
    pub last_ack_no: Cell<SeqNumber>, // Most recent ACK number observed, for duplicate detection.
    pub in_fast_recovery: Cell<bool>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Reno {
    /// Creates congestion state for a connection that has not completed its
    /// handshake yet. `cwnd` stays zero until [`Self::initialize`] runs on
    /// entry to ESTABLISHED.
    pub fn new(mss: usize) -> Self {
        Self {
            mss: mss as u32,
            cwnd: Cell::new(0),
            ssthresh: Cell::new(INITIAL_SSTHRESH),
            dupacks: Cell::new(0),
            last_ack_no: Cell::new(SeqNumber::from(0)),
            in_fast_recovery: Cell::new(false),
        }
    }

    /// Called on entry to ESTABLISHED.
    pub fn initialize(&self) {
        self.cwnd.set(self.mss);
        self.ssthresh.set(INITIAL_SSTHRESH);
        self.dupacks.set(0);
        self.in_fast_recovery.set(false);
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd.get()
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh.get()
    }

    pub fn dupacks(&self) -> u16 {
        self.dupacks.get()
    }

    pub fn last_ack_no(&self) -> SeqNumber {
        self.last_ack_no.get()
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery.get()
    }

    /// Remembers the ACK number without treating it as a window update (used
    /// for the handshake ACK, which acknowledges only our SYN).
    pub fn record_ack(&self, ack_no: SeqNumber) {
        self.last_ack_no.set(ack_no);
    }

    /// An ACK advanced SND.UNA by `bytes_acked`.
    pub fn on_new_ack(&self, ack_no: SeqNumber, bytes_acked: u32) {
        self.dupacks.set(0);
        self.last_ack_no.set(ack_no);

        if self.in_fast_recovery.get() {
            // Deflate: the lost segment has been repaired.
            self.cwnd.set(self.ssthresh.get());
            self.in_fast_recovery.set(false);
            debug!("leaving fast recovery (cwnd={})", self.cwnd.get());
            return;
        }

        let cwnd: u32 = self.cwnd.get();
        let ssthresh: u32 = self.ssthresh.get();
        if cwnd < ssthresh {
            // Slow start: grow by the amount acknowledged, up to ssthresh.
            self.cwnd.set(min(cwnd + bytes_acked, ssthresh));
        } else {
            // Congestion avoidance: roughly one MSS per RTT, approximated
            // per ACK.
            self.cwnd.set(cwnd + max(1, self.mss * self.mss / cwnd));
        }
    }

    /// An ACK arrived that acknowledges nothing new. Returns the updated
    /// duplicate count; the caller fast-retransmits and enters recovery when
    /// it hits the threshold.
    pub fn on_duplicate_ack(&self) -> u16 {
        let dupacks: u16 = self.dupacks.get() + 1;
        self.dupacks.set(dupacks);
        if dupacks > DUP_ACK_THRESHOLD || self.in_fast_recovery.get() {
            // Each further duplicate signals another segment left the
            // network; inflate to keep data flowing.
            self.cwnd.set(self.cwnd.get() + self.mss);
        }
        dupacks
    }

    /// Third duplicate ACK: halve the window and open it back up by the three
    /// segments the duplicates represent.
    pub fn enter_fast_recovery(&self) {
        let cwnd: u32 = self.cwnd.get();
        let ssthresh: u32 = max(cwnd / 2, 2 * self.mss);
        self.ssthresh.set(ssthresh);
        self.cwnd.set(ssthresh + 3 * self.mss);
        self.in_fast_recovery.set(true);
        debug!("entering fast recovery (cwnd={}, ssthresh={})", self.cwnd.get(), ssthresh);
    }

    /// Loss detected by timeout: collapse back into slow start. No timer
    /// fires in this stack today, but the state transition is the one RFC
    /// 5681 prescribes should one be added.
    pub fn on_timeout(&self) {
        let cwnd: u32 = self.cwnd.get();
        self.ssthresh.set(max(cwnd / 2, 2 * self.mss));
        self.cwnd.set(self.mss);
        self.dupacks.set(0);
        self.in_fast_recovery.set(false);
        debug!("congestion event (cwnd={}, ssthresh={})", self.cwnd.get(), self.ssthresh.get());
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Reno;
    use crate::protocols::tcp::SeqNumber;
    use ::anyhow::Result;

    const MSS: u32 = 1460;

    #[test]
    fn slow_start_caps_at_ssthresh_then_grows_linearly() -> Result<()> {
        let cc: Reno = Reno::new(MSS as usize);
        cc.initialize();
        cc.ssthresh.set(4 * MSS);

        // Four full-segment ACKs take us exactly to ssthresh.
        let mut ack: SeqNumber = SeqNumber::from(MSS);
        for round in 1..=4u32 {
            cc.on_new_ack(ack, MSS);
            crate::ensure_eq!(cc.cwnd(), (round + 1).min(4) * MSS);
            ack = ack + SeqNumber::from(MSS);
        }
        crate::ensure_eq!(cc.cwnd(), 4 * MSS);

        // The fifth ACK is congestion avoidance: growth of about mss^2/cwnd.
        cc.on_new_ack(ack, MSS);
        crate::ensure_eq!(cc.cwnd(), 4 * MSS + MSS / 4);
        Ok(())
    }

    #[test]
    fn timeout_collapses_window() -> Result<()> {
        let cc: Reno = Reno::new(MSS as usize);
        cc.initialize();
        cc.cwnd.set(10 * MSS);
        cc.on_timeout();
        crate::ensure_eq!(cc.ssthresh(), 5 * MSS);
        crate::ensure_eq!(cc.cwnd(), MSS);
        crate::ensure_eq!(cc.dupacks(), 0);
        Ok(())
    }

    #[test]
    fn timeout_ssthresh_has_two_mss_floor() -> Result<()> {
        let cc: Reno = Reno::new(MSS as usize);
        cc.initialize();
        crate::ensure_eq!(cc.cwnd(), MSS);
        cc.on_timeout();
        crate::ensure_eq!(cc.ssthresh(), 2 * MSS);
        Ok(())
    }

    #[test]
    fn fast_recovery_inflates_then_deflates() -> Result<()> {
        let cc: Reno = Reno::new(MSS as usize);
        cc.initialize();
        cc.cwnd.set(8 * MSS);
        cc.record_ack(SeqNumber::from(1000));

        for n in 1..=3u16 {
            crate::ensure_eq!(cc.on_duplicate_ack(), n);
        }
        cc.enter_fast_recovery();
        crate::ensure_eq!(cc.ssthresh(), 4 * MSS);
        crate::ensure_eq!(cc.cwnd(), 4 * MSS + 3 * MSS);

        // Further duplicates inflate by one MSS each.
        cc.on_duplicate_ack();
        crate::ensure_eq!(cc.cwnd(), 4 * MSS + 4 * MSS);

        // The first new ACK deflates back to ssthresh.
        cc.on_new_ack(SeqNumber::from(2000), MSS);
        crate::ensure_eq!(cc.cwnd(), 4 * MSS);
        crate::ensure_eq!(cc.in_fast_recovery(), false);
        crate::ensure_eq!(cc.dupacks(), 0);
        Ok(())
    }
}
