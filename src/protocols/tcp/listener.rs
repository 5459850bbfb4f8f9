// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    protocols::tcp::ctrlblk::ControlBlock,
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::libc::ECONNREFUSED;
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::VecDeque,
    net::SocketAddrV4,
    rc::Rc,
};

//==============================================================================
// Structures
//==============================================================================

/// Occupancy statistics for a listener's acceptor queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacklogStats {
    pub current: u32,
    pub max: u32,
    pub peak: u32,
    pub total_queued: u32,
    pub total_rejected: u32,
}

/// A passive endpoint: holds connections that have completed their handshake
/// until the application accepts them.
pub struct Listener {
    local: SocketAddrV4,
    acceptors: RefCell<VecDeque<Rc<ControlBlock>>>,
    acceptable: Cell<bool>,
    max_backlog: u32,
    current: Cell<u32>,
    peak: Cell<u32>,
    total_queued: Cell<u32>,
    total_rejected: Cell<u32>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Listener {
    /// Creates a listener for `local`. The backlog limit is resolved once,
    /// here, from `MAX_BACKLOG_PORT_<port>`.
    pub fn new(local: SocketAddrV4) -> Self {
        let max_backlog: u32 = limits::port_backlog_limit(local.port()) as u32;
        info!("listening on {} (backlog={})", local, max_backlog);
        Self {
            local,
            acceptors: RefCell::new(VecDeque::new()),
            acceptable: Cell::new(false),
            max_backlog,
            current: Cell::new(0),
            peak: Cell::new(0),
            total_queued: Cell::new(0),
            total_rejected: Cell::new(0),
        }
    }

    pub fn endpoint(&self) -> SocketAddrV4 {
        self.local
    }

    /// Queues a freshly-established connection for `accept`. Fails when the
    /// backlog is full; the caller is expected to drop the connection.
    pub fn push_acceptor(&self, ccb: Rc<ControlBlock>) -> Result<(), Fail> {
        if self.current.get() >= self.max_backlog {
            self.total_rejected.set(self.total_rejected.get() + 1);
            return Err(Fail::new(ECONNREFUSED, "acceptor backlog full"));
        }
        self.acceptors.borrow_mut().push_back(ccb);
        self.current.set(self.current.get() + 1);
        self.total_queued.set(self.total_queued.get() + 1);
        if self.current.get() > self.peak.get() {
            self.peak.set(self.current.get());
        }
        self.acceptable.set(true);
        Ok(())
    }

    /// Pops the next connection awaiting `accept`.
    pub fn pop_acceptor(&self) -> Option<Rc<ControlBlock>> {
        let ccb: Rc<ControlBlock> = self.acceptors.borrow_mut().pop_front()?;
        self.current.set(self.current.get() - 1);
        if self.acceptors.borrow().is_empty() {
            self.acceptable.set(false);
        }
        Some(ccb)
    }

    pub fn has_pending(&self) -> bool {
        !self.acceptors.borrow().is_empty()
    }

    pub fn is_acceptable(&self) -> bool {
        self.acceptable.get()
    }

    pub fn backlog_stats(&self) -> BacklogStats {
        BacklogStats {
            current: self.current.get(),
            max: self.max_backlog,
            peak: self.peak.get(),
            total_queued: self.total_queued.get(),
            total_rejected: self.total_rejected.get(),
        }
    }
}
