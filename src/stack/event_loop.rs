// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::HashMap,
    rc::Rc,
};

//==============================================================================
// Structures
//==============================================================================

/// Application callback. Runs to completion on the event-loop thread, so it
/// must not block; it re-enters the socket surface, which is non-blocking.
pub type Callback = Rc<RefCell<Box<dyn FnMut()>>>;

/// Callback registry and run flag for the single-threaded event loop.
///
/// The loop itself lives on the stack (it needs the device and the protocol
/// layers); this type owns the pieces the loop shares with application code:
/// which callbacks fire for which handles, and whether the loop keeps going.
pub struct EventLoop {
    accept_callbacks: RefCell<HashMap<i32, Callback>>,
    read_callbacks: RefCell<HashMap<i32, Callback>>,
    running: Cell<bool>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl EventLoop {
    pub fn new() -> Self {
        Self {
            accept_callbacks: RefCell::new(HashMap::new()),
            read_callbacks: RefCell::new(HashMap::new()),
            running: Cell::new(false),
        }
    }

    pub fn register_accept_callback(&self, fd: i32, cb: Box<dyn FnMut()>) {
        self.accept_callbacks.borrow_mut().insert(fd, Rc::new(RefCell::new(cb)));
    }

    pub fn register_read_callback(&self, fd: i32, cb: Box<dyn FnMut()>) {
        self.read_callbacks.borrow_mut().insert(fd, Rc::new(RefCell::new(cb)));
    }

    pub fn unregister_callbacks(&self, fd: i32) {
        self.accept_callbacks.borrow_mut().remove(&fd);
        self.read_callbacks.borrow_mut().remove(&fd);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn set_running(&self, running: bool) {
        self.running.set(running);
    }

    /// Requests the loop to exit at the next iteration boundary.
    pub fn stop(&self) {
        self.running.set(false);
    }

    /// Invokes the registered callback once for each ready handle. Callbacks
    /// are free to register or unregister handles while they run; the maps
    /// are not borrowed during the call.
    pub fn dispatch(&self, acceptable: &[i32], readable: &[i32]) {
        for fd in acceptable {
            let cb: Option<Callback> = self.accept_callbacks.borrow().get(fd).cloned();
            if let Some(cb) = cb {
                (cb.borrow_mut())();
            }
        }
        for fd in readable {
            let cb: Option<Callback> = self.read_callbacks.borrow().get(fd).cloned();
            if let Some(cb) = cb {
                (cb.borrow_mut())();
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
