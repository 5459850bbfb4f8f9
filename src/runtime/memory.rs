// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::libc::EINVAL;
use ::std::{
    fmt,
    ops::{
        Deref,
        DerefMut,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Owned byte buffer used for packet payloads throughout the stack.
///
/// Parsing works by stripping headers off the front (`adjust`) and padding off
/// the back (`trim`), so the same buffer that arrived from the device flows up
/// the layers without reallocation. Cloning produces a deep copy, which is
/// exactly what the retransmission queue wants.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct DataBuffer {
    data: Vec<u8>,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl DataBuffer {
    /// Creates a zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    /// Creates an empty buffer.
    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    /// Creates a buffer holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { data: bytes.to_vec() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes `nbytes` from the front of the buffer.
    pub fn adjust(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.data.len() {
            return Err(Fail::new(EINVAL, "adjust past end of buffer"));
        }
        self.data.drain(..nbytes);
        Ok(())
    }

    /// Removes `nbytes` from the back of the buffer.
    pub fn trim(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.data.len() {
            return Err(Fail::new(EINVAL, "trim past end of buffer"));
        }
        self.data.truncate(self.data.len() - nbytes);
        Ok(())
    }

    /// Splits off and returns the first `nbytes` of the buffer.
    pub fn split_front(&mut self, nbytes: usize) -> Result<Self, Fail> {
        if nbytes > self.data.len() {
            return Err(Fail::new(EINVAL, "split past end of buffer"));
        }
        let front: Vec<u8> = self.data.drain(..nbytes).collect();
        Ok(Self { data: front })
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Deref for DataBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for DataBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataBuffer({} bytes)", self.data.len())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
