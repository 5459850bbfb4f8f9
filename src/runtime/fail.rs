// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure carrying an errno and a cause.
///
/// Every fallible operation in the stack reports errors through this type, so
/// the socket surface can hand an errno-style result back to the application.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl Fail {
    /// Creates a new failure.
    pub fn new(errno: c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure out of the calling thread's last OS error.
    pub fn last_os_error(cause: &str) -> Self {
        let errno: c_int = io::Error::last_os_error().raw_os_error().unwrap_or(EIO);
        Self::new(errno, cause)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {:?}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {:?}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}
