// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::fmt;

//==============================================================================
// Structures
//==============================================================================

/// Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(eui48::MacAddress);

//==============================================================================
// Associated Functions
//==============================================================================

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(eui48::MacAddress::new(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        MacAddress(eui48::MacAddress::from_bytes(bytes).expect("mac address should have exactly six bytes"))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.to_array()
    }

    pub fn broadcast() -> Self {
        MacAddress(eui48::MacAddress::broadcast())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_broadcast()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex_string())
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self.0.to_hex_string())
    }
}
