// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#[macro_use]
extern crate log;

pub mod nic;
pub mod protocols;
pub mod runtime;
pub mod stack;

pub use self::{
    runtime::fail::Fail,
    stack::TapStack,
};

/// Asserts that two expressions are equal, bailing out of the calling test with
/// a diagnostic when they are not.
#[macro_export]
macro_rules! ensure_eq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs != rhs {
            ::anyhow::bail!(
                "ensure_eq!({}, {}) failed: {:?} != {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs,
                rhs
            );
        }
    }};
}

/// Asserts that two expressions are not equal.
#[macro_export]
macro_rules! ensure_neq {
    ($lhs:expr, $rhs:expr) => {{
        let lhs = $lhs;
        let rhs = $rhs;
        if lhs == rhs {
            ::anyhow::bail!(
                "ensure_neq!({}, {}) failed: both sides are {:?}",
                stringify!($lhs),
                stringify!($rhs),
                lhs
            );
        }
    }};
}
