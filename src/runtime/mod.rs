// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod fail;
pub mod limits;
pub mod logging;
pub mod macaddr;
pub mod memory;

pub use self::{
    fail::Fail,
    macaddr::MacAddress,
    memory::DataBuffer,
};
