// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod congestion_control;
pub mod constants;
pub mod ctrlblk;
mod isn_generator;
pub mod listener;
pub mod peer;
pub mod segment;
pub mod sender;
mod sequence_number;

#[cfg(test)]
pub mod tests;

pub use self::{
    ctrlblk::{
        ControlBlock,
        State,
    },
    listener::Listener,
    peer::{
        FlowKey,
        TcbManager,
        TcpEvent,
    },
    segment::{
        TcpHeader,
        TcpSegment,
    },
    sequence_number::SeqNumber,
};
