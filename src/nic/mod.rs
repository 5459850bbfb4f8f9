// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod tuntap;

pub use self::tuntap::TunTapDevice;
