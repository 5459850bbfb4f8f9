// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod admission;
mod established;
