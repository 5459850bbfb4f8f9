// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::std::env;

//==============================================================================
// Constants
//==============================================================================

/// Default cap on concurrent connections across the whole stack. Counts every
/// control block that has not yet been swept, whatever its state.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default cap on fully-established connections queued on a listener awaiting
/// `accept`.
pub const DEFAULT_MAX_BACKLOG: usize = 128;

//==============================================================================
// Standalone Functions
//==============================================================================

/// Resolves the global connection cap from `MAX_CONNECTIONS`. Invalid or
/// non-positive values are ignored and the default applies.
pub fn max_connections() -> usize {
    parse_positive("MAX_CONNECTIONS").unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

/// Resolves the connection cap for `port` from `MAX_CONNECTIONS_PORT_<port>`,
/// falling back to the global cap.
pub fn port_connection_limit(port: u16) -> usize {
    parse_positive(&format!("MAX_CONNECTIONS_PORT_{}", port)).unwrap_or_else(max_connections)
}

/// Resolves the acceptor backlog cap for `port` from
/// `MAX_BACKLOG_PORT_<port>`.
pub fn port_backlog_limit(port: u16) -> usize {
    parse_positive(&format!("MAX_BACKLOG_PORT_{}", port)).unwrap_or(DEFAULT_MAX_BACKLOG)
}

/// Reads an environment variable as a positive integer.
fn parse_positive(name: &str) -> Option<usize> {
    match env::var(name) {
        Ok(value) => match value.parse::<usize>() {
            Ok(limit) if limit > 0 => Some(limit),
            _ => {
                warn!("ignoring invalid value for {} ({:?})", name, value);
                None
            },
        },
        Err(_) => None,
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
