//! Tunables for an [`crate::acceptor::Acceptor`] or [`crate::dialer::Dialer`].
//!
//! A plain struct with a `Default` impl rather than `grow-a-cache`'s
//! CLI/TOML layer (`clap`/`serde`/`toml`): this crate is a library, not
//! a standalone server, so configuration comes from the embedding
//! application's own code, not a config file.

use std::time::Duration;

/// Configuration shared by the event-loop threads.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial size, in bytes, for a connection's rx and tx ring
    /// buffers before any growth.
    pub ring_initial_size: usize,
    /// Upper bound on bytes read from a socket per readable wakeup,
    /// before yielding back to `poll` so one busy connection can't
    /// starve the others on the same event loop.
    pub max_read_per_wakeup: usize,
    /// `listen(2)` backlog for an `Acceptor`'s listening socket.
    pub accept_backlog: i32,
    /// Maximum pending connections accepted in a single readable
    /// wakeup on the listener before yielding back to `poll`.
    pub accept_batch_size: usize,
    /// Capacity hint for the live-connection `Slab`.
    pub max_connections: usize,
    /// Deadline for `Dialer::connect` when the caller doesn't supply
    /// one explicitly.
    pub default_dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_initial_size: crate::ring::DEFAULT_INITIAL_SIZE,
            max_read_per_wakeup: 1024 * 1024,
            accept_backlog: 1024,
            accept_batch_size: 64,
            max_connections: 10_000,
            default_dial_timeout: Duration::from_secs(10),
        }
    }
}
