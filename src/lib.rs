//! Event-driven, non-blocking TCP/UDP socket core.
//!
//! Three pieces compose the public surface:
//!
//! - [`ring`] — a mirrored-mapping ring buffer giving every connection a
//!   contiguous view of its queued bytes regardless of wrap-around.
//! - [`socket`] and [`connection`] — a thin non-blocking socket wrapper
//!   and the state machine (`Created -> Running -> Closing -> Closed`)
//!   built on top of it, with a producer-side tx buffer safe to write
//!   from any thread and a consumer-side rx buffer read only from the
//!   owning event loop.
//! - [`acceptor`] and [`dialer`] — the passive and active endpoints,
//!   each running its own dedicated `mio`-backed event-loop thread and
//!   driving a [`acceptor::ServerDelegate`] or [`dialer::ClientDelegate`].

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod ring;
pub mod socket;

pub use acceptor::{Acceptor, ServerDelegate};
pub use config::Config;
pub use connection::{Connection, ConnectionHandle};
pub use dialer::{ClientDelegate, Dialer};
pub use error::{Error, Operation, Result};
pub use ring::RingBuffer;
pub use socket::{Family, Protocol, Socket};

/// Installs a `tracing` subscriber reading `RUST_LOG`, falling back to
/// `level` when unset. Mirrors `grow-a-cache`'s `main.rs` setup; left
/// as an opt-in helper rather than called automatically, since a
/// library should never install global logging behind its caller's
/// back.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
