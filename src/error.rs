//! Error taxonomy shared by every component of the socket core.
//!
//! Follows the `repr` + `Operation` shape of `vmap`'s error type: the
//! kind of failure is kept separate from what the caller was trying to
//! do when it happened, so a single `Error` value can carry both a
//! diagnosable cause and enough context to log usefully.

use std::fmt;
use std::io;

/// A specialized `Result` type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by the socket core.
#[non_exhaustive]
pub struct Error {
    repr: Repr,
    op: Operation,
}

enum Repr {
    Io(io::Error),
    AddressResolution(String),
    Kernel { code: i32, step: &'static str },
    ProtocolNotSupported,
    NotUtf8,
    WriteBufferFull,
    CantStartListener(Box<Error>),
    TimedOut,
    ConnectionReset,
}

impl Error {
    /// Wraps a `std::io::Error` (the `POSIX(errno)` case in the taxonomy).
    pub fn io(op: Operation, err: io::Error) -> Self {
        Self { repr: Repr::Io(err), op }
    }

    /// Returns an error representing the last OS error for `errno`-style
    /// syscall failures (bind, accept, connect, read, write, mmap, ...).
    pub fn last_os_error(op: Operation) -> Self {
        Self::io(op, io::Error::last_os_error())
    }

    /// Address/host resolution failure (`gai`-style code, kept as text
    /// since resolution itself is an external collaborator not specified
    /// here).
    pub fn address_resolution(op: Operation, detail: impl Into<String>) -> Self {
        Self { repr: Repr::AddressResolution(detail.into()), op }
    }

    /// A non-POSIX kernel-level failure, carrying the failing step's name
    /// (used by the mirror-mapping allocator: which `mmap` call failed).
    pub fn kernel(op: Operation, code: i32, step: &'static str) -> Self {
        Self { repr: Repr::Kernel { code, step }, op }
    }

    pub fn protocol_not_supported(op: Operation) -> Self {
        Self { repr: Repr::ProtocolNotSupported, op }
    }

    pub fn not_utf8(op: Operation) -> Self {
        Self { repr: Repr::NotUtf8, op }
    }

    pub fn write_buffer_full(op: Operation) -> Self {
        Self { repr: Repr::WriteBufferFull, op }
    }

    pub fn cant_start_listener(op: Operation, cause: Error) -> Self {
        Self { repr: Repr::CantStartListener(Box::new(cause)), op }
    }

    pub fn timed_out(op: Operation) -> Self {
        Self { repr: Repr::TimedOut, op }
    }

    pub fn connection_reset(op: Operation) -> Self {
        Self { repr: Repr::ConnectionReset, op }
    }

    /// True if this is the recoverable "tx buffer has no room" condition;
    /// callers may retry once the buffer drains.
    pub fn is_write_buffer_full(&self) -> bool {
        matches!(self.repr, Repr::WriteBufferFull)
    }

    /// True if this is a peer-initiated orderly shutdown or reset.
    pub fn is_connection_reset(&self) -> bool {
        matches!(self.repr, Repr::ConnectionReset)
    }

    /// True if the underlying syscall would have blocked — the caller
    /// should retry once the relevant readiness source fires again.
    pub fn is_would_block(&self) -> bool {
        matches!(&self.repr, Repr::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// The operation that was being attempted when this error occurred.
    pub fn operation(&self) -> Operation {
        self.op
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match &self.repr {
            Repr::Io(e) => e.raw_os_error(),
            Repr::Kernel { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.repr {
            Repr::Io(err) => Some(err),
            Repr::CantStartListener(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self { repr: Repr::Io(err), op: Operation::None }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Error")
            .field("op", &self.op)
            .field("cause", &format_args!("{}", DisplayRepr(&self.repr)))
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(op) = self.op.as_str() {
            write!(fmt, "failed to {op}: {}", DisplayRepr(&self.repr))
        } else {
            write!(fmt, "{}", DisplayRepr(&self.repr))
        }
    }
}

struct DisplayRepr<'a>(&'a Repr);

impl fmt::Display for DisplayRepr<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Repr::Io(err) => write!(fmt, "{err}"),
            Repr::AddressResolution(detail) => write!(fmt, "address resolution failed: {detail}"),
            Repr::Kernel { code, step } => write!(fmt, "kernel error {code} during {step}"),
            Repr::ProtocolNotSupported => write!(fmt, "protocol not supported"),
            Repr::NotUtf8 => write!(fmt, "data is not valid utf-8"),
            Repr::WriteBufferFull => write!(fmt, "write buffer full"),
            Repr::CantStartListener(cause) => write!(fmt, "can't start listener: {cause}"),
            Repr::TimedOut => write!(fmt, "timed out"),
            Repr::ConnectionReset => write!(fmt, "connection reset"),
        }
    }
}

/// The operation being attempted when an [`Error`] occurred.
///
/// Intended to grow over time; not recommended to match exhaustively.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum Operation {
    RingAllocate,
    RingResize,
    RingRemapPrimary,
    RingRemapSecondary,
    RingMemoryFd,
    Bind,
    Listen,
    Accept,
    Connect,
    Read,
    Write,
    RecvFrom,
    SendTo,
    SetReadTimeout,
    Dial,
    None,
}

impl Operation {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            Operation::RingAllocate => Some("allocate ring buffer"),
            Operation::RingResize => Some("resize ring buffer"),
            Operation::RingRemapPrimary => Some("map ring first half"),
            Operation::RingRemapSecondary => Some("map ring second half"),
            Operation::RingMemoryFd => Some("open ring memory fd"),
            Operation::Bind => Some("bind"),
            Operation::Listen => Some("listen"),
            Operation::Accept => Some("accept"),
            Operation::Connect => Some("connect"),
            Operation::Read => Some("read"),
            Operation::Write => Some("write"),
            Operation::RecvFrom => Some("recv_from"),
            Operation::SendTo => Some("send_to"),
            Operation::SetReadTimeout => Some("set read timeout"),
            Operation::Dial => Some("dial"),
            Operation::None => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str().unwrap_or(""))
    }
}
