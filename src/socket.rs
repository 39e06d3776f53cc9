//! Thin typed wrapper over a non-blocking socket descriptor.
//!
//! Bind/listen/accept/connect/read/write plumbing lives here; the actual
//! readiness-source registration is left to [`crate::connection`] and
//! [`crate::acceptor`], which register a [`Socket`]'s raw descriptor with
//! an owner's `mio::Poll` via `mio::unix::SourceFd` — a socket never
//! "owns" a source, it only exposes the fd a source can be built from.
//!
//! Grounded on `grow-a-cache`'s `create_listener_with_reuseport` for the
//! socket2 option-setting sequence.

use crate::error::{Error, Operation, Result};
use socket2::{Domain, SockAddr, Type};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Once;
use std::time::Duration;

/// Address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Transport protocol. Only `Tcp` and `Udp` are meaningful; anything
/// else surfaces as [`Error::protocol_not_supported`] at the call sites
/// that care (the [`crate::dialer::Dialer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

static IGNORE_SIGPIPE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// A non-blocking socket descriptor, opened lazily on first use.
pub struct Socket {
    descriptor: Option<socket2::Socket>,
    family: Family,
    protocol: Protocol,
    peer_addr: Option<SocketAddr>,
    read_timeout: Option<Duration>,
    is_connected: bool,
}

impl Socket {
    /// Creates a socket for the given family/protocol. The descriptor is
    /// not actually opened until the first operation needs it.
    pub fn new(family: Family, protocol: Protocol) -> Self {
        Self {
            descriptor: None,
            family,
            protocol,
            peer_addr: None,
            read_timeout: None,
            is_connected: false,
        }
    }

    /// Adopts an already-open, already-connected descriptor (the shape
    /// returned by [`Socket::accept`]).
    pub(crate) fn adopt(
        raw: socket2::Socket,
        family: Family,
        protocol: Protocol,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            descriptor: Some(raw),
            family,
            protocol,
            peer_addr: Some(peer_addr),
            read_timeout: None,
            is_connected: true,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.descriptor.as_ref().map(|s| s.as_raw_fd())
    }

    fn ensure_open(&mut self) -> Result<&mut socket2::Socket> {
        if self.descriptor.is_none() {
            ignore_sigpipe();
            let domain = match self.family {
                Family::V4 => Domain::IPV4,
                Family::V6 => Domain::IPV6,
            };
            let ty = match self.protocol {
                Protocol::Tcp => Type::STREAM,
                Protocol::Udp => Type::DGRAM,
            };
            let proto = match self.protocol {
                Protocol::Tcp => Some(socket2::Protocol::TCP),
                Protocol::Udp => Some(socket2::Protocol::UDP),
            };
            let socket = socket2::Socket::new(domain, ty, proto).map_err(|e| {
                Error::io(Operation::Bind, e)
            })?;
            socket.set_nonblocking(true).map_err(|e| Error::io(Operation::Bind, e))?;
            self.descriptor = Some(socket);
        }
        Ok(self.descriptor.as_mut().unwrap())
    }

    /// Binds to `port` on `ip` (defaulting to the wildcard address for
    /// this socket's family). For IPv6, sets `IPV6_V6ONLY` first so a
    /// dual-stack deployment may bind both families to the same port;
    /// always sets `SO_REUSEADDR` before binding.
    pub fn bind(&mut self, port: u16, ip: Option<IpAddr>) -> Result<()> {
        let family = self.family;
        let socket = self.ensure_open()?;

        if family == Family::V6 {
            socket.set_only_v6(true).map_err(|e| Error::io(Operation::Bind, e))?;
        }
        socket.set_reuse_address(true).map_err(|e| Error::io(Operation::Bind, e))?;

        let ip = ip.unwrap_or(match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        let addr = SocketAddr::new(ip, port);
        socket.bind(&addr.into()).map_err(|e| Error::io(Operation::Bind, e))
    }

    /// Marks the socket as passive. `backlog` defaults to the platform
    /// maximum when not given.
    pub fn listen(&mut self, backlog: Option<i32>) -> Result<()> {
        let backlog = backlog.unwrap_or(1024);
        self.ensure_open()?
            .listen(backlog)
            .map_err(|e| Error::io(Operation::Listen, e))
    }

    /// Accepts one pending connection. `nonblocking` controls whether the
    /// adopted descriptor is switched into non-blocking mode (it already
    /// is, by construction, but the flag is kept for parity with the
    /// spec's signature and so callers can assert it loudly).
    pub fn accept(&mut self, nonblocking: bool) -> Result<Socket> {
        let family = self.family;
        let protocol = self.protocol;
        let socket = self.ensure_open()?;
        let (accepted, addr) = socket.accept().map_err(|e| Error::io(Operation::Accept, e))?;
        accepted
            .set_nonblocking(nonblocking)
            .map_err(|e| Error::io(Operation::Accept, e))?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| Error::address_resolution(Operation::Accept, "peer address not IP"))?;
        Ok(Socket::adopt(accepted, family, protocol, peer))
    }

    /// Resolves `host` and connects. A non-blocking connect returning
    /// "in progress" (`EINPROGRESS`) is treated as success: the eventual
    /// completion or failure surfaces through the write readiness source.
    pub fn connect(&mut self, host: &str, port: u16, nonblocking: bool) -> Result<()> {
        let addr = resolve(host, port, self.family)?;
        self.ensure_open()?.set_nonblocking(nonblocking).map_err(|e| Error::io(Operation::Connect, e))?;
        let sockaddr: SockAddr = addr.into();
        match self.ensure_open()?.connect(&sockaddr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::io(Operation::Connect, e)),
        }
        self.peer_addr = Some(addr);
        self.is_connected = true;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` unambiguously means an
    /// orderly peer shutdown (EOF); a non-blocking descriptor with no
    /// data ready surfaces as `Err` with [`Error::is_would_block`] true,
    /// so callers never have to guess which happened.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?.read(buf).map_err(|e| Error::io(Operation::Read, e))
    }

    /// Writes up to `buf.len()` bytes. A non-blocking descriptor with no
    /// room surfaces as `Err` with [`Error::is_would_block`] true.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?.write(buf).map_err(|e| Error::io(Operation::Write, e))
    }

    /// Connectionless receive, for UDP sockets.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let socket = self.ensure_open()?;
        let uninit = unsafe {
            &mut *(buf as *mut [u8] as *mut [std::mem::MaybeUninit<u8>])
        };
        let (n, addr) = socket.recv_from(uninit).map_err(|e| Error::io(Operation::RecvFrom, e))?;
        let peer = addr
            .as_socket()
            .ok_or_else(|| Error::address_resolution(Operation::RecvFrom, "peer address not IP"))?;
        Ok((n, peer))
    }

    /// Connectionless send, for UDP sockets.
    pub fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> Result<usize> {
        let sockaddr: SockAddr = addr.into();
        self.ensure_open()?
            .send_to(data, &sockaddr)
            .map_err(|e| Error::io(Operation::SendTo, e))
    }

    /// Memoized: a no-op if the timeout is unchanged.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.read_timeout == timeout {
            return Ok(());
        }
        self.ensure_open()?
            .set_read_timeout(timeout)
            .map_err(|e| Error::io(Operation::SetReadTimeout, e))?;
        self.read_timeout = timeout;
        Ok(())
    }

    /// Cached `SO_SNDBUF` value, used by `Connection` to cap per-wakeup
    /// write sizes.
    pub fn send_buffer_size(&self) -> Result<usize> {
        match &self.descriptor {
            Some(s) => s.send_buffer_size().map_err(|e| Error::io(Operation::Write, e)),
            None => Ok(0),
        }
    }

    /// Polls `SO_ERROR` without clearing the socket's connected state,
    /// used to learn whether a non-blocking `connect` that returned
    /// `EINPROGRESS` has since succeeded or failed.
    pub fn take_error(&self) -> Result<Option<std::io::Error>> {
        match &self.descriptor {
            Some(s) => s.take_error().map_err(|e| Error::io(Operation::Connect, e)),
            None => Ok(None),
        }
    }

    /// The address this socket is bound to, once opened.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self
            .descriptor
            .as_ref()
            .ok_or_else(|| Error::address_resolution(Operation::Bind, "socket not open"))?;
        socket
            .local_addr()
            .map_err(|e| Error::io(Operation::Bind, e))?
            .as_socket()
            .ok_or_else(|| Error::address_resolution(Operation::Bind, "local address not IP"))
    }

    /// Closes the descriptor. Idempotent; clears the cached timeout and
    /// `is_connected`.
    pub fn close(&mut self) {
        self.descriptor = None;
        self.is_connected = false;
        self.read_timeout = None;
    }
}

/// Resolves `host` to a single socket address. Address-family/protocol
/// enumeration and full resolver policy are an external collaborator
/// per spec.md §1; this performs the minimal std-library resolution a
/// TCP/UDP dial needs.
fn resolve(host: &str, port: u16, family: Family) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::address_resolution(Operation::Connect, e.to_string()))?;
    for addr in candidates {
        match (family, addr) {
            (Family::V4, SocketAddr::V4(_)) => return Ok(addr),
            (Family::V6, SocketAddr::V6(_)) => return Ok(addr),
            _ => continue,
        }
    }
    Err(Error::address_resolution(
        Operation::Connect,
        format!("no {family:?} address found for {host}:{port}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_connect_roundtrip() {
        let mut server = Socket::new(Family::V4, Protocol::Tcp);
        server.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        server.listen(Some(16)).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut client = Socket::new(Family::V4, Protocol::Tcp);
        client.connect("127.0.0.1", port, true).unwrap();
        assert!(client.is_connected());

        // Give the kernel a moment to complete the handshake before accept.
        std::thread::sleep(Duration::from_millis(20));
        let accepted = server.accept(true);
        assert!(accepted.is_ok());
    }

    #[test]
    fn read_timeout_is_memoized() {
        let mut sock = Socket::new(Family::V4, Protocol::Tcp);
        sock.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        // Setting the same value again must be a no-op (no error either way).
        sock.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn close_clears_connected_and_timeout() {
        let mut sock = Socket::new(Family::V4, Protocol::Tcp);
        sock.bind(0, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        sock.close();
        assert!(!sock.is_connected());
        assert!(sock.as_raw_fd().is_none());
    }
}
