//! The connection state machine: CREATED -> RUNNING -> CLOSING -> CLOSED,
//! paired rx/tx ring buffers, and the read/write handlers an owner's
//! event loop drives off mio readiness events.
//!
//! Grounded on `grow-a-cache`'s `runtime/mio_impl/event_loop.rs`
//! (`handle_readable`/`handle_writable`, and reregistering `Interest`
//! to arm/disarm the write side) and its `ConnState` enum shape, with
//! the buffers swapped for the mirrored-mapping [`crate::ring::RingBuffer`]
//! and cross-thread sharing modeled on `Storage`'s `Arc<RwLock<..>>`
//! pattern (`std::sync::Mutex` here, since the tx buffer has a single
//! writer at a time rather than many readers).

use crate::error::{Error, Operation, Result};
use crate::ring::{RingBuffer, DEFAULT_INITIAL_SIZE};
use crate::socket::Socket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Running,
    Closing,
    Closed,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Created,
            1 => ConnState::Running,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Outcome of draining a connection's readable side once.
pub enum ReadOutcome {
    /// At least one byte landed in the rx buffer; the owner should run
    /// the `hasData` callback.
    DataAvailable,
    /// The socket has no more data ready right now.
    WouldBlock,
    /// The peer performed an orderly shutdown.
    PeerClosed,
}

/// Outcome of draining a connection's writable side once.
pub enum WriteOutcome {
    /// The tx buffer fully drained; the write source should be disarmed.
    Drained,
    /// Some bytes were written but the tx buffer still has data, or the
    /// socket would block on a larger write; the write source stays armed.
    Partial,
}

/// State shared between the event-loop-owned [`Connection`] and any
/// number of cloned [`ConnectionHandle`]s held by other threads.
struct Shared {
    tx: Mutex<RingBuffer>,
    state: AtomicU8,
    last_error: Mutex<Option<String>>,
    waker: Option<Arc<mio::Waker>>,
    token: usize,
    peer_addr: Option<SocketAddr>,
}

/// A cheap, `Send + Sync` handle to a connection's write side and
/// lifecycle, safe to hand to any thread. Reading is intentionally not
/// exposed here: the rx buffer is only ever touched from the owner's
/// event-loop thread, during the `hasData` callback (see [`Connection`]).
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn token(&self) -> usize {
        self.shared.token
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Queues `data` on the tx buffer and wakes the owning event loop so
    /// it rearms the write readiness source. Fails recoverably with
    /// [`Error::is_write_buffer_full`] under backpressure (spec.md §4.A).
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        {
            let mut tx = self.shared.tx.lock().expect("tx mutex poisoned");
            let dst = tx.acquire_write(data.len())?;
            dst.copy_from_slice(data);
            tx.commit_write(data.len());
        }
        self.wake();
        Ok(())
    }

    /// Convenience for line-oriented protocols: writes `line` followed
    /// by `\r\n` as a single buffered region.
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\r');
        buf.push(b'\n');
        self.write(&buf)
    }

    /// Requests an orderly close. Idempotent; has no effect once the
    /// connection has already left the `Running` state.
    pub fn disconnect(&self) {
        let _ = self.shared.state.compare_exchange(
            ConnState::Running as u8,
            ConnState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake();
    }

    /// The most recent error recorded against this connection, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().expect("error mutex poisoned").clone()
    }

    fn wake(&self) {
        if let Some(waker) = &self.shared.waker {
            let _ = waker.wake();
        }
    }
}

/// A single connection's state machine, owned exclusively by its
/// Acceptor or Dialer's event-loop thread. `rx` is read from that same
/// thread only (directly, or via `hasData` callbacks it invokes); `tx`
/// is shared with any [`ConnectionHandle`] clones through an internal
/// mutex so other threads may queue writes (spec.md §5).
pub struct Connection {
    shared: Arc<Shared>,
    socket: Socket,
    rx: RingBuffer,
    source_ref_count: u8,
    write_source_running: bool,
    send_buffer_size: usize,
    context: String,
}

impl Connection {
    pub(crate) fn new(
        socket: Socket,
        token: usize,
        waker: Option<Arc<mio::Waker>>,
    ) -> Self {
        Self::with_ring_size(socket, token, waker, DEFAULT_INITIAL_SIZE)
    }

    pub(crate) fn with_ring_size(
        socket: Socket,
        token: usize,
        waker: Option<Arc<mio::Waker>>,
        ring_initial_size: usize,
    ) -> Self {
        let peer_addr = socket.peer_addr();
        // Cached once at construction: a write never asks the kernel for
        // this again, it just caps each send to it (spec.md §4.C).
        let send_buffer_size = socket.send_buffer_size().unwrap_or(ring_initial_size).max(1);
        let shared = Arc::new(Shared {
            tx: Mutex::new(RingBuffer::new(ring_initial_size)),
            state: AtomicU8::new(ConnState::Created as u8),
            last_error: Mutex::new(None),
            waker,
            token,
            peer_addr,
        });
        Self {
            shared,
            socket,
            rx: RingBuffer::new(ring_initial_size),
            // Two readiness sources (read + write) are registered for
            // every connection up front; both must report cancelled
            // before the socket is actually closed (spec.md §4.C).
            source_ref_count: 2,
            write_source_running: false,
            send_buffer_size,
            context: String::new(),
        }
    }

    /// Transitions CREATED -> RUNNING. Called once the owner has
    /// finished registering both readiness sources.
    pub(crate) fn start(&mut self) {
        self.shared.state.store(ConnState::Running as u8, Ordering::Release);
    }

    pub fn token(&self) -> usize {
        self.shared.token
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub(crate) fn write_source_running(&self) -> bool {
        self.write_source_running
    }

    pub(crate) fn set_write_source_running(&mut self, running: bool) {
        self.write_source_running = running;
    }

    pub(crate) fn source_ref_count(&self) -> u8 {
        self.source_ref_count
    }

    /// Called when one of the two readiness sources finishes its
    /// cancellation. Returns `true` once both have (ref count hits
    /// zero), at which point the owner should close the socket.
    pub(crate) fn note_source_cancelled(&mut self) -> bool {
        self.source_ref_count = self.source_ref_count.saturating_sub(1);
        self.source_ref_count == 0
    }

    /// A cloneable, `Send + Sync` write/lifecycle handle for this
    /// connection, safe to hand to code running on another thread.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle { shared: Arc::clone(&self.shared) }
    }

    /// Sets this connection's user-assignable tag, used by
    /// [`crate::acceptor::Acceptor::connection_with_context`] to look it
    /// up from another thread.
    pub fn set_context(&mut self, value: impl Into<String>) {
        self.context = value.into();
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub(crate) fn mark_closing(&mut self, err: Option<Error>) {
        self.shared.state.store(ConnState::Closing as u8, Ordering::Release);
        if let Some(err) = err {
            *self.shared.last_error.lock().expect("error mutex poisoned") = Some(err.to_string());
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.shared.state.store(ConnState::Closed as u8, Ordering::Release);
        self.socket.close();
    }

    /// Returns the first `n` bytes currently queued for reading, without
    /// consuming them. `None` if fewer than `n` bytes are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        let available = self.rx.acquire_read();
        if available.len() < n {
            None
        } else {
            Some(&available[..n])
        }
    }

    /// Copies up to `buf.len()` bytes out of the rx buffer, consuming
    /// them. Returns the number of bytes copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let available = self.rx.acquire_read();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.rx.commit_read(n);
        n
    }

    /// Drains the entire rx buffer into a freshly allocated `Vec`.
    pub fn read_all_data(&mut self) -> Vec<u8> {
        let n = self.rx.acquire_read().len();
        let out = self.rx.acquire_read()[..n].to_vec();
        self.rx.commit_read(n);
        out
    }

    /// Reads up to and including the first `delim` byte, consuming it,
    /// along with any run of further `delim` bytes that immediately
    /// follow (coalescing). Returns `None` if no `delim` has arrived yet.
    pub fn read_token(&mut self, delim: u8) -> Option<Vec<u8>> {
        let available = self.rx.acquire_read();
        let pos = available.iter().position(|&b| b == delim)?;
        let token = available[..=pos].to_vec();
        let mut consumed = pos + 1;
        while consumed < available.len() && available[consumed] == delim {
            consumed += 1;
        }
        self.rx.commit_read(consumed);
        Some(token)
    }

    /// Reads a single `\n`-terminated line (the trailing newline, and a
    /// preceding `\r` if present, are stripped). `None` if no full line
    /// has arrived yet; `Err` if the line is not valid UTF-8.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        match self.read_token(b'\n') {
            None => Ok(None),
            Some(mut bytes) => {
                bytes.pop(); // '\n'
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| Error::not_utf8(Operation::Read))
            }
        }
    }

    /// Moves every byte currently queued in `other`'s rx buffer into
    /// this connection's tx buffer in one relay copy, waking this
    /// connection's owner so the write source rearms. Used for
    /// proxy-style relays without an intermediate heap buffer.
    pub fn copy_all_from(&self, other: &mut Connection) -> Result<usize> {
        let n = {
            let mut tx = self.shared.tx.lock().expect("tx mutex poisoned");
            tx.splice_from(&mut other.rx)?
        };
        if n > 0 {
            self.handle().wake();
        }
        Ok(n)
    }

    /// Queues `data` for send on this connection's own tx buffer; a
    /// thin convenience so code already holding `&Connection` (e.g.
    /// inside a `hasData` callback) doesn't need to call `.handle()`
    /// first.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.handle().write(data)
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        self.handle().write_line(line)
    }

    /// Drains up to `max_read` bytes from the socket into the rx
    /// buffer, growing it as needed (spec.md §4.C step 1-3). A single
    /// call may issue several `read`s while the socket keeps returning
    /// full buffers, stopping at the first short read, `WouldBlock`, or
    /// EOF.
    pub(crate) fn on_readable(&mut self, max_read: usize) -> Result<ReadOutcome> {
        let mut any = false;
        loop {
            let chunk = max_read.min(self.rx.free_space().max(4096));
            let buf = match self.rx.acquire_write(chunk) {
                Ok(buf) => buf,
                Err(ref e) if e.is_write_buffer_full() => {
                    // Consumer hasn't caught up; stop for now, the next
                    // readable event will retry.
                    break;
                }
                Err(e) => return Err(e),
            };
            match self.socket.read(buf) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => {
                    self.rx.commit_write(n);
                    any = true;
                    if n < chunk {
                        break;
                    }
                }
                Err(ref e) if e.is_would_block() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(if any { ReadOutcome::DataAvailable } else { ReadOutcome::WouldBlock })
    }

    /// Drains as much of the tx buffer to the socket as it will accept
    /// right now, one `send_buffer_size`-capped write at a time
    /// (spec.md §4.C write-handler pseudocode).
    pub(crate) fn on_writable(&mut self) -> Result<WriteOutcome> {
        loop {
            let wrote = {
                let mut tx = self.shared.tx.lock().expect("tx mutex poisoned");
                let pending = tx.acquire_read();
                if pending.is_empty() {
                    return Ok(WriteOutcome::Drained);
                }
                let n = pending.len().min(self.send_buffer_size);
                match self.socket.write(&pending[..n]) {
                    Ok(n) => {
                        tx.commit_read(n);
                        n
                    }
                    Err(ref e) if e.is_would_block() => return Ok(WriteOutcome::Partial),
                    Err(e) => return Err(e),
                }
            };
            if wrote == 0 {
                return Ok(WriteOutcome::Partial);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{Family, Protocol};

    fn paired_sockets() -> (Socket, Socket) {
        let mut server = Socket::new(Family::V4, Protocol::Tcp);
        server.bind(0, Some(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))).unwrap();
        server.listen(Some(8)).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut client = Socket::new(Family::V4, Protocol::Tcp);
        client.connect("127.0.0.1", port, true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = server.accept(true).unwrap();
        (accepted, client)
    }

    #[test]
    fn read_line_splits_on_newline_and_strips_cr() {
        let (server_sock, _client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        {
            let buf = conn.rx.acquire_write(32).unwrap();
            buf[..13].copy_from_slice(b"hello world\r\n");
            conn.rx.commit_write(13);
        }
        let line = conn.read_line().unwrap().unwrap();
        assert_eq!(line, "hello world");
        assert_eq!(conn.rx.available(), 0);
    }

    #[test]
    fn read_line_returns_none_without_full_line() {
        let (server_sock, _client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        {
            let buf = conn.rx.acquire_write(32).unwrap();
            buf[..5].copy_from_slice(b"hello");
            conn.rx.commit_write(5);
        }
        assert!(conn.read_line().unwrap().is_none());
        assert_eq!(conn.rx.available(), 5);
    }

    #[test]
    fn handle_write_is_visible_to_owner_on_writable() {
        let (server_sock, mut client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        conn.start();
        let handle = conn.handle();
        handle.write(b"ping").unwrap();

        matches!(conn.on_writable().unwrap(), WriteOutcome::Drained);

        let mut buf = [0u8; 16];
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn on_readable_reports_peer_closed_on_eof() {
        let (server_sock, client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        match conn.on_readable(4096).unwrap() {
            ReadOutcome::PeerClosed => {}
            _ => panic!("expected PeerClosed"),
        }
    }

    #[test]
    fn note_source_cancelled_reaches_zero_after_two_calls() {
        let (server_sock, _client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        assert!(!conn.note_source_cancelled());
        assert!(conn.note_source_cancelled());
    }

    #[test]
    fn read_token_coalesces_a_run_of_separators() {
        let (server_sock, _client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        {
            let buf = conn.rx.acquire_write(32).unwrap();
            buf[..9].copy_from_slice(b"a,,,b,,c,");
            conn.rx.commit_write(9);
        }
        assert_eq!(conn.read_token(b',').unwrap(), b"a,");
        assert_eq!(conn.read_token(b',').unwrap(), b"b,");
        assert_eq!(conn.read_token(b',').unwrap(), b"c,");
        assert!(conn.read_token(b',').is_none());
    }

    #[test]
    fn peek_returns_none_until_n_bytes_are_buffered() {
        let (server_sock, _client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        assert!(conn.peek(3).is_none());
        {
            let buf = conn.rx.acquire_write(8).unwrap();
            buf[..5].copy_from_slice(b"hello");
            conn.rx.commit_write(5);
        }
        assert!(conn.peek(6).is_none());
        assert_eq!(conn.peek(3).unwrap(), b"hel");
        assert_eq!(conn.rx.available(), 5); // peek does not consume
    }

    #[test]
    fn write_line_appends_crlf() {
        let (server_sock, mut client) = paired_sockets();
        let mut conn = Connection::new(server_sock, 0, None);
        conn.start();
        conn.write_line("hi").unwrap();
        matches!(conn.on_writable().unwrap(), WriteOutcome::Drained);

        let mut buf = [0u8; 16];
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\r\n");
    }

    #[test]
    fn copy_all_from_relays_bytes_between_connections() {
        let (a_sock, _a_client) = paired_sockets();
        let (b_sock, _b_client) = paired_sockets();
        let mut a = Connection::new(a_sock, 0, None);
        let mut b = Connection::new(b_sock, 1, None);
        {
            let buf = b.rx.acquire_write(5).unwrap();
            buf.copy_from_slice(b"howdy");
            b.rx.commit_write(5);
        }
        let n = a.copy_all_from(&mut b).unwrap();
        assert_eq!(n, 5);
        assert_eq!(b.rx.available(), 0);
        let tx = a.shared.tx.lock().unwrap();
        assert_eq!(tx.acquire_read(), b"howdy");
    }
}
