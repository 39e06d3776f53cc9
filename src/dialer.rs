//! An active TCP/UDP endpoint: dials out and hands the resulting
//! connection to a [`ClientDelegate`] from a single dedicated
//! event-loop thread, mirroring [`crate::acceptor::Acceptor`] but
//! without a listener.
//!
//! Grounded on the same `mio_impl/event_loop.rs` poll/reregister shape
//! as the acceptor; the one addition is a deadline per in-flight dial,
//! tracked by bounding `Poll::poll`'s timeout to the closest deadline
//! instead of blocking indefinitely (spec.md §4.E).

use crate::config::Config;
use crate::connection::{Connection, ReadOutcome, WriteOutcome};
use crate::error::{Error, Operation, Result};
use crate::socket::{Family, Protocol, Socket};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Callbacks a [`Dialer`] drives, all from its single event-loop
/// thread.
pub trait ClientDelegate: Send + Sync {
    /// A dial completed; the connection is now `Running`.
    fn connected(&self, _conn: &mut Connection) {}
    fn disconnected(&self, _conn: &mut Connection, _cause: Option<&str>) {}
    fn has_data(&self, _conn: &mut Connection) {}
    /// A dial never completed: refused, unreachable, or timed out.
    fn connection_failed(
        &self,
        _host: &str,
        _port: u16,
        _family: Family,
        _protocol: Protocol,
        _cause: &Error,
    ) {
    }
}

enum Command {
    Dial {
        socket: Socket,
        host: String,
        port: u16,
        family: Family,
        protocol: Protocol,
        deadline: Instant,
    },
    Disconnect(usize),
    DisconnectAll,
    Stop,
}

struct Pending {
    socket: Socket,
    host: String,
    port: u16,
    family: Family,
    protocol: Protocol,
    deadline: Instant,
}

/// Owns a dedicated event-loop thread that drives every connection this
/// dialer originates.
pub struct Dialer {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    started: Arc<AtomicBool>,
    default_dial_timeout: Duration,
    join: Option<JoinHandle<()>>,
}

impl Dialer {
    pub fn new(config: Config, delegate: Arc<dyn ClientDelegate>) -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::io(Operation::Dial, e))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| Error::io(Operation::Dial, e))?,
        );
        let (cmd_tx, cmd_rx) = channel();
        let started = Arc::new(AtomicBool::new(false));
        let default_dial_timeout = config.default_dial_timeout;

        let join = {
            let started = Arc::clone(&started);
            let waker = Arc::clone(&waker);
            thread::Builder::new()
                .name("nbsock-dialer".into())
                .spawn(move || {
                    started.store(true, Ordering::Release);
                    run(poll, config, delegate, cmd_rx, waker);
                })
                .map_err(|e| Error::io(Operation::Dial, e))?
        };

        Ok(Self { cmd_tx, waker, started, default_dial_timeout, join: Some(join) })
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Begins connecting to `host:port`. The dial itself runs
    /// asynchronously on the dialer's event loop; failures that can be
    /// detected immediately (bad family/resolution, protocol mismatch)
    /// are returned here, everything else — including timeout and
    /// refusal — arrives via [`ClientDelegate::connection_failed`].
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        family: Family,
        protocol: Protocol,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !matches!(protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(Error::protocol_not_supported(Operation::Dial));
        }
        let mut socket = Socket::new(family, protocol);
        socket.connect(host, port, true)?;

        let deadline = Instant::now() + timeout.unwrap_or(self.default_dial_timeout);
        let _ = self.cmd_tx.send(Command::Dial {
            socket,
            host: host.to_string(),
            port,
            family,
            protocol,
            deadline,
        });
        let _ = self.waker.wake();
        Ok(())
    }

    pub fn disconnect(&self, token: usize) {
        let _ = self.cmd_tx.send(Command::Disconnect(token));
        let _ = self.waker.wake();
    }

    /// Requests every live connection this dialer owns close, without
    /// waiting for them to finish.
    pub fn disconnect_all(&self) {
        let _ = self.cmd_tx.send(Command::DisconnectAll);
        let _ = self.waker.wake();
    }

    pub fn stop(mut self) {
        let _ = self.cmd_tx.send(Command::Stop);
        let _ = self.waker.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(
    mut poll: Poll,
    config: Config,
    delegate: Arc<dyn ClientDelegate>,
    cmd_rx: Receiver<Command>,
    waker: Arc<Waker>,
) {
    let mut connections: Slab<Connection> = Slab::with_capacity(config.max_connections);
    let mut pending: Slab<Pending> = Slab::with_capacity(64);
    let mut events = Events::with_capacity(128);

    debug!("dialer started");

    'outer: loop {
        let timeout = next_deadline(&pending);
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    for cmd in cmd_rx.try_iter() {
                        match cmd {
                            Command::Stop => break 'outer,
                            Command::Disconnect(token) => {
                                if let Some(conn) = connections.get_mut(token) {
                                    conn.mark_closing(None);
                                }
                            }
                            Command::DisconnectAll => {
                                for (_, conn) in connections.iter_mut() {
                                    conn.mark_closing(None);
                                }
                            }
                            Command::Dial { socket, host, port, family, protocol, deadline } => {
                                register_pending(
                                    &mut poll, &mut pending, socket, host, port, family, protocol, deadline,
                                );
                            }
                        }
                    }
                    rearm_pending_writes(&mut poll, &mut connections);
                }
                Token(id) if pending.contains(id) => {
                    finish_dial(&mut poll, &mut pending, &mut connections, id, &delegate, &waker, &config);
                }
                Token(id) => {
                    handle_connection_event(&mut poll, &mut connections, id, event, &delegate, &config);
                }
            }
        }

        expire_pending(&mut poll, &mut pending, &delegate);
        reap_closed(&mut poll, &mut connections, &delegate);
    }

    for (_, conn) in connections.iter_mut() {
        conn.mark_closing(None);
    }
    reap_closed(&mut poll, &mut connections, &delegate);
}

fn next_deadline(pending: &Slab<Pending>) -> Option<Duration> {
    pending
        .iter()
        .map(|(_, p)| p.deadline.saturating_duration_since(Instant::now()))
        .min()
}

fn register_pending(
    poll: &mut Poll,
    pending: &mut Slab<Pending>,
    socket: Socket,
    host: String,
    port: u16,
    family: Family,
    protocol: Protocol,
    deadline: Instant,
) {
    let Some(fd) = socket.as_raw_fd() else { return };
    let entry = pending.vacant_entry();
    let token = entry.key();
    if poll.registry().register(&mut SourceFd(&fd), Token(token), Interest::WRITABLE).is_err() {
        return;
    }
    entry.insert(Pending { socket, host, port, family, protocol, deadline });
}

fn finish_dial(
    poll: &mut Poll,
    pending: &mut Slab<Pending>,
    connections: &mut Slab<Connection>,
    id: usize,
    delegate: &Arc<dyn ClientDelegate>,
    waker: &Arc<Waker>,
    config: &Config,
) {
    let Pending { socket, host, port, family, protocol, .. } = pending.remove(id);
    if let Some(fd) = socket.as_raw_fd() {
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }

    match socket.take_error() {
        Ok(None) => {}
        Ok(Some(err)) => {
            delegate.connection_failed(&host, port, family, protocol, &Error::io(Operation::Dial, err));
            return;
        }
        Err(e) => {
            delegate.connection_failed(&host, port, family, protocol, &e);
            return;
        }
    }

    let entry = connections.vacant_entry();
    let token = entry.key();
    let Some(fd) = socket.as_raw_fd() else { return };
    let mut conn = Connection::with_ring_size(
        socket,
        token,
        Some(Arc::clone(waker)),
        config.ring_initial_size,
    );
    if poll.registry().register(&mut SourceFd(&fd), Token(token), Interest::READABLE).is_err() {
        return;
    }
    conn.start();
    entry.insert(conn);
    delegate.connected(connections.get_mut(token).expect("just inserted"));
}

fn expire_pending(poll: &mut Poll, pending: &mut Slab<Pending>, delegate: &Arc<dyn ClientDelegate>) {
    let now = Instant::now();
    let expired: Vec<usize> = pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(id, _)| id)
        .collect();

    for id in expired {
        let Pending { socket, host, port, family, protocol, .. } = pending.remove(id);
        if let Some(fd) = socket.as_raw_fd() {
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
        delegate.connection_failed(&host, port, family, protocol, &Error::timed_out(Operation::Dial));
    }
}

fn rearm_pending_writes(poll: &mut Poll, connections: &mut Slab<Connection>) {
    for (token, conn) in connections.iter_mut() {
        if conn.write_source_running() {
            continue;
        }
        let Some(fd) = conn.socket().as_raw_fd() else { continue };
        if poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), Interest::READABLE | Interest::WRITABLE)
            .is_ok()
        {
            conn.set_write_source_running(true);
        }
    }
}

fn handle_connection_event(
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    id: usize,
    event: &mio::event::Event,
    delegate: &Arc<dyn ClientDelegate>,
    config: &Config,
) {
    if !connections.contains(id) {
        return;
    }

    if event.is_readable() {
        match connections[id].on_readable(config.max_read_per_wakeup) {
            Ok(ReadOutcome::DataAvailable) => delegate.has_data(&mut connections[id]),
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::PeerClosed) => {
                connections[id].mark_closing(Some(Error::connection_reset(Operation::Read)))
            }
            Err(e) => connections[id].mark_closing(Some(e)),
        }
    }

    if !connections.contains(id) {
        return;
    }

    if event.is_writable() {
        match connections[id].on_writable() {
            Ok(WriteOutcome::Drained) => {
                let conn = &mut connections[id];
                if conn.write_source_running() {
                    if let Some(fd) = conn.socket().as_raw_fd() {
                        let _ = poll.registry().reregister(&mut SourceFd(&fd), Token(id), Interest::READABLE);
                    }
                    conn.set_write_source_running(false);
                }
            }
            Ok(WriteOutcome::Partial) => {}
            Err(e) => connections[id].mark_closing(Some(e)),
        }
    }
}

fn reap_closed(poll: &mut Poll, connections: &mut Slab<Connection>, delegate: &Arc<dyn ClientDelegate>) {
    let closing: Vec<usize> = connections
        .iter()
        .filter(|(_, c)| c.state() == crate::connection::ConnState::Closing)
        .map(|(id, _)| id)
        .collect();

    for id in closing {
        if let Some(fd) = connections[id].socket().as_raw_fd() {
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
        connections[id].note_source_cancelled();
        connections[id].note_source_cancelled();

        let cause = connections[id].handle().last_error();
        connections[id].mark_closed();
        delegate.disconnected(&mut connections[id], cause.as_deref());
        connections.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::{Acceptor, ServerDelegate};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingServer {
        seen: Mutex<Vec<Vec<u8>>>,
    }
    impl ServerDelegate for RecordingServer {
        fn has_data(&self, conn: &mut Connection) {
            self.seen.lock().unwrap().push(conn.read_all_data());
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        connected: Mutex<bool>,
        failed: Mutex<Option<String>>,
    }
    impl ClientDelegate for RecordingClient {
        fn connected(&self, conn: &mut Connection) {
            *self.connected.lock().unwrap() = true;
            let _ = conn.write(b"hi");
        }
        fn connection_failed(
            &self,
            _host: &str,
            _port: u16,
            _family: Family,
            _protocol: Protocol,
            cause: &Error,
        ) {
            *self.failed.lock().unwrap() = Some(cause.to_string());
        }
    }

    #[test]
    fn connects_and_sends_first_write() {
        let server_delegate = Arc::new(RecordingServer::default());
        let acceptor = Acceptor::new(0, Family::V4, Config::default(), server_delegate.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let client_delegate = Arc::new(RecordingClient::default());
        let dialer = Dialer::new(Config::default(), client_delegate.clone()).unwrap();
        dialer
            .connect("127.0.0.1", acceptor.local_addr().port(), Family::V4, Protocol::Tcp, None)
            .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(*client_delegate.connected.lock().unwrap());
        assert_eq!(server_delegate.seen.lock().unwrap().as_slice(), &[b"hi".to_vec()]);

        dialer.stop();
        acceptor.stop();
    }

    #[test]
    fn connect_to_closed_port_reports_failure() {
        let client_delegate = Arc::new(RecordingClient::default());
        let dialer = Dialer::new(Config::default(), client_delegate.clone()).unwrap();
        // Port 1 is privileged/unused in test sandboxes; expect ECONNREFUSED
        // or a timeout, either of which should surface as connection_failed.
        dialer
            .connect(
                "127.0.0.1",
                1,
                Family::V4,
                Protocol::Tcp,
                Some(Duration::from_millis(300)),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(500));
        assert!(client_delegate.failed.lock().unwrap().is_some());
        dialer.stop();
    }
}
