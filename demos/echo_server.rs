//! Runnable echo server built on `nbsock`'s `Acceptor`.
//!
//! `cargo run --bin echo_server -- 7070`

use nbsock::{Acceptor, Config, Connection, Family, ServerDelegate};
use std::sync::Arc;
use tracing::info;

struct Echo;

impl ServerDelegate for Echo {
    fn connected(&self, conn: &mut Connection) {
        info!(token = conn.token(), peer = ?conn.peer_addr(), "client connected");
    }

    fn has_data(&self, conn: &mut Connection) {
        let data = conn.read_all_data();
        if let Err(e) = conn.write(&data) {
            if !e.is_write_buffer_full() {
                info!(token = conn.token(), error = %e, "write failed");
            }
        }
    }

    fn disconnected(&self, conn: &mut Connection, cause: Option<&str>) {
        info!(token = conn.token(), cause = ?cause, "client disconnected");
    }
}

fn main() {
    nbsock::init_tracing("info");

    let port: u16 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(7070);
    let acceptor = Acceptor::new(port, Family::V4, Config::default(), Arc::new(Echo))
        .expect("failed to start acceptor");

    info!(addr = %acceptor.local_addr(), "echo server listening");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
