//! Runnable echo client built on `nbsock`'s `Dialer`.
//!
//! `cargo run --bin echo_client -- 127.0.0.1 7070 "hello there"`

use nbsock::{ClientDelegate, Config, Connection, Dialer, Error, Family, Protocol};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct Echo {
    message: String,
}

impl ClientDelegate for Echo {
    fn connected(&self, conn: &mut Connection) {
        info!(token = conn.token(), "connected, sending message");
        if let Err(e) = conn.write_line(&self.message) {
            info!(error = %e, "write failed");
        }
    }

    fn has_data(&self, conn: &mut Connection) {
        if let Ok(Some(line)) = conn.read_line() {
            info!(reply = %line, "got reply");
            std::process::exit(0);
        }
    }

    fn connection_failed(&self, host: &str, port: u16, _family: Family, _protocol: Protocol, cause: &Error) {
        eprintln!("failed to connect to {host}:{port}: {cause}");
        std::process::exit(1);
    }
}

fn main() {
    nbsock::init_tracing("info");

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(7070);
    let message = args.next().unwrap_or_else(|| "hello".to_string());

    let delegate = Arc::new(Echo { message });
    let dialer = Dialer::new(Config::default(), delegate).expect("failed to start dialer");
    dialer
        .connect(&host, port, Family::V4, Protocol::Tcp, Some(Duration::from_secs(5)))
        .expect("dial failed");

    std::thread::sleep(Duration::from_secs(10));
}
