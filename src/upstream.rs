//! The upstream connection in remote trusted mode.
//!
//! One TCP connection to the parent pool, shared between a sender and a
//! receiver thread through a mutex. The handshake announces this process
//! with `mining.remote` and must be answered `result: true`. The sender
//! drains a queue of pre-encoded lines and owns reconnection: a failed write
//! closes the socket and retries the same message after the link is back.
//! The receiver reads with a short timeout and pings through the sender when
//! the link goes quiet.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::config::parse_host_port;
use crate::connector::Connector;
use crate::error::Error;
use crate::listener::{set_recvbufsize, set_sendbufsize};

/// Sleep between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Read timeout on the established link before a ping is sent.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for the handshake response.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream socket buffers are large for bulk message forwarding.
const UPSTREAM_BUFSIZE: usize = 2 * 1024 * 1024;

pub(crate) struct Upstream {
    url: String,
    port: u16,
    /// Guards shared use of the connection between the threads.
    state: Mutex<State>,
    sends: Sender<String>,
}

#[derive(Default)]
struct State {
    stream: Option<TcpStream>,
    rdbuf: Vec<u8>,
}

/// Messages the upstream pool may send us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMethod {
    Transactions,
    AuthResult,
    WorkInfo,
    Block,
    ReqTxns,
    Pong,
}

impl UpstreamMethod {
    pub fn classify(method: &str) -> Option<Self> {
        match method {
            "mining.transactions" => Some(UpstreamMethod::Transactions),
            "mining.authresult" => Some(UpstreamMethod::AuthResult),
            "mining.workinfo" => Some(UpstreamMethod::WorkInfo),
            "mining.block" => Some(UpstreamMethod::Block),
            "mining.reqtxns" => Some(UpstreamMethod::ReqTxns),
            "pong" => Some(UpstreamMethod::Pong),
            _ => None,
        }
    }
}

/// Connects to the configured upstream and starts the sender and receiver
/// threads. Fails only on configuration errors; connection problems are
/// retried forever.
pub(crate) fn setup(conn: &Connector) -> Result<(), Error> {
    let upstream_url = conn.cfg().upstream.clone().ok_or(Error::NoUpstream)?;
    let (url, port) =
        parse_host_port(&upstream_url).ok_or_else(|| Error::UpstreamUrl(upstream_url.clone()))?;

    let (tx, rx) = unbounded();
    let upstream = Arc::new(Upstream {
        url,
        port,
        state: Mutex::new(State::default()),
        sends: tx,
    });

    while !upstream.connect(conn) {
        thread::sleep(RECONNECT_DELAY);
    }

    {
        let upstream = Arc::clone(&upstream);
        let conn = conn.clone();
        thread::Builder::new()
            .name("usender".to_string())
            .spawn(move || sender_loop(upstream, conn, rx))?;
    }
    {
        let upstream = Arc::clone(&upstream);
        let conn = conn.clone();
        thread::Builder::new()
            .name("ureceiver".to_string())
            .spawn(move || receiver_loop(upstream, conn))?;
    }

    conn.install_upstream(upstream);
    Ok(())
}

impl Upstream {
    /// Queues one pre-encoded line for the upstream pool.
    pub(crate) fn queue(&self, msg: String) {
        if self.sends.send(msg).is_err() {
            warn!("upstream sender is gone");
        }
    }

    fn ping(&self) {
        self.queue("{\"method\":\"ping\"}\n".to_string());
    }

    /// Establishes the connection and performs the `mining.remote`
    /// handshake. Holds the state lock for the duration.
    fn connect(&self, conn: &Connector) -> bool {
        let mut state = self.state.lock();
        state.stream = None;
        state.rdbuf.clear();

        let mut stream = match TcpStream::connect((self.url.as_str(), self.port)) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "failed to connect to upstream server {}:{}: {e}",
                    self.url, self.port
                );
                return false;
            }
        };
        let _ = socket2::SockRef::from(&stream).set_keepalive(true);
        // We want large buffers for upstreaming messages.
        set_recvbufsize(stream.as_fd(), UPSTREAM_BUFSIZE, conn.rmem_warn());
        set_sendbufsize(stream.as_fd(), UPSTREAM_BUFSIZE, conn.wmem_warn());

        let handshake = json!({
            "method": "mining.remote",
            "params": [concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))],
        });
        let mut line = handshake.to_string();
        line.push('\n');
        if let Err(e) = stream.write_all(line.as_bytes()) {
            warn!("failed to send upstream handshake: {e}");
            return false;
        }

        let reply = match read_line_timeout(&mut stream, &mut state.rdbuf, HANDSHAKE_TIMEOUT) {
            Ok(Some(reply)) => reply,
            Ok(None) | Err(_) => {
                warn!("failed to receive upstream handshake response");
                return false;
            }
        };
        let accepted = serde_json::from_str::<Value>(&reply)
            .ok()
            .and_then(|val| val.get("result").and_then(Value::as_bool))
            .unwrap_or(false);
        if !accepted {
            warn!("denied upstream trusted connection: {}", reply.trim_end());
            return false;
        }

        info!(
            "connected to upstream server {}:{} as trusted remote",
            self.url, self.port
        );
        state.stream = Some(stream);
        true
    }
}

/// Writes queued messages, reconnecting with the current message cached
/// until it goes through.
fn sender_loop(upstream: Arc<Upstream>, conn: Connector, rx: Receiver<String>) {
    while let Ok(msg) = rx.recv() {
        if msg.is_empty() {
            warn!("empty message queued for upstream");
            continue;
        }
        trace!("sending upstream msg: {}", msg.trim_end());
        loop {
            let written = {
                let mut state = upstream.state.lock();
                match state.stream.as_mut() {
                    Some(stream) => stream.write_all(msg.as_bytes()).is_ok(),
                    None => false,
                }
            };
            if written {
                break;
            }
            if upstream.state.lock().stream.take().is_some() {
                warn!("upstream pool failed, attempting reconnect while caching messages");
            }
            thread::sleep(RECONNECT_DELAY);
            while !upstream.connect(&conn) {
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// Reads upstream messages, pinging on quiet periods and classifying
/// everything that arrives.
fn receiver_loop(upstream: Arc<Upstream>, conn: Connector) {
    loop {
        let line = {
            let mut state = upstream.state.lock();
            let State { stream, rdbuf } = &mut *state;
            match stream.as_mut() {
                Some(stream) => read_line_timeout(stream, rdbuf, READ_TIMEOUT),
                None => {
                    // The sender owns reconnection; wait it out.
                    drop(state);
                    thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            }
        };
        match line {
            Ok(Some(line)) => dispatch(&conn, &line),
            Ok(None) => {
                trace!("no message from upstream pool");
                upstream.ping();
            }
            Err(e) => {
                info!("failed to read from upstream pool: {e}");
                upstream.ping();
                // The sender notices the dead link and reconnects; stay off
                // the lock while it does.
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// Routes one upstream line by its method field.
fn dispatch(conn: &Connector, line: &str) {
    let Ok(val) = serde_json::from_str::<Value>(line) else {
        warn!("received non-json msg from upstream pool: {}", line.trim_end());
        return;
    };
    let Some(method) = val.get("method").and_then(Value::as_str) else {
        warn!("failed to find method in upstream json: {}", line.trim_end());
        return;
    };
    match UpstreamMethod::classify(method) {
        Some(UpstreamMethod::Pong) => trace!("received upstream pong"),
        Some(_) => {
            debug!("upstream {method} message");
            conn.peers().forward_to_stratifier(val);
        }
        None => warn!("unrecognised upstream method {method}"),
    }
}

/// Reads one newline-terminated line, buffering partial reads. `Ok(None)`
/// means the timeout passed without a complete line.
fn read_line_timeout(
    stream: &mut TcpStream,
    rdbuf: &mut Vec<u8>,
    timeout: Duration,
) -> io::Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pos) = rdbuf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = rdbuf.drain(..=pos).collect();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        stream.set_read_timeout(Some(deadline - now))?;
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => return Err(io::Error::other("upstream closed connection")),
            Ok(n) => rdbuf.extend_from_slice(&chunk[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crate::config::Config;
    use crate::connector::Connector;

    use super::*;

    #[test]
    fn method_classification_table() {
        assert_eq!(
            UpstreamMethod::classify("mining.transactions"),
            Some(UpstreamMethod::Transactions)
        );
        assert_eq!(
            UpstreamMethod::classify("mining.authresult"),
            Some(UpstreamMethod::AuthResult)
        );
        assert_eq!(
            UpstreamMethod::classify("mining.workinfo"),
            Some(UpstreamMethod::WorkInfo)
        );
        assert_eq!(
            UpstreamMethod::classify("mining.block"),
            Some(UpstreamMethod::Block)
        );
        assert_eq!(
            UpstreamMethod::classify("mining.reqtxns"),
            Some(UpstreamMethod::ReqTxns)
        );
        assert_eq!(UpstreamMethod::classify("pong"), Some(UpstreamMethod::Pong));
        assert_eq!(UpstreamMethod::classify("mining.subscribe"), None);
    }

    #[test]
    fn line_reader_times_out_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        let _peer = listener.accept().unwrap();

        let mut rdbuf = Vec::new();
        let got = read_line_timeout(&mut stream, &mut rdbuf, Duration::from_millis(50)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn line_reader_assembles_split_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        peer.write_all(b"{\"method\":").unwrap();
        peer.write_all(b"\"pong\"}\nrest\n").unwrap();

        let mut rdbuf = Vec::new();
        let got = read_line_timeout(&mut stream, &mut rdbuf, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(got, "{\"method\":\"pong\"}\n");
        let got = read_line_timeout(&mut stream, &mut rdbuf, Duration::from_millis(200))
            .unwrap()
            .unwrap();
        assert_eq!(got, "rest\n");
    }

    #[test]
    fn handshake_requires_result_true() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = peer.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') {
                    break;
                }
            }
            let line = String::from_utf8(buf).unwrap();
            assert!(line.contains("mining.remote"));
            peer.write_all(b"{\"result\":true}\n").unwrap();
            // Hold the socket open until the client is done.
            std::thread::sleep(Duration::from_millis(100));
        });

        let (conn, _queues) = Connector::for_tests(Config::default());
        let (tx, _rx) = unbounded();
        let upstream = Upstream {
            url: "127.0.0.1".to_string(),
            port: addr.port(),
            state: Mutex::new(State::default()),
            sends: tx,
        };
        assert!(upstream.connect(&conn));
        assert!(upstream.state.lock().stream.is_some());
        server.join().unwrap();
    }

    #[test]
    fn pong_is_consumed_without_forwarding() {
        let (conn, queues) = Connector::for_tests(Config::default());
        dispatch(&conn, "{\"method\":\"pong\"}\n");
        assert!(queues.stratifier_recv.try_recv().is_err());

        dispatch(&conn, "{\"method\":\"mining.workinfo\",\"workinfo\":{}}\n");
        let msg = queues.stratifier_recv.recv().unwrap();
        assert_eq!(msg["method"], "mining.workinfo");
    }
}
