//! The connector service object.
//!
//! One [`Connector`] per process: it owns the registry, the send queue, the
//! epoll instance and the peer links, and spawns every thread. Handles are
//! cheap clones of an `Arc`; there are no globals and no hidden singletons.
//! Construction is explicit and ordered: config, listeners, queues, then
//! threads.

use std::io;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::unbounded;
use log::{error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::client::Client;
use crate::config::Config;
use crate::control;
use crate::error::Error;
use crate::listener::Listener;
use crate::peers::{self, PeerQueues, Peers};
use crate::poller::Poller;
use crate::receiver;
use crate::registry::Registry;
use crate::sender::{self, SendQueue};
use crate::upstream::{self, Upstream};

#[derive(Clone)]
pub struct Connector {
    shared: Arc<Shared>,
}

struct Shared {
    cfg: Config,
    registry: Registry,
    peers: Peers,
    sendq: SendQueue,
    poller: Poller,
    listeners: Vec<Listener>,

    /// The acceptor gate, toggled over the control socket.
    accept: AtomicBool,
    /// Set once the stratifier can consume what we forward.
    stratifier_ready: AtomicBool,

    /// One-shot latches for the buffer-size warnings.
    wmem_warn: AtomicBool,
    rmem_warn: AtomicBool,

    /// All-time count of accepted connections.
    nfds: AtomicU64,

    /// The client-message processor's receiving end, taken by `start`.
    cmpq_rx: Mutex<Option<crossbeam_channel::Receiver<Value>>>,

    upstream: OnceLock<Arc<Upstream>>,
}

impl Connector {
    /// Builds the service object around already-bound listeners. Returns the
    /// handle and the receiving halves of the peer links.
    pub fn new(cfg: Config, listeners: Vec<Listener>) -> Result<(Connector, PeerQueues), Error> {
        cfg.validate()?;
        let poller = Poller::new()?;
        let (peers, queues) = peers::channels();
        let registry = Registry::new(listeners.len());
        let shared = Shared {
            cfg,
            registry,
            peers,
            sendq: SendQueue::new(),
            poller,
            listeners,
            accept: AtomicBool::new(false),
            stratifier_ready: AtomicBool::new(false),
            wmem_warn: AtomicBool::new(false),
            rmem_warn: AtomicBool::new(false),
            nfds: AtomicU64::new(0),
            cmpq_rx: Mutex::new(Some(queues.cmpq.clone())),
            upstream: OnceLock::new(),
        };
        Ok((
            Connector {
                shared: Arc::new(shared),
            },
            queues,
        ))
    }

    /// Spawns the sender, the client-message processor, the event workers
    /// and the receiver. In remote mode the upstream link is established
    /// first and its failure to configure is fatal.
    pub fn start(&self) -> Result<(), Error> {
        if self.cfg().remote {
            upstream::setup(self)?;
        }

        {
            let conn = self.clone();
            thread::Builder::new()
                .name("sender".to_string())
                .spawn(move || sender::run(conn))?;
        }

        {
            let conn = self.clone();
            let cmpq_rx = self
                .shared
                .cmpq_rx
                .lock()
                .take()
                .ok_or_else(|| Error::Io(io::Error::other("connector already started")))?;
            thread::Builder::new()
                .name("cmpq".to_string())
                .spawn(move || {
                    while let Ok(msg) = cmpq_rx.recv() {
                        control::client_message_processor(&conn, msg);
                    }
                })?;
        }

        let (cevents_tx, cevents_rx) = unbounded();
        let workers = thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1);
        for i in 0..workers {
            let conn = self.clone();
            let rx = cevents_rx.clone();
            thread::Builder::new()
                .name(format!("cevent-{i}"))
                .spawn(move || receiver::worker(conn, rx))?;
        }

        {
            let conn = self.clone();
            thread::Builder::new()
                .name("receiver".to_string())
                .spawn(move || {
                    if let Err(e) = receiver::run(conn, cevents_tx) {
                        error!("FATAL: receiver failed: {e}");
                        std::process::exit(1);
                    }
                })?;
        }

        info!("connector started with {workers} event workers");
        Ok(())
    }

    /// Runs the control loop on the caller's thread. Only returns when the
    /// control socket itself fails, which is process-fatal.
    pub fn run_control(&self, listener: UnixListener) -> io::Error {
        control::run(self, listener)
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.shared.cfg
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn peers(&self) -> &Peers {
        &self.shared.peers
    }

    pub(crate) fn sendq(&self) -> &SendQueue {
        &self.shared.sendq
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.shared.poller
    }

    pub(crate) fn listeners(&self) -> &[Listener] {
        &self.shared.listeners
    }

    pub fn accepting(&self) -> bool {
        self.shared.accept.load(Ordering::Relaxed)
    }

    pub fn set_accept(&self, accept: bool) {
        self.shared.accept.store(accept, Ordering::Relaxed);
    }

    pub fn stratifier_ready(&self) -> bool {
        self.shared.stratifier_ready.load(Ordering::Relaxed)
    }

    pub fn set_stratifier_ready(&self) {
        self.shared.stratifier_ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn wmem_warn(&self) -> &AtomicBool {
        &self.shared.wmem_warn
    }

    pub(crate) fn wmem_warned(&self) -> bool {
        self.shared.wmem_warn.load(Ordering::Relaxed)
    }

    pub(crate) fn rmem_warn(&self) -> &AtomicBool {
        &self.shared.rmem_warn
    }

    pub(crate) fn bump_nfds(&self) -> u64 {
        self.shared.nfds.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queues an outbound JSON message through the client-message processor.
    pub fn add_message(&self, msg: Value) {
        self.peers().queue_client_message(msg);
    }

    /// Allocates a fresh client id for peers that multiplex virtual clients.
    pub fn new_client_id(&self) -> i64 {
        self.registry().next_client_id()
    }

    /// Queues a line for the upstream pool in remote mode.
    pub fn upstream_msg(&self, msg: String) {
        trace!("upstreaming {}", msg.trim_end());
        match self.shared.upstream.get() {
            Some(upstream) => upstream.queue(msg),
            None => warn!("upstream message queued without an upstream link"),
        }
    }

    pub(crate) fn install_upstream(&self, upstream: Arc<Upstream>) {
        if self.shared.upstream.set(upstream).is_err() {
            warn!("upstream link installed twice");
        }
    }

    /// Invalidates a client: drops it from the live set, notifies the
    /// stratifier (and the generator in passthrough mode) and lazily culls
    /// unreferenced dead records.
    pub(crate) fn invalidate_client(&self, client: &Client) {
        let id = client.id();
        let passthrough = client.is_passthrough();
        let remote = client.is_remote();
        let address = client.address_name();
        let server = client.server();

        if let Some(fd) = self.registry().drop_client(client) {
            if passthrough {
                info!("dropped passthrough {id} {address}");
            } else if remote {
                warn!("remote trusted server client {id} {address} disconnected");
            }
            trace!("dropped client {id} fd {fd}");
            self.peers().stratifier_drop_id(id);
            if self.cfg().passthrough {
                self.peers().generator_drop_client(id, &address, server);
            }
        }
        self.registry().sweep_dead();
    }

    /// The stats blob served over the control socket.
    pub fn stats_json(&self) -> Value {
        let reg = self.registry().stats();
        let (pending, pending_memory, generated, queued, queued_memory, delayed) =
            self.sendq().stats();
        json!({
            "clients": {
                "count": reg.live,
                "memory": reg.live_memory,
                "generated": reg.live_generated,
            },
            "dead": {
                "count": reg.dead,
                "memory": reg.dead_memory,
                "generated": reg.dead_generated,
            },
            "sends": {
                "count": pending,
                "memory": pending_memory,
                "generated": generated,
            },
            "delays": {
                "count": queued,
                "memory": queued_memory,
                "generated": delayed,
            },
        })
    }

    /// A connector with no listeners and open gates, for exercising the
    /// pipeline against hand-installed clients.
    #[cfg(test)]
    pub(crate) fn for_tests(cfg: Config) -> (Connector, PeerQueues) {
        let (peers, queues) = peers::channels();
        let shared = Shared {
            cfg,
            registry: Registry::new(1),
            peers,
            sendq: SendQueue::new(),
            poller: Poller::new().unwrap(),
            listeners: Vec::new(),
            accept: AtomicBool::new(true),
            stratifier_ready: AtomicBool::new(true),
            wmem_warn: AtomicBool::new(false),
            rmem_warn: AtomicBool::new(false),
            nfds: AtomicU64::new(0),
            cmpq_rx: Mutex::new(Some(queues.cmpq.clone())),
            upstream: OnceLock::new(),
        };
        (
            Connector {
                shared: Arc::new(shared),
            },
            queues,
        )
    }

    #[cfg(test)]
    pub(crate) fn drain_sends_for_tests(&self) {
        sender::drain_for_tests(self);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn invalidation_notifies_generator_in_passthrough_mode() {
        let cfg = Config {
            passthrough: true,
            ..Config::default()
        };
        let (conn, queues) = Connector::for_tests(cfg);
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let client = conn.registry().recruit();
        let id = conn
            .registry()
            .insert(client, ours.into_raw_fd(), 0, "10.0.0.9".into());

        let client = conn.registry().ref_by_id(id).unwrap();
        conn.invalidate_client(&client);

        assert_eq!(
            queues.stratifier_proc.recv().unwrap(),
            format!("dropclient={id}")
        );
        let term = queues.generator_send.recv().unwrap();
        assert_eq!(term["method"], "mining.term");
        assert_eq!(term["client_id"], id);
    }

    #[test]
    fn invalidation_is_idempotent_on_notifications() {
        let (conn, queues) = Connector::for_tests(Config::default());
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let client = conn.registry().recruit();
        let id = conn
            .registry()
            .insert(client, ours.into_raw_fd(), 0, "10.0.0.9".into());

        let client = conn.registry().ref_by_id(id).unwrap();
        conn.invalidate_client(&client);
        conn.invalidate_client(&client);
        assert!(queues.stratifier_proc.recv().is_ok());
        assert!(queues.stratifier_proc.try_recv().is_err());
    }

    #[test]
    fn end_to_end_echo_framing() {
        let (conn, queues) = Connector::for_tests(Config::default());
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let client = conn.registry().recruit();
        let id = conn
            .registry()
            .insert(client, ours.into_raw_fd(), 0, "127.0.0.1".into());

        theirs
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .unwrap();
        let client = conn.registry().ref_by_id(id).unwrap();
        assert!(crate::parser::parse_client_msg(&conn, &client));

        let msg = queues.stratifier_recv.recv().unwrap();
        let expected = json!({
            "id": 1,
            "method": "mining.subscribe",
            "params": [],
            "client_id": id,
            "address": "127.0.0.1",
            "server": 0,
        });
        assert_eq!(msg, expected);
    }
}
