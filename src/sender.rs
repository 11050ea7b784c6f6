//! The outbound side: a dedicated thread draining a cross-thread send queue
//! with non-blocking writes.
//!
//! Messages for one client are strictly FIFO: the client's in-flight token
//! gates `try_write` so a later message can never overtake a blocked earlier
//! one. A client whose socket stays unwritable for 60 seconds is invalidated
//! and its pending message discarded.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, trace, warn};
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};

use crate::client::{subclient_parent, unix_now};
use crate::connector::Connector;
use crate::listener::set_sendbufsize;
use crate::redirector;
use crate::registry::ClientRef;

/// Invalidate clients whose writes have blocked this long.
const BLOCK_TIMEOUT_SECS: i64 = 60;

/// How long the sender dozes when there is nothing new to splice.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One queued outbound message. Holds a counted reference to its client
/// until it is written out or discarded.
pub(crate) struct SenderSend {
    token: u64,
    client: ClientRef,
    buf: Vec<u8>,
    ofs: usize,
}

impl SenderSend {
    fn footprint(&self) -> i64 {
        (mem::size_of::<SenderSend>() + self.buf.len() + 1) as i64
    }
}

#[derive(Default)]
struct Shared {
    incoming: VecDeque<SenderSend>,
    generated: i64,
    /// Number of sends that could not complete on the last pass.
    queued: i64,
    /// Bytes held by those sends.
    size: i64,
    /// All-time count of delayed sends.
    delayed: i64,
}

/// The cross-thread send queue: owners enqueue, the sender thread splices.
pub(crate) struct SendQueue {
    shared: Mutex<Shared>,
    cond: Condvar,
    next_token: AtomicU64,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        SendQueue {
            shared: Mutex::new(Shared::default()),
            cond: Condvar::new(),
            // Token 0 means "no send in flight".
            next_token: AtomicU64::new(1),
        }
    }

    fn make(&self, client: ClientRef, buf: Vec<u8>) -> SenderSend {
        SenderSend {
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            client,
            buf,
            ofs: 0,
        }
    }

    fn push(&self, send: SenderSend) {
        let mut shared = self.shared.lock();
        shared.generated += 1;
        shared.incoming.push_back(send);
        self.cond.notify_one();
    }

    /// Messages enqueued but not yet picked up by the sender thread.
    pub(crate) fn pending(&self) -> usize {
        self.shared.lock().incoming.len()
    }

    /// Counters for the stats report: (pending count, pending memory,
    /// generated, queued, queued memory, delayed).
    pub(crate) fn stats(&self) -> (usize, i64, i64, i64, i64, i64) {
        let shared = self.shared.lock();
        let memory = shared.incoming.iter().map(SenderSend::footprint).sum();
        (
            shared.incoming.len(),
            memory,
            shared.generated,
            shared.queued,
            shared.size,
            shared.delayed,
        )
    }
}

/// The sender thread body: drain what is writable, splice in new work,
/// sleep at most [`POLL_INTERVAL`].
pub(crate) fn run(conn: Connector) {
    let mut sends: VecDeque<SenderSend> = VecDeque::new();
    loop {
        let now = unix_now();
        let mut queued = 0i64;
        let mut size = 0i64;
        sends.retain_mut(|send| {
            if try_write(&conn, send, now) {
                // Dropping the send releases its client reference.
                false
            } else {
                queued += 1;
                size += send.footprint();
                true
            }
        });

        let q = conn.sendq();
        let mut shared = q.shared.lock();
        shared.delayed += queued;
        shared.queued = queued;
        shared.size = size;
        if shared.incoming.is_empty() {
            q.cond.wait_for(&mut shared, POLL_INTERVAL);
        }
        sends.extend(shared.incoming.drain(..));
    }
}

/// Attempts one non-blocking write pass. Returns `true` once the message is
/// finished with: fully written, discarded for an invalid client, or the
/// client was invalidated for stalling.
fn try_write(conn: &Connector, send: &mut SenderSend, now: i64) -> bool {
    let client = &send.client;
    if client.is_invalid() {
        client.set_sending(0);
        return true;
    }
    // Only one message at a time per client, in queue order.
    let in_flight = client.sending();
    if in_flight != 0 && in_flight != send.token {
        return false;
    }
    client.set_sending(send.token);

    // Grow the kernel buffer to fit large messages, typically only for
    // mining-node clients. Skipped once the process knows it cannot.
    if send.buf.len() as i32 > client.sendbufsize() && !conn.wmem_warned() {
        if let Some(fd) = client.borrowed_fd() {
            let got = set_sendbufsize(fd, send.buf.len(), conn.wmem_warn());
            client.set_sendbufsize(got);
        }
    }

    while send.ofs < send.buf.len() {
        let Some(fd) = client.borrowed_fd() else {
            client.set_sending(0);
            return true;
        };
        match nix::unistd::write(fd, &send.buf[send.ofs..]) {
            Ok(0) | Err(Errno::EAGAIN) => {
                let blocked = client.blocked_since();
                if blocked != 0 && now - blocked >= BLOCK_TIMEOUT_SECS {
                    info!(
                        "client id {} fd {} blocked for >{BLOCK_TIMEOUT_SECS} seconds, disconnecting",
                        client.id(),
                        client.fd()
                    );
                    conn.invalidate_client(client);
                    client.set_sending(0);
                    return true;
                }
                if blocked == 0 {
                    client.set_blocked_since(now);
                }
                return false;
            }
            Ok(n) => {
                send.ofs += n;
                client.set_blocked_since(0);
            }
            Err(e) => {
                debug!(
                    "client id {} fd {} disconnected with write errno: {}",
                    client.id(),
                    client.fd(),
                    e
                );
                conn.invalidate_client(client);
                client.set_sending(0);
                return true;
            }
        }
    }
    client.set_sending(0);
    true
}

/// Queues a heap-owned buffer for a client by id, taking ownership either
/// way. Unknown ids are reported back to the stratifier as drops.
pub fn send_client(conn: &Connector, id: i64, buf: Vec<u8>) {
    if buf.is_empty() {
        warn!("send_client called with an empty buffer for client {id}");
        return;
    }
    if conn.cfg().node && id == 0 {
        // Messages addressed to nobody are for the node itself.
        trace!("message for node: {}", String::from_utf8_lossy(&buf));
        conn.peers()
            .stratifier_command(String::from_utf8_lossy(&buf).into_owned());
        return;
    }

    // A passthrough subclient id resolves to its parent connection.
    let Some(client) = conn.registry().ref_by_id(id) else {
        debug!("failed to find client id {id} to send to");
        conn.peers().stratifier_drop_id(id);
        return;
    };

    // Clients matching the IP of already-redirected clients go immediately;
    // otherwise an accepted share from the echo list promotes them.
    let mut redirect = false;
    if conn.cfg().redirector
        && subclient_parent(id) == 0
        && !client.is_redirected()
        && client.is_authorised()
    {
        redirect = conn
            .registry()
            .redirect_lookup(&client.address_name())
            .is_some()
            || redirector::test_redirector_shares(&client, &buf);
    }

    let send = conn.sendq().make(client.clone(), buf);
    conn.sendq().push(send);

    // Redirect after the share/authorise response is on its way out.
    if redirect {
        redirector::redirect_client(conn, &client);
    }
}

/// Encodes a JSON value compactly with a trailing newline and queues it.
pub(crate) fn send_client_json(conn: &Connector, client_id: i64, mut msg: Value) {
    if conn.cfg().node {
        if let Some(client) = conn.registry().ref_by_id(client_id) {
            let mut copy = msg.clone();
            if let Some(obj) = copy.as_object_mut() {
                obj.insert("client_id".to_string(), json!(client_id));
                obj.insert("address".to_string(), json!(client.address_name()));
                obj.insert("server".to_string(), json!(client.server()));
            }
            conn.peers().forward_to_stratifier(copy);
        }
    }
    if conn.cfg().passthrough && client_id != 0 {
        if let Some(obj) = msg.as_object_mut() {
            obj.remove("node.method");
        }
    }
    let mut line = msg.to_string();
    line.push('\n');
    send_client(conn, client_id, line.into_bytes());
}

/// Queues a message built by the redirector directly, bypassing the
/// redirect checks in [`send_client`].
pub(crate) fn queue_direct(conn: &Connector, client: ClientRef, buf: Vec<u8>) {
    let send = conn.sendq().make(client, buf);
    conn.sendq().push(send);
}

/// Runs sender passes until nothing remains queued. Test-only stand-in for
/// the sender thread.
#[cfg(test)]
pub(crate) fn drain_for_tests(conn: &Connector) {
    let mut sends: VecDeque<SenderSend> = VecDeque::new();
    loop {
        sends.extend(conn.sendq().shared.lock().incoming.drain(..));
        if sends.is_empty() {
            return;
        }
        sends.retain_mut(|send| !try_write(conn, send, unix_now()));
        if !sends.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
