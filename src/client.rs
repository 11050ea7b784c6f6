//! Per-connection client records.
//!
//! A [`Client`] is recruited by the registry when a connection is accepted and
//! recycled once it is dead and unreferenced. The record itself is shared
//! between the receiver workers, the sender thread and the control loop, so
//! its hot fields are atomics; transitions between the live, dead and recycled
//! collections are serialized by the registry lock.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Largest frame accepted from a normal (non trusted-remote) client.
pub const MAX_MSGSIZE: usize = 1024;

/// Read buffers grow in page-aligned steps.
pub const PAGESIZE: usize = 4096;

/// Share echo entries older than this are aged out on insertion.
const SHARE_MAX_AGE: i64 = 120;

/// Builds a composite passthrough subclient id from the parent client id and
/// the sub-id assigned by the passthrough.
pub const fn pack_subclient(parent: i64, sub: i64) -> i64 {
    (parent << 32) | (sub & 0xffff_ffff)
}

/// The passthrough parent id of a composite subclient id, 0 when the id does
/// not belong to a subclient.
pub const fn subclient_parent(id: i64) -> i64 {
    (id >> 32) & 0xffff_ffff
}

/// The low 32 bits of a composite subclient id.
pub const fn subclient_low(id: i64) -> i64 {
    id & 0xffff_ffff
}

pub fn round_up_page(n: usize) -> usize {
    n.div_ceil(PAGESIZE) * PAGESIZE
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A share submitted through a redirector, remembered so the matching accept
/// response can promote the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Share {
    pub submitted: i64,
    pub id: i64,
}

/// One client connection.
///
/// `fd` is owned by the registry and cannot change while a reference is held,
/// which is what makes lock-free reads and writes from the worker and sender
/// threads sound.
pub struct Client {
    id: AtomicI64,
    fd: AtomicI32,
    /// References held outside the registry collections.
    refs: AtomicI32,
    /// Set once on drop; no new references may be taken afterwards.
    invalid: AtomicBool,

    passthrough: AtomicBool,
    remote: AtomicBool,
    redirected: AtomicBool,
    authorised: AtomicBool,

    /// Index of the listening socket this connection arrived on.
    server: AtomicUsize,
    /// Unix time a write first returned EAGAIN, 0 when not blocked.
    blocked_since: AtomicI64,
    /// Detected kernel send buffer size.
    sendbufsize: AtomicI32,
    /// Token of the in-flight outbound message, 0 when idle.
    sending: AtomicU64,

    address: Mutex<String>,
    rxbuf: Mutex<Vec<u8>>,
    shares: Mutex<Vec<Share>>,
}

impl Default for Client {
    fn default() -> Self {
        Client {
            id: AtomicI64::new(-1),
            fd: AtomicI32::new(-1),
            refs: AtomicI32::new(0),
            invalid: AtomicBool::new(false),
            passthrough: AtomicBool::new(false),
            remote: AtomicBool::new(false),
            redirected: AtomicBool::new(false),
            authorised: AtomicBool::new(false),
            server: AtomicUsize::new(0),
            blocked_since: AtomicI64::new(0),
            sendbufsize: AtomicI32::new(0),
            sending: AtomicU64::new(0),
            address: Mutex::new(String::new()),
            rxbuf: Mutex::new(Vec::new()),
            shares: Mutex::new(Vec::new()),
        }
    }
}

impl Client {
    pub fn id(&self) -> i64 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: i64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Relaxed);
    }

    /// Hands out the fd exactly once; later callers see `None`.
    pub(crate) fn take_fd(&self) -> Option<RawFd> {
        let fd = self.fd.swap(-1, Ordering::Relaxed);
        (fd >= 0).then_some(fd)
    }

    /// Borrow the fd for a read or write. The caller must hold a reference,
    /// which guarantees the fd is not recycled underneath it.
    pub(crate) fn borrowed_fd(&self) -> Option<BorrowedFd<'_>> {
        let fd = self.fd();
        (fd >= 0).then(|| unsafe { BorrowedFd::borrow_raw(fd) })
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_invalid(&self) {
        self.invalid.store(true, Ordering::Relaxed);
    }

    pub(crate) fn refs(&self) -> i32 {
        self.refs.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_refs(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_refs(&self) {
        self.refs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    pub(crate) fn set_passthrough(&self) {
        self.passthrough.store(true, Ordering::Relaxed);
    }

    pub fn is_remote(&self) -> bool {
        self.remote.load(Ordering::Relaxed)
    }

    pub(crate) fn set_remote(&self) {
        self.remote.store(true, Ordering::Relaxed);
    }

    pub fn is_redirected(&self) -> bool {
        self.redirected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_redirected(&self) {
        self.redirected.store(true, Ordering::Relaxed);
    }

    pub fn is_authorised(&self) -> bool {
        self.authorised.load(Ordering::Relaxed)
    }

    pub(crate) fn set_authorised(&self) {
        self.authorised.store(true, Ordering::Relaxed);
    }

    pub fn server(&self) -> usize {
        self.server.load(Ordering::Relaxed)
    }

    pub(crate) fn set_server(&self, server: usize) {
        self.server.store(server, Ordering::Relaxed);
    }

    pub(crate) fn blocked_since(&self) -> i64 {
        self.blocked_since.load(Ordering::Relaxed)
    }

    pub(crate) fn set_blocked_since(&self, t: i64) {
        self.blocked_since.store(t, Ordering::Relaxed);
    }

    pub(crate) fn sendbufsize(&self) -> i32 {
        self.sendbufsize.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sendbufsize(&self, size: i32) {
        self.sendbufsize.store(size, Ordering::Relaxed);
    }

    pub(crate) fn sending(&self) -> u64 {
        self.sending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sending(&self, token: u64) {
        self.sending.store(token, Ordering::Relaxed);
    }

    pub fn address_name(&self) -> String {
        self.address.lock().clone()
    }

    pub(crate) fn set_address(&self, name: String) {
        *self.address.lock() = name;
    }

    /// The read buffer. Only ever locked by the single worker currently
    /// processing this client's oneshot event.
    pub(crate) fn rxbuf(&self) -> &Mutex<Vec<u8>> {
        &self.rxbuf
    }

    /// Appends a share echo entry and ages out stale ones. The aging only
    /// runs here, on insertion.
    pub(crate) fn push_share(&self, now: i64, id: i64) {
        let mut shares = self.shares.lock();
        shares.push(Share { submitted: now, id });
        shares.retain(|s| now <= s.submitted + SHARE_MAX_AGE);
    }

    pub(crate) fn has_share(&self, id: i64) -> bool {
        self.shares.lock().iter().any(|s| s.id == id)
    }

    pub(crate) fn clear_shares(&self) {
        self.shares.lock().clear();
    }

    /// Prepares a fresh record for the recycled list.
    pub(crate) fn reset(&self) {
        self.id.store(-1, Ordering::Relaxed);
        self.fd.store(-1, Ordering::Relaxed);
        self.refs.store(0, Ordering::Relaxed);
        self.invalid.store(false, Ordering::Relaxed);
        self.passthrough.store(false, Ordering::Relaxed);
        self.remote.store(false, Ordering::Relaxed);
        self.redirected.store(false, Ordering::Relaxed);
        self.authorised.store(false, Ordering::Relaxed);
        self.server.store(0, Ordering::Relaxed);
        self.blocked_since.store(0, Ordering::Relaxed);
        self.sendbufsize.store(0, Ordering::Relaxed);
        self.sending.store(0, Ordering::Relaxed);
        self.address.lock().clear();
        let mut rx = self.rxbuf.lock();
        rx.clear();
        rx.shrink_to_fit();
        self.shares.lock().clear();
    }
}
