//! The client registry.
//!
//! Owns every client record for the life of the process. A record is always
//! reachable from exactly one of three collections: the live map keyed by id,
//! the dead list, or the recycled free list, and only ever moves live → dead
//! → recycled.
//!
//! References held outside those collections are counted explicitly.
//! [`ClientRef`] is a scoped acquisition: it increments the count when taken
//! and decrements on drop, on every exit path. The epoll registration holds
//! one long-lived count that is released exactly once, at invalidation. A
//! dead record is recycled lazily, when its count reaches zero.
//!
//! One writer-preferring rwlock guards the collections, the id counter, the
//! redirect map and all count mutations. Lookups that mutate nothing take the
//! shared side.

use std::mem;
use std::ops::Deref;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::client::{subclient_parent, Client, PAGESIZE};
use crate::listener::{close_fd, nolinger};

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<State>>,
}

struct State {
    clients: FxHashMap<i64, Arc<Client>>,
    dead: Vec<Arc<Client>>,
    recycled: Vec<Arc<Client>>,
    /// Next id to assign. Ids below the listener count are reserved so epoll
    /// user-data can discriminate accepts from data events.
    next_id: i64,
    clients_generated: i64,
    dead_generated: i64,
    /// Redirected IP addresses, never evicted.
    redirects: FxHashMap<String, usize>,
    /// Round-robin cursor into the redirect url table.
    redirect_next: usize,
}

/// A counted reference to a live (or recently dead) client.
///
/// Holding one guarantees the record and its fd are not recycled.
pub struct ClientRef {
    registry: Registry,
    client: Arc<Client>,
}

impl Deref for ClientRef {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Clone for ClientRef {
    fn clone(&self) -> Self {
        let _guard = self.registry.inner.write();
        self.client.inc_refs();
        ClientRef {
            registry: self.registry.clone(),
            client: Arc::clone(&self.client),
        }
    }
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        let _guard = self.registry.inner.write();
        self.client.dec_refs();
    }
}

/// Point-in-time registry counters for the stats report.
pub struct RegistryStats {
    pub live: usize,
    pub live_memory: usize,
    pub live_generated: i64,
    pub dead: usize,
    pub dead_memory: usize,
    pub dead_generated: i64,
}

impl Registry {
    /// `reserved_ids` is the number of listening sockets; client ids start
    /// above them.
    pub fn new(reserved_ids: usize) -> Self {
        Registry {
            inner: Arc::new(RwLock::new(State {
                clients: FxHashMap::default(),
                dead: Vec::new(),
                recycled: Vec::new(),
                next_id: reserved_ids as i64,
                clients_generated: 0,
                dead_generated: 0,
                redirects: FxHashMap::default(),
                redirect_next: 0,
            })),
        }
    }

    /// Returns a zeroed record, drawing from the recycled list first.
    pub fn recruit(&self) -> Arc<Client> {
        let recycled = {
            let mut state = self.inner.write();
            match state.recycled.pop() {
                Some(client) => Some(client),
                None => {
                    state.clients_generated += 1;
                    None
                }
            }
        };
        let client = match recycled {
            Some(client) => {
                trace!("recycled client instance");
                client
            }
            None => {
                trace!("created new client instance");
                Arc::new(Client::default())
            }
        };
        client.rxbuf().lock().reserve(PAGESIZE);
        client
    }

    /// Assigns the next id, installs the record in the live map and takes the
    /// reference representing the epoll registration.
    pub fn insert(&self, client: Arc<Client>, fd: RawFd, server: usize, address: String) -> i64 {
        client.set_fd(fd);
        client.set_server(server);
        client.set_address(address);
        let mut state = self.inner.write();
        let id = state.next_id;
        state.next_id += 1;
        client.set_id(id);
        client.inc_refs();
        state.clients.insert(id, client);
        id
    }

    /// Takes a counted reference by id. Returns `None` for missing or
    /// invalidated clients. A passthrough subclient id references its parent.
    pub fn ref_by_id(&self, id: i64) -> Option<ClientRef> {
        let parent = subclient_parent(id);
        let id = if parent != 0 { parent } else { id };
        let state = self.inner.write();
        let client = state.clients.get(&id)?;
        if client.is_invalid() {
            return None;
        }
        client.inc_refs();
        let client = Arc::clone(client);
        drop(state);
        Some(ClientRef {
            registry: self.clone(),
            client,
        })
    }

    /// Lookup without taking a reference. A subclient exists while its
    /// passthrough parent does.
    pub fn exists(&self, id: i64) -> bool {
        let parent = subclient_parent(id);
        let id = if parent != 0 { parent } else { id };
        self.inner.read().clients.contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().clients.len()
    }

    /// Hands out the next monotonic id, letting peers allocate virtual ids
    /// from the same sequence as real clients.
    pub fn next_client_id(&self) -> i64 {
        let mut state = self.inner.write();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Marks the client invalid, closes its fd and moves it to the dead list,
    /// releasing the epoll reference. Idempotent: returns `None` when the
    /// client was already dropped, otherwise the fd it was using.
    pub fn drop_client(&self, client: &Client) -> Option<RawFd> {
        let mut state = self.inner.write();
        drop_locked(&mut state, client)
    }

    /// Drops every live client. Used when a passthrough is told to reject.
    pub fn drop_all(&self) {
        let mut state = self.inner.write();
        let all: Vec<Arc<Client>> = state.clients.values().cloned().collect();
        for client in all {
            drop_locked(&mut state, &client);
        }
    }

    /// Culls dead records with no remaining references: the buffer is freed,
    /// the id reset, and the record moved to the recycled list.
    pub fn sweep_dead(&self) {
        let mut state = self.inner.write();
        let mut i = 0;
        while i < state.dead.len() {
            if state.dead[i].refs() != 0 {
                i += 1;
                continue;
            }
            let client = state.dead.swap_remove(i);
            debug!("recycling client {}", client.id());
            // The fd was normally closed at drop time; a still-open one is
            // discarded without lingering.
            if let Some(fd) = client.take_fd() {
                nolinger(unsafe { BorrowedFd::borrow_raw(fd) });
                close_fd(fd);
            }
            client.reset();
            state.recycled.push(client);
        }
    }

    /// Returns a recruited record that never made it into the live map
    /// straight to the recycled list.
    pub(crate) fn recycle(&self, client: Arc<Client>) {
        client.reset();
        self.inner.write().recycled.push(client);
    }

    /// Releases the epoll reference of a client that never made it into the
    /// epoll set.
    pub(crate) fn dec_ref(&self, client: &Client) {
        let _guard = self.inner.write();
        client.dec_refs();
    }

    /// The redirect url index previously chosen for this address, if any.
    pub fn redirect_lookup(&self, address: &str) -> Option<usize> {
        self.inner.read().redirects.get(address).copied()
    }

    /// Chooses (or recalls) the redirect url index for an address. The bool
    /// reports whether the address was already known. Entries persist for the
    /// process lifetime.
    pub fn redirect_insert(&self, address: &str, nurls: usize) -> (usize, bool) {
        let mut state = self.inner.write();
        if let Some(&no) = state.redirects.get(address) {
            return (no, true);
        }
        let no = state.redirect_next;
        state.redirect_next = (state.redirect_next + 1) % nurls.max(1);
        state.redirects.insert(address.to_string(), no);
        (no, false)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.read();
        let live = state.clients.len();
        let entry = mem::size_of::<(i64, Arc<Client>)>() + mem::size_of::<Client>();
        RegistryStats {
            live,
            live_memory: live * entry,
            live_generated: state.clients_generated,
            dead: state.dead.len(),
            dead_memory: state.dead.len() * mem::size_of::<Client>(),
            dead_generated: state.dead_generated,
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        let state = self.inner.read();
        (
            state.clients.len(),
            state.dead.len(),
            state.recycled.len(),
        )
    }
}

fn drop_locked(state: &mut State, client: &Client) -> Option<RawFd> {
    if client.is_invalid() {
        return None;
    }
    client.set_invalid();
    let fd = client.take_fd();
    // Closing the fd also removes it from the epoll set.
    if let Some(fd) = fd {
        close_fd(fd);
    }
    if let Some(arc) = state.clients.remove(&client.id()) {
        state.dead.push(arc);
    }
    // The reference representing this client's epoll registration.
    client.dec_refs();
    state.dead_generated += 1;
    fd
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::client::pack_subclient;

    fn fresh_fd() -> RawFd {
        let (a, _b) = UnixStream::pair().unwrap();
        a.into_raw_fd()
    }

    fn registry_with_client() -> (Registry, i64) {
        let registry = Registry::new(1);
        let client = registry.recruit();
        let id = registry.insert(client, fresh_fd(), 0, "127.0.0.1".into());
        (registry, id)
    }

    #[test]
    fn ids_start_above_reserved_range_and_are_unique() {
        let registry = Registry::new(3);
        let mut seen = Vec::new();
        for _ in 0..10 {
            let client = registry.recruit();
            let id = registry.insert(client, fresh_fd(), 0, "127.0.0.1".into());
            assert!(id >= 3);
            assert!(!seen.contains(&id));
            seen.push(id);
        }
    }

    #[test]
    fn dropped_ids_are_never_reassigned() {
        let (registry, first) = registry_with_client();
        let client = registry.ref_by_id(first).unwrap();
        registry.drop_client(&client);
        drop(client);
        registry.sweep_dead();

        // The recycled record is reused but gets a fresh id.
        let client = registry.recruit();
        let id = registry.insert(client, fresh_fd(), 0, "127.0.0.1".into());
        assert_ne!(id, first);
    }

    #[test]
    fn ref_by_id_fails_for_missing_and_invalid() {
        let (registry, id) = registry_with_client();
        assert!(registry.ref_by_id(id + 1).is_none());

        let client = registry.ref_by_id(id).unwrap();
        registry.drop_client(&client);
        assert!(registry.ref_by_id(id).is_none());
        drop(client);
    }

    #[test]
    fn record_lives_in_exactly_one_collection() {
        let (registry, id) = registry_with_client();
        assert_eq!(registry.counts(), (1, 0, 0));

        let client = registry.ref_by_id(id).unwrap();
        registry.drop_client(&client);
        assert_eq!(registry.counts(), (0, 1, 0));

        // Still referenced: the sweep must not recycle it.
        registry.sweep_dead();
        assert_eq!(registry.counts(), (0, 1, 0));

        drop(client);
        registry.sweep_dead();
        assert_eq!(registry.counts(), (0, 0, 1));
    }

    #[test]
    fn recycled_record_is_reset() {
        let (registry, id) = registry_with_client();
        let client = registry.ref_by_id(id).unwrap();
        let arc = Arc::clone(&client.client);
        registry.drop_client(&client);
        drop(client);
        registry.sweep_dead();

        assert_eq!(arc.id(), -1);
        assert_eq!(arc.refs(), 0);
        assert_eq!(arc.fd(), -1);
        assert!(!arc.is_invalid());
    }

    #[test]
    fn drop_is_idempotent() {
        let (registry, id) = registry_with_client();
        let client = registry.ref_by_id(id).unwrap();
        assert!(registry.drop_client(&client).is_some());
        assert!(registry.drop_client(&client).is_none());
        drop(client);
    }

    #[test]
    fn subclient_id_references_parent() {
        let (registry, parent) = registry_with_client();
        let sub = pack_subclient(parent, 7);
        let client = registry.ref_by_id(sub).unwrap();
        assert_eq!(client.id(), parent);
        assert!(registry.exists(sub));
    }

    #[test]
    fn refs_track_acquisitions() {
        let (registry, id) = registry_with_client();
        let a = registry.ref_by_id(id).unwrap();
        // One for epoll, one for `a`.
        assert_eq!(a.refs(), 2);
        let b = a.clone();
        assert_eq!(a.refs(), 3);
        drop(b);
        assert_eq!(a.refs(), 2);
        drop(a);
    }

    #[test]
    fn redirects_round_robin_and_persist() {
        let registry = Registry::new(1);
        assert_eq!(registry.redirect_insert("10.0.0.1", 2), (0, false));
        assert_eq!(registry.redirect_insert("10.0.0.2", 2), (1, false));
        assert_eq!(registry.redirect_insert("10.0.0.3", 2), (0, false));
        assert_eq!(registry.redirect_insert("10.0.0.1", 2), (0, true));
        assert_eq!(registry.redirect_lookup("10.0.0.2"), Some(1));
        assert_eq!(registry.redirect_lookup("10.9.9.9"), None);
    }

    #[test]
    fn drop_all_empties_the_live_map() {
        let registry = Registry::new(1);
        for _ in 0..5 {
            let client = registry.recruit();
            registry.insert(client, fresh_fd(), 0, "127.0.0.1".into());
        }
        registry.drop_all();
        assert_eq!(registry.client_count(), 0);
        let (live, dead, _) = registry.counts();
        assert_eq!(live, 0);
        assert_eq!(dead, 5);
    }
}
