//! Ownership of the epoll instance.
//!
//! The poller discriminates events by their user-data value: listening
//! sockets are registered with their index, clients with their id. Client ids
//! start above the listener count, so the receiver can tell an accept event
//! from a data event by numeric range alone.
//!
//! Clients are armed `EPOLLIN | EPOLLRDHUP | EPOLLONESHOT`: a worker owns the
//! client until it re-arms it, so no two workers ever process the same client
//! concurrently.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};

use crate::error::Error;
use crate::events::{interest, Readiness};

/// How long one `epoll_wait` blocks.
const WAIT_MS: u16 = 1000;

/// A ready event handed off to a worker. Ownership of the event data moves
/// with it; the receiver keeps nothing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientEvent {
    pub data: u64,
    pub readiness: Readiness,
}

pub(crate) struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub(crate) fn new() -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::Epoll(io::Error::from(e)))?;
        Ok(Poller { epoll })
    }

    /// Registers a listening socket under its index.
    pub(crate) fn add_listener(&self, fd: RawFd, index: usize) -> io::Result<()> {
        let event = EpollEvent::new(interest().read().rdhup().bitflags(), index as u64);
        self.epoll
            .add(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            .map_err(io::Error::from)
    }

    /// Registers a freshly accepted client under its id.
    pub(crate) fn add_client(&self, fd: RawFd, id: i64) -> io::Result<()> {
        let event = EpollEvent::new(interest().read().rdhup().oneshot().bitflags(), id as u64);
        self.epoll
            .add(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            .map_err(io::Error::from)
    }

    /// Re-arms a oneshot-disabled client. Failure is ignored: if the fd was
    /// closed in the meantime it has already left the epoll set.
    pub(crate) fn rearm(&self, fd: RawFd, id: i64) {
        let mut event = EpollEvent::new(interest().read().rdhup().oneshot().bitflags(), id as u64);
        let _ = self
            .epoll
            .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event);
    }

    /// Waits up to one second for a single ready event.
    pub(crate) fn wait(&self) -> io::Result<Option<ClientEvent>> {
        let mut buf = [EpollEvent::empty()];
        match self.epoll.wait(&mut buf, EpollTimeout::from(WAIT_MS)) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(ClientEvent {
                data: buf[0].data(),
                readiness: buf[0].events().into(),
            })),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn listener_event_surfaces_with_index_data() {
        let poller = Poller::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        poller.add_listener(listener.as_raw_fd(), 0).unwrap();

        // Nothing pending yet: a connect makes the listener readable.
        let addr = listener.local_addr().unwrap();
        let _conn = std::net::TcpStream::connect(addr).unwrap();

        let ev = poller.wait().unwrap().expect("listener should be ready");
        assert_eq!(ev.data, 0);
        assert!(ev.readiness.is_readable());
    }

    #[test]
    fn oneshot_client_fires_once_until_rearmed() {
        let poller = Poller::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut conn = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let id = 1000;
        poller.add_client(accepted.as_raw_fd(), id).unwrap();

        use std::io::Write;
        conn.write_all(b"x").unwrap();

        let ev = poller.wait().unwrap().expect("client should be ready");
        assert_eq!(ev.data, id as u64);
        assert!(ev.readiness.is_readable());

        // Oneshot: the unconsumed data does not fire again.
        assert!(poller.wait().unwrap().is_none());

        poller.rearm(accepted.as_raw_fd(), id);
        let ev = poller.wait().unwrap().expect("rearm should re-enable");
        assert_eq!(ev.data, id as u64);
    }
}
