//! Type-safe wrappers over raw `epoll` flags.
//!
//! [`Interest`] is the mask a file descriptor is armed with; [`Readiness`] is
//! the mask `epoll_wait` hands back. Both wrap [`EpollFlags`] and exist so the
//! receiver and workers never touch raw bits.

use nix::sys::epoll::EpollFlags;

/// The readiness events to monitor for a file descriptor.
///
/// Built with the fluent API:
///
/// ```
/// # use poolconn::events::interest;
/// let mask = interest().read().rdhup().oneshot();
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Interest(EpollFlags);

impl Interest {
    /// Returns the underlying `EpollFlags` bitmask.
    pub const fn bitflags(&self) -> EpollFlags {
        self.0
    }

    const fn add(self, flags: EpollFlags) -> Self {
        Self(EpollFlags::from_bits_retain(self.0.bits() | flags.bits()))
    }

    /// Adds readable interest (`EPOLLIN`).
    pub const fn read(self) -> Self {
        self.add(EpollFlags::EPOLLIN)
    }

    /// Adds interest in the peer closing its write half (`EPOLLRDHUP`).
    pub const fn rdhup(self) -> Self {
        self.add(EpollFlags::EPOLLRDHUP)
    }

    /// Sets one-shot mode (`EPOLLONESHOT`).
    ///
    /// After an event is pulled for the file descriptor, it is disabled until
    /// it is re-armed.
    pub const fn oneshot(self) -> Self {
        self.add(EpollFlags::EPOLLONESHOT)
    }
}

/// Creates a new, empty `Interest` set.
pub const fn interest() -> Interest {
    Interest(EpollFlags::empty())
}

/// The readiness reported for a file descriptor by `epoll_wait`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Readiness(EpollFlags);

impl From<EpollFlags> for Readiness {
    fn from(value: EpollFlags) -> Self {
        Self(value)
    }
}

impl Readiness {
    /// Returns `true` if data is available to read (`EPOLLIN`).
    pub const fn is_readable(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLIN)
    }

    /// Returns `true` if an error condition was reported (`EPOLLERR`).
    ///
    /// This flag is always reported, even when not requested in the interest
    /// set.
    pub const fn is_error(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLERR)
    }

    /// Returns `true` on a hang up (`EPOLLHUP`): the peer closed the
    /// connection. Always reported, even when not requested.
    pub const fn is_hangup(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLHUP)
    }

    /// Returns `true` if the peer has closed their writing end
    /// (`EPOLLRDHUP`).
    pub const fn is_read_closed(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLRDHUP)
    }
}
