//! Listening sockets and per-socket option plumbing.
//!
//! Listeners are built with socket2 so the backlog can exceed what the
//! standard library allows, and so sockets inherited from a previous process
//! generation can be adopted or rebound when their address no longer matches
//! the configuration.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::socket::{setsockopt, sockopt};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::config::{Config, ServerUrl, DEFAULT_MINING_PORT, DEFAULT_PROXY_PORT};
use crate::error::Error;

/// Listen backlog, set larger than SOMAXCONN in case the system supports it.
const BACKLOG: i32 = 8192;

/// Bind attempts before giving up, 5 s apart (about two minutes).
const BIND_RETRIES: u32 = 25;

/// One listening socket.
pub struct Listener {
    socket: Socket,
    pub url: String,
    pub port: u16,
    pub highdiff: bool,
}

impl Listener {
    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        self.socket.accept()
    }
}

/// Creates all configured listeners, adopting handed-over sockets whose
/// address still matches their url and rebinding the rest.
pub fn setup_listeners(
    cfg: &Config,
    mut handover: Vec<Option<OwnedFd>>,
) -> Result<Vec<Listener>, Error> {
    if cfg.serverurl.is_empty() {
        // No serverurls have been specified, bind all interfaces on the
        // default socket.
        let port = if cfg.proxy {
            DEFAULT_PROXY_PORT
        } else {
            DEFAULT_MINING_PORT
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let url = addr.to_string();
        let socket = bind_retrying(addr, &url)?;
        info!("bound default listener on {url}");
        return Ok(vec![Listener {
            socket,
            url,
            port,
            highdiff: false,
        }]);
    }

    let mut listeners = Vec::with_capacity(cfg.serverurl.len());
    for (i, serverurl) in cfg.serverurl.iter().enumerate() {
        let parsed = ServerUrl::parse(serverurl)?;
        if parsed.highdiff {
            info!("highdiff server {serverurl}");
        }
        let addr = (parsed.host.as_str(), parsed.port)
            .to_socket_addrs()
            .map_err(|_| Error::ServerUrl(serverurl.clone()))?
            .next()
            .ok_or_else(|| Error::ServerUrl(serverurl.clone()))?;

        let inherited = handover.get_mut(i).and_then(Option::take);
        let socket = match adopt_handover(inherited, addr, serverurl) {
            Some(socket) => socket,
            None => bind_retrying(addr, serverurl)?,
        };
        listeners.push(Listener {
            socket,
            url: serverurl.clone(),
            port: parsed.port,
            highdiff: parsed.highdiff,
        });
    }
    Ok(listeners)
}

/// Checks whether a socket handed over by the previous process generation is
/// still bound to the configured address.
fn adopt_handover(fd: Option<OwnedFd>, addr: SocketAddr, url: &str) -> Option<Socket> {
    let socket = Socket::from(fd?);
    let bound = socket.local_addr().ok().and_then(|a| a.as_socket());
    match bound {
        Some(old) if old == addr => {
            debug!("adopting handed-over socket for {url}");
            let _ = socket.set_nonblocking(true);
            Some(socket)
        }
        Some(old) => {
            warn!("handed-over socket {old} does not match config {url}, creating new socket");
            None
        }
        None => None,
    }
}

fn bind_retrying(addr: SocketAddr, url: &str) -> Result<Socket, Error> {
    let mut tries = 0;
    loop {
        match try_bind(addr) {
            Ok(socket) => {
                if tries > 0 {
                    warn!("successfully bound to {url}");
                }
                return Ok(socket);
            }
            Err(source) => {
                tries += 1;
                if tries >= BIND_RETRIES {
                    return Err(Error::Bind {
                        url: url.to_string(),
                        source,
                    });
                }
                warn!("failed to bind to {url}, retrying in 5s: {source}");
                thread::sleep(Duration::from_secs(5));
            }
        }
    }
}

fn try_bind(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Options applied to every accepted client socket.
pub(crate) fn setup_client_socket(socket: &Socket) -> io::Result<()> {
    socket.set_keepalive(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    Ok(())
}

/// Grows a kernel send buffer, trying the privileged force option first and
/// falling back to the plain one. Returns the size actually obtained and
/// warns once per process when the request could not be met.
pub(crate) fn set_sendbufsize(fd: BorrowedFd<'_>, len: usize, wmem_warn: &AtomicBool) -> i32 {
    if setsockopt(&fd, sockopt::SndBufForce, &len).is_err() {
        let _ = socket2::SockRef::from(&fd).set_send_buffer_size(len);
    }
    let actual = socket2::SockRef::from(&fd)
        .send_buffer_size()
        .unwrap_or(0);
    if actual < len && !wmem_warn.swap(true, Ordering::Relaxed) {
        warn!("only obtained send buffer of {actual} wanting {len}, not warning again");
    }
    actual as i32
}

/// Receive-buffer counterpart of [`set_sendbufsize`].
pub(crate) fn set_recvbufsize(fd: BorrowedFd<'_>, len: usize, rmem_warn: &AtomicBool) {
    if setsockopt(&fd, sockopt::RcvBufForce, &len).is_err() {
        let _ = socket2::SockRef::from(&fd).set_recv_buffer_size(len);
    }
    let actual = socket2::SockRef::from(&fd)
        .recv_buffer_size()
        .unwrap_or(0);
    if actual < len && !rmem_warn.swap(true, Ordering::Relaxed) {
        warn!("only obtained receive buffer of {actual} wanting {len}, not warning again");
    }
}

/// Disables lingering so a close discards unsent data immediately.
pub(crate) fn nolinger(fd: BorrowedFd<'_>) {
    let _ = socket2::SockRef::from(&fd).set_linger(Some(Duration::ZERO));
}

/// Closes a raw fd. Errors are logged and swallowed; there is nothing useful
/// to do with a failed close.
pub(crate) fn close_fd(fd: RawFd) {
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        debug!("error closing fd {fd}: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bind_uses_mining_port_family() {
        // Binding the literal default port may collide with the environment,
        // so only exercise the parse-and-bind path with an ephemeral port.
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = try_bind(addr).unwrap();
        let bound = socket.local_addr().unwrap().as_socket().unwrap();
        assert!(bound.port() > 0);
    }

    #[test]
    fn sendbufsize_reports_obtained_size() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = try_bind(addr).unwrap();
        let warn = AtomicBool::new(false);
        let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        let got = set_sendbufsize(fd, 65536, &warn);
        assert!(got > 0);
    }

    #[test]
    fn handover_mismatch_is_rejected() {
        let old = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let old_fd = OwnedFd::from(old);
        let other: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(adopt_handover(Some(old_fd), other, "127.0.0.1:1").is_none());
    }

    #[test]
    fn handover_match_is_adopted() {
        let old = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = old.local_addr().unwrap();
        let old_fd = OwnedFd::from(old);
        assert!(adopt_handover(Some(old_fd), addr, "test").is_some());
    }
}
