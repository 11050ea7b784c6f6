//! The receiver: one thread owning `epoll_wait`, fanning ready events out to
//! a small worker pool.
//!
//! The receiver itself never touches client state. Listener events are
//! handled inline by the acceptor; everything else moves to a worker with
//! ownership of the event. Workers re-arm the oneshot registration when the
//! client survives processing; a closed fd leaves the epoll set by itself.

use std::io;
use std::os::fd::IntoRawFd;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, trace, warn};
use socket2::SockRef;

use crate::connector::Connector;
use crate::listener::setup_client_socket;
use crate::parser::parse_client_msg;
use crate::poller::ClientEvent;

/// How long the gates are polled while the connector is not yet accepting.
const GATE_POLL: Duration = Duration::from_millis(10);

/// The receiver thread body. Only returns on process-fatal errors.
pub(crate) fn run(conn: Connector, cevents: Sender<ClientEvent>) -> io::Result<()> {
    for (index, listener) in conn.listeners().iter().enumerate() {
        conn.poller().add_listener(listener.raw_fd(), index)?;
    }

    // Serve nothing until the stratifier can consume it.
    while !conn.stratifier_ready() {
        thread::sleep(GATE_POLL);
    }

    let nlisteners = conn.listeners().len() as u64;
    loop {
        while !conn.accepting() {
            thread::sleep(GATE_POLL);
        }
        let Some(event) = conn.poller().wait()? else {
            continue;
        };
        // Listener user-data sits below the client id range.
        if event.data < nlisteners {
            accept_client(&conn, event.data as usize)?;
            continue;
        }
        if cevents.send(event).is_err() {
            return Err(io::Error::other("client event workers are gone"));
        }
    }
}

/// A worker draining the client event queue.
pub(crate) fn worker(conn: Connector, cevents: Receiver<ClientEvent>) {
    while let Ok(event) = cevents.recv() {
        process_event(&conn, event);
    }
}

/// Accepts one connection on the given listening socket and installs it.
fn accept_client(conn: &Connector, server: usize) -> io::Result<()> {
    let no_clients = conn.registry().client_count();
    let maxclients = conn.cfg().maxclients;
    if maxclients > 0 && no_clients >= maxclients {
        warn!("server full with {no_clients} clients");
        return Ok(());
    }

    let client = conn.registry().recruit();
    let (socket, addr) = match conn.listeners()[server].accept() {
        Ok(accepted) => accepted,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
            ) =>
        {
            debug!("recoverable error on accept: {e}");
            conn.registry().recycle(client);
            return Ok(());
        }
        Err(e) => {
            warn!("failed to accept on server socket {server}: {e}");
            conn.registry().recycle(client);
            return Err(e);
        }
    };

    let Some(peer) = addr.as_socket() else {
        warn!("unknown address family for connection on socket {server}");
        conn.registry().recycle(client);
        return Ok(());
    };
    if let Err(e) = setup_client_socket(&socket) {
        debug!("failed to set up accepted socket: {e}");
        conn.registry().recycle(client);
        return Ok(());
    }
    let sendbufsize = socket.send_buffer_size().unwrap_or(0);
    client.set_sendbufsize(sendbufsize as i32);
    trace!("client sendbufsize detected as {sendbufsize}");

    let fd = socket.into_raw_fd();
    let nfds = conn.bump_nfds();
    let id = conn
        .registry()
        .insert(client.clone(), fd, server, peer.ip().to_string());
    debug!(
        "connected new client {nfds} on socket {fd} to {no_clients} active clients from {}:{}",
        peer.ip(),
        peer.port()
    );

    if let Err(e) = conn.poller().add_client(fd, id) {
        warn!("failed to add accepted client {id} to epoll: {e}");
        // The epoll registration never happened; release its reference and
        // let the usual lifecycle collect the record.
        conn.registry().dec_ref(&client);
    }
    Ok(())
}

/// Worker side of one ready event: resolve, parse, classify, re-arm.
fn process_event(conn: &Connector, event: ClientEvent) {
    let id = event.data as i64;
    let Some(client) = conn.registry().ref_by_id(id) else {
        info!("failed to find client by id {id} in receiver");
        return;
    };

    // Data and a hangup can arrive together; drain the data first.
    if event.readiness.is_readable() && !parse_client_msg(conn, &client) {
        conn.invalidate_client(&client);
        return;
    }

    if event.readiness.is_error() {
        // Classify the pending socket error; a plain reset is routine.
        let err = client
            .borrowed_fd()
            .and_then(|fd| SockRef::from(&fd).take_error().ok().flatten());
        match err {
            Some(e) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                info!("client id {id} fd {} reset by peer", client.fd());
            }
            Some(e) => {
                warn!("client id {id} fd {} epoll error: {e}", client.fd());
            }
            None => {
                warn!("client id {id} fd {} epoll error with no pending errno", client.fd());
            }
        }
        conn.invalidate_client(&client);
    } else if event.readiness.is_hangup() {
        debug!("client id {id} fd {} HUP in epoll", client.fd());
        conn.invalidate_client(&client);
    } else if event.readiness.is_read_closed() {
        debug!("client id {id} fd {} RDHUP in epoll", client.fd());
        conn.invalidate_client(&client);
    }

    if !client.is_invalid() {
        // Closing the fd would have removed it from the epoll set, so only
        // surviving clients are re-armed.
        conn.poller().rearm(client.fd(), id);
    }
}
