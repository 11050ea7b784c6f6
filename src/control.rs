//! The control plane: line commands over a unix-domain socket.
//!
//! Each control exchange is one connection: the peer connects, sends one
//! length-prefixed message, optionally reads a reply (or a listening fd via
//! SCM_RIGHTS) and disconnects. The loop runs forever; a failed command
//! returns to the loop.

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use log::{debug, info, trace, warn, LevelFilter};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use serde_json::{json, Value};

use crate::client::{subclient_low, subclient_parent};
use crate::connector::Connector;
use crate::registry::ClientRef;
use crate::sender::{send_client, send_client_json};

/// Upper bound on a framed control message.
const MAX_CONTROL_MSG: usize = 1 << 24;

/// Writes one length-prefixed message.
pub fn send_unix_msg(stream: &mut UnixStream, data: &[u8]) -> io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(data)
}

/// Reads one length-prefixed message.
pub fn recv_unix_msg(stream: &mut UnixStream) -> io::Result<String> {
    let mut lenbuf = [0u8; 4];
    stream.read_exact(&mut lenbuf)?;
    let len = u32::from_le_bytes(lenbuf) as usize;
    if len == 0 || len > MAX_CONTROL_MSG {
        return Err(io::Error::other("control message length out of range"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| io::Error::other("control message is not utf-8"))
}

/// Passes an open fd over the control connection via SCM_RIGHTS.
pub fn send_fd(fd: RawFd, stream: &UnixStream) -> io::Result<()> {
    let iov = [IoSlice::new(b"*")];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map(drop)
        .map_err(io::Error::from)
}

/// The control loop. Only returns when the listening socket itself fails.
pub(crate) fn run(conn: &Connector, listener: UnixListener) -> io::Error {
    loop {
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => return e,
        };
        let msg = match recv_unix_msg(&mut stream) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("failed to receive control message: {e}");
                continue;
            }
        };
        trace!("control received message: {msg}");
        handle_command(conn, msg.trim_end(), &mut stream);
    }
}

fn handle_command(conn: &Connector, buf: &str, stream: &mut UnixStream) {
    // The bulk of the messages are json to send to clients.
    if buf.starts_with('{') {
        match serde_json::from_str::<Value>(buf) {
            Ok(val) => conn.peers().queue_client_message(val),
            Err(e) => warn!("invalid json control message: {e}"),
        }
    } else if let Some(rest) = buf.strip_prefix("dropclient=") {
        let Ok(id) = rest.parse::<i64>() else {
            debug!("failed to parse dropclient command: {buf}");
            return;
        };
        if subclient_parent(id) != 0 {
            drop_passthrough_client(conn, id);
            return;
        }
        let Some(client) = conn.registry().ref_by_id(id) else {
            debug!("failed to find client id {id} to drop");
            return;
        };
        conn.invalidate_client(&client);
        debug!("dropped client id {id}");
    } else if let Some(rest) = buf.strip_prefix("testclient=") {
        let Ok(id) = rest.parse::<i64>() else {
            debug!("failed to parse testclient command: {buf}");
            return;
        };
        if conn.registry().exists(id) {
            return;
        }
        debug!("detected non-existent client id {id}");
        conn.peers().stratifier_drop_id(id);
    } else if let Some(rest) = buf.strip_prefix("passthrough=") {
        let Ok(id) = rest.parse::<i64>() else {
            debug!("failed to parse passthrough command: {buf}");
            return;
        };
        let Some(client) = conn.registry().ref_by_id(id) else {
            debug!("failed to find client id {id} to pass through");
            return;
        };
        passthrough_client(conn, &client);
    } else if let Some(rest) = buf.strip_prefix("getxfd") {
        let Ok(fdno) = rest.parse::<usize>() else {
            debug!("failed to parse getxfd command: {buf}");
            return;
        };
        match conn.listeners().get(fdno) {
            Some(listener) => {
                if let Err(e) = send_fd(listener.raw_fd(), stream) {
                    warn!("failed to pass listener fd {fdno}: {e}");
                }
            }
            None => warn!("asked to send invalid fd {fdno}"),
        }
    } else if buf == "accept" {
        debug!("received accept signal");
        conn.set_accept(true);
    } else if buf == "reject" {
        debug!("received reject signal");
        conn.set_accept(false);
        if conn.cfg().passthrough {
            conn.registry().drop_all();
        }
    } else if buf == "stats" {
        let stats = conn.stats_json().to_string();
        info!("connector stats: {stats}");
        if let Err(e) = send_unix_msg(stream, stats.as_bytes()) {
            debug!("failed to send stats reply: {e}");
        }
    } else if buf == "ping" {
        trace!("received ping request");
        if let Err(e) = send_unix_msg(stream, b"pong") {
            debug!("failed to send pong reply: {e}");
        }
    } else if let Some(rest) = buf.strip_prefix("loglevel=") {
        match rest.parse::<u8>() {
            Ok(level) => log::set_max_level(level_filter(level)),
            Err(_) => debug!("failed to parse loglevel command: {buf}"),
        }
    } else {
        warn!("unhandled control message: {buf}");
    }
}

/// Maps syslog-style numeric levels onto the log crate's filters.
fn level_filter(level: u8) -> LevelFilter {
    match level {
        0..=3 => LevelFilter::Error,
        4 => LevelFilter::Warn,
        5 => LevelFilter::Info,
        6 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// A subclient drop is forwarded down its passthrough connection as a
/// regular command.
fn drop_passthrough_client(conn: &Connector, id: i64) {
    debug!("asked to drop passthrough client {id}, forwarding to passthrough");
    let sub = subclient_low(id);
    send_client(conn, id, format!("dropclient={sub}\n").into_bytes());
}

/// Flips a client into passthrough mode and gives both socket directions
/// room to aggregate.
fn passthrough_client(conn: &Connector, client: &ClientRef) {
    debug!("adding passthrough client {}", client.id());
    client.set_passthrough();
    send_client_json(conn, client.id(), json!({ "result": true }));
    if let Some(fd) = client.borrowed_fd() {
        crate::listener::set_recvbufsize(fd, 1_048_576, conn.rmem_warn());
        let got = crate::listener::set_sendbufsize(fd, 1_048_576, conn.wmem_warn());
        client.set_sendbufsize(got);
    }
}

/// Extracts the client id from an outbound message and queues the encoded
/// line for sending. In redirector mode this is also where authorisation
/// results flip the client's `authorised` flag.
pub(crate) fn client_message_processor(conn: &Connector, mut msg: Value) {
    let client_id = msg.get("client_id").and_then(Value::as_i64).unwrap_or(0);
    if let Some(obj) = msg.as_object_mut() {
        obj.remove("client_id");
        // A passthrough subclient is addressed by its own id on the wire.
        if subclient_parent(client_id) != 0 {
            obj.insert("client_id".to_string(), json!(subclient_low(client_id)));
        }
    }

    if conn.cfg().redirector && subclient_parent(client_id) == 0 {
        if let Some(client) = conn.registry().ref_by_id(client_id) {
            if !client.is_redirected() && !client.is_authorised() {
                let method = msg.get("node.method").and_then(Value::as_str);
                if method == Some("authresult") {
                    client.set_authorised();
                }
            }
        }
    }

    send_client_json(conn, client_id, msg);
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};

    use crate::config::Config;
    use crate::connector::Connector;
    use crate::peers::PeerQueues;

    use super::*;

    fn harness(cfg: Config) -> (Connector, PeerQueues) {
        Connector::for_tests(cfg)
    }

    fn control_pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    fn install_client(conn: &Connector) -> i64 {
        let (ours, theirs) = UnixStream::pair().unwrap();
        std::mem::forget(theirs);
        let client = conn.registry().recruit();
        conn.registry()
            .insert(client, ours.into_raw_fd(), 0, "127.0.0.1".into())
    }

    #[test]
    fn framing_round_trips() {
        let (mut a, mut b) = control_pair();
        send_unix_msg(&mut a, b"stats").unwrap();
        assert_eq!(recv_unix_msg(&mut b).unwrap(), "stats");
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let (mut a, mut b) = control_pair();
        a.write_all(&0u32.to_le_bytes()).unwrap();
        assert!(recv_unix_msg(&mut b).is_err());
    }

    #[test]
    fn ping_replies_pong() {
        let (conn, _queues) = harness(Config::default());
        let (mut ours, mut theirs) = control_pair();
        handle_command(&conn, "ping", &mut theirs);
        assert_eq!(recv_unix_msg(&mut ours).unwrap(), "pong");
    }

    #[test]
    fn stats_reports_all_sections() {
        let (conn, _queues) = harness(Config::default());
        install_client(&conn);
        let (mut ours, mut theirs) = control_pair();
        handle_command(&conn, "stats", &mut theirs);
        let reply = recv_unix_msg(&mut ours).unwrap();
        let val: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(val["clients"]["count"], 1);
        for section in ["clients", "dead", "sends", "delays"] {
            assert!(val[section].get("count").is_some());
            assert!(val[section].get("memory").is_some());
            assert!(val[section].get("generated").is_some());
        }
    }

    #[test]
    fn accept_reject_toggle_is_idempotent() {
        let (conn, _queues) = harness(Config::default());
        let (_ours, mut theirs) = control_pair();
        handle_command(&conn, "reject", &mut theirs);
        assert!(!conn.accepting());
        handle_command(&conn, "reject", &mut theirs);
        assert!(!conn.accepting());
        handle_command(&conn, "accept", &mut theirs);
        assert!(conn.accepting());
        handle_command(&conn, "accept", &mut theirs);
        assert!(conn.accepting());
    }

    #[test]
    fn dropclient_invalidates_and_is_idempotent() {
        let (conn, queues) = harness(Config::default());
        let id = install_client(&conn);
        let (_ours, mut theirs) = control_pair();

        handle_command(&conn, &format!("dropclient={id}"), &mut theirs);
        assert!(conn.registry().ref_by_id(id).is_none());
        assert_eq!(
            queues.stratifier_proc.recv().unwrap(),
            format!("dropclient={id}")
        );

        // Second drop is a no-op.
        handle_command(&conn, &format!("dropclient={id}"), &mut theirs);
        assert!(queues.stratifier_proc.try_recv().is_err());
    }

    #[test]
    fn testclient_reports_only_missing_ids() {
        let (conn, queues) = harness(Config::default());
        let id = install_client(&conn);
        let (_ours, mut theirs) = control_pair();

        handle_command(&conn, &format!("testclient={id}"), &mut theirs);
        assert!(queues.stratifier_proc.try_recv().is_err());

        handle_command(&conn, "testclient=555", &mut theirs);
        assert_eq!(queues.stratifier_proc.recv().unwrap(), "dropclient=555");
    }

    #[test]
    fn json_command_reaches_the_message_queue() {
        let (conn, queues) = harness(Config::default());
        let (_ours, mut theirs) = control_pair();
        handle_command(&conn, r#"{"client_id":3,"result":null}"#, &mut theirs);
        let queued = queues.cmpq.recv().unwrap();
        assert_eq!(queued["client_id"], 3);
    }

    #[test]
    fn passthrough_command_flips_flag_and_replies() {
        let (conn, _queues) = harness(Config::default());
        let id = install_client(&conn);
        let (_ours, mut theirs) = control_pair();

        handle_command(&conn, &format!("passthrough={id}"), &mut theirs);
        let client = conn.registry().ref_by_id(id).unwrap();
        assert!(client.is_passthrough());
        // The {"result":true} reply is on the send queue.
        assert_eq!(conn.sendq().pending(), 1);
    }

    #[test]
    fn fd_passing_survives_the_socket() {
        let sent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (ours, theirs) = control_pair();
        send_fd(sent.as_raw_fd(), &theirs).unwrap();

        let mut byte = [0u8; 1];
        let mut iov = [io::IoSliceMut::new(&mut byte)];
        let mut space = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            ours.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::empty(),
        )
        .unwrap();
        let mut received = None;
        for cmsg in msg.cmsgs().unwrap() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received = fds.first().copied();
            }
        }
        let fd = received.expect("no fd received");
        assert!(fd >= 0);
        assert_ne!(fd, sent.as_raw_fd());
        crate::listener::close_fd(fd);
    }

    #[test]
    fn processor_strips_client_id_and_flags_authorisation() {
        let cfg = Config {
            redirector: true,
            ..Config::default()
        };
        let (conn, _queues) = harness(cfg);
        let id = install_client(&conn);

        client_message_processor(
            &conn,
            json!({"client_id": id, "node.method": "authresult", "result": true}),
        );
        let client = conn.registry().ref_by_id(id).unwrap();
        assert!(client.is_authorised());
        assert_eq!(conn.sendq().pending(), 1);
    }

    #[test]
    fn processor_restores_subclient_low_bits() {
        let (conn, queues) = harness(Config::default());
        let parent = install_client(&conn);
        let composite = crate::client::pack_subclient(parent, 7);
        let client = conn.registry().ref_by_id(parent).unwrap();
        client.set_passthrough();

        client_message_processor(&conn, json!({"client_id": composite, "result": true}));
        // The queued line addresses the parent connection and carries the
        // subclient's own id in its payload.
        assert_eq!(conn.sendq().pending(), 1);
        drop(client);
        let _ = queues;
    }

    #[test]
    fn level_filter_mapping() {
        assert_eq!(level_filter(3), LevelFilter::Error);
        assert_eq!(level_filter(5), LevelFilter::Info);
        assert_eq!(level_filter(7), LevelFilter::Trace);
    }
}
