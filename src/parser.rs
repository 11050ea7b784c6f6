//! Per-client line framing and message dispatch.
//!
//! Converts the byte stream of one client into `\n`-delimited JSON values,
//! annotates each with the connector's routing keys and hands it to the
//! stratifier or generator. Runs on a worker while the client's oneshot event
//! is disarmed, so a single parser call owns the read buffer.

use log::{debug, info, trace};
use nix::errno::Errno;
use serde_json::{json, Value};

use crate::client::{pack_subclient, round_up_page, MAX_MSGSIZE};
use crate::connector::Connector;
use crate::redirector;
use crate::registry::ClientRef;
use crate::sender::send_client;

/// Reads and dispatches whatever the client has sent. Returns `true` while
/// the connection should be kept; `false` asks the caller to invalidate.
///
/// The caller holds a reference (the client is off the epoll set until
/// re-armed), but `invalid` can still flip concurrently: the dispatch step
/// checks it and drops the message rather than enqueueing.
pub(crate) fn parse_client_msg(conn: &Connector, client: &ClientRef) -> bool {
    loop {
        // Overload check before reading more. Trusted remotes may exceed the
        // frame limit; their buffer grows in page-aligned steps instead.
        {
            let mut buf = client.rxbuf().lock();
            if buf.len() > MAX_MSGSIZE {
                if !client.is_remote() {
                    info!(
                        "client id {} fd {} overloaded buffer without EOL, disconnecting",
                        client.id(),
                        client.fd()
                    );
                    return false;
                }
                let want = round_up_page(buf.len() + MAX_MSGSIZE + 1);
                let len = buf.len();
                buf.reserve(want - len);
            }
        }

        let mut chunk = [0u8; MAX_MSGSIZE];
        let n = {
            let Some(fd) = client.borrowed_fd() else {
                // Invalidated underneath us; nothing more to read.
                return true;
            };
            nix::unistd::read(fd, &mut chunk)
        };
        match n {
            // A zero read without a hangup is left to EPOLLRDHUP to resolve.
            Ok(0) => return true,
            Err(Errno::EAGAIN) => return true,
            Err(e) => {
                debug!(
                    "client id {} fd {} disconnected - recv fail: {}",
                    client.id(),
                    client.fd(),
                    e
                );
                return false;
            }
            Ok(n) => client.rxbuf().lock().extend_from_slice(&chunk[..n]),
        }

        // Dispatch every complete frame, then shift the residual left and go
        // back to reading.
        loop {
            let frame: Vec<u8> = {
                let mut buf = client.rxbuf().lock();
                let Some(eol) = buf.iter().position(|&b| b == b'\n') else {
                    break;
                };
                let buflen = eol + 1;
                if buflen > MAX_MSGSIZE && !client.is_remote() {
                    info!(
                        "client id {} fd {} message oversize, disconnecting",
                        client.id(),
                        client.fd()
                    );
                    return false;
                }
                buf.drain(..buflen).collect()
            };
            if !process_frame(conn, client, &frame) {
                return false;
            }
        }
    }
}

/// Parses one newline-terminated frame, annotates it and dispatches by mode.
fn process_frame(conn: &Connector, client: &ClientRef, frame: &[u8]) -> bool {
    // Tolerate trailing bytes between the end of the JSON value and the
    // newline; the frame boundary is the newline, not the value.
    let mut stream = serde_json::Deserializer::from_slice(frame).into_iter::<Value>();
    let mut val = match stream.next() {
        Some(Ok(val)) => val,
        _ => {
            debug!(
                "client id {} sent invalid json message {}",
                client.id(),
                String::from_utf8_lossy(frame).trim_end()
            );
            send_client(conn, client.id(), b"Invalid JSON, disconnecting\n".to_vec());
            return false;
        }
    };

    if client.is_passthrough() {
        // Fold the subclient's own id into the upper half of ours.
        let sub = val.get("client_id").and_then(Value::as_i64).unwrap_or(0);
        if let Some(obj) = val.as_object_mut() {
            obj.insert(
                "client_id".to_string(),
                json!(pack_subclient(client.id(), sub)),
            );
        }
    } else {
        if conn.cfg().redirector
            && !client.is_redirected()
            && frame.windows(b"mining.submit".len()).any(|w| w == b"mining.submit")
        {
            redirector::parse_redirector_share(client, &val);
        }
        if let Some(obj) = val.as_object_mut() {
            obj.insert("client_id".to_string(), json!(client.id()));
            obj.insert("address".to_string(), json!(client.address_name()));
        }
    }
    if let Some(obj) = val.as_object_mut() {
        obj.insert("server".to_string(), json!(client.server()));
    }

    // Do not forward messages of clients we have already dropped. The
    // occasional false negative is filtered by the stratifier.
    if client.is_invalid() {
        trace!("discarding frame of dropped client {}", client.id());
        return true;
    }
    if !conn.cfg().passthrough {
        conn.peers().forward_to_stratifier(val);
    } else {
        if conn.cfg().node {
            conn.peers().forward_to_stratifier(val.clone());
        }
        conn.peers().forward_to_generator(val);
    }
    true
}
