//! Redirector mode: clients that prove they submit real work are told to
//! reconnect to a protected pool endpoint.
//!
//! Promotion needs either an accepted share matching the client's echo list,
//! or an IP that has already been redirected. Redirect entries are keyed by
//! IP text and persist for the life of the process.

use log::{debug, info, trace, warn};
use serde_json::{json, Value};

use crate::client::{unix_now, Client};
use crate::connector::Connector;
use crate::registry::ClientRef;
use crate::sender;

/// Remembers a `mining.submit` request id so the matching response can be
/// recognised on the way back out.
pub(crate) fn parse_redirector_share(client: &Client, val: &Value) {
    let Some(id) = val.get("id").and_then(Value::as_i64) else {
        info!("failed to find redirector share id");
        return;
    };
    debug!("redirector adding client {} share id: {}", client.id(), id);
    client.push_share(unix_now(), id);
}

/// Checks an outgoing message against the client's share echo list. True
/// means an accepted share was found and the client should be redirected.
pub(crate) fn test_redirector_shares(client: &Client, buf: &[u8]) -> bool {
    let Ok(val) = serde_json::from_slice::<Value>(buf) else {
        // Can happen when responding to invalid json from the client.
        debug!(
            "unparseable response to client {}: {}",
            client.id(),
            String::from_utf8_lossy(buf).trim_end()
        );
        return false;
    };
    let Some(id) = val.get("id").and_then(Value::as_i64) else {
        debug!("failed to find response id");
        return false;
    };
    if !client.has_share(id) {
        return false;
    }
    let Some(result) = val.get("result").and_then(Value::as_bool) else {
        debug!("failed to find result in matched share response");
        return false;
    };
    if !matches!(val.get("error"), Some(Value::Null)) {
        debug!("got error for matched share");
        return false;
    }
    if !result {
        trace!("rejected share for client {}", client.id());
        return false;
    }
    info!("found accepted share for client {} - redirecting", client.id());
    // The echo list has served its purpose.
    client.clear_shares();
    true
}

/// Sends `client.reconnect` pointing at the next redirect url in round-robin
/// order, or the one this IP was already assigned.
pub(crate) fn redirect_client(conn: &Connector, client: &ClientRef) {
    // Only ever try redirecting a client once.
    client.set_redirected();

    let urls = conn.cfg().redirect_urls();
    if urls.is_empty() {
        warn!("redirector has no redirect urls configured");
        return;
    }
    let address = client.address_name();
    let (no, known) = conn.registry().redirect_insert(&address, urls.len());
    info!(
        "redirecting client {} from {} IP {} to redirecturl {}",
        client.id(),
        if known { "matching" } else { "new" },
        address,
        no
    );

    let target = &urls[no];
    let val = json!({
        "id": Value::Null,
        "method": "client.reconnect",
        "params": [target.url, target.port.to_string(), 0],
    });
    let mut line = val.to_string();
    line.push('\n');
    sender::queue_direct(conn, client.clone(), line.into_bytes());
}
