//! Typed in-process queues to the peer subsystems.
//!
//! The stratifier and generator are separate processes; from the connector's
//! point of view they are reachable through these channels. Annotated client
//! traffic flows to the stratifier (or the generator in passthrough mode),
//! process commands like `dropclient=<id>` travel on a separate string
//! channel, and the cmpq carries outbound JSON through the client-message
//! processor.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct Peers {
    stratifier_recv: Sender<Value>,
    stratifier_proc: Sender<String>,
    generator_send: Sender<Value>,
    cmpq: Sender<Value>,
}

/// The receiving halves handed to whoever hosts the peer links. The cmpq
/// receiver stays inside the connector.
pub struct PeerQueues {
    pub stratifier_recv: Receiver<Value>,
    pub stratifier_proc: Receiver<String>,
    pub generator_send: Receiver<Value>,
    pub(crate) cmpq: Receiver<Value>,
}

pub(crate) fn channels() -> (Peers, PeerQueues) {
    let (stratifier_recv_tx, stratifier_recv_rx) = unbounded();
    let (stratifier_proc_tx, stratifier_proc_rx) = unbounded();
    let (generator_send_tx, generator_send_rx) = unbounded();
    let (cmpq_tx, cmpq_rx) = unbounded();
    (
        Peers {
            stratifier_recv: stratifier_recv_tx,
            stratifier_proc: stratifier_proc_tx,
            generator_send: generator_send_tx,
            cmpq: cmpq_tx,
        },
        PeerQueues {
            stratifier_recv: stratifier_recv_rx,
            stratifier_proc: stratifier_proc_rx,
            generator_send: generator_send_rx,
            cmpq: cmpq_rx,
        },
    )
}

impl Peers {
    /// Hands an annotated inbound message to the stratifier.
    pub fn forward_to_stratifier(&self, msg: Value) {
        if self.stratifier_recv.send(msg).is_err() {
            trace!("stratifier receive queue disconnected");
        }
    }

    /// Sends a process command string to the stratifier.
    pub fn stratifier_command(&self, cmd: String) {
        if self.stratifier_proc.send(cmd).is_err() {
            trace!("stratifier command queue disconnected");
        }
    }

    /// Tells the stratifier a client id is gone.
    pub fn stratifier_drop_id(&self, id: i64) {
        self.stratifier_command(format!("dropclient={id}"));
    }

    /// Hands a message to the generator for upstream forwarding.
    pub fn forward_to_generator(&self, msg: Value) {
        if self.generator_send.send(msg).is_err() {
            trace!("generator send queue disconnected");
        }
    }

    /// Tells the upstream pool a passthrough client terminated.
    pub fn generator_drop_client(&self, id: i64, address: &str, server: usize) {
        self.forward_to_generator(json!({
            "id": 42,
            "client_id": id,
            "address": address,
            "server": server,
            "method": "mining.term",
            "params": [],
        }));
    }

    /// Queues an outbound JSON message for the client-message processor.
    pub fn queue_client_message(&self, msg: Value) {
        if self.cmpq.send(msg).is_err() {
            trace!("client message queue disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_notification_format() {
        let (peers, queues) = channels();
        peers.stratifier_drop_id(1234);
        assert_eq!(queues.stratifier_proc.recv().unwrap(), "dropclient=1234");
    }

    #[test]
    fn generator_term_message_shape() {
        let (peers, queues) = channels();
        peers.generator_drop_client(7, "10.1.2.3", 1);
        let msg = queues.generator_send.recv().unwrap();
        assert_eq!(msg["method"], "mining.term");
        assert_eq!(msg["client_id"], 7);
        assert_eq!(msg["address"], "10.1.2.3");
        assert_eq!(msg["server"], 1);
        assert!(msg["params"].as_array().unwrap().is_empty());
    }
}
