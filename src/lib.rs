//! The connector front-end of a mining-pool server.
//!
//! This crate terminates thousands of long-lived Stratum-style TCP
//! connections, frames their newline-delimited JSON, annotates each message
//! with routing keys and shuttles it to the pool's stratifier and generator
//! peers. The reverse path drains a cross-thread send queue with strictly
//! per-client FIFO, non-blocking writes.
//!
//! # Key pieces
//!
//! - [`Registry`]: owns every client record, with an explicit reference
//!   count and a lazily-reclaimed live → dead → recycled lifecycle.
//! - The receiver: a single thread in `epoll_wait` over one-shot
//!   registrations, fanning ready events out to a worker pool.
//! - The sender: one thread draining the send queue, detecting stalled
//!   clients and preserving head-of-line order per connection.
//! - The control loop: `accept`/`reject`/`dropclient`/`passthrough`/`stats`
//!   and friends over a unix-domain socket, including listener fd passing
//!   with SCM_RIGHTS.
//! - Optional modes: passthrough aggregation with composite subclient ids,
//!   remote trusted upstream forwarding, and IP-based redirection of
//!   share-producing clients.
//!
//! # Example
//!
//! ```no_run
//! use std::os::unix::net::UnixListener;
//!
//! use poolconn::{setup_listeners, Config, Connector};
//!
//! fn main() -> Result<(), poolconn::Error> {
//!     let cfg = Config::default();
//!     let control = UnixListener::bind(cfg.control_socket_path())?;
//!
//!     let listeners = setup_listeners(&cfg, Vec::new())?;
//!     let (connector, _queues) = Connector::new(cfg, listeners)?;
//!     connector.start()?;
//!     connector.set_stratifier_ready();
//!     connector.set_accept(true);
//!
//!     // Never returns while the process is healthy.
//!     Err(connector.run_control(control).into())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod events;
pub mod listener;
pub mod peers;
pub mod registry;
pub mod sender;
pub mod upstream;

mod parser;
mod poller;
mod receiver;
mod redirector;

pub use crate::client::{pack_subclient, subclient_low, subclient_parent, Client};
pub use crate::config::Config;
pub use crate::connector::Connector;
pub use crate::error::Error;
pub use crate::listener::{setup_listeners, Listener};
pub use crate::peers::{PeerQueues, Peers};
pub use crate::registry::{ClientRef, Registry};
pub use crate::sender::send_client;
pub use crate::upstream::UpstreamMethod;
