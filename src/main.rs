use std::os::unix::net::UnixListener;
use std::process::exit;
use std::thread;

use log::{error, info, trace};
use poolconn::{setup_listeners, Config, Connector, PeerQueues};

/// Drains the peer links so the queues never grow without bound when the
/// connector runs without its sibling processes attached in-process.
fn spawn_peer_taps(queues: PeerQueues) {
    let stratifier_recv = queues.stratifier_recv;
    let stratifier_proc = queues.stratifier_proc;
    let generator_send = queues.generator_send;
    let _ = thread::Builder::new().name("stratifier-tap".to_string()).spawn(move || {
        for msg in stratifier_recv.iter() {
            trace!("stratifier <- {msg}");
        }
    });
    let _ = thread::Builder::new().name("stratproc-tap".to_string()).spawn(move || {
        for cmd in stratifier_proc.iter() {
            trace!("stratifier <- {cmd}");
        }
    });
    let _ = thread::Builder::new().name("generator-tap".to_string()).spawn(move || {
        for msg in generator_send.iter() {
            trace!("generator <- {msg}");
        }
    });
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{e}");
                exit(1);
            }
        },
        None => Config::default(),
    };

    let listeners = match setup_listeners(&cfg, Vec::new()) {
        Ok(listeners) => listeners,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };

    let sockpath = cfg.control_socket_path();
    if let Some(dir) = sockpath.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = std::fs::remove_file(&sockpath);
    let control = match UnixListener::bind(&sockpath) {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind control socket {}: {e}", sockpath.display());
            exit(1);
        }
    };

    let (connector, queues) = match Connector::new(cfg, listeners) {
        Ok(built) => built,
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    };
    spawn_peer_taps(queues);

    if let Err(e) = connector.start() {
        error!("{e}");
        exit(1);
    }
    connector.set_stratifier_ready();
    connector.set_accept(true);
    info!("connector ready on {}", sockpath.display());

    let err = connector.run_control(control);
    error!("control loop failed: {err}");
    exit(1);
}
