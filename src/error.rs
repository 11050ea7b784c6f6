use std::io;

use thiserror::Error;

/// Fatal startup errors. Anything surfacing here aborts the process with
/// exit code 1; runtime errors are logged and contained instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create epoll instance: {0}")]
    Epoll(#[source] io::Error),

    #[error("failed to bind {url} after retrying: {source}")]
    Bind { url: String, source: io::Error },

    #[error("cannot parse server url `{0}`")]
    ServerUrl(String),

    #[error("no upstream server configured in remote trusted mode")]
    NoUpstream,

    #[error("cannot parse upstream url `{0}`")]
    UpstreamUrl(String),

    #[error("cannot parse redirect url `{0}`")]
    RedirectUrl(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead { path: String, source: io::Error },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
