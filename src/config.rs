//! Runtime configuration for the connector process.
//!
//! The config is a JSON document deserialized with serde. Every field has a
//! default so a connector can start with an empty object and bind the default
//! mining port on all interfaces.

use std::fs;
use std::net::ToSocketAddrs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Default port bound when no server urls are configured.
pub const DEFAULT_MINING_PORT: u16 = 3333;
/// Default port bound when no server urls are configured in proxy mode.
pub const DEFAULT_PROXY_PORT: u16 = 3334;

/// Ports above this are treated as high-difficulty servers.
const HIGHDIFF_PORT: u16 = 4000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum simultaneous clients, 0 for no limit.
    pub maxclients: usize,

    /// Listening urls as `host:port`. Empty binds all interfaces on the
    /// default port.
    pub serverurl: Vec<String>,

    /// Redirect targets as `host:port` for redirector mode.
    pub redirecturl: Vec<String>,

    /// Aggregate subclients over one upstream connection.
    pub passthrough: bool,

    /// Mirror all traffic to the stratifier as a passive node.
    pub node: bool,

    /// Act as a downstream trusted remote of another pool.
    pub remote: bool,

    /// Redirect share-producing clients to a protected endpoint.
    pub redirector: bool,

    /// Proxy mode changes the default listening port.
    pub proxy: bool,

    /// Upstream pool url, required in remote mode.
    pub upstream: Option<String>,

    /// Directory holding the unix-domain control socket.
    pub sockdir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_string(),
            source,
        })?;
        let cfg: Config = serde_json::from_str(&raw).map_err(|source| Error::ConfigParse {
            path: path.to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.remote && self.upstream.is_none() {
            return Err(Error::NoUpstream);
        }
        for url in &self.redirecturl {
            parse_host_port(url).ok_or_else(|| Error::RedirectUrl(url.clone()))?;
        }
        Ok(())
    }

    /// Path of the unix-domain control socket.
    pub fn control_socket_path(&self) -> PathBuf {
        let dir = self
            .sockdir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp/poolconn"));
        dir.join("connector")
    }

    /// Parsed redirect targets. `validate` has already checked these.
    pub fn redirect_urls(&self) -> Vec<RedirectUrl> {
        self.redirecturl
            .iter()
            .filter_map(|u| parse_host_port(u))
            .map(|(url, port)| RedirectUrl { url, port })
            .collect()
    }
}

/// One parsed listening url.
#[derive(Debug, Clone)]
pub struct ServerUrl {
    pub host: String,
    pub port: u16,
    /// High port servers are treated as highdiff ports.
    pub highdiff: bool,
}

impl ServerUrl {
    pub fn parse(serverurl: &str) -> Result<Self, Error> {
        let (host, port) =
            parse_host_port(serverurl).ok_or_else(|| Error::ServerUrl(serverurl.to_string()))?;
        // Make sure the url resolves now rather than at bind time.
        (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| Error::ServerUrl(serverurl.to_string()))?;
        Ok(ServerUrl {
            host,
            port,
            highdiff: port > HIGHDIFF_PORT,
        })
    }
}

/// One redirect target in redirector mode.
#[derive(Debug, Clone)]
pub struct RedirectUrl {
    pub url: String,
    pub port: u16,
}

pub(crate) fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let (host, port) = url.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}
