//! Forwarding redo entries to the current leader.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::RwLock;
use url::Url;

use crate::types::LogEntry;
use crate::{Error, Result};

use super::http::parse_response_status;
use super::{REDOLOG_PATH, SYNC_HEADER};

/// Delivers one entry to a remote leader.
pub trait RemoteForwarder: Send + Sync {
    /// Deliver `entry` to the leader with session `leader_id`.
    ///
    /// Any failure is reported as [`Error::LeaderUnavailable`].
    fn forward(&self, leader_id: &str, entry: &LogEntry, synchronous: bool) -> Result<()>;
}

/// Maps leader session ids to the base URL of their redo endpoint.
pub trait LeaderDirectory: Send + Sync {
    fn resolve(&self, leader_id: &str) -> Option<Url>;
}

/// Directory backed by an in-memory table.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    urls: RwLock<HashMap<String, Url>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the base URL of a node, e.g. `http://10.0.0.2:7070/service/`.
    pub fn insert(&self, leader_id: impl Into<String>, base_url: &str) -> Result<()> {
        let url = Url::parse(base_url)
            .map_err(|err| Error::InvalidConfiguration(format!("bad leader url {}: {}", base_url, err)))?;
        self.urls
            .write()
            .insert(leader_id.into(), ensure_trailing_slash(url));
        Ok(())
    }

    pub fn remove(&self, leader_id: &str) {
        self.urls.write().remove(leader_id);
    }
}

impl LeaderDirectory for StaticDirectory {
    fn resolve(&self, leader_id: &str) -> Option<Url> {
        self.urls.read().get(leader_id).cloned()
    }
}

/// Posts framed entries to `<base>/redolog` over plain HTTP/1.1.
pub struct HttpForwarder {
    directory: Arc<dyn LeaderDirectory>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(directory: Arc<dyn LeaderDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    fn post(&self, base: &Url, body: &[u8], synchronous: bool) -> Result<u16> {
        let target = base
            .join(REDOLOG_PATH.trim_start_matches('/'))
            .map_err(|err| Error::http(format!("invalid endpoint url: {}", err)))?;
        if target.scheme() != "http" {
            return Err(Error::http(format!("unsupported scheme {}", target.scheme())));
        }
        let host = target
            .host_str()
            .ok_or_else(|| Error::http("leader url has no host"))?;
        let port = target.port_or_known_default().unwrap_or(80);

        let mut stream = self.connect(host, port)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}:{}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n{}: {}\r\nConnection: close\r\n\r\n",
            target.path(),
            host,
            port,
            body.len(),
            SYNC_HEADER,
            synchronous
        );
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;
        stream.flush()?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        parse_response_status(&response)
    }

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => err.into(),
            None => Error::Io(format!("no address for {}:{}", host, port)),
        })
    }
}

impl RemoteForwarder for HttpForwarder {
    fn forward(&self, leader_id: &str, entry: &LogEntry, synchronous: bool) -> Result<()> {
        let base = self
            .directory
            .resolve(leader_id)
            .ok_or_else(|| Error::leader_unavailable(format!("no address for leader {}", leader_id)))?;

        let status = self
            .post(&base, &entry.encode(), synchronous)
            .map_err(|err| Error::leader_unavailable(format!("{}: {}", leader_id, err)))?;
        if status != 200 {
            return Err(Error::leader_unavailable(format!(
                "{} answered HTTP {}",
                leader_id, status
            )));
        }
        debug!(
            "event=entry_forwarded leader={} txn={} sync={}",
            leader_id,
            entry.txn_id(),
            synchronous
        );
        Ok(())
    }
}

fn ensure_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
