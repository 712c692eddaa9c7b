//! Leader-side `POST /redolog` endpoint.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::types::LogEntry;
use crate::wal::LogWriter;
use crate::{Error, Result};

use super::http::{read_request, write_response, HttpRequest};
use super::{REDOLOG_PATH, SYNC_HEADER};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts entries forwarded by followers and logs them locally.
pub struct RedologEndpoint {
    writer: Arc<dyn LogWriter>,
}

impl RedologEndpoint {
    pub fn new(writer: Arc<dyn LogWriter>) -> Self {
        Self { writer }
    }

    /// Status code for one request.
    pub fn handle(&self, request: &HttpRequest) -> u16 {
        if request.path != REDOLOG_PATH {
            return 404;
        }
        if !request.method.eq_ignore_ascii_case("POST") {
            return 405;
        }
        let entry = match LogEntry::decode(&request.body) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("event=redolog_bad_frame bytes={} error={}", request.body.len(), err);
                return 400;
            }
        };
        let synchronous = request
            .header(SYNC_HEADER)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        match self.writer.log(&entry, synchronous) {
            Ok(()) => 200,
            Err(Error::WriterClosed) => 503,
            Err(err) => {
                warn!(
                    "event=redolog_append_failed txn={} error={}",
                    entry.txn_id(),
                    err
                );
                500
            }
        }
    }

    /// Serve one connection: a single request and its response.
    pub fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let status = match read_request(&mut stream) {
            Ok(request) => self.handle(&request),
            Err(err) => {
                debug!("event=redolog_bad_request error={}", err);
                400
            }
        };
        write_response(&mut stream, status)
    }

    /// Run the accept loop on `listener` until the handle is shut down.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<EndpointHandle> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let join = thread::Builder::new()
            .name("redolog-endpoint".to_string())
            .spawn(move || self.accept_loop(listener, shutdown_flag))
            .map_err(|err| Error::internal(format!("failed to spawn endpoint: {}", err)))?;

        info!("event=redolog_endpoint_listening addr={}", local_addr);
        Ok(EndpointHandle {
            shutdown,
            join: Some(join),
            local_addr,
        })
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let endpoint = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name("redolog-conn".to_string())
                        .spawn(move || {
                            if let Err(err) = endpoint.handle_connection(stream) {
                                warn!("event=redolog_connection_failed peer={} error={}", addr, err);
                            }
                        });
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(err) => warn!("event=redolog_spawn_failed peer={} error={}", addr, err),
                    }
                    workers.retain(|handle| !handle.is_finished());
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    warn!("event=redolog_accept_failed error={}", err);
                    break;
                }
            }
        }
        for handle in workers {
            let _ = handle.join();
        }
        info!("event=redolog_endpoint_stopped");
    }
}

/// Running accept loop. Dropping it stops the loop.
pub struct EndpointHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl EndpointHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight requests.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
