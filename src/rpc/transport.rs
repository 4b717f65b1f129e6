//! Named blocking request/reply transport over TCP.
//!
//! Each peer is addressed by its `"host:port"` string from the node
//! config. A client keeps one persistent [`TcpStream`] per peer behind a
//! [`Mutex`], opening it lazily and reopening it on the next call after any
//! I/O error. The server accepts connections on a fixed-size worker pool
//! and dispatches each request line to an [`RpcHandler`].

use std::io::{BufRead, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::rpc::wire::{Frame, Reply};

/// Backoff between retries of a transient RPC failure, matching the
/// design's fixed unbounded retry (no exponential backoff).
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Number of worker threads servicing inbound connections.
const WORKER_COUNT: usize = 8;

/// Implemented by whatever owns the coherence state, to answer one parsed
/// request frame with a reply.
pub trait RpcHandler: Send + Sync {
    /// Services one request, returning the reply payload fields on
    /// success or an error describing why the request could not be
    /// serviced.
    fn handle(&self, frame: &Frame) -> Result<Vec<String>>;
}

/// A running RPC server: a [`TcpListener`] plus a fixed worker pool
/// draining accepted connections.
pub struct Server {
    local_addr: std::net::SocketAddr,
    _workers: Vec<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds `addr` and starts servicing connections with `handler` on a
    /// fixed pool of [`WORKER_COUNT`] threads. Runs until the process
    /// exits; there is no shutdown path, matching the node's own lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RpcTransient`] if the bind fails.
    pub fn bind<H>(addr: &str, handler: &'static H) -> Result<Self>
    where
        H: RpcHandler + 'static,
    {
        let listener = TcpListener::bind(addr).map_err(|e| Error::RpcTransient {
            name: "bind",
            peer: 0,
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| Error::RpcTransient {
            name: "bind",
            peer: 0,
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel::<TcpStream>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for id in 0..WORKER_COUNT {
            let rx = Arc::clone(&rx);
            workers.push(thread::spawn(move || worker_loop(id, &rx, handler)));
        }

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        if tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        });

        Ok(Self {
            local_addr,
            _workers: workers,
        })
    }

    /// The address the server actually bound to (useful when `addr` used
    /// port `0` in tests).
    #[must_use]
    pub const fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

fn worker_loop(id: usize, rx: &Mutex<mpsc::Receiver<TcpStream>>, handler: &(impl RpcHandler + ?Sized)) {
    loop {
        let stream = {
            let guard = rx.lock().expect("accept queue poisoned");
            guard.recv()
        };
        let Ok(stream) = stream else {
            debug!("worker {id} shutting down: accept queue closed");
            return;
        };
        if let Err(e) = serve_one(stream, handler) {
            warn!("worker {id} connection error: {e}");
        }
    }
}

fn serve_one(stream: TcpStream, handler: &(impl RpcHandler + ?Sized)) -> Result<()> {
    let mut writer = stream.try_clone().map_err(|e| Error::RpcTransient {
        name: "serve",
        peer: 0,
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(|e| Error::RpcTransient {
            name: "serve",
            peer: 0,
            reason: e.to_string(),
        })?;
        if n == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(['\n', '\r']);

        let reply = match Frame::parse(line) {
            Ok(frame) => match handler.handle(&frame) {
                Ok(fields) => Reply::Ok(fields),
                Err(e) => {
                    error!("request {} failed: {e}", frame.name);
                    Reply::NotOk(e.to_string())
                }
            },
            Err(e) => Reply::NotOk(e.to_string()),
        };

        writer
            .write_all(format!("{}\n", reply.to_line()).as_bytes())
            .map_err(|e| Error::RpcTransient {
                name: "serve",
                peer: 0,
                reason: e.to_string(),
            })?;
    }
}

/// One persistent connection to one peer, reopened lazily on failure.
struct PeerConn {
    stream: Option<TcpStream>,
}

/// The client side of the transport: one persistent connection per peer,
/// addressed by index into the node's configured endpoint list.
pub struct Client {
    endpoints: Vec<String>,
    conns: Vec<Mutex<PeerConn>>,
}

impl Client {
    /// Builds a client over the given ordered endpoint list. Connections
    /// are opened lazily, on first use of each peer.
    #[must_use]
    pub fn new(endpoints: Vec<String>) -> Self {
        let conns = endpoints.iter().map(|_| Mutex::new(PeerConn { stream: None })).collect();
        Self { endpoints, conns }
    }

    /// Makes a single attempt at `name(fields)` against `peer`. Does not
    /// retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RpcTransient`] on any I/O failure (the connection
    /// is dropped so the next call reconnects), and [`Error::RpcProtocol`]
    /// if the peer replied `NOT_OK`.
    pub fn call(&self, peer: usize, name: &'static str, fields: Vec<String>) -> Result<Vec<String>> {
        let addr = self.endpoints.get(peer).ok_or_else(|| Error::RpcTransient {
            name,
            peer,
            reason: "no such peer".to_owned(),
        })?;

        let mut guard = self.conns[peer].lock().expect("peer connection poisoned");
        let frame = Frame::new(name, fields);
        let line = format!("{}\n", frame.to_line());

        let reply = send_and_receive(&mut guard, addr, &line).map_err(|e| {
            guard.stream = None;
            Error::RpcTransient {
                name,
                peer,
                reason: e.to_string(),
            }
        })?;

        match Reply::parse(&reply) {
            Reply::Ok(fields) => Ok(fields),
            Reply::NotOk(reason) => Err(Error::RpcProtocol { name, reason }),
        }
    }

    /// As [`Self::call`], but retries forever on [`Error::RpcTransient`],
    /// sleeping [`RETRY_DELAY`] between attempts. Used for every coherence
    /// RPC per the design's "the caller retries a transient transport
    /// failure with a fixed, unbounded backoff" contract.
    ///
    /// # Errors
    ///
    /// Returns immediately on [`Error::RpcProtocol`] (a peer-reported
    /// failure is never retried).
    pub fn call_blocking(&self, peer: usize, name: &'static str, fields: Vec<String>) -> Result<Vec<String>> {
        loop {
            match self.call(peer, name, fields.clone()) {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() => {
                    warn!("transient failure calling {name} on peer {peer}: {e}; retrying");
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn send_and_receive(conn: &mut PeerConn, addr: &str, line: &str) -> std::io::Result<String> {
    if conn.stream.is_none() {
        conn.stream = Some(TcpStream::connect(addr)?);
    }
    let stream = conn.stream.as_mut().expect("just ensured Some");

    stream.write_all(line.as_bytes())?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut reply = String::new();
    let n = reader.read_line(&mut reply)?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed connection",
        ));
    }

    Ok(reply.trim_end_matches(['\n', '\r']).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        calls: AtomicUsize,
    }

    impl RpcHandler for EchoHandler {
        fn handle(&self, frame: &Frame) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if frame.name == "FAIL" {
                return Err(Error::BadState("forced failure".to_owned()));
            }
            Ok(frame.fields.clone())
        }
    }

    #[test]
    fn client_round_trips_a_successful_call() {
        let handler = Box::leak(Box::new(EchoHandler { calls: AtomicUsize::new(0) }));
        let server = Server::bind("127.0.0.1:0", handler).expect("bind");
        let client = Client::new(vec![server.local_addr().to_string()]);

        let reply = client.call(0, "PING", vec!["1".to_owned(), "2".to_owned()]).expect("call");
        assert_eq!(reply, vec!["1".to_owned(), "2".to_owned()]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_surfaces_a_not_ok_reply_as_rpc_protocol_error() {
        let handler = Box::leak(Box::new(EchoHandler { calls: AtomicUsize::new(0) }));
        let server = Server::bind("127.0.0.1:0", handler).expect("bind");
        let client = Client::new(vec![server.local_addr().to_string()]);

        let err = client.call(0, "FAIL", vec![]).unwrap_err();
        assert!(matches!(err, Error::RpcProtocol { .. }));
    }

    #[test]
    fn client_reports_transient_error_for_unreachable_peer() {
        let client = Client::new(vec!["127.0.0.1:1".to_owned()]);
        let err = client.call(0, "PING", vec![]).unwrap_err();
        assert!(err.is_transient());
    }
}
