//! Blocking MAL/TCP transport: one accept thread, one reader thread per
//! connection, one outbound pump draining a bounded channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};

use crate::transport::frame::{FIXED_HEADER_LEN, FrameCodec, variable_length};
use crate::transport::{Network, TransportCallback, TransportConfig, TransportError};
use crate::types::{MALTCP_PREFIX, Message, Uri};

const OUTBOUND_QUEUE: usize = 10;
const SEND_ATTEMPTS: u32 = 3;
const ACCEPT_POLL: Duration = Duration::from_millis(25);

enum Outbound {
    Deliver(Box<Message>),
    Shutdown,
}

pub struct TcpTransport {
    shared: Arc<TransportShared>,
    outbound: Sender<Outbound>,
    accept: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Cloneable enqueue handle held by endpoints; outlives borrows of the
/// transport itself.
#[derive(Clone)]
pub struct TransmitHandle {
    outbound: Sender<Outbound>,
    shared: Arc<TransportShared>,
}

impl TransmitHandle {
    /// Enqueues one outbound message. Blocks only on queue back-pressure,
    /// never on network I/O.
    pub fn transmit(&self, msg: Message) -> Result<(), TransportError> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if msg.uri_to.host_port().is_none() {
            return Err(TransportError::BadDestination(msg.uri_to.to_string()));
        }
        self.outbound
            .send(Outbound::Deliver(Box::new(msg)))
            .map_err(|_| TransportError::Closed)
    }

    pub fn transmit_multiple(
        &self,
        msgs: impl IntoIterator<Item = Message>,
    ) -> Result<(), TransportError> {
        for msg in msgs {
            self.transmit(msg)?;
        }
        Ok(())
    }
}

struct TransportShared {
    base_uri: Uri,
    codec: FrameCodec,
    callback: Arc<dyn TransportCallback>,
    running: AtomicBool,
    conns: RwLock<HashMap<String, TcpStream>>,
}

impl TcpTransport {
    /// Binds the listening socket for `host:port` and starts the accept
    /// and pump threads. `host` is the address the transport advertises
    /// in its own URIs; the listener binds the wildcard address of the
    /// selected network.
    pub fn bind(
        host: &str,
        port: u16,
        config: TransportConfig,
        callback: Arc<dyn TransportCallback>,
    ) -> Result<Self, TransportError> {
        let wildcard = match config.network {
            Network::Tcp | Network::Tcp4 => "0.0.0.0",
            Network::Tcp6 => "::",
        };
        let listener = TcpListener::bind((wildcard, port))?;
        listener.set_nonblocking(true)?;

        let base_uri = Uri::new(format!("{MALTCP_PREFIX}{host}:{port}"));
        let codec = FrameCodec::new(base_uri.as_str(), config);
        let shared = Arc::new(TransportShared {
            base_uri,
            codec,
            callback,
            running: AtomicBool::new(true),
            conns: RwLock::new(HashMap::new()),
        });

        let (outbound, queue) = bounded(OUTBOUND_QUEUE);
        let accept = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_accept_loop(listener, shared))
        };
        let pump = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_pump(queue, shared))
        };

        Ok(Self {
            shared,
            outbound,
            accept: Some(accept),
            pump: Some(pump),
        })
    }

    /// Base URI of this transport, `maltcp://host:port`.
    pub fn uri(&self) -> &Uri {
        &self.shared.base_uri
    }

    pub fn handle(&self) -> TransmitHandle {
        TransmitHandle {
            outbound: self.outbound.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn transmit(&self, msg: Message) -> Result<(), TransportError> {
        self.handle().transmit(msg)
    }

    pub fn transmit_multiple(
        &self,
        msgs: impl IntoIterator<Item = Message>,
    ) -> Result<(), TransportError> {
        self.handle().transmit_multiple(msgs)
    }

    /// Drains pending sends, tears down every socket and joins the
    /// transport threads. Idempotent.
    pub fn close(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        // Queued messages ahead of the sentinel still go out.
        let _ = self.outbound.send(Outbound::Shutdown);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }

        if let Ok(mut conns) = self.shared.conns.write() {
            for (peer, stream) in conns.drain() {
                tracing::debug!(%peer, "transport close, shutting down connection");
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl TransportShared {
    fn add_connection(&self, peer: &str, stream: TcpStream) {
        if let Ok(mut conns) = self.conns.write() {
            conns.insert(peer.to_string(), stream);
        }
    }

    fn del_connection(&self, peer: &str) {
        if let Ok(mut conns) = self.conns.write() {
            conns.remove(peer);
        }
    }

    /// Returns a write handle for the peer; no I/O happens under the lock.
    fn get_connection(&self, peer: &str) -> Option<TcpStream> {
        let conns = self.conns.read().ok()?;
        conns.get(peer).and_then(|stream| stream.try_clone().ok())
    }

    fn spawn_reader(self: &Arc<Self>, stream: TcpStream, peer: String) {
        let shared = Arc::clone(self);
        thread::spawn(move || run_reader(stream, peer, shared));
    }
}

fn run_accept_loop(listener: TcpListener, shared: Arc<TransportShared>) {
    loop {
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                let peer = addr.to_string();
                tracing::debug!(%peer, "accepted inbound connection");
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);
                match stream.try_clone() {
                    Ok(writer) => shared.add_connection(&peer, writer),
                    Err(err) => {
                        tracing::warn!(%peer, "cannot register connection: {err}");
                        continue;
                    }
                }
                shared.spawn_reader(stream, peer);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                if shared.running.load(Ordering::Relaxed) {
                    tracing::warn!("accept error: {err}");
                }
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!(uri = %shared.base_uri, "accept loop exited");
}

fn run_reader(mut stream: TcpStream, peer: String, shared: Arc<TransportShared>) {
    loop {
        let mut header = [0u8; FIXED_HEADER_LEN];
        if let Err(err) = stream.read_exact(&mut header) {
            if shared.running.load(Ordering::Relaxed)
                && err.kind() != std::io::ErrorKind::UnexpectedEof
            {
                tracing::warn!(%peer, "read error: {err}");
            }
            break;
        }
        let announced = match variable_length(&header) {
            Ok(len) => len,
            Err(err) => {
                tracing::warn!(%peer, "bad fixed header: {err}");
                break;
            }
        };

        let mut frame = vec![0u8; FIXED_HEADER_LEN + announced];
        frame[..FIXED_HEADER_LEN].copy_from_slice(&header);
        if let Err(err) = stream.read_exact(&mut frame[FIXED_HEADER_LEN..]) {
            if shared.running.load(Ordering::Relaxed) {
                tracing::warn!(%peer, "truncated frame: {err}");
            }
            break;
        }

        match shared.codec.decode(&frame, &peer) {
            Ok(msg) => shared.callback.receive(msg),
            Err(err) => {
                // Wire-level errors poison the stream framing; close it.
                tracing::warn!(%peer, "decode error, closing connection: {err}");
                break;
            }
        }
    }
    shared.del_connection(&peer);
    let _ = stream.shutdown(Shutdown::Both);
    tracing::debug!(%peer, "reader exited");
}

fn run_pump(queue: Receiver<Outbound>, shared: Arc<TransportShared>) {
    for command in queue.iter() {
        let msg = match command {
            Outbound::Deliver(msg) => msg,
            Outbound::Shutdown => break,
        };
        let Some(addr) = msg.uri_to.host_port().map(str::to_string) else {
            tracing::warn!(uri_to = %msg.uri_to, "cannot route message, dropping");
            continue;
        };

        let frame = match shared.codec.encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(uri_to = %msg.uri_to, "encode error, dropping message: {err}");
                continue;
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            let stream = match shared.get_connection(&addr) {
                Some(stream) => stream,
                None => match dial(&shared, &addr) {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(%addr, "dial failed: {err}");
                        if attempts < SEND_ATTEMPTS {
                            continue;
                        }
                        // Reserved: hand the message to an error listener.
                        tracing::warn!(%addr, "dropping message after {attempts} attempts");
                        break;
                    }
                },
            };

            match write_frame(&stream, &frame) {
                Ok(()) => break,
                Err(err) => {
                    tracing::debug!(%addr, "send failed: {err}");
                    // Close to recover a clean framing state, then retry
                    // the same message on a fresh connection.
                    let _ = stream.shutdown(Shutdown::Both);
                    shared.del_connection(&addr);
                    if attempts < SEND_ATTEMPTS {
                        continue;
                    }
                    tracing::warn!(%addr, "dropping message after {attempts} attempts");
                    break;
                }
            }
        }
    }
    tracing::debug!(uri = %shared.base_uri, "outbound pump exited");
}

fn dial(shared: &Arc<TransportShared>, addr: &str) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr).map_err(|source| TransportError::ConnectionFailed {
        addr: addr.to_string(),
        source,
    })?;
    let _ = stream.set_nodelay(true);
    let writer = stream.try_clone()?;
    shared.add_connection(addr, writer.try_clone()?);
    // The dialed connection is bidirectional: wait for frames coming back.
    shared.spawn_reader(stream, addr.to_string());
    Ok(writer)
}

fn write_frame(mut stream: &TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame)
}
