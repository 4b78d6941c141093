//! UDP client for the group relay.
//!
//! One reader thread turns datagrams into [`RelayEvent`]s and one writer thread
//! drains an outbound queue. Both hand their results to a caller-supplied sink,
//! which is expected to forward them onto the session's own channel.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::RelayError;
use crate::protocol::{self, Inbound, ProtocolVersion, RelayCodec};

const MAX_DATAGRAM: usize = 1500;
const OUTBOUND_CAPACITY: usize = 64;
const READ_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub group: String,
    pub version: ProtocolVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected { peer: SocketAddr },
    Message(Inbound),
    /// The connection is gone. Sent at most once per client.
    Closed(String),
}

/// Result of one receive attempt. Nothing arriving and the peer going away
/// are different things to a session.
#[derive(Debug)]
pub enum RelayPoll {
    Frame(Vec<u8>),
    Empty,
    Closed(io::Error),
}

type Sink = Arc<dyn Fn(RelayEvent) + Send + Sync>;

struct Shared {
    sink: Sink,
    closed: AtomicBool,
    shutdown: AtomicBool,
}

impl Shared {
    fn close(&self, reason: String) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!("relay: closed: {reason}");
            (self.sink)(RelayEvent::Closed(reason));
        }
    }
}

pub struct RelayClient {
    codec: RelayCodec,
    peer: SocketAddr,
    out_tx: Option<cb::Sender<Vec<u8>>>,
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("codec", &self.codec)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub fn resolve_socket_addr(host: &str, port: u16) -> Result<SocketAddr, RelayError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let endpoint = format!("{host}:{port}");
    let mut addrs = endpoint
        .to_socket_addrs()
        .map_err(|source| RelayError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs.next().ok_or(RelayError::NoAddress(endpoint))
}

fn open_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true).ok();
    let any: SocketAddr = if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket.bind(&any.into())?;
    socket.connect(&peer.into())?;
    socket.set_read_timeout(Some(READ_POLL))?;
    Ok(socket.into())
}

fn poll(socket: &UdpSocket, buf: &mut [u8]) -> RelayPoll {
    match socket.recv(buf) {
        Ok(n) => RelayPoll::Frame(buf[..n].to_vec()),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            RelayPoll::Empty
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => RelayPoll::Empty,
        Err(e) => RelayPoll::Closed(e),
    }
}

fn reader_main(socket: UdpSocket, shared: Arc<Shared>) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shared.shutdown.load(Ordering::Acquire) && !shared.closed.load(Ordering::Acquire) {
        match poll(&socket, &mut buf) {
            RelayPoll::Empty => {}
            RelayPoll::Frame(frame) => match protocol::decode(&frame) {
                Ok(msg) => {
                    trace!("relay: <- {msg:?}");
                    (shared.sink)(RelayEvent::Message(msg));
                }
                Err(e) => warn!("relay: dropping {}-byte frame: {e}", frame.len()),
            },
            RelayPoll::Closed(e) => {
                if !shared.shutdown.load(Ordering::Acquire) {
                    shared.close(e.to_string());
                }
                break;
            }
        }
    }
    debug!("relay: reader stopped");
}

fn writer_main(socket: UdpSocket, rx: cb::Receiver<Vec<u8>>, shared: Arc<Shared>) {
    for frame in rx.iter() {
        if let Err(e) = socket.send(&frame) {
            if !shared.shutdown.load(Ordering::Acquire) {
                shared.close(e.to_string());
            }
            break;
        }
    }
    debug!("relay: writer stopped");
}

/// Nanoseconds since the Unix epoch, as carried in protocol 03 headers.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

impl RelayClient {
    /// Resolves and connects, then starts the reader and writer threads.
    /// Emits [`RelayEvent::Connected`] through `sink` before returning.
    pub fn connect<F>(settings: &RelaySettings, sink: F) -> Result<Self, RelayError>
    where
        F: Fn(RelayEvent) + Send + Sync + 'static,
    {
        let peer = resolve_socket_addr(&settings.host, settings.port)?;
        let socket = open_socket(peer).map_err(RelayError::Socket)?;
        let write_socket = socket.try_clone().map_err(RelayError::Socket)?;

        let shared = Arc::new(Shared {
            sink: Arc::new(sink),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let (out_tx, out_rx) = cb::bounded(OUTBOUND_CAPACITY);

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("relay-reader".into())
            .spawn(move || reader_main(socket, reader_shared))
            .map_err(RelayError::Spawn)?;
        let writer_shared = Arc::clone(&shared);
        let writer = match thread::Builder::new()
            .name("relay-writer".into())
            .spawn(move || writer_main(write_socket, out_rx, writer_shared))
        {
            Ok(writer) => writer,
            Err(e) => {
                shared.shutdown.store(true, Ordering::Release);
                let _ = reader.join();
                return Err(RelayError::Spawn(e));
            }
        };

        info!("relay: connected to {peer} ({:?})", settings.version);
        (shared.sink)(RelayEvent::Connected { peer });

        Ok(Self {
            codec: RelayCodec::new(settings.version, settings.group.clone()),
            peer,
            out_tx: Some(out_tx),
            shared,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn codec(&self) -> &RelayCodec {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queues a frame. Returns `false` if it was dropped because the client is
    /// closed or the outbound queue is full.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(tx) = &self.out_tx else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(cb::TrySendError::Full(_)) => {
                warn!("relay: outbound queue full; dropping frame");
                false
            }
            Err(cb::TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn join(&self, index: Option<usize>, sector: u64) -> bool {
        self.send(self.codec.join(index, sector, now_ns()))
    }

    pub fn broadcast(&self, index: Option<usize>, sector: u64, payload: &[u8]) -> bool {
        self.send(self.codec.broadcast(index, sector, now_ns(), payload))
    }

    pub fn echo(&self, index: Option<usize>) -> bool {
        match self.codec.echo(index, now_ns()) {
            Some(frame) => self.send(frame),
            None => false,
        }
    }

    /// Stops both threads without reporting [`RelayEvent::Closed`].
    pub fn disconnect(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.out_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        info!("relay: disconnected from {}", self.peer);
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            self.disconnect();
        }
    }
}
