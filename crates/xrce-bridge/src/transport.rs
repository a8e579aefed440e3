// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction for UDP, TCP, serial and in-process links.
//
// The agent side is addressed (one socket, many peers); the client side is
// a point-to-point pipe to its agent. Stream transports (TCP, serial) carry
// each datagram behind a u16 little-endian length prefix.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::XrceAgentConfig;
use crate::error::{Result, XrceError};

/// Default MTU of datagram transports.
pub const UDP_MTU: usize = 1500;
/// Default MTU of stream transports.
pub const TCP_MTU: usize = 4096;
/// Default MTU of serial links.
pub const SERIAL_MTU: usize = 256;

// Socket timeouts of zero mean "block forever" to the OS.
const MIN_POLL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Transport address
// ---------------------------------------------------------------------------

/// Address identifying a remote XRCE client over any transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// UDP socket address.
    Udp(SocketAddr),
    /// Serial port - only one peer, address is the device path.
    Serial(String),
    /// TCP connection identified by peer address.
    Tcp(SocketAddr),
    /// In-process peer id.
    Memory(u32),
}

// ---------------------------------------------------------------------------
// Transport traits
// ---------------------------------------------------------------------------

/// Agent-side transport: receives from and sends to many clients.
pub trait XrceTransport: Send {
    /// Wait up to `timeout` for one datagram. Returns (bytes_read,
    /// sender_address), or `None` if nothing arrived.
    ///
    /// `TransportClosed` means no datagram will ever arrive again; any
    /// other error is transient.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration)
        -> Result<Option<(usize, TransportAddr)>>;

    /// Send `data` to the given address.
    fn send(&mut self, addr: &TransportAddr, data: &[u8]) -> Result<()>;

    /// Largest datagram this transport carries.
    fn mtu(&self) -> usize;
}

/// Client-side transport: a pipe to one agent.
pub trait ClientTransport: Send {
    /// Send one datagram. Returns the number of bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for one datagram.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;

    /// Largest datagram this transport carries.
    fn mtu(&self) -> usize;
}

impl<T: ClientTransport + ?Sized> ClientTransport for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        (**self).receive(buf, timeout)
    }

    fn mtu(&self) -> usize {
        (**self).mtu()
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

fn udp_socket(bind: SocketAddr) -> Result<UdpSocket> {
    let domain = if bind.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(
        domain,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// UDP agent transport built with `socket2`.
pub struct UdpTransport {
    socket: UdpSocket,
    mtu: usize,
}

impl UdpTransport {
    /// Bind a UDP socket to `0.0.0.0:<port>`.
    pub fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(([0, 0, 0, 0], port).into())
    }

    pub fn bind_addr(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            socket: udp_socket(addr)?,
            mtu: UDP_MTU,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl XrceTransport for UdpTransport {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, TransportAddr)>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_POLL)))?;
        match self.socket.recv_from(buf) {
            Ok((n, peer)) => Ok(Some((n, TransportAddr::Udp(peer)))),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, addr: &TransportAddr, data: &[u8]) -> Result<()> {
        match addr {
            TransportAddr::Udp(sa) => {
                self.socket.send_to(data, sa)?;
                Ok(())
            }
            _ => Err(XrceError::Io("UDP transport requires UDP address".into())),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// UDP client transport connected to one agent.
pub struct UdpClientTransport {
    socket: UdpSocket,
    mtu: usize,
}

impl UdpClientTransport {
    pub fn connect(agent: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if agent.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = udp_socket(local)?;
        socket.connect(agent)?;
        Ok(Self {
            socket,
            mtu: UDP_MTU,
        })
    }
}

impl ClientTransport for UdpClientTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.socket.send(data)?)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_POLL)))?;
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed framing (TCP, serial)
// ---------------------------------------------------------------------------

/// Reassembles u16-LE length-prefixed frames from a byte stream.
#[derive(Debug, Default)]
struct Framer {
    rx: Vec<u8>,
}

impl Framer {
    fn push(&mut self, bytes: &[u8]) {
        self.rx.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.rx.len() < 2 {
            return None;
        }
        let len = usize::from(u16::from_le_bytes([self.rx[0], self.rx[1]]));
        if self.rx.len() < 2 + len {
            return None;
        }
        let frame = self.rx[2..2 + len].to_vec();
        self.rx.drain(..2 + len);
        Some(frame)
    }

    /// Copy the next complete frame into `buf`.
    fn take_into(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.next_frame() {
            Some(frame) if frame.len() > buf.len() => Err(XrceError::ExceedsMaxMessageSize {
                size: frame.len(),
                max: buf.len(),
            }),
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
            None => Ok(None),
        }
    }

    fn encode(data: &[u8]) -> Result<Vec<u8>> {
        let len = u16::try_from(data.len()).map_err(|_| XrceError::ExceedsMaxMessageSize {
            size: data.len(),
            max: usize::from(u16::MAX),
        })?;
        let mut out = Vec::with_capacity(2 + data.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(data);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

struct TcpPeer {
    stream: TcpStream,
    framer: Framer,
}

/// TCP agent transport that accepts connections and multiplexes them.
pub struct TcpTransport {
    listener: TcpListener,
    peers: HashMap<SocketAddr, TcpPeer>,
    mtu: usize,
}

impl TcpTransport {
    /// Bind a TCP listener on `0.0.0.0:<port>`.
    pub fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(([0, 0, 0, 0], port).into())
    }

    pub fn bind_addr(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            peers: HashMap::new(),
            mtu: TCP_MTU,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Try to accept new connections (non-blocking).
    fn accept_new(&mut self) {
        while let Ok((stream, addr)) = self.listener.accept() {
            if let Err(e) = stream.set_nonblocking(true) {
                log::warn!("[XRCE] TCP peer {}: {}", addr, e);
                continue;
            }
            let _ = stream.set_nodelay(true);
            log::debug!("[XRCE] TCP peer {} connected", addr);
            self.peers.insert(
                addr,
                TcpPeer {
                    stream,
                    framer: Framer::default(),
                },
            );
        }
    }

    /// One non-blocking sweep over every peer.
    fn poll_peers(&mut self, buf: &mut [u8]) -> Result<Option<(usize, TransportAddr)>> {
        let mut closed = Vec::new();
        let mut found = None;
        let mut chunk = [0u8; 1024];
        for (addr, peer) in self.peers.iter_mut() {
            loop {
                match peer.stream.read(&mut chunk) {
                    Ok(0) => {
                        closed.push(*addr);
                        break;
                    }
                    Ok(n) => peer.framer.push(&chunk[..n]),
                    Err(e) if is_timeout(&e) => break,
                    Err(e) => {
                        log::debug!("[XRCE] TCP peer {}: {}", addr, e);
                        closed.push(*addr);
                        break;
                    }
                }
            }
            if let Some(n) = peer.framer.take_into(buf)? {
                found = Some((n, TransportAddr::Tcp(*addr)));
                break;
            }
        }
        for addr in closed {
            log::debug!("[XRCE] TCP peer {} disconnected", addr);
            self.peers.remove(&addr);
        }
        Ok(found)
    }
}

impl XrceTransport for TcpTransport {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, TransportAddr)>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.accept_new();
            if let Some(hit) = self.poll_peers(buf)? {
                return Ok(Some(hit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(MIN_POLL);
        }
    }

    fn send(&mut self, addr: &TransportAddr, data: &[u8]) -> Result<()> {
        match addr {
            TransportAddr::Tcp(sa) => match self.peers.get_mut(sa) {
                Some(peer) => {
                    peer.stream.write_all(&Framer::encode(data)?)?;
                    Ok(())
                }
                None => Err(XrceError::Io("TCP peer not connected".into())),
            },
            _ => Err(XrceError::Io("TCP transport requires TCP address".into())),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// TCP client transport.
pub struct TcpClientTransport {
    stream: TcpStream,
    framer: Framer,
    mtu: usize,
}

impl TcpClientTransport {
    pub fn connect(agent: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(agent)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            framer: Framer::default(),
            mtu: TCP_MTU,
        })
    }
}

impl ClientTransport for TcpClientTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.stream.write_all(&Framer::encode(data)?)?;
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(n) = self.framer.take_into(buf)? {
                return Ok(Some(n));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            self.stream.set_read_timeout(Some(left.max(MIN_POLL)))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(XrceError::TransportClosed),
                Ok(n) => self.framer.push(&chunk[..n]),
                Err(e) if is_timeout(&e) => {
                    if left.is_zero() {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

// ---------------------------------------------------------------------------
// Serial transport (file-based)
// ---------------------------------------------------------------------------

/// Serial transport using basic file I/O.
///
/// On Linux this opens the serial device as a regular file. Baud rate and
/// line discipline are expected to be configured externally (e.g. via
/// `stty`). A reader thread feeds raw chunks through a channel so that
/// receives honour their timeout whatever the device's VMIN/VTIME.
pub struct SerialTransport {
    device_path: String,
    chunks: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    writer: std::fs::File,
    framer: Framer,
    mtu: usize,
}

impl SerialTransport {
    /// Open a serial device for XRCE communication.
    pub fn open(device_path: &str) -> Result<Self> {
        use std::fs::OpenOptions;
        let reader = OpenOptions::new().read(true).open(device_path)?;
        let writer = OpenOptions::new().write(true).open(device_path)?;
        let (tx, chunks) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let path = device_path.to_string();
        std::thread::Builder::new()
            .name("xrce-serial-rx".into())
            .spawn(move || serial_reader(reader, tx, flag, path))?;
        Ok(Self {
            device_path: device_path.to_string(),
            chunks,
            stop,
            writer,
            framer: Framer::default(),
            mtu: SERIAL_MTU,
        })
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(n) = self.framer.take_into(buf)? {
                return Ok(Some(n));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            match self.chunks.recv_timeout(left) {
                Ok(bytes) => self.framer.push(&bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(XrceError::TransportClosed),
            }
        }
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(&Framer::encode(data)?)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // A reader blocked in read() exits after its next chunk.
        self.stop.store(true, Ordering::Release);
    }
}

fn serial_reader(
    mut reader: std::fs::File,
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    path: String,
) {
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut chunk) {
            // VTIME expiry or end of file: nothing yet.
            Ok(0) => std::thread::sleep(MIN_POLL),
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if is_timeout(&e) || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("[XRCE] serial {}: read failed: {}", path, e);
                break;
            }
        }
    }
    log::debug!("[XRCE] serial {} reader stopped", path);
}

impl XrceTransport for SerialTransport {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, TransportAddr)>> {
        let path = self.device_path.clone();
        Ok(self
            .read_frame(buf, timeout)?
            .map(|n| (n, TransportAddr::Serial(path))))
    }

    fn send(&mut self, _addr: &TransportAddr, data: &[u8]) -> Result<()> {
        self.write_frame(data)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl ClientTransport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.write_frame(data)?;
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        self.read_frame(buf, timeout)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

// ---------------------------------------------------------------------------
// Configured transports
// ---------------------------------------------------------------------------

/// Open every agent transport `config` enables: UDP always, TCP when
/// `tcp_port` is set, serial when `serial_device` is set.
pub fn open_configured(config: &XrceAgentConfig) -> Result<Vec<Box<dyn XrceTransport>>> {
    let mut transports: Vec<Box<dyn XrceTransport>> = Vec::new();
    let udp = UdpTransport::bind(config.udp_port)?;
    log::info!("[XRCE] UDP listening on {}", udp.local_addr()?);
    transports.push(Box::new(udp));
    if let Some(port) = config.tcp_port {
        let tcp = TcpTransport::bind(port)?;
        log::info!("[XRCE] TCP listening on {}", tcp.local_addr()?);
        transports.push(Box::new(tcp));
    }
    if let Some(device) = config.serial_device.as_deref() {
        transports.push(Box::new(SerialTransport::open(device)?));
        log::info!("[XRCE] serial link on {}", device);
    }
    Ok(transports)
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

type Peers = Arc<Mutex<HashMap<u32, Sender<Vec<u8>>>>>;

/// Agent end of an in-process link. Clients are attached with
/// [`MemoryAgentTransport::connect`].
pub struct MemoryAgentTransport {
    inbox: Receiver<(u32, Vec<u8>)>,
    inbox_tx: Sender<(u32, Vec<u8>)>,
    peers: Peers,
    next_peer: Arc<AtomicU32>,
    mtu: usize,
}

impl MemoryAgentTransport {
    pub fn new(mtu: usize) -> Self {
        let (inbox_tx, inbox) = channel::unbounded();
        Self {
            inbox,
            inbox_tx,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_peer: Arc::new(AtomicU32::new(1)),
            mtu,
        }
    }

    /// Attach a new client with its own address.
    pub fn connect(&self) -> MemoryClientTransport {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded();
        self.peers.lock().insert(id, tx);
        MemoryClientTransport {
            id,
            outbox: self.inbox_tx.clone(),
            inbox: rx,
            mtu: self.mtu,
        }
    }
}

impl XrceTransport for MemoryAgentTransport {
    fn recv(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, TransportAddr)>> {
        match self.inbox.recv_timeout(timeout) {
            Ok((from, data)) => {
                if data.len() > buf.len() {
                    return Err(XrceError::ExceedsMaxMessageSize {
                        size: data.len(),
                        max: buf.len(),
                    });
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some((data.len(), TransportAddr::Memory(from))))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(XrceError::TransportClosed),
        }
    }

    fn send(&mut self, addr: &TransportAddr, data: &[u8]) -> Result<()> {
        if data.len() > self.mtu {
            return Err(XrceError::ExceedsMaxMessageSize {
                size: data.len(),
                max: self.mtu,
            });
        }
        let TransportAddr::Memory(id) = addr else {
            return Err(XrceError::Io("memory transport requires memory address".into()));
        };
        let mut peers = self.peers.lock();
        let delivered = peers
            .get(id)
            .map(|tx| tx.send(data.to_vec()).is_ok())
            .unwrap_or(false);
        if !delivered {
            peers.remove(id);
            return Err(XrceError::Io(format!("memory peer {} gone", id)));
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

/// Client end of an in-process link.
pub struct MemoryClientTransport {
    id: u32,
    outbox: Sender<(u32, Vec<u8>)>,
    inbox: Receiver<Vec<u8>>,
    mtu: usize,
}

impl MemoryClientTransport {
    pub fn addr(&self) -> TransportAddr {
        TransportAddr::Memory(self.id)
    }
}

impl ClientTransport for MemoryClientTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.mtu {
            return Err(XrceError::ExceedsMaxMessageSize {
                size: data.len(),
                max: self.mtu,
            });
        }
        self.outbox
            .send((self.id, data.to_vec()))
            .map_err(|_| XrceError::TransportClosed)?;
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(data) if data.len() > buf.len() => Err(XrceError::ExceedsMaxMessageSize {
                size: data.len(),
                max: buf.len(),
            }),
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some(data.len()))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(XrceError::TransportClosed),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
