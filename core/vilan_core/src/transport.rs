//! Event-driven links
//!
//! A [`Transport`] opens outbound connections. Each connection gets a
//! [`Handler`] that receives lifecycle callbacks from the link's own reactor
//! thread:
//!
//! ```text
//!  socket ──► idle timer ──► codec ──► Handler
//!                │                       on_active    connection established
//!                │                       on_read      one decoded frame
//!                └─────────────────────► on_idle      nothing read for `read_idle`
//!                                        on_exception socket fault
//!                                        on_inactive  link closed (once)
//! ```
//!
//! UDP links are connected sockets, so each remote appears as its own
//! connection. Handler panics are caught at this boundary and logged.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::{FrameCodec, FrameContext, StreamDecoder, MAX_PEER_FRAME_LEN};
use crate::config::Scheme;
use crate::error::{Error, Result};
use crate::protocol::Frame;

// ============================================================================
// Constants
// ============================================================================

/// Largest UDP datagram
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Read chunk for stream links
const STREAM_READ_SIZE: usize = 64 * 1024;

/// Connect timeout for stream links
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// mio token for the link socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the close waker
const WAKER_TOKEN: Token = Token(1);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Contract
// ============================================================================

/// One established link
pub trait Link: Send + Sync {
    fn id(&self) -> u64;
    fn send(&self, frame: &Frame) -> Result<()>;
    /// Stop the link; `on_inactive` follows from its reactor
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn local_addr(&self) -> SocketAddr;
    fn peer_addr(&self) -> SocketAddr;
}

/// Cloneable handle to a link
#[derive(Clone)]
pub struct Connection(Arc<dyn Link>);

impl Connection {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Connection(link)
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn write(&self, frame: impl Into<Frame>) -> Result<()> {
        if self.0.is_closed() {
            return Err(Error::Connectivity(format!(
                "link to {} is closed",
                self.0.peer_addr()
            )));
        }
        self.0.send(&frame.into())
    }

    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.peer_addr()
    }

    /// Same underlying link
    pub fn same(&self, other: &Connection) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection(#{} {} -> {})",
            self.id(),
            self.local_addr(),
            self.peer_addr()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    ReadIdle,
}

/// Lifecycle callbacks for one connection
pub trait Handler: Send + Sync {
    fn on_active(&self, _conn: &Connection) {}

    fn on_read(&self, conn: &Connection, frame: Frame);

    fn on_idle(&self, _conn: &Connection, _event: IdleEvent) {}

    fn on_exception(&self, conn: &Connection, fault: &io::Error) {
        log::warn!("{:?}: {}", conn, fault);
    }

    fn on_inactive(&self, _conn: &Connection) {}
}

/// Options for an outbound connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub remote: SocketAddr,
    /// Local address to bind; ephemeral when absent
    pub local: Option<SocketAddr>,
    pub scheme: Scheme,
    /// Fire `on_idle` after this long without reads
    pub read_idle: Option<Duration>,
    pub max_frame_len: usize,
    /// Allow binding a local address already in use by another link
    pub reuse_addr: bool,
}

impl ConnectOptions {
    pub fn new(remote: SocketAddr) -> Self {
        ConnectOptions {
            remote,
            local: None,
            scheme: Scheme::Udp,
            read_idle: None,
            max_frame_len: MAX_PEER_FRAME_LEN,
            reuse_addr: false,
        }
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn bind(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn read_idle(mut self, idle: Duration) -> Self {
        self.read_idle = Some(idle);
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn reuse_addr(mut self) -> Self {
        self.reuse_addr = true;
        self
    }
}

/// Opens connections
pub trait Transport: Send + Sync {
    fn connect(&self, options: ConnectOptions, handler: Arc<dyn Handler>) -> io::Result<Connection>;
}

/// Run a handler callback, containing any panic
fn guarded(conn: &Connection, what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{:?}: handler panicked in {}", conn, what);
    }
}

// ============================================================================
// Socket Transport
// ============================================================================

/// Transport over OS sockets; frames are coded with the session context
pub struct SocketTransport {
    context: Arc<FrameContext>,
    /// Event capacity per reactor poll
    batch: usize,
}

impl SocketTransport {
    pub fn new(context: Arc<FrameContext>, batch: usize) -> Self {
        SocketTransport {
            context,
            batch: batch.max(8),
        }
    }
}

impl Transport for SocketTransport {
    fn connect(&self, options: ConnectOptions, handler: Arc<dyn Handler>) -> io::Result<Connection> {
        let codec = FrameCodec::new(self.context.clone(), options.max_frame_len);
        match options.scheme {
            Scheme::Udp => UdpLink::open(options, codec, handler, self.batch),
            Scheme::Tcp => TcpLink::open(options, codec, handler),
        }
    }
}

fn new_socket(options: &ConnectOptions, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = Domain::for_address(options.remote);
    let socket = Socket::new(domain, ty, Some(protocol))?;
    if options.reuse_addr {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    if let Some(local) = options.local {
        socket.bind(&local.into())?;
    }
    Ok(socket)
}

// ============================================================================
// UDP
// ============================================================================

struct UdpLink {
    id: u64,
    socket: UdpSocket,
    codec: FrameCodec,
    local: SocketAddr,
    peer: SocketAddr,
    closed: AtomicBool,
    waker: Waker,
}

impl UdpLink {
    fn open(
        options: ConnectOptions,
        codec: FrameCodec,
        handler: Arc<dyn Handler>,
        batch: usize,
    ) -> io::Result<Connection> {
        let socket = new_socket(&options, Type::DGRAM, Protocol::UDP)?;
        if options.local.is_none() {
            let any: SocketAddr = match options.remote {
                SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
                SocketAddr::V6(_) => ([0u16; 8], 0).into(),
            };
            socket.bind(&any.into())?;
        }
        socket.connect(&options.remote.into())?;
        socket.set_nonblocking(true)?;

        let mut socket = UdpSocket::from_std(socket.into());
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let link = Arc::new(UdpLink {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            local: socket.local_addr()?,
            peer: options.remote,
            socket,
            codec,
            closed: AtomicBool::new(false),
            waker,
        });
        log::debug!("udp link #{} {} -> {}", link.id, link.local, link.peer);

        let reactor_link = link.clone();
        let read_idle = options.read_idle;
        thread::Builder::new()
            .name(format!("udp-link-{}", link.id))
            .spawn(move || reactor_link.run(poll, handler, read_idle, batch))?;

        Ok(Connection::new(link))
    }

    fn run(
        self: Arc<Self>,
        mut poll: Poll,
        handler: Arc<dyn Handler>,
        read_idle: Option<Duration>,
        batch: usize,
    ) {
        let conn = Connection::new(self.clone());
        guarded(&conn, "active", || handler.on_active(&conn));

        let mut events = Events::with_capacity(batch);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_read = Instant::now();

        'reactor: while !self.is_closed() {
            let timeout = read_idle.map(|idle| idle.saturating_sub(last_read.elapsed()));
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                guarded(&conn, "exception", || handler.on_exception(&conn, &e));
                break;
            }

            for event in events.iter() {
                if event.token() != SOCKET_TOKEN {
                    continue;
                }
                loop {
                    match self.socket.recv(&mut buf) {
                        Ok(n) => {
                            last_read = Instant::now();
                            match self.codec.decode_datagram(&buf[..n]) {
                                Ok(frame) => guarded(&conn, "read", || handler.on_read(&conn, frame)),
                                Err(e) => log::debug!("{:?}: dropping datagram: {}", conn, e),
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        // ICMP unreachable from the remote; the path may still open
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                            log::debug!("{:?}: {}", conn, e);
                        }
                        Err(e) => {
                            guarded(&conn, "exception", || handler.on_exception(&conn, &e));
                            break 'reactor;
                        }
                    }
                }
            }

            if let Some(idle) = read_idle {
                if last_read.elapsed() >= idle {
                    last_read = Instant::now();
                    guarded(&conn, "idle", || handler.on_idle(&conn, IdleEvent::ReadIdle));
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        log::debug!("udp link #{} closed", self.id);
        guarded(&conn, "inactive", || handler.on_inactive(&conn));
    }
}

impl Link for UdpLink {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.socket.send(&bytes)?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                log::warn!("udp link #{}: wake failed: {}", self.id, e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

// ============================================================================
// TCP
// ============================================================================

struct TcpLink {
    id: u64,
    writer: Mutex<TcpStream>,
    codec: FrameCodec,
    local: SocketAddr,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpLink {
    fn open(
        options: ConnectOptions,
        codec: FrameCodec,
        handler: Arc<dyn Handler>,
    ) -> io::Result<Connection> {
        let socket = new_socket(&options, Type::STREAM, Protocol::TCP)?;
        socket.connect_timeout(&options.remote.into(), CONNECT_TIMEOUT)?;
        socket.set_nodelay(true)?;
        let stream: TcpStream = socket.into();
        stream.set_read_timeout(options.read_idle)?;

        let reader = stream.try_clone()?;
        let link = Arc::new(TcpLink {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            local: stream.local_addr()?,
            peer: options.remote,
            writer: Mutex::new(stream),
            codec,
            closed: AtomicBool::new(false),
        });
        log::debug!("tcp link #{} {} -> {}", link.id, link.local, link.peer);

        let reactor_link = link.clone();
        thread::Builder::new()
            .name(format!("tcp-link-{}", link.id))
            .spawn(move || reactor_link.run(reader, handler))?;

        Ok(Connection::new(link))
    }

    fn run(self: Arc<Self>, mut reader: TcpStream, handler: Arc<dyn Handler>) {
        let conn = Connection::new(self.clone());
        guarded(&conn, "active", || handler.on_active(&conn));

        let mut decoder: StreamDecoder = self.codec.stream_decoder();
        let mut buf = vec![0u8; STREAM_READ_SIZE];

        while !self.is_closed() {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for frame in decoder.feed(&buf[..n]) {
                        guarded(&conn, "read", || handler.on_read(&conn, frame));
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    guarded(&conn, "idle", || handler.on_idle(&conn, IdleEvent::ReadIdle));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.is_closed() {
                        guarded(&conn, "exception", || handler.on_exception(&conn, &e));
                    }
                    break;
                }
            }
        }

        self.closed.store(true, Ordering::Release);
        log::debug!("tcp link #{} closed", self.id);
        guarded(&conn, "inactive", || handler.on_inactive(&conn));
    }
}

impl Link for TcpLink {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let writer = match self.writer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let _ = writer.shutdown(Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

// ============================================================================
// Mock Transport
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerId;
    use crate::protocol::{DataFrame, DataKind};
    use crate::state::{PeerState, StateCell};
    use std::net::{TcpListener, UdpSocket as StdUdpSocket};
    use std::sync::mpsc;

    enum Event {
        Active,
        Read(Frame),
        Idle,
        Inactive,
    }

    struct ChannelHandler(Mutex<mpsc::Sender<Event>>);

    impl ChannelHandler {
        fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(ChannelHandler(Mutex::new(tx))), rx)
        }

        fn emit(&self, event: Event) {
            let _ = self.0.lock().unwrap().send(event);
        }
    }

    impl Handler for ChannelHandler {
        fn on_active(&self, _conn: &Connection) {
            self.emit(Event::Active);
        }

        fn on_read(&self, _conn: &Connection, frame: Frame) {
            self.emit(Event::Read(frame));
        }

        fn on_idle(&self, _conn: &Connection, _event: IdleEvent) {
            self.emit(Event::Idle);
        }

        fn on_inactive(&self, _conn: &Connection) {
            self.emit(Event::Inactive);
        }
    }

    struct PanickingHandler(AtomicU64);

    impl Handler for PanickingHandler {
        fn on_read(&self, _conn: &Connection, _frame: Frame) {
            self.0.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        }
    }

    fn codec() -> FrameCodec {
        let ctx = Arc::new(FrameContext::new(Arc::new(StateCell::new(PeerState::Ok))));
        FrameCodec::new(ctx, MAX_PEER_FRAME_LEN)
    }

    fn transport() -> SocketTransport {
        let ctx = Arc::new(FrameContext::new(Arc::new(StateCell::new(PeerState::Ok))));
        SocketTransport::new(ctx, 16)
    }

    fn ping() -> DataFrame {
        DataFrame::signal(DataKind::Ping, PeerId(2), PeerId(4))
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_udp_link_exchange_and_close() {
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        remote.set_read_timeout(Some(WAIT)).unwrap();
        let (handler, events) = ChannelHandler::new();

        let conn = transport()
            .connect(ConnectOptions::new(remote.local_addr().unwrap()), handler)
            .unwrap();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Active));

        // Outbound
        conn.write(ping()).unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(from, conn.local_addr());
        assert_eq!(codec().decode_datagram(&buf[..n]).unwrap(), Frame::Data(ping()));

        // Inbound
        let reply = codec().encode(&Frame::Data(ping())).unwrap();
        remote.send_to(&reply, from).unwrap();
        match events.recv_timeout(WAIT).unwrap() {
            Event::Read(frame) => assert_eq!(frame, Frame::Data(ping())),
            _ => panic!("expected read"),
        }

        // Garbage is dropped without closing
        remote.send_to(&[0xff, 0xff], from).unwrap();
        remote.send_to(&reply, from).unwrap();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Read(_)));

        conn.close();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Inactive));
        assert!(conn.is_closed());
        assert!(conn.write(ping()).is_err());
    }

    #[test]
    fn test_udp_read_idle_fires() {
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let (handler, events) = ChannelHandler::new();
        let conn = transport()
            .connect(
                ConnectOptions::new(remote.local_addr().unwrap())
                    .read_idle(Duration::from_millis(50)),
                handler,
            )
            .unwrap();

        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Active));
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Idle));
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Idle));
        conn.close();
    }

    #[test]
    fn test_udp_reuse_addr_shares_local_port() {
        let remote_a = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_b = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let t = transport();

        let (h1, _e1) = ChannelHandler::new();
        let first = t
            .connect(
                ConnectOptions::new(remote_a.local_addr().unwrap())
                    .bind("127.0.0.1:0".parse().unwrap())
                    .reuse_addr(),
                h1,
            )
            .unwrap();

        let (h2, _e2) = ChannelHandler::new();
        let second = t
            .connect(
                ConnectOptions::new(remote_b.local_addr().unwrap())
                    .bind(first.local_addr())
                    .reuse_addr(),
                h2,
            )
            .unwrap();

        assert_eq!(first.local_addr(), second.local_addr());
        first.close();
        second.close();
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let remote = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let handler = Arc::new(PanickingHandler(AtomicU64::new(0)));
        let conn = transport()
            .connect(ConnectOptions::new(remote.local_addr().unwrap()), handler.clone())
            .unwrap();

        let bytes = codec().encode(&Frame::Data(ping())).unwrap();
        remote.send_to(&bytes, conn.local_addr()).unwrap();
        remote.send_to(&bytes, conn.local_addr()).unwrap();

        let deadline = Instant::now() + WAIT;
        while handler.0.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
        assert!(!conn.is_closed());
        conn.close();
    }

    #[test]
    fn test_tcp_link_reassembles_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (handler, events) = ChannelHandler::new();
        let conn = transport()
            .connect(
                ConnectOptions::new(listener.local_addr().unwrap()).scheme(Scheme::Tcp),
                handler,
            )
            .unwrap();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Active));

        let (mut server, _) = listener.accept().unwrap();
        let mut wire = codec().encode(&Frame::Data(ping())).unwrap();
        wire.extend(codec().encode(&Frame::Data(ping())).unwrap());
        let (head, tail) = wire.split_at(3);
        server.write_all(head).unwrap();
        server.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        server.write_all(tail).unwrap();

        for _ in 0..2 {
            match events.recv_timeout(WAIT).unwrap() {
                Event::Read(frame) => assert_eq!(frame, Frame::Data(ping())),
                _ => panic!("expected read"),
            }
        }

        conn.write(ping()).unwrap();
        let mut buf = vec![0u8; 64];
        server.set_read_timeout(Some(WAIT)).unwrap();
        let n = server.read(&mut buf).unwrap();
        let mut decoder = codec().stream_decoder();
        assert_eq!(decoder.feed(&buf[..n]), vec![Frame::Data(ping())]);

        conn.close();
        assert!(matches!(events.recv_timeout(WAIT).unwrap(), Event::Inactive));
    }

    #[test]
    fn test_mock_transport_records() {
        let t = mock::MockTransport::new();
        let (handler, _events) = ChannelHandler::new();
        let remote: SocketAddr = "192.0.2.1:3000".parse().unwrap();
        let conn = t.connect(ConnectOptions::new(remote), handler).unwrap();
        conn.write(ping()).unwrap();

        let mc = t.last_to(remote).unwrap();
        assert_eq!(mc.sent(), vec![Frame::Data(ping())]);
        assert!(mc.take_sent().len() == 1 && mc.sent().is_empty());

        t.fail.store(true, Ordering::SeqCst);
        let (handler, _events) = ChannelHandler::new();
        assert!(t.connect(ConnectOptions::new(remote), handler).is_err());
    }
}
