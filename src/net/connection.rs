use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{self, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use crate::logging::{self, Logger};
use crate::message::buffer::{MessageBuffer, RecyclingArray};
use crate::message::{Message, HEADER_SIZE};
use crate::pool::cache::{self, ObjectCache};
use crate::pool::object::Recycle;
use crate::shared::{ErrorType, NetworkError, NetworkResult, SendMode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reliable frames are prefixed with their length as a big-endian `u32`.
pub const FRAME_PREFIX_SIZE: usize = 4;
const MAX_FRAME_SIZE: usize = u16::max_value() as usize;

const SOCKET_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Lifecycle of a connection. Transitions are monotone within a session;
/// once `Disconnected` is reached no further events fire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// A momentary reliable-channel error is being retried. Transparent to
    /// the facade except through the interruption counter.
    Interrupted,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> StateCell {
        StateCell(AtomicU8::new(state as u8))
    }

    #[inline]
    fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Interrupted,
            raw => panic!("Invalid connection state {}", raw),
        }
    }

    #[inline]
    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    #[inline]
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Remote endpoint description for both channels. A single port serves both
/// by default; stream and datagram ports can also differ.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionConfig {
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
    no_delay: bool,
}

impl ConnectionConfig {
    pub fn new(ip: IpAddr, port: u16) -> ConnectionConfig {
        ConnectionConfig::with_ports(ip, port, port)
    }

    pub fn with_ports(ip: IpAddr, tcp_port: u16, udp_port: u16) -> ConnectionConfig {
        ConnectionConfig {
            ip,
            tcp_port,
            udp_port,
            no_delay: false,
        }
    }

    /// Disables write coalescing on the reliable channel.
    pub fn no_delay(mut self, no_delay: bool) -> ConnectionConfig {
        self.no_delay = no_delay;
        self
    }

    #[inline]
    fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    #[inline]
    fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    fn local_bind(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

pub type MessageCallback = Box<dyn Fn(MessageBuffer, SendMode) + Send + Sync>;
pub type DisconnectCallback = Box<dyn Fn(ErrorType) + Send + Sync>;
/// Produces the first message sent on the reliable channel after it
/// connects.
pub type HelloProducer = Box<dyn Fn() -> Message + Send + Sync>;

struct Shared {
    state: Arc<StateCell>,
    shutdown: AtomicBool,
    interruptions: AtomicUsize,
    unreliable_errors: AtomicUsize,
    on_message: MessageCallback,
    on_disconnect: DisconnectCallback,
}

impl Shared {
    #[inline]
    fn delivering(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        match self.state.get() {
            ConnectionState::Connected | ConnectionState::Interrupted => true,
            _ => false,
        }
    }

    /// Hands a framed message to the receive callback. The loop's own
    /// reference is released once the callback returns.
    fn deliver(&self, buffer: MessageBuffer, mode: SendMode) {
        if !self.delivering() {
            return;
        }

        let handoff = buffer.clone();
        (self.on_message)(handoff, mode);
        drop(buffer);
    }

    /// Marks the session dead with the given cause. Only the first failure
    /// reports; a locally initiated teardown suppresses the callback
    /// entirely.
    fn fail(&self, error: ErrorType) -> bool {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.state.set(ConnectionState::Disconnecting);
        self.state.set(ConnectionState::Disconnected);
        (self.on_disconnect)(error);

        true
    }
}

struct ChannelHandle {
    queue: Arc<Mutex<VecDeque<MessageBuffer>>>,
    waker: SetReadiness,
    thread: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    fn enqueue(&self, buffer: MessageBuffer) {
        self.queue
            .lock()
            .expect("Send queue lock poisoned")
            .push_back(buffer);
        self.wake();
    }

    fn wake(&self) {
        drop(self.waker.set_readiness(Ready::readable()));
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                drop(handle.join());
            }
        }
    }
}

/// Recycled per-read operation record: the framing state machine of the
/// reliable channel. Carries partial header and body progress across reads.
pub struct ReceiveOp {
    header: [u8; FRAME_PREFIX_SIZE],
    header_filled: usize,
    body: Option<MessageBuffer>,
    body_filled: usize,
    inert: bool,
}

impl ReceiveOp {
    pub(crate) fn acquire() -> ReceiveOp {
        ObjectCache::acquire_receive_op()
    }

    /// Advances the state machine against the stream. Returns one complete
    /// frame body per call; `Wait` means the stream has no more data for
    /// now and progress is kept for the next call.
    fn advance<R: Read>(&mut self, stream: &mut R) -> NetworkResult<MessageBuffer> {
        loop {
            if self.header_filled < FRAME_PREFIX_SIZE {
                let count = stream.read(&mut self.header[self.header_filled..])?;
                if count == 0 {
                    return Err(NetworkError::Fatal(ErrorType::Io(
                        io::ErrorKind::UnexpectedEof,
                    )));
                }
                self.header_filled += count;
                continue;
            }

            let length = BigEndian::read_u32(&self.header) as usize;
            if length < HEADER_SIZE {
                return Err(NetworkError::Fatal(ErrorType::MalformedMessage));
            }
            if length > MAX_FRAME_SIZE {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            if self.body.is_none() {
                let mut buffer = MessageBuffer::with_capacity(length);
                buffer.set_count(length);
                self.body = Some(buffer);
                self.body_filled = 0;
            }

            {
                let buffer = self.body.as_mut().expect("Read operation holds a body");
                let target = buffer
                    .write_slice()
                    .expect("Body buffer is exclusive to the read loop");

                let count = stream.read(&mut target[self.body_filled..length])?;
                if count == 0 {
                    return Err(NetworkError::Fatal(ErrorType::Io(
                        io::ErrorKind::UnexpectedEof,
                    )));
                }
                self.body_filled += count;
                if self.body_filled < length {
                    continue;
                }
            }

            self.header_filled = 0;
            return Ok(self.body.take().expect("Completed frame has a body"));
        }
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for ReceiveOp {
    fn default() -> ReceiveOp {
        ReceiveOp {
            header: [0; FRAME_PREFIX_SIZE],
            header_filled: 0,
            body: None,
            body_filled: 0,
            inert: true,
        }
    }
}

impl Recycle for ReceiveOp {
    fn reset(&mut self) {
        self.header = [0; FRAME_PREFIX_SIZE];
        self.header_filled = 0;
        self.body = None;
        self.body_filled = 0;
    }
}

impl Drop for ReceiveOp {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        drop(self.body.take());
        self.inert = true;
        ObjectCache::release_receive_op(ReceiveOp::default());
    }
}

/// An in-flight reliable write: length prefix plus body, with partial
/// progress carried across `WouldBlock`.
struct WriteOp {
    prefix: [u8; FRAME_PREFIX_SIZE],
    prefix_written: usize,
    buffer: MessageBuffer,
    body_written: usize,
}

impl WriteOp {
    fn new(buffer: MessageBuffer) -> WriteOp {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        BigEndian::write_u32(&mut prefix, buffer.len() as u32);

        WriteOp {
            prefix,
            prefix_written: 0,
            buffer,
            body_written: 0,
        }
    }

    fn flush<W: Write>(&mut self, stream: &mut W) -> NetworkResult<()> {
        while self.prefix_written < FRAME_PREFIX_SIZE {
            let count = stream.write(&self.prefix[self.prefix_written..])?;
            if count == 0 {
                return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero)));
            }
            self.prefix_written += count;
        }

        while self.body_written < self.buffer.len() {
            let count = stream.write(&self.buffer.as_slice()[self.body_written..])?;
            if count == 0 {
                return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero)));
            }
            self.body_written += count;
        }

        Ok(())
    }
}

struct ReliableLoop {
    stream: TcpStream,
    shared: Arc<Shared>,
    queue: Arc<Mutex<VecDeque<MessageBuffer>>>,
    wake: Registration,
    wake_flag: SetReadiness,
    peer: SetReadiness,
    op: ReceiveOp,
    pending: Option<WriteOp>,
    log: Logger,
}

impl ReliableLoop {
    fn run(mut self) {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                self.close(ErrorType::Io(err.kind()));
                return;
            }
        };

        let registered = poll
            .register(
                &self.stream,
                SOCKET_TOKEN,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .and_then(|()| poll.register(&self.wake, WAKE_TOKEN, Ready::readable(), PollOpt::edge()));

        if let Err(err) = registered {
            self.close(ErrorType::Io(err.kind()));
            return;
        }

        let mut events = Events::with_capacity(64);

        loop {
            if let Err(err) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.close(ErrorType::Io(err.kind()));
                return;
            }

            if self.shared.shutdown.load(Ordering::SeqCst) {
                logging::trace!(self.log, "reliable loop stopping"; "context" => "run");
                return;
            }

            drop(self.wake_flag.set_readiness(Ready::empty()));

            if let Err(error) = self.flush_sends() {
                self.close(error);
                return;
            }

            if let Err(error) = self.drain_reads() {
                self.close(error);
                return;
            }
        }
    }

    fn flush_sends(&mut self) -> Result<(), ErrorType> {
        loop {
            if self.pending.is_none() {
                self.pending = self
                    .queue
                    .lock()
                    .expect("Send queue lock poisoned")
                    .pop_front()
                    .map(WriteOp::new);
            }

            let op = match self.pending.as_mut() {
                Some(op) => op,
                None => return Ok(()),
            };

            match op.flush(&mut self.stream) {
                Ok(()) => self.pending = None,
                Err(NetworkError::Wait) => return Ok(()),
                Err(NetworkError::Fatal(error)) => return Err(error),
            }
        }
    }

    fn drain_reads(&mut self) -> Result<(), ErrorType> {
        let mut retried = false;

        loop {
            match self.op.advance(&mut self.stream) {
                Ok(buffer) => {
                    retried = false;
                    self.restore_connected();
                    self.shared.deliver(buffer, SendMode::Reliable);
                }
                Err(NetworkError::Wait) => {
                    self.restore_connected();
                    return Ok(());
                }
                Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::Interrupted))) => {
                    self.shared.interruptions.fetch_add(1, Ordering::SeqCst);
                    self.shared
                        .state
                        .transition(ConnectionState::Connected, ConnectionState::Interrupted);

                    if retried {
                        return Err(ErrorType::Io(io::ErrorKind::Interrupted));
                    }
                    retried = true;

                    logging::debug!(self.log, "reliable read interrupted, retrying";
                                    "context" => "receive",
                                    "interruptions" => self.shared.interruptions.load(Ordering::SeqCst));
                }
                Err(NetworkError::Fatal(error)) => return Err(error),
            }
        }
    }

    fn restore_connected(&self) {
        self.shared
            .state
            .transition(ConnectionState::Interrupted, ConnectionState::Connected);
    }

    fn close(&mut self, error: ErrorType) {
        logging::debug!(self.log, "reliable channel closing";
                        "context" => "close",
                        "error" => ?error);

        self.shared.fail(error);
        drop(self.peer.set_readiness(Ready::readable()));
    }
}

struct UnreliableLoop {
    socket: UdpSocket,
    remote: SocketAddr,
    shared: Arc<Shared>,
    queue: Arc<Mutex<VecDeque<MessageBuffer>>>,
    wake: Registration,
    wake_flag: SetReadiness,
    log: Logger,
}

impl UnreliableLoop {
    fn run(mut self) {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                self.record_error(&err, "setup");
                return;
            }
        };

        let registered = poll
            .register(
                &self.socket,
                SOCKET_TOKEN,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .and_then(|()| poll.register(&self.wake, WAKE_TOKEN, Ready::readable(), PollOpt::edge()));

        if let Err(err) = registered {
            self.record_error(&err, "setup");
            return;
        }

        let mut events = Events::with_capacity(64);
        let mut scratch = RecyclingArray::acquire(cache::settings().extra_large_block_size);

        loop {
            if let Err(err) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // Losing the datagram channel alone never tears the session
                // down; the loop just ends.
                self.record_error(&err, "poll");
                return;
            }

            if self.shared.shutdown.load(Ordering::SeqCst) {
                logging::trace!(self.log, "unreliable loop stopping"; "context" => "run");
                return;
            }

            drop(self.wake_flag.set_readiness(Ready::empty()));

            self.flush_sends();
            self.drain_reads(&mut scratch);
        }
    }

    fn flush_sends(&mut self) {
        loop {
            let buffer = match self
                .queue
                .lock()
                .expect("Send queue lock poisoned")
                .pop_front()
            {
                Some(buffer) => buffer,
                None => return,
            };

            match self.socket.send_to(buffer.as_slice(), &self.remote) {
                Ok(_) => (),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.queue
                        .lock()
                        .expect("Send queue lock poisoned")
                        .push_front(buffer);
                    return;
                }
                Err(err) => {
                    // The datagram is lost, which the channel permits.
                    self.record_error(&err, "send");
                }
            }
        }
    }

    fn drain_reads(&mut self, scratch: &mut RecyclingArray) {
        loop {
            match self.socket.recv_from(scratch.as_mut_slice()) {
                Ok((count, from)) => {
                    if from != self.remote {
                        logging::trace!(self.log, "foreign datagram dropped";
                                        "context" => "receive",
                                        "from" => %from);
                        continue;
                    }
                    if count < HEADER_SIZE {
                        logging::debug!(self.log, "malformed datagram dropped";
                                        "context" => "receive",
                                        "size" => count);
                        continue;
                    }

                    let buffer = MessageBuffer::from_slice(&scratch.as_slice()[..count]);
                    self.shared.deliver(buffer, SendMode::Unreliable);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.record_error(&err, "receive");
                    return;
                }
            }
        }
    }

    fn record_error(&self, err: &io::Error, context: &'static str) {
        self.shared.unreliable_errors.fetch_add(1, Ordering::SeqCst);
        logging::warn!(self.log, "unreliable channel error";
                       "context" => context,
                       "error" => %err);
    }
}

/// A two-socket transport to a single peer: one reliable stream and one
/// best-effort datagram channel, each driven by its own receive loop thread.
///
/// Connecting blocks the caller: the stream socket is connected, the
/// caller-supplied hello goes out as the first frame, the datagram socket is
/// bound, and only then do the loop threads start. Received frames are
/// handed to the message callback together with the channel they arrived
/// on; reliable-channel loss ends the session while datagram errors are
/// only counted.
pub struct BichannelConnection {
    config: ConnectionConfig,
    hello: HelloProducer,
    on_message: Option<MessageCallback>,
    on_disconnect: Option<DisconnectCallback>,
    state: Arc<StateCell>,
    shared: Option<Arc<Shared>>,
    reliable: Option<ChannelHandle>,
    unreliable: Option<ChannelHandle>,
    tcp_remote: Option<SocketAddr>,
    udp_remote: Option<SocketAddr>,
    tcp_local: Option<SocketAddr>,
    udp_local: Option<SocketAddr>,
    log: Logger,
}

impl BichannelConnection {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ConnectionConfig,
        hello: HelloProducer,
        log: L,
    ) -> BichannelConnection {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        BichannelConnection {
            config,
            hello,
            on_message: None,
            on_disconnect: None,
            state: Arc::new(StateCell::new(ConnectionState::Disconnected)),
            shared: None,
            reliable: None,
            unreliable: None,
            tcp_remote: None,
            udp_remote: None,
            tcp_local: None,
            udp_local: None,
            log,
        }
    }

    /// Installs the receive callback. Must happen before `connect`.
    pub fn set_message_callback(&mut self, callback: MessageCallback) {
        self.on_message = Some(callback);
    }

    /// Installs the peer-disconnect callback. Must happen before `connect`.
    pub fn set_disconnect_callback(&mut self, callback: DisconnectCallback) {
        self.on_disconnect = Some(callback);
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Number of momentary reliable-channel errors retried this session.
    pub fn interruptions(&self) -> usize {
        match self.shared {
            Some(ref shared) => shared.interruptions.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Number of datagram-channel errors recorded this session.
    pub fn unreliable_errors(&self) -> usize {
        match self.shared {
            Some(ref shared) => shared.unreliable_errors.load(Ordering::SeqCst),
            None => 0,
        }
    }

    /// Remote address of the named channel, `"tcp"` or `"udp"`.
    pub fn remote_endpoint(&self, name: &str) -> Option<SocketAddr> {
        match name {
            "tcp" => self.tcp_remote,
            "udp" => self.udp_remote,
            _ => None,
        }
    }

    /// Local address of the named channel, `"tcp"` or `"udp"`.
    pub fn local_endpoint(&self, name: &str) -> Option<SocketAddr> {
        match name {
            "tcp" => self.tcp_local,
            "udp" => self.udp_local,
            _ => None,
        }
    }

    /// Connects both channels and sends the hello. Blocks until the sockets
    /// are up or the attempt fails.
    pub fn connect(&mut self) -> NetworkResult<()> {
        if !self
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(NetworkError::Fatal(ErrorType::AlreadyConnected));
        }

        match self.establish() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.state.set(ConnectionState::Disconnected);
                Err(error)
            }
        }
    }

    fn establish(&mut self) -> NetworkResult<()> {
        let tcp_addr = self.config.tcp_addr();
        logging::debug!(self.log, "connecting reliable channel";
                        "context" => "connect",
                        "remote" => %tcp_addr);

        let stream = net::TcpStream::connect_timeout(&tcp_addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(self.config.no_delay)?;
        let tcp_local = stream.local_addr()?;
        let tcp_remote = stream.peer_addr()?;

        // The hello is the first frame on the wire, written while the
        // stream is still blocking.
        let hello = (self.hello)();
        let hello_buffer = hello.to_buffer();
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        BigEndian::write_u32(&mut prefix, hello_buffer.len() as u32);
        (&stream).write_all(&prefix)?;
        (&stream).write_all(hello_buffer.as_slice())?;
        drop(hello_buffer);
        drop(hello);

        let udp = net::UdpSocket::bind(self.config.local_bind())?;
        let udp_local = udp.local_addr()?;
        let udp_remote = self.config.udp_addr();

        stream.set_nonblocking(true)?;
        udp.set_nonblocking(true)?;
        let stream = TcpStream::from_stream(stream)?;
        let socket = UdpSocket::from_socket(udp)?;

        let on_message = self
            .on_message
            .take()
            .expect("Message callback must be installed before connect");
        let on_disconnect = self
            .on_disconnect
            .take()
            .expect("Disconnect callback must be installed before connect");

        let shared = Arc::new(Shared {
            state: self.state.clone(),
            shutdown: AtomicBool::new(false),
            interruptions: AtomicUsize::new(0),
            unreliable_errors: AtomicUsize::new(0),
            on_message,
            on_disconnect,
        });

        let (reliable_reg, reliable_wake) = Registration::new2();
        let (unreliable_reg, unreliable_wake) = Registration::new2();
        let reliable_queue = Arc::new(Mutex::new(VecDeque::new()));
        let unreliable_queue = Arc::new(Mutex::new(VecDeque::new()));

        // The loops check the state before delivering, so it flips to
        // connected before they start.
        self.state.set(ConnectionState::Connected);

        let reliable_loop = ReliableLoop {
            stream,
            shared: shared.clone(),
            queue: reliable_queue.clone(),
            wake: reliable_reg,
            wake_flag: reliable_wake.clone(),
            peer: unreliable_wake.clone(),
            op: ReceiveOp::acquire(),
            pending: None,
            log: self.log.new(logging::o!("channel" => "reliable")),
        };
        let reliable_thread = match thread::Builder::new()
            .name("tether-reliable".into())
            .spawn(move || reliable_loop.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                shared.shutdown.store(true, Ordering::SeqCst);
                self.state.set(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };

        let unreliable_loop = UnreliableLoop {
            socket,
            remote: udp_remote,
            shared: shared.clone(),
            queue: unreliable_queue.clone(),
            wake: unreliable_reg,
            wake_flag: unreliable_wake.clone(),
            log: self.log.new(logging::o!("channel" => "unreliable")),
        };
        let unreliable_thread = match thread::Builder::new()
            .name("tether-unreliable".into())
            .spawn(move || unreliable_loop.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                shared.shutdown.store(true, Ordering::SeqCst);
                drop(reliable_wake.set_readiness(Ready::readable()));
                drop(reliable_thread.join());
                self.state.set(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };

        self.reliable = Some(ChannelHandle {
            queue: reliable_queue,
            waker: reliable_wake,
            thread: Some(reliable_thread),
        });
        self.unreliable = Some(ChannelHandle {
            queue: unreliable_queue,
            waker: unreliable_wake,
            thread: Some(unreliable_thread),
        });
        self.shared = Some(shared);
        self.tcp_remote = Some(tcp_remote);
        self.udp_remote = Some(udp_remote);
        self.tcp_local = Some(tcp_local);
        self.udp_local = Some(udp_local);

        logging::debug!(self.log, "connection established";
                        "context" => "connect",
                        "tcp_remote" => %tcp_remote,
                        "udp_remote" => %udp_remote,
                        "udp_local" => %udp_local);

        Ok(())
    }

    /// Enqueues a serialized message on the chosen channel. Returns false
    /// when the connection is not up. The connection keeps no reference to
    /// the buffer once the write has been handed to the socket.
    pub fn send(&self, buffer: MessageBuffer, mode: SendMode) -> bool {
        match self.state.get() {
            ConnectionState::Connected | ConnectionState::Interrupted => (),
            _ => return false,
        }

        let handle = match mode {
            SendMode::Reliable => self.reliable.as_ref(),
            SendMode::Unreliable => self.unreliable.as_ref(),
        };

        match handle {
            Some(handle) => {
                handle.enqueue(buffer);
                true
            }
            None => false,
        }
    }

    /// Tears both channels down and waits for the loops to stop. Idempotent
    /// after the first successful call.
    pub fn disconnect(&mut self) -> bool {
        let armed = self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnecting)
            || self
                .state
                .transition(ConnectionState::Interrupted, ConnectionState::Disconnecting);

        if !armed {
            // Reap loop threads left over from a peer-initiated close.
            self.teardown();
            return false;
        }

        logging::debug!(self.log, "disconnecting"; "context" => "disconnect");
        self.teardown();
        self.state.set(ConnectionState::Disconnected);

        true
    }

    fn teardown(&mut self) {
        if let Some(ref shared) = self.shared {
            shared.shutdown.store(true, Ordering::SeqCst);
        }
        if let Some(ref handle) = self.reliable {
            handle.wake();
        }
        if let Some(ref handle) = self.unreliable {
            handle.wake();
        }
        if let Some(mut handle) = self.reliable.take() {
            handle.join();
        }
        if let Some(mut handle) = self.unreliable.take() {
            handle.join();
        }
        self.shared = None;
    }
}

impl Drop for BichannelConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ErrorUtils;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        eof: bool,
        interrupts: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                eof: false,
                interrupts: 0,
            }
        }

        fn eof(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                eof: true,
                interrupts: 0,
            }
        }

        fn feed(&mut self, more: &[u8]) {
            self.data.extend_from_slice(more);
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(io::ErrorKind::Interrupted.into());
            }

            if self.cursor == self.data.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    struct MockSink {
        data: Vec<u8>,
        chunk: usize,
        capacity: usize,
    }

    impl Write for MockSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.capacity {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.capacity - self.data.len());
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(message: &[u8]) -> Vec<u8> {
        let mut framed = vec![0u8; FRAME_PREFIX_SIZE];
        BigEndian::write_u32(&mut framed, message.len() as u32);
        framed.extend_from_slice(message);
        framed
    }

    #[test]
    fn test_receive_op_frames_coalesced_messages() {
        let first = [0x00, 0x05, b'a'];
        let second = [0x00, 0x06, b'b', b'c'];

        let mut data = frame(&first);
        data.extend(frame(&second));
        let mut channel = MockChannel::new(data, 3);
        let mut op = ReceiveOp::acquire();

        let buffer = op.advance(&mut channel).unwrap();
        assert_eq!(buffer.as_slice(), &first);

        let buffer = op.advance(&mut channel).unwrap();
        assert_eq!(buffer.as_slice(), &second);

        assert_eq!(op.advance(&mut channel).unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_receive_op_keeps_progress_across_reads() {
        let message = [0x00, 0x09, 1, 2, 3, 4];
        let framed = frame(&message);

        let mut channel = MockChannel::new(framed[..5].to_vec(), 64);
        let mut op = ReceiveOp::acquire();

        assert_eq!(op.advance(&mut channel).unwrap_err(), NetworkError::Wait);

        channel.feed(&framed[5..]);
        let buffer = op.advance(&mut channel).unwrap();
        assert_eq!(buffer.as_slice(), &message);
    }

    #[test]
    fn test_receive_op_rejects_undersized_frame() {
        let mut channel = MockChannel::new(frame(&[0x00]), 64);
        let mut op = ReceiveOp::acquire();

        assert_eq!(
            op.advance(&mut channel).unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedMessage)
        );
    }

    #[test]
    fn test_receive_op_rejects_oversized_frame() {
        let mut framed = vec![0u8; FRAME_PREFIX_SIZE];
        BigEndian::write_u32(&mut framed, (MAX_FRAME_SIZE + 1) as u32);
        let mut channel = MockChannel::new(framed, 64);
        let mut op = ReceiveOp::acquire();

        assert_eq!(
            op.advance(&mut channel).unwrap_err(),
            NetworkError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_receive_op_survives_an_interrupted_read() {
        let message = [0x00, 0x0b, 7, 7];
        let mut channel = MockChannel::new(frame(&message), 3);
        channel.interrupts = 1;
        let mut op = ReceiveOp::acquire();

        // The interruption surfaces distinctly so the loop can retry it.
        assert_eq!(
            op.advance(&mut channel).unwrap_err(),
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::Interrupted))
        );

        // The retry picks up where the read left off.
        let buffer = op.advance(&mut channel).unwrap();
        assert_eq!(buffer.as_slice(), &message);
    }

    #[test]
    fn test_receive_op_surfaces_eof() {
        let mut channel = MockChannel::eof(Vec::new(), 64);
        let mut op = ReceiveOp::acquire();

        assert_eq!(
            op.advance(&mut channel).unwrap_err(),
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::UnexpectedEof))
        );
    }

    #[test]
    fn test_write_op_carries_partial_progress() {
        let message = [0x00, 0x07, 9, 9, 9, 9];
        let mut op = WriteOp::new(MessageBuffer::from_slice(&message));

        let mut sink = MockSink {
            data: Vec::new(),
            chunk: 3,
            capacity: 5,
        };

        assert_eq!(op.flush(&mut sink).unwrap_err(), NetworkError::Wait);
        assert_eq!(sink.data.len(), 5);

        sink.capacity = 64;
        op.flush(&mut sink).unwrap();
        assert_eq!(sink.data, frame(&message));
    }

    #[test]
    fn test_state_cell_transitions() {
        let state = StateCell::new(ConnectionState::Disconnected);

        assert!(state.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!state.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(state.get(), ConnectionState::Connecting);

        state.set(ConnectionState::Connected);
        assert_eq!(state.get(), ConnectionState::Connected);
    }

    #[test]
    fn test_config_addresses() {
        let config = ConnectionConfig::with_ports("10.0.0.1".parse().unwrap(), 4296, 4297);

        assert_eq!(config.tcp_addr(), "10.0.0.1:4296".parse().unwrap());
        assert_eq!(config.udp_addr(), "10.0.0.1:4297".parse().unwrap());
        assert_eq!(config.local_bind(), "0.0.0.0:0".parse().unwrap());
        assert!(!config.no_delay);

        let config = ConnectionConfig::new("::1".parse().unwrap(), 4296).no_delay(true);
        assert_eq!(config.udp_addr(), "[::1]:4296".parse().unwrap());
        assert_eq!(config.local_bind(), "[::]:0".parse().unwrap());
        assert!(config.no_delay);
    }

    #[test]
    fn test_connect_refused() {
        // Grab a port that nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ConnectionConfig::new(addr.ip(), addr.port());
        let mut connection =
            BichannelConnection::new(config, Box::new(|| Message::create(0)), None);
        connection.set_message_callback(Box::new(|_, _| ()));
        connection.set_disconnect_callback(Box::new(|_| ()));

        let result = connection.connect();
        assert!(result.has_failed());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.send(MessageBuffer::from_slice(&[0, 0]), SendMode::Reliable));
        assert!(!connection.disconnect());
    }
}
