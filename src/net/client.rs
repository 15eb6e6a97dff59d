use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::{self, Logger};
use crate::message::buffer::MessageBuffer;
use crate::message::{command, Message};
use crate::net::connection::{BichannelConnection, ConnectionState};
use crate::net::rtt::RoundTripTime;
use crate::pool::cache::ObjectCache;
use crate::pool::object::Recycle;
use crate::shared::{ClientId, ErrorType, NetworkError, NetworkResult, SendMode};

/// How long `connect` waits for the server's configure command before the
/// attempt is abandoned.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

const RTT_INFLIGHT_CAPACITY: usize = 32;
const RTT_WINDOW: usize = 16;

/// Recycled event record handed to message subscribers. Lives exactly as
/// long as the handler invocations; the message and its buffer are released
/// when the record is dropped.
pub struct MessageReceivedEvent {
    message: Option<Message>,
    send_mode: SendMode,
    inert: bool,
}

impl MessageReceivedEvent {
    fn over(message: Message, send_mode: SendMode) -> MessageReceivedEvent {
        let mut event = ObjectCache::acquire_event();
        event.message = Some(message);
        event.send_mode = send_mode;
        event
    }

    pub fn message(&self) -> &Message {
        self.message.as_ref().expect("Event carries a message")
    }

    #[inline]
    pub fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for MessageReceivedEvent {
    fn default() -> MessageReceivedEvent {
        MessageReceivedEvent {
            message: None,
            send_mode: SendMode::Reliable,
            inert: true,
        }
    }
}

impl Recycle for MessageReceivedEvent {
    fn reset(&mut self) {
        self.message = None;
        self.send_mode = SendMode::Reliable;
    }
}

impl Drop for MessageReceivedEvent {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        // Release the message before the shell goes back to the cache.
        drop(self.message.take());
        self.inert = true;
        ObjectCache::release_event(MessageReceivedEvent::default());
    }
}

/// Payload of the `disconnected` event.
#[derive(Debug, Copy, Clone)]
pub struct DisconnectedEvent {
    pub locally_initiated: bool,
    pub error: ErrorType,
}

/// Recycled record timing a deferred piece of work, used by the
/// background-connect worker.
pub struct DispatchTask {
    label: &'static str,
    started: Option<Instant>,
    inert: bool,
}

impl DispatchTask {
    pub(crate) fn begin(label: &'static str) -> DispatchTask {
        let mut task = ObjectCache::acquire_task();
        task.label = label;
        task.started = Some(Instant::now());
        task
    }

    pub(crate) fn finish(self, log: &Logger) {
        logging::debug!(log, "dispatch task finished";
                        "context" => "dispatch",
                        "task" => self.label,
                        "elapsed" => ?self.started.map(|started| started.elapsed()));
    }

    pub(crate) fn activate(&mut self) {
        self.inert = false;
    }
}

impl Default for DispatchTask {
    fn default() -> DispatchTask {
        DispatchTask {
            label: "",
            started: None,
            inert: true,
        }
    }
}

impl Recycle for DispatchTask {
    fn reset(&mut self) {
        self.label = "";
        self.started = None;
    }
}

impl Drop for DispatchTask {
    fn drop(&mut self) {
        if self.inert {
            return;
        }

        self.inert = true;
        ObjectCache::release_task(DispatchTask::default());
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SetupState {
    Pending,
    Completed,
    Failed(ErrorType),
}

/// One-shot parking signal raised when the handshake completes. The
/// handshake receive thread sets it, the connect caller parks on it; nothing
/// else waits here.
struct SetupSignal {
    state: Mutex<SetupState>,
    signal: Condvar,
}

impl SetupSignal {
    fn new() -> SetupSignal {
        SetupSignal {
            state: Mutex::new(SetupState::Pending),
            signal: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.lock() = SetupState::Pending;
    }

    /// Raises the signal. Only the first raise per session reports true.
    fn complete(&self) -> bool {
        let mut state = self.lock();
        match *state {
            SetupState::Pending => {
                *state = SetupState::Completed;
                self.signal.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Aborts a pending wait with the given cause.
    fn fail(&self, error: ErrorType) {
        let mut state = self.lock();
        if *state == SetupState::Pending {
            *state = SetupState::Failed(error);
            self.signal.notify_all();
        }
    }

    /// Parks until the signal resolves or the timeout passes; a `Pending`
    /// result means the wait timed out.
    fn wait(&self, timeout: Duration) -> SetupState {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            match *state {
                SetupState::Pending => (),
                resolved => return resolved,
            }

            let now = Instant::now();
            if now >= deadline {
                return SetupState::Pending;
            }

            let (guard, _) = self
                .signal
                .wait_timeout(state, deadline - now)
                .expect("Setup signal lock poisoned");
            state = guard;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<SetupState> {
        self.state.lock().expect("Setup signal lock poisoned")
    }
}

type MessageHandler = Arc<dyn Fn(&MessageReceivedEvent) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&DisconnectedEvent) + Send + Sync>;

struct ClientCore {
    connection: Mutex<Option<BichannelConnection>>,
    setup: SetupSignal,
    /// True once the configure command delivered the client id.
    configured: AtomicBool,
    /// True while a fully established session can still be torn down; the
    /// winner of the flip raises the disconnected event.
    armed: AtomicBool,
    id: AtomicU16,
    rtt: RoundTripTime,
    message_handlers: Mutex<Vec<MessageHandler>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    log: Logger,
}

/// The client facade: owns one connection at a time, drives connect and
/// handshake, fans received messages out to subscribers and keeps the ping
/// bookkeeping.
///
/// Cloning is cheap and clones share the same client.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Client {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Client {
            core: Arc::new(ClientCore {
                connection: Mutex::new(None),
                setup: SetupSignal::new(),
                configured: AtomicBool::new(false),
                armed: AtomicBool::new(false),
                id: AtomicU16::new(0),
                rtt: RoundTripTime::new(RTT_INFLIGHT_CAPACITY, RTT_WINDOW),
                message_handlers: Mutex::new(Vec::new()),
                disconnect_handlers: Mutex::new(Vec::new()),
                log,
            }),
        }
    }

    /// Subscribes to received user messages.
    pub fn on_message_received<F>(&self, handler: F)
    where
        F: Fn(&MessageReceivedEvent) + Send + Sync + 'static,
    {
        self.core
            .message_handlers
            .lock()
            .expect("Handler list lock poisoned")
            .push(Arc::new(handler));
    }

    /// Subscribes to disconnection notices.
    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&DisconnectedEvent) + Send + Sync + 'static,
    {
        self.core
            .disconnect_handlers
            .lock()
            .expect("Handler list lock poisoned")
            .push(Arc::new(handler));
    }

    /// Connects and blocks until the server has assigned this client its
    /// id, or up to ten seconds. A connection that is still unconfigured by
    /// then is forcibly torn down and the attempt fails.
    ///
    /// Any previously held connection is disposed first.
    pub fn connect(&self, mut connection: BichannelConnection) -> NetworkResult<()> {
        // Take the old connection out before tearing it down; joining its
        // loops while holding the slot lock would deadlock against a
        // handler calling back into the client.
        let previous = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned")
            .take();
        if let Some(mut previous) = previous {
            self.core.armed.store(false, Ordering::SeqCst);
            previous.disconnect();
        }

        self.core.configured.store(false, Ordering::SeqCst);
        self.core.setup.reset();

        let core = Arc::downgrade(&self.core);
        connection.set_message_callback(Box::new(move |buffer, mode| {
            if let Some(core) = core.upgrade() {
                core.handle_received(buffer, mode);
            }
        }));

        let core = Arc::downgrade(&self.core);
        connection.set_disconnect_callback(Box::new(move |error| {
            if let Some(core) = core.upgrade() {
                core.handle_remote_disconnect(error);
            }
        }));

        connection.connect()?;
        *self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned") = Some(connection);

        match self.core.setup.wait(SETUP_TIMEOUT) {
            SetupState::Completed => {
                logging::info!(self.core.log, "session established";
                               "context" => "connect",
                               "client_id" => self.core.id.load(Ordering::SeqCst));
                Ok(())
            }
            SetupState::Failed(error) => {
                self.abandon_connection();
                Err(NetworkError::Fatal(error))
            }
            SetupState::Pending => {
                logging::warn!(self.core.log, "handshake timed out"; "context" => "connect");
                self.abandon_connection();
                Err(NetworkError::Fatal(ErrorType::HandshakeTimeout))
            }
        }
    }

    /// Runs `connect` on a one-shot worker thread and reports the outcome
    /// through the callback.
    pub fn connect_in_background<F>(&self, connection: BichannelConnection, callback: F)
    where
        F: FnOnce(NetworkResult<()>) + Send + 'static,
    {
        let client = self.clone();

        thread::Builder::new()
            .name("tether-connect".into())
            .spawn(move || {
                let task = DispatchTask::begin("background connect");
                let result = client.connect(connection);
                callback(result);
                task.finish(&client.core.log);
            })
            .expect("Connect worker spawn failed");
    }

    /// Serializes the message and hands it to the connection. Ping messages
    /// record their code with the round-trip helper before transmission.
    pub fn send(&self, message: Message, send_mode: SendMode) -> bool {
        if message.is_ping() {
            if let Some(code) = message.ping_code() {
                self.core.rtt.record_outbound(code, Instant::now());
            }
        }

        let buffer = message.to_buffer();
        let slot = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned");

        match slot.as_ref() {
            Some(connection) => connection.send(buffer, send_mode),
            None => false,
        }
    }

    /// Tears the session down and raises the disconnected event with the
    /// conventional local cause. Only the first call per session reports
    /// true.
    pub fn disconnect(&self) -> bool {
        if self
            .core
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.core.configured.store(false, Ordering::SeqCst);
        let connection = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned")
            .take();
        if let Some(mut connection) = connection {
            connection.disconnect();
        }

        self.core.raise_disconnected(DisconnectedEvent {
            locally_initiated: true,
            error: ErrorType::Disconnecting,
        });

        true
    }

    /// The server-assigned id, valid while the session is configured.
    pub fn client_id(&self) -> Option<ClientId> {
        if self.core.configured.load(Ordering::SeqCst) {
            Some(self.core.id.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        let slot = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned");

        match slot.as_ref() {
            Some(connection) => connection.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Round-trip statistics for this client's pings.
    pub fn rtt(&self) -> &RoundTripTime {
        &self.core.rtt
    }

    /// Remote address of the named channel, `"tcp"` or `"udp"`.
    pub fn remote_endpoint(&self, name: &str) -> Option<SocketAddr> {
        let slot = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned");
        slot.as_ref().and_then(|connection| connection.remote_endpoint(name))
    }

    /// Local address of the named channel, `"tcp"` or `"udp"`.
    pub fn local_endpoint(&self, name: &str) -> Option<SocketAddr> {
        let slot = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned");
        slot.as_ref().and_then(|connection| connection.local_endpoint(name))
    }

    fn abandon_connection(&self) {
        self.core.armed.store(false, Ordering::SeqCst);
        self.core.configured.store(false, Ordering::SeqCst);
        let connection = self
            .core
            .connection
            .lock()
            .expect("Connection slot lock poisoned")
            .take();
        drop(connection);
    }
}

impl ClientCore {
    /// Receive hook installed on the connection; runs on the channel loop
    /// threads. Every exit path releases the message and with it the
    /// buffer.
    fn handle_received(&self, buffer: MessageBuffer, send_mode: SendMode) {
        let message = match Message::from_buffer(buffer) {
            Ok(message) => message,
            Err(error) => {
                logging::warn!(self.log, "malformed message dropped";
                               "context" => "receive",
                               "error" => ?error);
                return;
            }
        };

        if message.is_ping_ack() {
            if let Some(code) = message.ping_code() {
                if !self.rtt.record_inbound(code, Instant::now()) {
                    logging::trace!(self.log, "stale ping acknowledgement";
                                    "context" => "receive",
                                    "code" => code);
                }
            }
        }

        if message.is_command() {
            self.handle_command(message);
        } else if self.configured.load(Ordering::SeqCst) {
            self.raise_message(message, send_mode);
        } else {
            logging::debug!(self.log, "message before configuration dropped";
                            "context" => "receive",
                            "tag" => message.tag());
        }
    }

    fn handle_command(&self, message: Message) {
        match message.tag() {
            command::CONFIGURE => {
                let mut reader = message.reader();
                match reader.read_u16() {
                    Ok(id) => {
                        if self.configured.swap(true, Ordering::SeqCst) {
                            logging::warn!(self.log, "repeated configure command ignored";
                                           "context" => "handshake",
                                           "client_id" => id);
                        } else {
                            self.id.store(id, Ordering::SeqCst);
                            self.armed.store(true, Ordering::SeqCst);
                            self.setup.complete();
                            logging::debug!(self.log, "configured by server";
                                            "context" => "handshake",
                                            "client_id" => id);
                        }
                    }
                    Err(_) => {
                        logging::warn!(self.log, "malformed configure command";
                                       "context" => "handshake");
                    }
                }
            }
            tag => {
                logging::debug!(self.log, "unknown command ignored";
                                "context" => "receive",
                                "tag" => tag);
            }
        }
    }

    /// Disconnect hook installed on the connection; fires when the peer
    /// closes or the reliable channel dies.
    fn handle_remote_disconnect(&self, error: ErrorType) {
        if self
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Still mid-handshake: abort the pending connect instead.
            self.setup.fail(error);
            return;
        }

        self.configured.store(false, Ordering::SeqCst);
        logging::info!(self.log, "disconnected by peer";
                       "context" => "disconnect",
                       "error" => ?error);

        self.raise_disconnected(DisconnectedEvent {
            locally_initiated: false,
            error,
        });

        // Reap the connection if nobody else is holding the slot. It is
        // dropped only after the slot lock is released, since its teardown
        // joins the other channel loop.
        let stale = match self.connection.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        drop(stale);
    }

    fn raise_message(&self, message: Message, send_mode: SendMode) {
        let event = MessageReceivedEvent::over(message, send_mode);
        let handlers: Vec<MessageHandler> = self
            .message_handlers
            .lock()
            .expect("Handler list lock poisoned")
            .iter()
            .cloned()
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                logging::error!(self.log, "message handler panicked";
                                "context" => "receive",
                                "tag" => event.message().tag());
            }
        }
    }

    fn raise_disconnected(&self, event: DisconnectedEvent) {
        let handlers: Vec<DisconnectHandler> = self
            .disconnect_handlers
            .lock()
            .expect("Handler list lock poisoned")
            .iter()
            .cloned()
            .collect();

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                logging::error!(self.log, "disconnect handler panicked"; "context" => "disconnect");
            }
        }
    }
}
