//! Per-link session engine.
//!
//! A [`Connection`] owns the inbound and outbound message queues of one
//! link, its protocol state and its optional attachment. Network tasks hand
//! decoded messages to [`Connection::receive`]; game code queues replies with
//! the `send` family; the [`ConnectionManager`](crate::ConnectionManager)
//! calls [`Connection::pulse`] once per tick to flush the outbound queue and
//! dispatch the inbound one.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, TryLockError};

use bytes::BytesMut;
use tokio::sync::{Notify, mpsc};

use crate::error::{AttachmentError, FrameError, HandlerError, SendError};
use crate::frame::encode_frame;
use crate::message::{Message, MessageRef};
use crate::protocol::Protocol;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Unique identifier for a connection within a manager session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Which end of the link the local process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The local end opened the link.
    Client,
    /// The local end accepted the link.
    Server,
}

/// Protocol phase of a connection.
///
/// Handlers move a connection forward with [`Connection::set_state`]; the
/// engine never advances it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Version negotiation. Every connection starts here.
    #[default]
    ExchangeHandshake,
    /// The peer has to identify itself.
    ExchangeIdentification,
    /// A synchronous reply is pending.
    Waiting,
    /// Regular gameplay traffic.
    Game,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::ExchangeHandshake => "ExchangeHandshake",
            SessionState::ExchangeIdentification => "ExchangeIdentification",
            SessionState::Waiting => "Waiting",
            SessionState::Game => "Game",
        };
        f.write_str(name)
    }
}

/// Value attached to a connection, typically the player it belongs to.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Callback invoked when a handler fails on a connection.
pub type ErrorHook = Arc<dyn Fn(&Connection, &dyn Message, &HandlerError) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Multi-producer queue whose single consumer is the pulse.
///
/// The length is tracked outside the receiver lock, so it can be read while
/// a pulse holds the receiver.
struct Queue {
    sender: mpsc::UnboundedSender<MessageRef>,
    receiver: Mutex<mpsc::UnboundedReceiver<MessageRef>>,
    pending: AtomicUsize,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: AtomicUsize::new(0),
        }
    }

    /// Messages pushed after `release` are dropped.
    fn push(&self, message: MessageRef) {
        // Counted before the send so a concurrent `pop` never underflows.
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn pop(&self, receiver: &mut mpsc::UnboundedReceiver<MessageRef>) -> Option<MessageRef> {
        let message = receiver.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(message)
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Close the queue and drop its contents unless a pulse currently holds
    /// it, in which case the pulse releases it on its next entry.
    fn release(&self) {
        let mut receiver = match self.receiver.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        receiver.close();
        while self.pop(&mut receiver).is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One client link: queues, protocol state, attachment and transport.
///
/// All methods take `&self` and may be called from any thread. Handler
/// invocations for one connection are serialized: queued and asynchronous
/// dispatch share one lock, so two handlers of the same connection never
/// run at the same time.
pub struct Connection {
    id: ConnectionId,
    role: Role,
    protocol: Arc<Protocol>,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    attachment: OnceLock<Attachment>,
    disconnected: AtomicBool,
    disconnect_reason: OnceLock<String>,
    closed: Notify,
    inbound: Queue,
    outbound: Queue,
    dispatch: Mutex<()>,
    pulsing: AtomicBool,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl Connection {
    /// Create a connection in [`SessionState::ExchangeHandshake`].
    pub fn new(
        id: ConnectionId,
        role: Role,
        protocol: Arc<Protocol>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id,
            role,
            protocol,
            transport,
            state: Mutex::new(SessionState::default()),
            attachment: OnceLock::new(),
            disconnected: AtomicBool::new(false),
            disconnect_reason: OnceLock::new(),
            closed: Notify::new(),
            inbound: Queue::new(),
            outbound: Queue::new(),
            dispatch: Mutex::new(()),
            pulsing: AtomicBool::new(false),
            error_hook: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.transport.remote_address()
    }

    /// The protocol this connection speaks.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Whether the connection is live and its transport can carry data.
    pub fn is_active(&self) -> bool {
        !self.is_disconnected() && self.transport.is_active()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Resolves once the connection is disconnected.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_disconnected() {
            return;
        }
        notified.await;
    }

    /// Reason passed to the winning [`disconnect`](Self::disconnect) call.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.get().map(String::as_str)
    }

    // -- state ---------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move the connection to `state`. Ignored once disconnected.
    pub fn set_state(&self, state: SessionState) {
        if self.is_disconnected() {
            return;
        }
        let mut current = lock(&self.state);
        if *current != state {
            tracing::debug!("Connection {} state {} -> {}", self.id, *current, state);
            *current = state;
        }
    }

    // -- attachment ----------------------------------------------------------

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.get()
    }

    /// The attachment, if set and of type `T`.
    pub fn attachment_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        let value: &(dyn Any + Send + Sync) = self.attachment.get()?.as_ref();
        value.downcast_ref::<T>()
    }

    /// Attach a value to the connection. An attachment can only be set once
    /// and never changes afterwards.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) -> Result<(), AttachmentError> {
        self.attachment
            .set(Arc::new(value))
            .map_err(|_| AttachmentError::AlreadySet)
    }

    /// Install the callback run when a handler on this connection fails.
    /// Without one, failures are logged at `error` level.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&Connection, &dyn Message, &HandlerError) + Send + Sync + 'static,
    {
        *self
            .error_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    // -- sending -------------------------------------------------------------

    /// Queue `message` for the next pulse.
    pub fn send<M: Message>(&self, message: M) -> Result<(), SendError> {
        let message: MessageRef = Arc::new(message);
        self.submit(vec![message], false)
    }

    /// Queue an already shared message for the next pulse.
    pub fn send_shared(&self, message: MessageRef) -> Result<(), SendError> {
        self.submit(vec![message], false)
    }

    /// Write `message` to the transport right away, ahead of anything still
    /// queued. Falls back to queueing when the transport is not active.
    pub fn send_urgent<M: Message>(&self, message: M) -> Result<(), SendError> {
        let message: MessageRef = Arc::new(message);
        self.submit(vec![message], true)
    }

    /// Queue several messages, in order.
    ///
    /// Every message type is checked before anything is queued, so an
    /// unknown type leaves the queue untouched.
    pub fn send_all<I>(&self, messages: I) -> Result<(), SendError>
    where
        I: IntoIterator<Item = MessageRef>,
    {
        self.submit(messages.into_iter().collect(), false)
    }

    /// Urgent variant of [`send_all`](Self::send_all).
    pub fn send_all_urgent<I>(&self, messages: I) -> Result<(), SendError>
    where
        I: IntoIterator<Item = MessageRef>,
    {
        self.submit(messages.into_iter().collect(), true)
    }

    fn submit(&self, messages: Vec<MessageRef>, urgent: bool) -> Result<(), SendError> {
        if self.is_disconnected() {
            return Ok(());
        }

        let codecs = self.protocol.codecs();
        if let Some(unknown) = messages
            .iter()
            .map(|message| message.message_type())
            .find(|message_type| !codecs.contains(*message_type))
        {
            return Err(SendError::UnknownMessageType(unknown));
        }

        if urgent && self.transport.is_active() {
            return self.write_now(&messages);
        }
        for message in messages {
            self.outbound.push(message);
        }
        Ok(())
    }

    fn write_now(&self, messages: &[MessageRef]) -> Result<(), SendError> {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_frame(self.protocol.codecs(), self.role, message.as_ref(), &mut buf)?;
        }

        let written = self
            .transport
            .write(buf.freeze())
            .and_then(|()| self.transport.flush());
        if let Err(e) = written {
            self.disconnect(format!("write failed: {e}"));
            return Err(FrameError::Io(e).into());
        }
        Ok(())
    }

    // -- receiving -----------------------------------------------------------

    /// Hand a decoded message to the connection.
    ///
    /// Asynchronous messages are dispatched on the calling thread; others wait
    /// for the next pulse. Messages arriving after disconnect are dropped.
    /// A handler must not pass an asynchronous message to its own
    /// connection.
    pub fn receive(&self, message: MessageRef) {
        if self.is_disconnected() {
            tracing::trace!(
                "Connection {} dropped {} after disconnect",
                self.id,
                message.message_type()
            );
            return;
        }

        if message.is_async() {
            self.dispatch(message.as_ref());
        } else {
            self.inbound.push(message);
        }
    }

    /// Number of messages waiting for the next pulse.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Number of queued outbound messages.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    // -- pulse ---------------------------------------------------------------

    /// Run one tick: flush queued outbound messages, then dispatch the
    /// inbound messages that were queued when the pulse started.
    ///
    /// Must not be called from a handler of this connection.
    pub fn pulse(&self) {
        if self.is_disconnected() {
            self.release_queues();
            return;
        }

        self.flush_outbound();
        if self.is_disconnected() {
            self.release_queues();
            return;
        }
        self.process_inbound();
    }

    fn flush_outbound(&self) {
        let mut receiver = lock(&self.outbound.receiver);
        let mut buf = BytesMut::new();

        while let Some(message) = self.outbound.pop(&mut receiver) {
            if let Err(e) = encode_frame(self.protocol.codecs(), self.role, message.as_ref(), &mut buf)
            {
                tracing::error!("Connection {} dropped outbound message: {e}", self.id);
                continue;
            }
            if let Err(e) = self.transport.write(buf.split().freeze()) {
                drop(receiver);
                self.disconnect(format!("write failed: {e}"));
                return;
            }
        }
        drop(receiver);

        if let Err(e) = self.transport.flush() {
            self.disconnect(format!("flush failed: {e}"));
        }
    }

    fn process_inbound(&self) {
        let mut receiver = lock(&self.inbound.receiver);

        // Messages queued by handlers during this drain wait for the next tick.
        let pending = receiver.len();
        for _ in 0..pending {
            if self.is_disconnected() {
                break;
            }
            let Some(message) = self.inbound.pop(&mut receiver) else {
                break;
            };
            self.dispatch(message.as_ref());
        }
    }

    fn release_queues(&self) {
        self.inbound.release();
        self.outbound.release();
    }

    pub(crate) fn try_begin_pulse(&self) -> bool {
        !self.pulsing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_pulse(&self) {
        self.pulsing.store(false, Ordering::Release);
    }

    // -- dispatch ------------------------------------------------------------

    fn dispatch(&self, message: &dyn Message) {
        let _guard = lock(&self.dispatch);
        if self.is_disconnected() {
            return;
        }

        let message_type = message.message_type();
        if let Some(required) = message.required_state() {
            let current = self.state();
            if current != required {
                tracing::warn!(
                    "Connection {} sent {message_type} in state {current}, expected {required}",
                    self.id
                );
                self.disconnect(format!("unexpected {message_type} in state {current}"));
                return;
            }
        }

        if message.requires_origin() && self.attachment.get().is_none() {
            tracing::warn!(
                "Connection {} sent {message_type} without an attached origin",
                self.id
            );
            self.disconnect(format!("{message_type} requires an attached origin"));
            return;
        }

        let Some(handler) = self.protocol.handlers().lookup(message_type) else {
            tracing::trace!("No handler registered for {message_type}, dropping message");
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(self, message)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload))));

        if let Err(error) = result {
            self.report_failure(message, &error);
            self.disconnect(format!("handler failed: {error}"));
        }
    }

    fn report_failure(&self, message: &dyn Message, error: &HandlerError) {
        let hook = self
            .error_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match hook {
            Some(hook) => {
                if panic::catch_unwind(AssertUnwindSafe(|| hook(self, message, error))).is_err() {
                    tracing::error!("Error hook of connection {} panicked", self.id);
                }
            }
            None => tracing::error!(
                "Connection {} failed to handle {}: {error}",
                self.id,
                message.message_type()
            ),
        }
    }

    // -- teardown ------------------------------------------------------------

    /// Disconnect with `reason`.
    ///
    /// Only the first call has an effect and returns `true`. When the
    /// protocol defines a kick message and the transport is still active,
    /// the peer is sent the reason before the transport closes. Never waits
    /// for a running pulse.
    pub fn disconnect(&self, reason: impl Into<String>) -> bool {
        if self
            .disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let reason = reason.into();
        tracing::info!(
            "Disconnecting {} ({}): {reason}",
            self.id,
            self.transport.remote_address()
        );

        if self.transport.is_active() {
            self.send_kick(&reason);
        }
        let _ = self.disconnect_reason.set(reason);

        self.transport.close();
        self.release_queues();
        self.closed.notify_waiters();
        true
    }

    fn send_kick(&self, reason: &str) {
        let Some(kick) = self.protocol.kick_message(reason) else {
            return;
        };

        let mut buf = BytesMut::new();
        match encode_frame(self.protocol.codecs(), self.role, kick.as_ref(), &mut buf) {
            Ok(()) => {
                let delivered = self
                    .transport
                    .write(buf.freeze())
                    .and_then(|()| self.transport.flush());
                if let Err(e) = delivered {
                    tracing::debug!("Could not deliver kick to {}: {e}", self.id);
                }
            }
            Err(e) => tracing::warn!("Could not encode kick for {}: {e}", self.id),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote", &self.transport.remote_address())
            .field("state", &self.state())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::frame::FrameCodec;
    use crate::transport::MemoryTransport;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use tokio_util::codec::Decoder;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hello {
        version: u32,
    }
    impl Message for Hello {
        fn required_state(&self) -> Option<SessionState> {
            Some(SessionState::ExchangeHandshake)
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ack;
    impl Message for Ack {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Say(String);
    impl Message for Say {
        fn required_state(&self) -> Option<SessionState> {
            Some(SessionState::Game)
        }

        fn requires_origin(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping;
    impl Message for Ping {
        fn is_async(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Again;
    impl Message for Again {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Quit;
    impl Message for Quit {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Fail;
    impl Message for Fail {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Explode;
    impl Message for Explode {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bye {
        reason: String,
    }
    impl Message for Bye {}

    #[derive(Debug)]
    struct Unregistered;
    impl Message for Unregistered {}

    #[derive(Debug)]
    struct Player {
        name: String,
    }

    #[derive(Default)]
    struct Seen {
        said: AtomicUsize,
        pings: AtomicUsize,
        again: AtomicUsize,
    }

    struct Fixture {
        connection: Connection,
        transport: Arc<MemoryTransport>,
        protocol: Arc<Protocol>,
        seen: Arc<Seen>,
    }

    fn fixture() -> Fixture {
        let seen = Arc::new(Seen::default());
        let mut protocol = Protocol::new();
        protocol.register_codec::<Hello, _>(0, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Ack, _>(1, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Say, _>(2, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Ping, _>(3, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Bye, _>(4, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Again, _>(5, PostcardCodec::new()).unwrap();

        protocol
            .register_handler::<Hello, _>(|connection: &Connection, hello: &Hello| {
                if hello.version != 3 {
                    return Err(HandlerError::rejected(format!(
                        "unsupported version {}",
                        hello.version
                    )));
                }
                connection.send(Ack)?;
                connection.set_state(SessionState::Game);
                Ok(())
            })
            .unwrap();

        let counter = Arc::clone(&seen);
        protocol
            .register_handler::<Say, _>(move |_: &Connection, _: &Say| {
                counter.said.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let counter = Arc::clone(&seen);
        protocol
            .register_handler::<Ping, _>(move |_: &Connection, _: &Ping| {
                counter.pings.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let counter = Arc::clone(&seen);
        protocol
            .register_handler::<Again, _>(move |connection: &Connection, _: &Again| {
                counter.again.fetch_add(1, Ordering::SeqCst);
                connection.receive(Arc::new(Again));
                Ok(())
            })
            .unwrap();

        protocol
            .register_handler::<Quit, _>(|connection: &Connection, _: &Quit| {
                connection.disconnect("quit");
                Ok(())
            })
            .unwrap();

        protocol
            .register_handler::<Fail, _>(|_: &Connection, _: &Fail| {
                Err(HandlerError::rejected("nope"))
            })
            .unwrap();

        protocol
            .register_handler::<Explode, _>(|_: &Connection, _: &Explode| -> Result<(), HandlerError> {
                panic!("boom")
            })
            .unwrap();

        let protocol = Arc::new(protocol.with_kick_message(|reason| Bye {
            reason: reason.to_owned(),
        }));
        let transport = Arc::new(MemoryTransport::new("10.0.0.7:5000".parse().unwrap()));
        let connection = Connection::new(
            ConnectionId(7),
            Role::Server,
            Arc::clone(&protocol),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        Fixture {
            connection,
            transport,
            protocol,
            seen,
        }
    }

    /// Decode everything the connection has flushed so far, as the client.
    fn sent(fixture: &Fixture) -> Vec<MessageRef> {
        let mut codec = FrameCodec::new(Arc::clone(&fixture.protocol), Role::Client);
        let mut buf = BytesMut::new();
        for frame in fixture.transport.frames() {
            buf.extend_from_slice(&frame);
        }

        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            messages.push(message);
        }
        messages
    }

    fn kick_reason(fixture: &Fixture) -> Option<String> {
        sent(fixture)
            .last()
            .and_then(|m| m.downcast_ref::<Bye>().map(|bye| bye.reason.clone()))
    }

    #[test]
    fn test_new_connection_defaults() {
        let f = fixture();
        assert_eq!(f.connection.id(), ConnectionId(7));
        assert_eq!(f.connection.role(), Role::Server);
        assert_eq!(f.connection.state(), SessionState::ExchangeHandshake);
        assert_eq!(
            f.connection.remote_address(),
            "10.0.0.7:5000".parse::<SocketAddr>().unwrap()
        );
        assert!(f.connection.attachment().is_none());
        assert!(f.connection.is_active());
        assert!(f.connection.disconnect_reason().is_none());
    }

    #[test]
    fn test_queued_message_waits_for_pulse() {
        let f = fixture();
        f.connection.receive(Arc::new(Hello { version: 3 }));
        assert_eq!(f.connection.state(), SessionState::ExchangeHandshake);
        assert_eq!(f.connection.pending_inbound(), 1);

        f.connection.pulse();
        assert_eq!(f.connection.state(), SessionState::Game);

        // The reply was queued during the inbound drain and goes out next tick.
        assert!(sent(&f).is_empty());
        f.connection.pulse();
        let sent = sent(&f);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is::<Ack>());
    }

    #[test]
    fn test_required_state_mismatch_disconnects() {
        let f = fixture();
        f.connection.set_attachment(Player { name: "ana".into() }).unwrap();
        f.connection.receive(Arc::new(Say("hi".into())));
        f.connection.pulse();

        assert!(f.connection.is_disconnected());
        assert_eq!(f.seen.said.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.connection.disconnect_reason(),
            Some("unexpected Say in state ExchangeHandshake")
        );
        assert_eq!(
            kick_reason(&f).as_deref(),
            Some("unexpected Say in state ExchangeHandshake")
        );
    }

    #[test]
    fn test_missing_origin_disconnects() {
        let f = fixture();
        f.connection.set_state(SessionState::Game);
        f.connection.receive(Arc::new(Say("hi".into())));
        f.connection.pulse();

        assert_eq!(f.seen.said.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.connection.disconnect_reason(),
            Some("Say requires an attached origin")
        );
    }

    #[test]
    fn test_origin_and_state_satisfied() {
        let f = fixture();
        f.connection.set_state(SessionState::Game);
        f.connection.set_attachment(Player { name: "ana".into() }).unwrap();
        f.connection.receive(Arc::new(Say("hi".into())));
        f.connection.pulse();

        assert_eq!(f.seen.said.load(Ordering::SeqCst), 1);
        assert!(!f.connection.is_disconnected());
    }

    #[test]
    fn test_async_message_dispatched_immediately() {
        let f = fixture();
        f.connection.receive(Arc::new(Ping));
        assert_eq!(f.seen.pings.load(Ordering::SeqCst), 1);
        assert_eq!(f.connection.pending_inbound(), 0);
    }

    #[test]
    fn test_message_without_handler_is_dropped() {
        let f = fixture();
        f.connection.receive(Arc::new(Ack));
        f.connection.pulse();
        assert!(!f.connection.is_disconnected());
        assert_eq!(f.connection.pending_inbound(), 0);
    }

    #[test]
    fn test_handler_error_goes_to_hook_and_disconnects() {
        let f = fixture();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        f.connection.set_error_hook(move |connection, message, error| {
            sink.lock()
                .unwrap()
                .push(format!("{} {} {error}", connection.id(), message.message_type()));
        });

        f.connection.receive(Arc::new(Fail));
        f.connection.pulse();

        assert_eq!(*reports.lock().unwrap(), vec!["#7 Fail nope".to_owned()]);
        assert_eq!(f.connection.disconnect_reason(), Some("handler failed: nope"));
    }

    #[test]
    fn test_handler_error_from_version_check() {
        let f = fixture();
        f.connection.receive(Arc::new(Hello { version: 2 }));
        f.connection.pulse();
        assert_eq!(
            f.connection.disconnect_reason(),
            Some("handler failed: unsupported version 2")
        );
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let f = fixture();
        f.connection.receive(Arc::new(Explode));
        f.connection.pulse();

        assert!(f.connection.is_disconnected());
        assert_eq!(
            f.connection.disconnect_reason(),
            Some("handler failed: handler panicked: boom")
        );
        // The dispatch lock is still usable.
        f.connection.pulse();
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = fixture();
        assert!(f.connection.disconnect("first"));
        assert!(!f.connection.disconnect("second"));

        assert_eq!(f.connection.disconnect_reason(), Some("first"));
        assert_eq!(f.transport.frames().len(), 1);
        assert_eq!(kick_reason(&f).as_deref(), Some("first"));
        assert!(!f.transport.is_active());
    }

    #[test]
    fn test_disconnect_without_active_transport_sends_nothing() {
        let f = fixture();
        f.transport.set_active(false);
        assert!(f.connection.disconnect("gone"));
        assert!(f.transport.frames().is_empty());
    }

    #[test]
    fn test_operations_after_disconnect_are_noops() {
        let f = fixture();
        f.connection.disconnect("bye");
        let frames = f.transport.frames().len();

        assert!(f.connection.send(Ack).is_ok());
        assert!(f.connection.send_urgent(Ack).is_ok());
        f.connection.receive(Arc::new(Ping));
        f.connection.set_state(SessionState::Game);
        f.connection.pulse();

        assert_eq!(f.seen.pings.load(Ordering::SeqCst), 0);
        assert_eq!(f.connection.state(), SessionState::ExchangeHandshake);
        assert_eq!(f.transport.frames().len(), frames);
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let f = fixture();
        assert!(matches!(
            f.connection.send(Unregistered),
            Err(SendError::UnknownMessageType(_))
        ));
        assert!(matches!(
            f.connection.send_urgent(Unregistered),
            Err(SendError::UnknownMessageType(_))
        ));
        assert!(!f.connection.is_disconnected());
    }

    #[test]
    fn test_send_all_checks_every_type_first() {
        let f = fixture();
        let batch = vec![Arc::new(Ack) as MessageRef, Arc::new(Unregistered)];
        assert!(f.connection.send_all(batch).is_err());
        assert_eq!(f.connection.pending_outbound(), 0);
    }

    #[test]
    fn test_outbound_fifo_and_urgent_overtakes() {
        let f = fixture();
        f.connection.send(Say("one".into())).unwrap();
        f.connection
            .send_all(vec![
                Arc::new(Say("two".into())) as MessageRef,
                Arc::new(Say("three".into())),
            ])
            .unwrap();
        f.connection.send_urgent(Ack).unwrap();
        f.connection.pulse();

        let sent = sent(&f);
        assert!(sent[0].is::<Ack>());
        let said: Vec<&str> = sent[1..]
            .iter()
            .filter_map(|m| m.downcast_ref::<Say>())
            .map(|say| say.0.as_str())
            .collect();
        assert_eq!(said, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_send_all_urgent_writes_in_order() {
        let f = fixture();
        f.connection
            .send_all_urgent(vec![
                Arc::new(Ack) as MessageRef,
                Arc::new(Say("now".into())),
            ])
            .unwrap();

        let sent = sent(&f);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is::<Ack>());
        assert!(sent[1].is::<Say>());
        assert_eq!(f.transport.flush_count(), 1);
    }

    #[test]
    fn test_urgent_send_queues_when_transport_inactive() {
        let f = fixture();
        f.transport.set_active(false);
        f.connection.send_urgent(Ack).unwrap();
        assert_eq!(f.connection.pending_outbound(), 1);
    }

    #[test]
    fn test_one_flush_per_pulse() {
        let f = fixture();
        for i in 0..5 {
            f.connection.send(Say(i.to_string())).unwrap();
        }
        f.connection.pulse();
        assert_eq!(f.transport.flush_count(), 1);
        assert_eq!(sent(&f).len(), 5);
    }

    #[test]
    fn test_write_failure_disconnects() {
        let f = fixture();
        f.connection.send(Ack).unwrap();
        f.transport.fail_writes();
        f.connection.pulse();

        assert!(f.connection.is_disconnected());
        assert!(
            f.connection
                .disconnect_reason()
                .unwrap()
                .starts_with("write failed")
        );
    }

    #[test]
    fn test_inbound_drain_bounded_to_snapshot() {
        let f = fixture();
        f.connection.receive(Arc::new(Again));

        f.connection.pulse();
        assert_eq!(f.seen.again.load(Ordering::SeqCst), 1);
        f.connection.pulse();
        assert_eq!(f.seen.again.load(Ordering::SeqCst), 2);
        assert_eq!(f.connection.pending_inbound(), 1);
    }

    #[test]
    fn test_disconnect_stops_inbound_drain() {
        let f = fixture();
        f.connection.set_state(SessionState::Game);
        f.connection.set_attachment(Player { name: "ana".into() }).unwrap();
        f.connection.receive(Arc::new(Quit));
        f.connection.receive(Arc::new(Say("late".into())));
        f.connection.pulse();

        assert_eq!(f.connection.disconnect_reason(), Some("quit"));
        assert_eq!(f.seen.said.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attachment_set_once() {
        let f = fixture();
        f.connection.set_attachment(Player { name: "ana".into() }).unwrap();
        assert_eq!(
            f.connection.set_attachment(Player { name: "bo".into() }),
            Err(AttachmentError::AlreadySet)
        );

        let player = f.connection.attachment_as::<Player>().unwrap();
        assert_eq!(player.name, "ana");
        assert!(f.connection.attachment_as::<String>().is_none());
    }

    #[test]
    fn test_pulse_guard() {
        let f = fixture();
        assert!(f.connection.try_begin_pulse());
        assert!(!f.connection.try_begin_pulse());
        f.connection.end_pulse();
        assert!(f.connection.try_begin_pulse());
    }

    // -- cross-thread use -----------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Peek;
    impl Message for Peek {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Work;
    impl Message for Work {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick;
    impl Message for Tick {
        fn is_async(&self) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Step {
        producer: u8,
        seq: u32,
    }
    impl Message for Step {}

    /// Counts handlers running at the same time on one connection.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        max: AtomicUsize,
        handled: AtomicUsize,
    }

    impl Overlap {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_micros(200));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn threaded_connection(
        peeks: Arc<Mutex<Vec<usize>>>,
        overlap: Arc<Overlap>,
    ) -> (Arc<Connection>, Arc<MemoryTransport>, Arc<Protocol>) {
        let mut protocol = Protocol::new();
        protocol.register_codec::<Peek, _>(0, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Work, _>(1, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Tick, _>(2, PostcardCodec::new()).unwrap();
        protocol.register_codec::<Step, _>(3, PostcardCodec::new()).unwrap();

        protocol
            .register_handler::<Peek, _>(move |connection: &Connection, _: &Peek| {
                peeks.lock().unwrap().push(connection.pending_inbound());
                Ok(())
            })
            .unwrap();
        let work = Arc::clone(&overlap);
        protocol
            .register_handler::<Work, _>(move |_: &Connection, _: &Work| {
                work.enter();
                Ok(())
            })
            .unwrap();
        protocol
            .register_handler::<Tick, _>(move |_: &Connection, _: &Tick| {
                overlap.enter();
                Ok(())
            })
            .unwrap();

        let protocol = Arc::new(protocol);
        let transport = Arc::new(MemoryTransport::new("10.0.0.9:5000".parse().unwrap()));
        let connection = Arc::new(Connection::new(
            ConnectionId(9),
            Role::Server,
            Arc::clone(&protocol),
            Arc::clone(&transport) as Arc<dyn Transport>,
        ));
        (connection, transport, protocol)
    }

    #[test]
    fn test_handler_can_read_pending_inbound() {
        let peeks = Arc::new(Mutex::new(Vec::new()));
        let (connection, _, _) = threaded_connection(Arc::clone(&peeks), Arc::default());
        for _ in 0..3 {
            connection.receive(Arc::new(Peek));
        }
        assert_eq!(connection.pending_inbound(), 3);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let pulsing = Arc::clone(&connection);
        std::thread::spawn(move || {
            pulsing.pulse();
            let _ = done_tx.send(());
        });

        assert!(
            done_rx
                .recv_timeout(std::time::Duration::from_secs(2))
                .is_ok(),
            "pulse did not finish"
        );
        assert_eq!(*peeks.lock().unwrap(), vec![2, 1, 0]);
        assert_eq!(connection.pending_inbound(), 0);
    }

    #[test]
    fn test_async_and_queued_handlers_never_overlap() {
        let overlap = Arc::new(Overlap::default());
        let (connection, _, _) = threaded_connection(Arc::default(), Arc::clone(&overlap));

        let pulser = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    connection.receive(Arc::new(Work));
                    connection.pulse();
                }
            })
        };
        let receivers: Vec<_> = (0..2)
            .map(|_| {
                let connection = Arc::clone(&connection);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        connection.receive(Arc::new(Tick));
                    }
                })
            })
            .collect();

        pulser.join().unwrap();
        for receiver in receivers {
            receiver.join().unwrap();
        }
        connection.pulse();

        assert_eq!(overlap.handled.load(Ordering::SeqCst), 150);
        assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
        assert!(!connection.is_disconnected());
    }

    #[test]
    fn test_concurrent_senders_keep_per_producer_order() {
        const PRODUCERS: u8 = 4;
        const PER_PRODUCER: u32 = 100;

        let (connection, transport, protocol) =
            threaded_connection(Arc::default(), Arc::default());

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let connection = Arc::clone(&connection);
                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        connection.send(Step { producer, seq }).unwrap();
                    }
                })
            })
            .collect();

        // Pulse while the producers are still sending.
        while producers.iter().any(|producer| !producer.is_finished()) {
            connection.pulse();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        connection.pulse();
        assert_eq!(connection.pending_outbound(), 0);

        let mut codec = FrameCodec::new(protocol, Role::Client);
        let mut buf = BytesMut::new();
        for frame in transport.frames() {
            buf.extend_from_slice(&frame);
        }

        let mut next = vec![0u32; PRODUCERS as usize];
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            let step = message.downcast_ref::<Step>().unwrap();
            assert_eq!(step.seq, next[step.producer as usize], "producer {}", step.producer);
            next[step.producer as usize] += 1;
        }
        assert_eq!(next, vec![PER_PRODUCER; PRODUCERS as usize]);
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
        assert_eq!(id1.to_string(), "#1");
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::default().to_string(), "ExchangeHandshake");
        assert_eq!(SessionState::Game.to_string(), "Game");
    }
}
