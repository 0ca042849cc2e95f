//! The live-connection set and the tick that drives it.
//!
//! [`ConnectionManager`] accepts TCP links, owns every live [`Connection`],
//! pulses all of them once per tick and removes the ones that disconnected.
//! Membership only changes through [`add`](ConnectionManager::add) and
//! [`remove`](ConnectionManager::remove).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;

use crate::connection::{Connection, ConnectionId, IdGenerator, Role};
use crate::error::{ManagerError, SendError};
use crate::frame::FrameCodec;
use crate::message::{Message, MessageRef};
use crate::protocol::Protocol;
use crate::socket::{self, SocketConfig};
use crate::transport::TcpTransport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// How long a tick waits for connection pulses before moving on.
    /// Default: 50ms.
    pub pulse_budget: Duration,
    /// How long `stop` waits for network tasks to wind down. Default: 5s.
    pub shutdown_timeout: Duration,
    /// Options for listeners and streams.
    pub socket: SocketConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            pulse_budget: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
            socket: SocketConfig::default(),
        }
    }
}

/// Clears the pulse flag even if the pulse unwinds.
struct PulseGuard(Arc<Connection>);

impl Drop for PulseGuard {
    fn drop(&mut self) {
        self.0.end_pulse();
    }
}

/// Owns the live connections and the network tasks feeding them.
pub struct ConnectionManager {
    protocol: Arc<Protocol>,
    config: ManagerConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    id_gen: IdGenerator,
    local_addrs: Mutex<Vec<SocketAddr>>,
    tasks: Mutex<JoinSet<()>>,
    overrun: Mutex<Vec<JoinSet<()>>>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create a manager for `protocol`.
    pub fn new(protocol: Arc<Protocol>, config: ManagerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            protocol,
            config,
            connections: RwLock::new(HashMap::new()),
            id_gen: IdGenerator::new(),
            local_addrs: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            overrun: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // -- membership ----------------------------------------------------------

    /// Register a connection. Fails on a duplicate id, when the manager is
    /// full, or after `stop`.
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), ManagerError> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped);
        }

        let mut map = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = connection.id();
        if map.contains_key(&id) {
            return Err(ManagerError::DuplicateConnection(id));
        }
        if map.len() >= self.config.max_connections {
            return Err(ManagerError::ConnectionLimitReached(self.config.max_connections));
        }
        map.insert(id, connection);
        Ok(())
    }

    /// Deregister a connection.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Return the number of live connections.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Return whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Queue `message` on every live connection. Returns how many
    /// connections it was queued on.
    pub fn broadcast<M: Message>(&self, message: M) -> Result<usize, SendError> {
        let message_type = message.message_type();
        if !self.protocol.codecs().contains(message_type) {
            return Err(SendError::UnknownMessageType(message_type));
        }

        let message: MessageRef = Arc::new(message);
        let mut queued = 0;
        for connection in self.connections() {
            if connection.is_disconnected() {
                continue;
            }
            connection.send_shared(Arc::clone(&message))?;
            queued += 1;
        }
        Ok(queued)
    }

    // -- tick ----------------------------------------------------------------

    /// Pulse every live connection once, then drop the disconnected ones.
    ///
    /// Each pulse runs on the blocking pool, so a slow handler only holds up
    /// its own connection. Pulses still running after the pulse budget are
    /// left to finish in the background, and their connections are skipped
    /// until they do. [`stop`](Self::stop) waits for them.
    pub async fn pulse(&self) {
        let mut pulses = JoinSet::new();
        for connection in self.connections() {
            if !connection.try_begin_pulse() {
                tracing::warn!(
                    "Connection {} is still pulsing, skipping this tick",
                    connection.id()
                );
                continue;
            }
            let guard = PulseGuard(connection);
            pulses.spawn_blocking(move || {
                let PulseGuard(connection) = &guard;
                connection.pulse();
            });
        }

        let budget = tokio::time::sleep(self.config.pulse_budget);
        tokio::pin!(budget);
        loop {
            tokio::select! {
                joined = pulses.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => tracing::error!("Connection pulse panicked: {e}"),
                    Some(_) => {}
                    None => break,
                },
                () = &mut budget => {
                    tracing::warn!(
                        "{} connection pulse(s) overran the {:?} budget",
                        pulses.len(),
                        self.config.pulse_budget
                    );
                    lock(&self.overrun).push(std::mem::take(&mut pulses));
                    break;
                }
            }
        }

        self.remove_disconnected();
        self.reap_tasks();
    }

    fn remove_disconnected(&self) {
        let gone: Vec<ConnectionId> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|connection| connection.is_disconnected())
            .map(|connection| connection.id())
            .collect();

        for id in gone {
            if let Some(connection) = self.remove(id) {
                tracing::info!(
                    "Removed connection {id}: {}",
                    connection.disconnect_reason().unwrap_or("disconnected")
                );
            }
        }
    }

    fn reap_tasks(&self) {
        let mut tasks = lock(&self.tasks);
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!("Network task panicked: {e}");
            }
        }
        drop(tasks);

        let mut overrun = lock(&self.overrun);
        for pulses in overrun.iter_mut() {
            while let Some(result) = pulses.try_join_next() {
                if let Err(e) = result
                    && e.is_panic()
                {
                    tracing::error!("Connection pulse panicked: {e}");
                }
            }
        }
        overrun.retain(|pulses| !pulses.is_empty());
    }

    /// Pulse every `tick` until [`stop`](Self::stop) is called.
    pub async fn run(&self, tick: Duration) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Tick loop running every {tick:?}");

        loop {
            tokio::select! {
                _ = interval.tick() => self.pulse().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Tick loop stopped");
    }

    // -- network -------------------------------------------------------------

    /// Listen on `address:port` and accept connections in the background.
    ///
    /// Returns `false` if the listener could not be created; the error is
    /// logged. Must be called inside a tokio runtime.
    pub fn bind(self: &Arc<Self>, address: IpAddr, port: u16) -> bool {
        if self.is_stopped() {
            tracing::warn!("Refusing to bind {address}:{port} on a stopped manager");
            return false;
        }

        let addr = SocketAddr::new(address, port);
        let listener = match socket::create_listener(addr, &self.config.socket) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind {addr}: {e}");
                return false;
            }
        };

        let local = listener.local_addr().unwrap_or(addr);
        lock(&self.local_addrs).push(local);
        tracing::info!("Listening on {local}");

        let manager = Arc::clone(self);
        lock(&self.tasks).spawn(manager.accept_loop(listener, local));
        true
    }

    /// Addresses of the bound listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.local_addrs).clone()
    }

    /// Open a client-role connection to `addr` and register it.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Connection>, ManagerError> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped);
        }
        let stream = TcpStream::connect(addr).await?;
        tracing::info!("Connected to {addr}");
        self.open(stream, addr, Role::Client)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, local: SocketAddr) {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let _ = self.open(stream, peer, Role::Server);
                    }
                    Err(e) => tracing::warn!("Accept on {local} failed: {e}"),
                },
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Listener {local} closed");
    }

    fn open(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        role: Role,
    ) -> Result<Arc<Connection>, ManagerError> {
        if let Err(e) = socket::configure_stream(&stream, &self.config.socket) {
            tracing::warn!("Failed to configure socket for {remote}: {e}");
        }

        let id = self.id_gen.next_id();
        let (reader, writer) = stream.into_split();
        let (transport, writer_task) = TcpTransport::spawn(writer, remote);
        let connection = Arc::new(Connection::new(
            id,
            role,
            Arc::clone(&self.protocol),
            Arc::new(transport),
        ));

        if let Err(e) = self.add(Arc::clone(&connection)) {
            tracing::warn!("Rejecting {remote}: {e}");
            connection.disconnect(e.to_string());
            return Err(e);
        }
        tracing::info!("Accepted connection {id} from {remote}");

        let manager = Arc::clone(self);
        let mut tasks = lock(&self.tasks);
        tasks.spawn(manager.read_loop(Arc::clone(&connection), reader));
        tasks.spawn(async move {
            let _ = writer_task.await;
        });
        Ok(connection)
    }

    /// Per-connection reader loop.
    async fn read_loop(self: Arc<Self>, connection: Arc<Connection>, reader: OwnedReadHalf) {
        let codec = FrameCodec::new(Arc::clone(&self.protocol), connection.role());
        let mut frames = FramedRead::new(reader, codec);
        let mut shutdown = self.shutdown_tx.subscribe();

        let reason = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(message)) => {
                        if message.is_async() {
                            // Async handlers run user code; keep it off the reactor.
                            let target = Arc::clone(&connection);
                            let _ = tokio::task::spawn_blocking(move || target.receive(message)).await;
                        } else {
                            connection.receive(message);
                        }
                    }
                    Some(Err(e)) if e.is_desync() => break Some(format!("protocol error: {e}")),
                    Some(Err(e)) => break Some(format!("read failed: {e}")),
                    None => break Some("connection closed by peer".to_owned()),
                },
                () = connection.closed() => break None,
                _ = shutdown.changed() => break None,
            }
        };

        if let Some(reason) = reason {
            connection.disconnect(reason);
        }
        self.remove(connection.id());
        tracing::info!("Connection {} closed", connection.id());
    }

    // -- shutdown ------------------------------------------------------------

    /// Disconnect every connection with `reason`, stop the listeners and
    /// reader tasks, and wait for them and for overrunning pulses to finish.
    /// Idempotent.
    pub async fn stop(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stopping connection manager: {reason}");

        for connection in self.connections() {
            connection.disconnect(reason);
        }
        let _ = self.shutdown_tx.send(true);

        let mut pending = std::mem::take(&mut *lock(&self.overrun));
        pending.push(std::mem::take(&mut *lock(&self.tasks)));
        let drain = async {
            for tasks in pending.iter_mut() {
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        tracing::error!("Task panicked during shutdown: {e}");
                    }
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                "Tasks did not finish within {:?}, aborting them",
                self.config.shutdown_timeout
            );
            // Blocking pulses cannot be aborted; only network tasks stop here.
            pending.iter_mut().for_each(JoinSet::abort_all);
        }

        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        lock(&self.local_addrs).clear();
        tracing::info!("Connection manager stopped");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.len())
            .field("local_addrs", &self.local_addrs())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
