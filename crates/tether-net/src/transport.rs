//! The byte channel underneath a connection.
//!
//! [`Transport`] is the synchronous surface a [`Connection`](crate::Connection)
//! writes frames to. [`TcpTransport`] backs it with a writer task that owns
//! the socket's write half; [`MemoryTransport`] records frames in memory for
//! tests and offline tools.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Write side of a link.
///
/// `write` only stages a frame; nothing is guaranteed to reach the peer
/// until `flush`. Both are non-blocking.
pub trait Transport: Send + Sync {
    /// Whether the link can still carry data.
    fn is_active(&self) -> bool;

    /// Stage one encoded frame.
    fn write(&self, frame: Bytes) -> io::Result<()>;

    /// Push all staged frames to the peer.
    fn flush(&self) -> io::Result<()>;

    /// Close the link after the staged frames are flushed. Idempotent.
    fn close(&self);

    /// Address of the peer.
    fn remote_address(&self) -> SocketAddr;
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WriteCommand {
    Frame(Bytes),
    Flush,
    Close,
}

/// [`Transport`] over the write half of a TCP stream.
///
/// Frames are handed to a writer task through an unbounded channel, so
/// `write` and `flush` never block the caller.
#[derive(Debug)]
pub struct TcpTransport {
    remote: SocketAddr,
    commands: mpsc::UnboundedSender<WriteCommand>,
    active: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Spawn the writer task for `writer` and return the transport feeding
    /// it. Must be called inside a tokio runtime.
    pub fn spawn(writer: OwnedWriteHalf, remote: SocketAddr) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(write_loop(writer, receiver, Arc::clone(&active), remote));
        (
            Self {
                remote,
                commands,
                active,
            },
            task,
        )
    }

    fn submit(&self, command: WriteCommand) -> io::Result<()> {
        if !self.is_active() {
            return Err(not_connected());
        }
        self.commands
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task has exited"))
    }
}

impl Transport for TcpTransport {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn write(&self, frame: Bytes) -> io::Result<()> {
        self.submit(WriteCommand::Frame(frame))
    }

    fn flush(&self) -> io::Result<()> {
        self.submit(WriteCommand::Flush)
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let _ = self.commands.send(WriteCommand::Close);
        }
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }
}

async fn write_loop(
    writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    active: Arc<AtomicBool>,
    remote: SocketAddr,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(command) = commands.recv().await {
        let result = match command {
            WriteCommand::Frame(frame) => writer.write_all(&frame).await,
            WriteCommand::Flush => writer.flush().await,
            WriteCommand::Close => {
                if let Err(e) = writer.flush().await {
                    tracing::debug!("Final flush to {remote} failed: {e}");
                }
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("Shutdown of {remote} failed: {e}");
                }
                break;
            }
        };

        if let Err(e) = result {
            tracing::warn!("Write to {remote} failed: {e}");
            break;
        }
    }

    active.store(false, Ordering::Release);
    tracing::debug!("Writer task for {remote} exited");
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// [`Transport`] that records frames instead of sending them.
///
/// Frames become visible through [`frames`](Self::frames) once flushed.
#[derive(Debug)]
pub struct MemoryTransport {
    remote: SocketAddr,
    active: AtomicBool,
    fail_writes: AtomicBool,
    staged: Mutex<Vec<Bytes>>,
    flushed: Mutex<Vec<Bytes>>,
    flushes: AtomicUsize,
}

impl MemoryTransport {
    /// Create an active transport reporting `remote` as the peer address.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            active: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            staged: Mutex::new(Vec::new()),
            flushed: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Frames flushed so far, in write order.
    pub fn frames(&self) -> Vec<Bytes> {
        self.flushed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the flushed frames.
    pub fn take_frames(&self) -> Vec<Bytes> {
        std::mem::take(
            &mut *self
                .flushed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Number of `flush` calls.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Make every following `write` fail, as a broken socket would.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Mark the link as down without going through `close`.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn write(&self, frame: Bytes) -> io::Result<()> {
        if !self.is_active() {
            return Err(not_connected());
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        self.staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        if !self.is_active() {
            return Err(not_connected());
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let staged = std::mem::take(
            &mut *self
                .staged
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        self.flushed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(staged);
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }
}
