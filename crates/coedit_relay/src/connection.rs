//! Connection handles
//!
//! Every accepted connection is represented inside the relay by a
//! [`ConnectionHandle`]: a stable [`ConnectionId`] ticket plus the sending half
//! of the connection's outbound line queue. The socket itself is owned by the
//! connection task; sessions only ever hold handles.
//!
//! Other connections' tasks write through [`ConnectionHandle::try_send_lines`],
//! which never waits: a peer that stops reading fills its queue, is closed, and
//! cannot hold up the rest of its session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one accepted connection, issued at accept time and never reused
/// within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Issue the next id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The connection's writer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct ConnectionClosed(pub ConnectionId);

/// A non-blocking write could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("connection {0} is not draining its queue")]
    Stalled(ConnectionId),
}

/// Addressable handle to one connection.
///
/// Cloning is cheap; equality is by [`ConnectionId`] only.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer_addr: Option<SocketAddr>, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            peer_addr,
            tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a handle with a fresh id and its outbound queue.
    pub fn channel(
        peer_addr: Option<SocketAddr>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(ConnectionId::next(), peer_addr, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue one line (without its terminator) for this connection.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<(), ConnectionClosed> {
        self.tx
            .send(line.into())
            .await
            .map_err(|_| ConnectionClosed(self.id))
    }

    /// Queue several lines in order.
    pub async fn send_lines<I, S>(&self, lines: I) -> Result<(), ConnectionClosed>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.send_line(line).await?;
        }
        Ok(())
    }

    /// Queue `lines` without waiting. Either every line is queued, or the
    /// queue was full and the connection is now closed.
    pub fn try_send_lines(&self, lines: &[String]) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.id));
        }
        if self.tx.capacity() < lines.len() {
            self.close();
            return Err(QueueError::Stalled(self.id));
        }
        for line in lines {
            match self.tx.try_send(line.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueError::Closed(self.id)),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.close();
                    return Err(QueueError::Stalled(self.id));
                }
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.shutdown.is_cancelled()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn close_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Ask the connection's task to hang up.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{} ({})", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}
