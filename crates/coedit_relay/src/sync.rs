//! Join-time snapshot handshake
//!
//! A joiner cannot take part in a session until the host has handed it the
//! whole document. The handshake runs like this:
//!
//! 1. the joiner's task enqueues a [`PendingSync`] on the session and the host
//!    is sent a `request` line, both under the session lock
//! 2. the host answers with `response`, a row count and that many rows; the
//!    host's task pops the oldest outstanding request of its session and fulfils
//!    it through that request's own oneshot channel
//! 3. the joiner's task writes the row count and rows to the joiner, then flushes
//!    any edits that were relayed while it was waiting
//!
//! The snapshot covers every edit the host received before `request` and every
//! edit the host sent before `response`. Only the rest is flushed in step 3.
//!
//! Requests are matched to replies in FIFO order per session. A request whose
//! joiner timed out or disconnected keeps its slot, so the host's late reply is
//! consumed and dropped instead of reaching a later join.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::metrics;
use crate::session::{JoinerSettle, Session};

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId(u64);

impl SyncId {
    fn next() -> Self {
        Self(NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync-{}", self.0)
    }
}

/// Where a join handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    AwaitingHostReply,
    DeliveringSnapshot,
    Done,
    Aborted,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Whether `next` is a legal successor of this phase.
    pub fn can_advance_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Idle, AwaitingHostReply) => true,
            (AwaitingHostReply, DeliveringSnapshot) => true,
            (DeliveringSnapshot, Done) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a handshake did not complete. The `Display` form is the line sent to
/// the joiner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("sync timeout")]
    Timeout,

    #[error("sync aborted: host left")]
    HostLeft,

    #[error("sync aborted: malformed snapshot")]
    MalformedSnapshot,

    #[error("sync aborted")]
    Aborted,
}

impl SyncError {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::HostLeft => "host_left",
            Self::MalformedSnapshot => "malformed",
            Self::Aborted => "aborted",
        }
    }
}

/// A full document as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    rows: Vec<String>,
}

impl Snapshot {
    pub fn new(rows: Vec<String>) -> Self {
        Self { rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Row count line followed by the rows.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.rows.len() + 1);
        lines.push(self.rows.len().to_string());
        lines.extend(self.rows.iter().cloned());
        lines
    }
}

/// Failure while reading a snapshot from the host's stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotReadError {
    #[error("row count {0:?} is not a number")]
    BadRowCount(String),

    #[error("row count {count} exceeds the limit of {max}")]
    TooManyRows { count: usize, max: usize },

    #[error("host stream ended after {received} of {expected} rows")]
    Disconnected { expected: usize, received: usize },

    #[error("host stream failed: {0}")]
    Stream(String),
}

impl SnapshotReadError {
    /// Whether the host's connection is unusable afterwards.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Stream(_))
    }

    pub fn to_sync_error(&self) -> SyncError {
        if self.is_disconnect() {
            SyncError::HostLeft
        } else {
            SyncError::MalformedSnapshot
        }
    }
}

type SyncResult = Result<Snapshot, SyncError>;

/// One outstanding join request, owned by its session's queue.
#[derive(Debug)]
pub(crate) struct PendingSync {
    id: SyncId,
    requester: ConnectionId,
    reply: oneshot::Sender<SyncResult>,
}

impl PendingSync {
    pub(crate) fn requester(&self) -> ConnectionId {
        self.requester
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn resolve(self, result: SyncResult) -> bool {
        self.reply.send(result).is_ok()
    }
}

/// Per-session FIFO of requests that were signalled to the current host and
/// not yet answered.
#[derive(Debug, Default)]
pub(crate) struct SyncQueue {
    outstanding: VecDeque<PendingSync>,
}

impl SyncQueue {
    pub(crate) fn push(&mut self, pending: PendingSync) {
        self.outstanding.push_back(pending);
    }

    pub(crate) fn pop(&mut self) -> Option<PendingSync> {
        self.outstanding.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Fail every outstanding request. Returns how many joiners were still
    /// waiting.
    pub(crate) fn abort_all(&mut self, error: SyncError) -> usize {
        let mut notified = 0;
        for pending in self.outstanding.drain(..) {
            if pending.resolve(Err(error.clone())) {
                metrics::record_sync_result(error.metric_label());
                notified += 1;
            }
        }
        notified
    }
}

/// Joiner-side state of one handshake.
#[derive(Debug)]
pub struct SyncTicket {
    id: SyncId,
    session: Arc<Session>,
    joiner: ConnectionHandle,
    deadline: Instant,
    phase: SyncPhase,
    rx: oneshot::Receiver<SyncResult>,
}

impl SyncTicket {
    pub fn id(&self) -> SyncId {
        self.id
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn advance(&mut self, next: SyncPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal sync transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(sync = %self.id, from = ?self.phase, to = ?next, "Sync phase change");
        self.phase = next;
    }
}

/// Host-side handle on the request being answered.
///
/// `pending` is `None` when the host replied although nothing was outstanding;
/// the reply is read and dropped in that case.
#[derive(Debug)]
pub struct SyncReply {
    session_id: String,
    pending: Option<PendingSync>,
}

impl SyncReply {
    pub fn requester(&self) -> Option<ConnectionId> {
        self.pending.as_ref().map(PendingSync::requester)
    }

    /// Hand the result to the waiting joiner. Returns `true` if it was
    /// delivered, `false` if it was discarded.
    pub fn fulfil(self, result: SyncResult) -> bool {
        let Some(pending) = self.pending else {
            debug!(session = %self.session_id, "Discarding unsolicited host reply");
            metrics::record_sync_result("discarded");
            return false;
        };

        let sync_id = pending.id;
        let requester = pending.requester;
        if pending.is_abandoned() {
            info!(
                session = %self.session_id,
                sync = %sync_id,
                joiner = %requester,
                "Discarding late host reply"
            );
            metrics::record_sync_result("discarded");
            return false;
        }

        if let Err(e) = &result {
            metrics::record_sync_result(e.metric_label());
        }
        let delivered = pending.resolve(result);
        if !delivered {
            metrics::record_sync_result("discarded");
        }
        delivered
    }
}

/// Drives join handshakes. Holds no per-session state of its own; every
/// queue lives inside its [`Session`].
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    timeout: Duration,
    max_rows: usize,
}

impl SyncCoordinator {
    pub fn new(timeout: Duration, max_rows: usize) -> Self {
        Self { timeout, max_rows }
    }

    /// Start a handshake for a joiner that was just admitted to `session`.
    /// Never waits on the host: a host that is not draining its queue fails
    /// the join right away.
    pub fn begin(
        &self,
        session: &Arc<Session>,
        joiner: &ConnectionHandle,
    ) -> Result<SyncTicket, SyncError> {
        let (tx, rx) = oneshot::channel();
        let id = SyncId::next();
        let pending = PendingSync {
            id,
            requester: joiner.id(),
            reply: tx,
        };

        let mut ticket = SyncTicket {
            id,
            session: session.clone(),
            joiner: joiner.clone(),
            deadline: Instant::now() + self.timeout,
            phase: SyncPhase::Idle,
            rx,
        };

        match session.enqueue_sync(pending) {
            Ok(host) => {
                ticket.advance(SyncPhase::AwaitingHostReply);
                debug!(
                    session = %session.id(),
                    sync = %id,
                    host = %host,
                    joiner = %joiner.id(),
                    timeout = ?self.timeout,
                    "Requested snapshot"
                );
                Ok(ticket)
            }
            Err(e) => {
                warn!(session = %session.id(), joiner = %joiner.id(), error = %e, "Could not start join handshake");
                metrics::record_sync_result(e.metric_label());
                ticket.advance(SyncPhase::Aborted);
                Err(e)
            }
        }
    }

    /// Wait for the host's reply, bounded by the configured timeout.
    ///
    /// Cancel-safe: dropping the future leaves the ticket waiting.
    pub async fn wait(&self, ticket: &mut SyncTicket) -> Result<Snapshot, SyncError> {
        let outcome = tokio::time::timeout_at(ticket.deadline, &mut ticket.rx).await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Aborted),
            Err(_) => {
                metrics::record_sync_result("timeout");
                Err(SyncError::Timeout)
            }
        };

        match &result {
            Ok(snapshot) => {
                debug!(sync = %ticket.id, rows = snapshot.row_count(), "Snapshot received");
                ticket.advance(SyncPhase::DeliveringSnapshot);
            }
            Err(e) => {
                warn!(sync = %ticket.id, session = %ticket.session.id(), error = %e, "Join handshake failed");
                ticket.rx.close();
                ticket.advance(SyncPhase::Aborted);
            }
        }
        result
    }

    /// Write the snapshot to the joiner, then any edits buffered for it, and
    /// mark it synchronized.
    pub async fn deliver(
        &self,
        ticket: &mut SyncTicket,
        snapshot: Snapshot,
    ) -> Result<(), SyncError> {
        let joiner = ticket.joiner.clone();
        if joiner.send_lines(snapshot.to_lines()).await.is_err() {
            ticket.advance(SyncPhase::Aborted);
            return Err(SyncError::Aborted);
        }

        loop {
            match ticket.session.settle_joiner(joiner.id()) {
                JoinerSettle::Backlog(lines) => {
                    if joiner.send_lines(lines).await.is_err() {
                        ticket.advance(SyncPhase::Aborted);
                        return Err(SyncError::Aborted);
                    }
                }
                JoinerSettle::Synchronized => break,
                JoinerSettle::Gone => {
                    ticket.advance(SyncPhase::Aborted);
                    return Err(SyncError::Aborted);
                }
            }
        }

        ticket.advance(SyncPhase::Done);
        metrics::record_sync_result("delivered");
        info!(
            session = %ticket.session.id(),
            joiner = %joiner.id(),
            rows = snapshot.row_count(),
            "Joiner synchronized"
        );
        Ok(())
    }

    /// Claim the oldest outstanding request for a `response` from `host`.
    /// Returns `None` if `host` is not the session's host.
    pub fn take_reply(&self, session: &Session, host: ConnectionId) -> Option<SyncReply> {
        let pending = session.take_sync_reply(host)?;
        Some(SyncReply {
            session_id: session.id().to_string(),
            pending,
        })
    }

    /// Read `<rowCount>` and that many rows from the host's line stream.
    pub async fn read_snapshot<S, E>(&self, lines: &mut S) -> Result<Snapshot, SnapshotReadError>
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: fmt::Display,
    {
        let count_line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(SnapshotReadError::Stream(e.to_string())),
            None => {
                return Err(SnapshotReadError::Disconnected {
                    expected: 0,
                    received: 0,
                })
            }
        };

        let count: usize = count_line
            .trim()
            .parse()
            .map_err(|_| SnapshotReadError::BadRowCount(count_line.clone()))?;
        if count > self.max_rows {
            return Err(SnapshotReadError::TooManyRows {
                count,
                max: self.max_rows,
            });
        }

        let mut rows = Vec::with_capacity(count.min(1024));
        while rows.len() < count {
            match lines.next().await {
                Some(Ok(row)) => rows.push(row),
                Some(Err(e)) => return Err(SnapshotReadError::Stream(e.to_string())),
                None => {
                    return Err(SnapshotReadError::Disconnected {
                        expected: count,
                        received: rows.len(),
                    })
                }
            }
        }

        Ok(Snapshot::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LeaveOutcome;
    use crate::protocol::SIGNAL_REQUEST;
    use futures::stream;
    use std::convert::Infallible;

    fn handle() -> (ConnectionHandle, tokio::sync::mpsc::Receiver<String>) {
        ConnectionHandle::channel(None, 64)
    }

    fn lines(items: &[&str]) -> impl Stream<Item = Result<String, Infallible>> + Unpin {
        stream::iter(
            items
                .iter()
                .map(|s| Ok(s.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    fn session_with_joiner() -> (
        Arc<Session>,
        ConnectionHandle,
        tokio::sync::mpsc::Receiver<String>,
        ConnectionHandle,
        tokio::sync::mpsc::Receiver<String>,
    ) {
        let (host, host_rx) = handle();
        let (joiner, joiner_rx) = handle();
        let session = Arc::new(Session::new("s1".into(), "pw".into(), host.clone()));
        session.join(joiner.clone(), "pw").unwrap();
        (session, host, host_rx, joiner, joiner_rx)
    }

    #[test]
    fn test_phase_transitions() {
        use SyncPhase::*;
        assert!(Idle.can_advance_to(AwaitingHostReply));
        assert!(AwaitingHostReply.can_advance_to(DeliveringSnapshot));
        assert!(DeliveringSnapshot.can_advance_to(Done));
        assert!(Idle.can_advance_to(Aborted));
        assert!(AwaitingHostReply.can_advance_to(Aborted));
        assert!(!Done.can_advance_to(Aborted));
        assert!(!Aborted.can_advance_to(Done));
        assert!(!Idle.can_advance_to(Done));
    }

    #[tokio::test]
    async fn test_read_snapshot() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(1), 10);

        let mut ok = lines(&["2", "hello", ""]);
        let snapshot = coordinator.read_snapshot(&mut ok).await.unwrap();
        assert_eq!(snapshot.rows(), ["hello", ""]);
        assert_eq!(snapshot.to_lines(), vec!["2", "hello", ""]);

        let mut empty = lines(&["0"]);
        assert_eq!(coordinator.read_snapshot(&mut empty).await.unwrap().row_count(), 0);

        let mut bad = lines(&["two", "a", "b"]);
        let err = coordinator.read_snapshot(&mut bad).await.unwrap_err();
        assert_eq!(err, SnapshotReadError::BadRowCount("two".into()));
        assert_eq!(err.to_sync_error(), SyncError::MalformedSnapshot);

        let mut huge = lines(&["11"]);
        assert!(matches!(
            coordinator.read_snapshot(&mut huge).await,
            Err(SnapshotReadError::TooManyRows { count: 11, max: 10 })
        ));

        let mut short = lines(&["3", "a"]);
        let err = coordinator.read_snapshot(&mut short).await.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(err.to_sync_error(), SyncError::HostLeft);
    }

    #[tokio::test]
    async fn test_handshake_delivers_snapshot_to_joiner() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(5), 100);
        let (session, host, mut host_rx, joiner, mut joiner_rx) = session_with_joiner();

        let mut ticket = coordinator.begin(&session, &joiner).unwrap();
        assert_eq!(ticket.phase(), SyncPhase::AwaitingHostReply);
        assert_eq!(host_rx.recv().await.as_deref(), Some(SIGNAL_REQUEST));

        let reply = coordinator.take_reply(&session, host.id()).unwrap();
        assert_eq!(reply.requester(), Some(joiner.id()));
        let snapshot = coordinator
            .read_snapshot(&mut lines(&["1", "abc"]))
            .await
            .unwrap();
        assert!(reply.fulfil(Ok(snapshot)));

        let snapshot = coordinator.wait(&mut ticket).await.unwrap();
        assert_eq!(ticket.phase(), SyncPhase::DeliveringSnapshot);
        coordinator.deliver(&mut ticket, snapshot).await.unwrap();
        assert_eq!(ticket.phase(), SyncPhase::Done);

        assert_eq!(joiner_rx.recv().await.as_deref(), Some("1"));
        assert_eq!(joiner_rx.recv().await.as_deref(), Some("abc"));
        assert!(session.is_synchronized(joiner.id()));
    }

    #[tokio::test]
    async fn test_non_host_cannot_take_reply() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(5), 100);
        let (session, _host, _host_rx, joiner, _joiner_rx) = session_with_joiner();
        assert!(coordinator.take_reply(&session, joiner.id()).is_none());
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_discarded() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(5), 100);
        let (session, host, _host_rx, _joiner, _joiner_rx) = session_with_joiner();
        let reply = coordinator.take_reply(&session, host.id()).unwrap();
        assert_eq!(reply.requester(), None);
        assert!(!reply.fulfil(Ok(Snapshot::default())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_discarded() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(2), 100);
        let (session, host, _host_rx, joiner, _joiner_rx) = session_with_joiner();

        let mut first = coordinator.begin(&session, &joiner).unwrap();
        assert_eq!(coordinator.wait(&mut first).await, Err(SyncError::Timeout));
        assert_eq!(first.phase(), SyncPhase::Aborted);

        let (late_joiner, _late_rx) = handle();
        session.join(late_joiner.clone(), "pw").unwrap();
        let mut second = coordinator.begin(&session, &late_joiner).unwrap();

        // The host answers the first request late; that answer must not reach
        // the second joiner.
        let stale = coordinator.take_reply(&session, host.id()).unwrap();
        assert_eq!(stale.requester(), Some(joiner.id()));
        assert!(!stale.fulfil(Ok(Snapshot::new(vec!["old".into()]))));

        let fresh = coordinator.take_reply(&session, host.id()).unwrap();
        assert_eq!(fresh.requester(), Some(late_joiner.id()));
        assert!(fresh.fulfil(Ok(Snapshot::new(vec!["new".into()]))));

        let snapshot = coordinator.wait(&mut second).await.unwrap();
        assert_eq!(snapshot.rows(), ["new"]);
    }

    #[tokio::test]
    async fn test_host_leaving_aborts_pending_joins() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(30), 100);
        let (session, host, _host_rx, joiner, _joiner_rx) = session_with_joiner();
        let (other, _other_rx) = handle();
        session.join(other.clone(), "pw").unwrap();

        let mut a = coordinator.begin(&session, &joiner).unwrap();
        let mut b = coordinator.begin(&session, &other).unwrap();

        let outcome = session.leave(host.id());
        assert!(matches!(outcome, LeaveOutcome::HostChanged { aborted_syncs: 2, .. }));

        assert_eq!(coordinator.wait(&mut a).await, Err(SyncError::HostLeft));
        assert_eq!(coordinator.wait(&mut b).await, Err(SyncError::HostLeft));
    }

    #[tokio::test]
    async fn test_begin_fails_when_host_is_gone() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(30), 100);
        let (session, _host, host_rx, joiner, _joiner_rx) = session_with_joiner();
        drop(host_rx);
        assert_eq!(
            coordinator.begin(&session, &joiner).unwrap_err(),
            SyncError::HostLeft
        );
        assert_eq!(session.outstanding_syncs(), 0);
    }

    #[tokio::test]
    async fn test_begin_does_not_wait_on_a_stalled_host() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(30), 100);
        let (host, _host_rx) = ConnectionHandle::channel(None, 1);
        let (joiner, _joiner_rx) = handle();
        let session = Arc::new(Session::new("s1".into(), "pw".into(), host.clone()));
        host.try_send_lines(&["unread".to_string()]).unwrap();
        session.join(joiner.clone(), "pw").unwrap();

        assert_eq!(
            coordinator.begin(&session, &joiner).unwrap_err(),
            SyncError::HostLeft
        );
        assert!(host.is_closed());
        assert_eq!(session.outstanding_syncs(), 0);
    }

    #[tokio::test]
    async fn test_edits_relayed_during_handshake_follow_the_snapshot() {
        let coordinator = SyncCoordinator::new(Duration::from_secs(5), 100);
        let (session, host, _host_rx, joiner, mut joiner_rx) = session_with_joiner();

        let mut ticket = coordinator.begin(&session, &joiner).unwrap();
        let typed_before: Vec<String> = ["char", "w", "0", "0"].map(String::from).to_vec();
        session.broadcast(host.id(), &typed_before);

        let reply = coordinator.take_reply(&session, host.id()).unwrap();
        let edit: Vec<String> = ["char", "x", "0", "0"].map(String::from).to_vec();
        session.broadcast(host.id(), &edit);
        reply.fulfil(Ok(Snapshot::new(vec!["row".into()])));
        let snapshot = coordinator.wait(&mut ticket).await.unwrap();
        coordinator.deliver(&mut ticket, snapshot).await.unwrap();

        let mut received = Vec::new();
        while let Ok(line) = joiner_rx.try_recv() {
            received.push(line);
        }
        assert_eq!(received, vec!["1", "row", "char", "x", "0", "0"]);
    }
}
