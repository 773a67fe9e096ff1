//! Editing sessions
//!
//! A [`Session`] is a password-protected room with a set of participants, one
//! of which is the host. All of a session's mutable state sits behind one
//! per-session lock. Lines for other connections are queued under that lock
//! with non-blocking writes, so the order in which the host sees edits and
//! snapshot requests is the order they were accepted here.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, QueueError};
use crate::metrics;
use crate::protocol::SIGNAL_REQUEST;
use crate::sync::{PendingSync, SyncError, SyncQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// No such session, or it was emptied while the join was in flight.
    #[error("invalid id")]
    InvalidId,

    #[error("invalid pass")]
    InvalidPassword,
}

/// Result of removing a connection from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was not a participant.
    NotMember,
    /// A non-host participant left.
    Left,
    /// The host left and `new_host` took over; pending handshakes were aborted.
    HostChanged {
        new_host: ConnectionId,
        aborted_syncs: usize,
    },
    /// The last participant left; the session is closed.
    Emptied,
}

/// What a joiner's task must do next after writing the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinerSettle {
    /// Edits relayed while the joiner was waiting; write them, then settle
    /// again.
    Backlog(Vec<String>),
    /// Nothing left to flush; the joiner now receives edits directly.
    Synchronized,
    /// The joiner is no longer a participant.
    Gone,
}

/// One edit held back for a joiner.
#[derive(Debug)]
struct Relayed {
    sender: ConnectionId,
    lines: Vec<String>,
}

#[derive(Debug)]
enum SyncState {
    /// Admitted, host not asked yet. Edits relayed now reach the host before
    /// the request, so the snapshot will contain them.
    Admitted,
    /// The host has been asked for a snapshot; edits it will not contain are
    /// held here.
    Pending(Vec<Relayed>),
    Synchronized,
}

#[derive(Debug)]
struct Participant {
    handle: ConnectionHandle,
    sync: SyncState,
}

impl Participant {
    fn is_synchronized(&self) -> bool {
        matches!(self.sync, SyncState::Synchronized)
    }
}

#[derive(Debug)]
struct SessionState {
    participants: HashMap<ConnectionId, Participant>,
    host: Option<ConnectionId>,
    closed: bool,
    syncs: SyncQueue,
}

impl SessionState {
    /// Pick a remaining participant, preferring one that holds the document.
    /// `None` only when nobody is left.
    fn elect_host(&self) -> Option<ConnectionId> {
        // Lowest id first so the choice does not depend on map order.
        let synchronized = self
            .participants
            .iter()
            .filter(|(_, p)| p.is_synchronized())
            .map(|(id, _)| *id)
            .min();
        synchronized.or_else(|| self.participants.keys().min().copied())
    }
}

#[derive(Debug)]
pub struct Session {
    id: String,
    password: String,
    created_at: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    /// A session whose only participant, and host, is `creator`.
    pub fn new(id: String, password: String, creator: ConnectionHandle) -> Self {
        let host = creator.id();
        let mut participants = HashMap::new();
        participants.insert(
            host,
            Participant {
                handle: creator,
                sync: SyncState::Synchronized,
            },
        );

        Self {
            id,
            password,
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                participants,
                host: Some(host),
                closed: false,
                syncs: SyncQueue::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Admit `conn` if `password` matches. The new participant is not
    /// synchronized until its snapshot has been delivered.
    pub fn join(&self, conn: ConnectionHandle, password: &str) -> Result<(), JoinError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(JoinError::InvalidId);
        }
        if password != self.password {
            return Err(JoinError::InvalidPassword);
        }

        let id = conn.id();
        state.participants.entry(id).or_insert(Participant {
            handle: conn,
            sync: SyncState::Admitted,
        });
        debug!(session = %self.id, conn = %id, participants = state.participants.len(), "Participant joined");
        Ok(())
    }

    /// Remove `conn`, re-electing the host or closing the session as needed.
    pub fn leave(&self, conn: ConnectionId) -> LeaveOutcome {
        let mut state = self.state.lock();
        if state.participants.remove(&conn).is_none() {
            return LeaveOutcome::NotMember;
        }

        let Some(new_host) = state.elect_host() else {
            state.closed = true;
            state.host = None;
            state.syncs.abort_all(SyncError::Aborted);
            info!(session = %self.id, lifetime = ?self.created_at.elapsed(), "Last participant left");
            return LeaveOutcome::Emptied;
        };

        if state.host != Some(conn) {
            return LeaveOutcome::Left;
        }

        state.host = Some(new_host);
        let aborted_syncs = state.syncs.abort_all(SyncError::HostLeft);
        info!(
            session = %self.id,
            old_host = %conn,
            new_host = %new_host,
            aborted_syncs,
            "Host left, new host elected"
        );
        LeaveOutcome::HostChanged {
            new_host,
            aborted_syncs,
        }
    }

    /// Deliver `lines` to every participant except `sender`.
    ///
    /// Joiners whose snapshot was requested get the lines appended to their
    /// backlog instead; joiners whose request has not gone out yet get nothing,
    /// since the host's snapshot will include the edit. A recipient whose
    /// queue is full is closed. Returns how many connections were written to.
    pub fn broadcast(&self, sender: ConnectionId, lines: &[String]) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for (id, participant) in state.participants.iter_mut() {
            if *id == sender {
                continue;
            }
            match &mut participant.sync {
                SyncState::Admitted => {}
                SyncState::Pending(backlog) => backlog.push(Relayed {
                    sender,
                    lines: lines.to_vec(),
                }),
                SyncState::Synchronized => match participant.handle.try_send_lines(lines) {
                    Ok(()) => delivered += 1,
                    Err(e @ QueueError::Stalled(_)) => {
                        metrics::record_stalled_connection();
                        warn!(session = %self.id, error = %e, "Closing stalled participant");
                    }
                    Err(e @ QueueError::Closed(_)) => {
                        debug!(session = %self.id, error = %e, "Skipping closed participant");
                    }
                },
            }
        }
        delivered
    }

    pub fn host(&self) -> Option<ConnectionHandle> {
        let state = self.state.lock();
        state
            .host
            .and_then(|id| state.participants.get(&id))
            .map(|p| p.handle.clone())
    }

    pub fn host_id(&self) -> Option<ConnectionId> {
        self.state.lock().host
    }

    pub fn is_host(&self, conn: ConnectionId) -> bool {
        self.state.lock().host == Some(conn)
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.state.lock().participants.contains_key(&conn)
    }

    pub fn is_synchronized(&self, conn: ConnectionId) -> bool {
        self.state
            .lock()
            .participants
            .get(&conn)
            .is_some_and(Participant::is_synchronized)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().participants.is_empty()
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    pub fn participant_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().participants.keys().copied().collect()
    }

    /// Requests signalled to the host and not yet answered.
    pub fn outstanding_syncs(&self) -> usize {
        self.state.lock().syncs.len()
    }

    /// Flush step after a joiner's snapshot was written: hand back whatever
    /// was buffered for it, or mark it synchronized once nothing is left.
    pub fn settle_joiner(&self, conn: ConnectionId) -> JoinerSettle {
        let mut state = self.state.lock();
        let Some(participant) = state.participants.get_mut(&conn) else {
            return JoinerSettle::Gone;
        };
        if let SyncState::Pending(backlog) = &mut participant.sync {
            if !backlog.is_empty() {
                let lines = std::mem::take(backlog)
                    .into_iter()
                    .flat_map(|relayed| relayed.lines)
                    .collect();
                return JoinerSettle::Backlog(lines);
            }
        }
        participant.sync = SyncState::Synchronized;
        JoinerSettle::Synchronized
    }

    /// Send `request` to the host and queue the join request it answers.
    /// From here on the joiner buffers edits. Returns the host's id.
    pub(crate) fn enqueue_sync(&self, pending: PendingSync) -> Result<ConnectionId, SyncError> {
        let mut state = self.state.lock();
        let joiner = pending.requester();
        if state.closed || !state.participants.contains_key(&joiner) {
            return Err(SyncError::Aborted);
        }

        let host = state
            .host
            .filter(|id| *id != joiner)
            .and_then(|id| state.participants.get(&id))
            .map(|p| p.handle.clone())
            .ok_or(SyncError::HostLeft)?;

        if let Err(e) = host.try_send_lines(&[SIGNAL_REQUEST.to_string()]) {
            if matches!(e, QueueError::Stalled(_)) {
                metrics::record_stalled_connection();
            }
            warn!(session = %self.id, error = %e, "Could not ask host for a snapshot");
            return Err(SyncError::HostLeft);
        }

        if let Some(participant) = state.participants.get_mut(&joiner) {
            participant.sync = SyncState::Pending(Vec::new());
        }
        state.syncs.push(pending);
        Ok(host.id())
    }

    /// Pop the oldest outstanding request on behalf of `host`. The outer
    /// `None` means `host` is not this session's host.
    ///
    /// Edits the host sent before this `response` are part of its snapshot, so
    /// they are dropped from the joiner's backlog.
    pub(crate) fn take_sync_reply(&self, host: ConnectionId) -> Option<Option<PendingSync>> {
        let mut state = self.state.lock();
        if state.host != Some(host) {
            return None;
        }
        let pending = state.syncs.pop();
        if let Some(joiner) = pending.as_ref().map(PendingSync::requester) {
            if let Some(Participant {
                sync: SyncState::Pending(backlog),
                ..
            }) = state.participants.get_mut(&joiner)
            {
                backlog.retain(|relayed| relayed.sender != host);
            }
        }
        Some(pending)
    }
}
