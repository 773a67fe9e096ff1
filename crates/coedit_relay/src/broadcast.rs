//! Edit fan-out
//!
//! Edits are relayed as-is: the keyword and each argument on its own line, to
//! every other participant of the sender's session. The relay never interprets
//! or merges them.

use tracing::trace;

use crate::connection::ConnectionId;
use crate::metrics;
use crate::protocol::EditOp;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("sender {0} is not a participant")]
    NotParticipant(ConnectionId),

    #[error("sender {0} has not received its snapshot yet")]
    NotSynchronized(ConnectionId),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EditBroadcaster;

impl EditBroadcaster {
    pub fn new() -> Self {
        Self
    }

    /// Relay `op` from `sender` to the rest of `session`. Returns the number of
    /// participants written to directly.
    pub fn apply(
        &self,
        session: &Session,
        sender: ConnectionId,
        op: &EditOp,
    ) -> Result<usize, RelayError> {
        if !session.contains(sender) {
            return Err(RelayError::NotParticipant(sender));
        }
        if !session.is_synchronized(sender) {
            return Err(RelayError::NotSynchronized(sender));
        }

        let lines = op.to_lines();
        let delivered = session.broadcast(sender, &lines);
        metrics::record_edit();
        trace!(session = %session.id(), sender = %sender, op = %op.kind(), delivered, "Relayed edit");
        Ok(delivered)
    }
}
