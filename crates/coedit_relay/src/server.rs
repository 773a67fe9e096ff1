//! TCP front end
//!
//! [`RelayServer`] accepts connections and runs one [`ConnectionTask`] per
//! client. Each connection also gets a writer task that drains its outbound
//! queue into the socket, so sessions never write to sockets directly.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::broadcast::EditBroadcaster;
use crate::config::RelayConfig;
use crate::connection::{ConnectionClosed, ConnectionHandle};
use crate::metrics;
use crate::protocol::{
    Command, EditOp, REPLY_CREATE_FAILED, REPLY_INVALID_ID, REPLY_INVALID_PASS, REPLY_LEFT,
    REPLY_PONG, REPLY_SUCCESS, REPLY_UNKNOWN_COMMAND,
};
use crate::registry::SessionRegistry;
use crate::session::{JoinError, Session};
use crate::sync::{SyncCoordinator, SyncError};

type LineStream = SplitStream<Framed<TcpStream, LinesCodec>>;

/// How long a closing connection may take to flush its queued lines.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    coordinator: SyncCoordinator,
    broadcaster: EditBroadcaster,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_registry(config, Arc::new(SessionRegistry::new()))
    }

    pub fn with_registry(config: RelayConfig, registry: Arc<SessionRegistry>) -> Self {
        let coordinator = SyncCoordinator::new(config.sync_timeout(), config.max_snapshot_rows);
        Self {
            config,
            registry,
            coordinator,
            broadcaster: EditBroadcaster::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to listen on {addr}"))
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections from `listener` until `shutdown` resolves.
    /// Connections already accepted keep running.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener
            .local_addr()
            .context("Failed to read listener address")?;
        info!(addr = %local, transport = %self.config.transport, "Relay listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let framed = Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.config.max_line_length),
        );
        let (mut sink, lines) = framed.split();
        let (handle, mut rx) = ConnectionHandle::channel(Some(addr), self.config.outbound_buffer);
        let conn = handle.id();

        info!(conn = %conn, peer = %addr, "Client connected");
        metrics::connection_opened();

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    debug!(conn = %conn, error = %e, "Write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let writer_abort = writer.abort_handle();

        let task = ConnectionTask {
            server: self.clone(),
            handle,
            lines,
            backlog: VecDeque::new(),
            session: None,
        };
        let stalled = task.run().await;

        if stalled {
            // Peer stopped reading; queued lines would never drain.
            writer_abort.abort();
        } else if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            warn!(conn = %conn, "Writer did not drain in time");
            writer_abort.abort();
        }

        metrics::connection_closed();
        info!(conn = %conn, peer = %addr, "Client disconnected");
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("peer closed the connection")]
    Closed,

    #[error(transparent)]
    Writer(#[from] ConnectionClosed),
}

/// Command loop of one client.
struct ConnectionTask {
    server: Arc<RelayServer>,
    handle: ConnectionHandle,
    lines: LineStream,
    /// Lines read while a join handshake was pending.
    backlog: VecDeque<String>,
    session: Option<Arc<Session>>,
}

impl ConnectionTask {
    /// Returns whether the connection was closed for not draining its queue.
    async fn run(mut self) -> bool {
        let conn = self.handle.id();
        let closed = self.handle.closed();
        tokio::pin!(closed);
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut closed => {
                    warn!(conn = %conn, "Outbound queue full, dropping connection");
                    break;
                }
                next = self.next_line() => next,
            };
            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(conn = %conn, error = %e, "Read failed");
                    break;
                }
                None => break,
            };

            if let Err(e) = self.dispatch(&line).await {
                debug!(conn = %conn, error = %e, "Closing connection");
                break;
            }
        }

        self.leave_current();
        self.handle.close_requested()
    }

    async fn next_line(&mut self) -> Option<Result<String, LinesCodecError>> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(Ok(line));
        }
        self.lines.next().await
    }

    async fn reply(&self, line: impl Into<String>) -> Result<(), ConnectionError> {
        tokio::select! {
            sent = self.handle.send_line(line) => sent?,
            _ = self.handle.closed() => return Err(ConnectionError::Closed),
        }
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> Result<(), ConnectionError> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(conn = %self.handle.id(), error = %e, "Rejected command");
                return self.reply(REPLY_UNKNOWN_COMMAND).await;
            }
        };

        match command {
            Command::Create { password } => self.create(&password).await,
            Command::Join {
                session_id,
                password,
            } => self.join(&session_id, &password).await,
            Command::Response => self.respond().await,
            Command::Edit(op) => self.edit(&op).await,
            Command::Leave => {
                if self.session.is_some() {
                    self.leave_current();
                    self.reply(REPLY_LEFT).await
                } else {
                    self.reply(REPLY_UNKNOWN_COMMAND).await
                }
            }
            Command::Ping => self.reply(REPLY_PONG).await,
        }
    }

    fn leave_current(&mut self) {
        if let Some(session) = self.session.take() {
            let outcome = self.server.registry.leave(&session, self.handle.id());
            debug!(session = %session.id(), conn = %self.handle.id(), outcome = ?outcome, "Left session");
        }
    }

    async fn create(&mut self, password: &str) -> Result<(), ConnectionError> {
        self.leave_current();
        match self.server.registry.create(password, self.handle.clone()) {
            Ok(session) => {
                let id = session.id().to_string();
                self.session = Some(session);
                self.reply(id).await
            }
            Err(e) => {
                error!(conn = %self.handle.id(), error = %e, "Failed to create session");
                self.reply(REPLY_CREATE_FAILED).await
            }
        }
    }

    async fn join(&mut self, session_id: &str, password: &str) -> Result<(), ConnectionError> {
        if self
            .session
            .as_ref()
            .is_some_and(|current| current.id() == session_id)
        {
            self.leave_current();
        }

        let joined = self
            .server
            .registry
            .join(session_id, self.handle.clone(), password);
        let session = match joined {
            Ok(session) => session,
            Err(e) => {
                let (label, reply) = match e {
                    JoinError::InvalidId => ("invalid_id", REPLY_INVALID_ID),
                    JoinError::InvalidPassword => ("invalid_pass", REPLY_INVALID_PASS),
                };
                metrics::record_join(label);
                info!(conn = %self.handle.id(), session = %session_id, error = %e, "Join refused");
                return self.reply(reply).await;
            }
        };

        self.leave_current();
        self.session = Some(session.clone());
        metrics::record_join("success");
        info!(conn = %self.handle.id(), session = %session.id(), "Client joined session");

        self.reply(REPLY_SUCCESS).await?;
        self.synchronize(session).await
    }

    /// Joiner side of the handshake. Lines the client sends meanwhile are
    /// kept for later; a disconnect abandons the request.
    async fn synchronize(&mut self, session: Arc<Session>) -> Result<(), ConnectionError> {
        let coordinator = self.server.coordinator.clone();
        let mut ticket = match coordinator.begin(&session, &self.handle) {
            Ok(ticket) => ticket,
            Err(e) => return self.abandon_join(e).await,
        };

        let outcome = {
            let wait = coordinator.wait(&mut ticket);
            let closed = self.handle.closed();
            tokio::pin!(wait, closed);
            loop {
                tokio::select! {
                    result = &mut wait => break Some(result),
                    _ = &mut closed => break None,
                    incoming = self.lines.next() => match incoming {
                        Some(Ok(line)) => self.backlog.push_back(line),
                        Some(Err(e)) => {
                            warn!(conn = %self.handle.id(), error = %e, "Read failed during join");
                            break None;
                        }
                        None => break None,
                    }
                }
            }
        };

        match outcome {
            None => Err(ConnectionError::Closed),
            Some(Ok(snapshot)) => match coordinator.deliver(&mut ticket, snapshot).await {
                Ok(()) => Ok(()),
                Err(e) => self.abandon_join(e).await,
            },
            Some(Err(e)) => self.abandon_join(e).await,
        }
    }

    async fn abandon_join(&mut self, error: SyncError) -> Result<(), ConnectionError> {
        self.leave_current();
        self.reply(error.to_string()).await
    }

    /// Host side of the handshake: read the snapshot that follows `response`.
    async fn respond(&mut self) -> Result<(), ConnectionError> {
        let Some(session) = self.session.clone() else {
            return self.reply(REPLY_UNKNOWN_COMMAND).await;
        };
        let coordinator = self.server.coordinator.clone();
        let Some(reply) = coordinator.take_reply(&session, self.handle.id()) else {
            return self.reply(REPLY_UNKNOWN_COMMAND).await;
        };

        let read = {
            let backlog = &mut self.backlog;
            let lines = &mut self.lines;
            let mut source = stream::poll_fn(|cx| match backlog.pop_front() {
                Some(line) => Poll::Ready(Some(Ok(line))),
                None => lines.poll_next_unpin(cx),
            });
            coordinator.read_snapshot(&mut source).await
        };

        match read {
            Ok(snapshot) => {
                let rows = snapshot.row_count();
                let requester = reply.requester();
                let delivered = reply.fulfil(Ok(snapshot));
                debug!(
                    session = %session.id(),
                    joiner = ?requester,
                    rows,
                    delivered,
                    "Host answered snapshot request"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session = %session.id(), host = %self.handle.id(), error = %e, "Unusable snapshot from host");
                reply.fulfil(Err(e.to_sync_error()));
                if e.is_disconnect() {
                    Err(ConnectionError::Closed)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn edit(&mut self, op: &EditOp) -> Result<(), ConnectionError> {
        let Some(session) = self.session.clone() else {
            return self.reply(REPLY_UNKNOWN_COMMAND).await;
        };
        match self
            .server
            .broadcaster
            .apply(&session, self.handle.id(), op)
        {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(conn = %self.handle.id(), error = %e, "Rejected edit");
                self.reply(REPLY_UNKNOWN_COMMAND).await
            }
        }
    }
}
