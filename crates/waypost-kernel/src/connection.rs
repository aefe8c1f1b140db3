//! Per-connection task.
//!
//! A connection runs two tasks. The reader turns the byte stream into
//! [`Inbound`] events and applies the idle timeout. The connection task owns
//! the writer and every piece of per-connection state, and multiplexes
//! inbound frames, its mailbox, deferred responses and shutdown.

use crate::node::NodeState;
use crate::session::ConversationSession;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use waypost_relay::mailbox::mailbox;
use waypost_relay::{CloseReason, ConnectionId, Mailbox, PeerEvent, RelayToken};
use waypost_search::SearchResultSet;
use waypost_types::config::ServerRole;
use waypost_wire::frame::{read_frame, FrameError};
use waypost_wire::message::{
    decode_message, peek_message_id, write_message, Status, WireError, WireMessage,
    WireMessageKind, WireRequest, WireResponse, UNKNOWN_MESSAGE_ID,
};

/// Frames read ahead of the connection task.
const INBOUND_QUEUE: usize = 32;

/// How long the reader keeps swallowing input after a protocol violation.
const VIOLATION_DRAIN: Duration = Duration::from_secs(1);

/// What the reader saw.
#[derive(Debug)]
enum Inbound {
    Message(WireMessage),
    Violation { id: u32, reason: String },
    IdleTimeout,
    Closed,
}

/// Why a connection ended.
enum Ending {
    PeerClosed,
    IdleTimeout,
    Violation { id: u32, reason: String },
    Evicted(CloseReason),
    WriteFailed(WireError),
    Shutdown,
}

impl fmt::Display for Ending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ending::PeerClosed => f.write_str("peer closed"),
            Ending::IdleTimeout => f.write_str("idle timeout"),
            Ending::Violation { reason, .. } => write!(f, "protocol violation: {reason}"),
            Ending::Evicted(reason) => write!(f, "{reason}"),
            Ending::WriteFailed(e) => write!(f, "write failed: {e}"),
            Ending::Shutdown => f.write_str("node shutting down"),
        }
    }
}

/// A response computed off the connection task.
pub(crate) struct Deferred {
    pub(crate) request_id: u32,
    pub(crate) response: WireResponse,
    /// The request was a relay bind that never became active.
    pub(crate) bind_failed: bool,
}

impl Deferred {
    pub(crate) fn reply(request_id: u32, response: WireResponse) -> Self {
        Self {
            request_id,
            response,
            bind_failed: false,
        }
    }
}

/// State owned by one connection task.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    pub(crate) roles: Arc<[ServerRole]>,
    pub(crate) state: Arc<NodeState>,
    pub(crate) session: ConversationSession,
    /// Result set of the last search.
    pub(crate) search: Option<SearchResultSet>,
    /// Relay token this application-service connection is bound to.
    pub(crate) relay_token: Option<RelayToken>,
    /// Posting end of this connection's own mailbox.
    pub(crate) mailbox: Mailbox,
    /// Responses computed off the connection task.
    pub(crate) deferred: JoinSet<Deferred>,
    /// Node-originated requests waiting for the client's response.
    pending: HashMap<u32, oneshot::Sender<WireResponse>>,
    next_request_id: u32,
}

impl Connection {
    fn new(
        id: ConnectionId,
        peer: SocketAddr,
        roles: Arc<[ServerRole]>,
        state: Arc<NodeState>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            id,
            peer,
            roles,
            state,
            session: ConversationSession::new(),
            search: None,
            relay_token: None,
            mailbox,
            deferred: JoinSet::new(),
            pending: HashMap::new(),
            next_request_id: UNKNOWN_MESSAGE_ID,
        }
    }

    /// Whether the listener of this connection serves `role`.
    pub(crate) fn serves(&self, role: ServerRole) -> bool {
        self.roles.contains(&role)
    }

    fn max_frame_size(&self) -> usize {
        self.state.config.limits.max_frame_size
    }

    fn allocate_request_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if self.next_request_id == UNKNOWN_MESSAGE_ID {
            self.next_request_id = 1;
        }
        self.next_request_id
    }

    async fn on_message<W>(&mut self, writer: &mut W, msg: WireMessage) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        match msg.kind {
            WireMessageKind::Request(request) => {
                debug!(conn = %self.id, id = msg.id, method = request.method(), "Request");
                match self.handle_request(msg.id, request) {
                    Some(response) => self.respond(writer, msg.id, response).await,
                    None => Ok(()),
                }
            }
            WireMessageKind::Response(response) => {
                match self.pending.remove(&msg.id) {
                    Some(reply) => {
                        let _ = reply.send(response);
                    }
                    None => debug!(conn = %self.id, id = msg.id, "Response to no pending request"),
                }
                Ok(())
            }
        }
    }

    async fn on_event<W>(&mut self, writer: &mut W, event: PeerEvent) -> Result<Option<Ending>, WireError>
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            PeerEvent::Request { request, reply } => {
                self.forward_request(writer, request, reply).await?;
                Ok(None)
            }
            PeerEvent::Respond { id, response } => {
                self.respond(writer, id, response).await?;
                Ok(None)
            }
            PeerEvent::Close(reason) => Ok(Some(Ending::Evicted(reason))),
        }
    }

    /// Write a response, replacing it with an internal error if it does not fit a frame.
    async fn respond<W>(&self, writer: &mut W, id: u32, response: WireResponse) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let max = self.max_frame_size();
        match write_message(writer, &WireMessage::response(id, response), max).await {
            Err(WireError::Frame(FrameError::TooLarge { size, .. })) => {
                warn!(conn = %self.id, id, size, "Response exceeds the frame limit");
                let fallback = WireResponse::error(Status::ErrorInternal, "response too large");
                write_message(writer, &WireMessage::response(id, fallback), max).await
            }
            other => other,
        }
    }

    /// Send a node-originated request to the client and remember where its response goes.
    async fn forward_request<W>(
        &mut self,
        writer: &mut W,
        request: WireRequest,
        reply: oneshot::Sender<WireResponse>,
    ) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        let id = self.allocate_request_id();
        let max = self.max_frame_size();
        match write_message(writer, &WireMessage::request(id, request), max).await {
            Ok(()) => {
                self.pending.insert(id, reply);
                Ok(())
            }
            Err(WireError::Frame(FrameError::TooLarge { size, .. })) => {
                debug!(conn = %self.id, size, "Notification exceeds the frame limit");
                let _ = reply.send(WireResponse::error(Status::ErrorInvalidValue, "message"));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Serve one accepted (and, for encrypted roles, TLS-established) stream.
pub(crate) async fn run_connection<S>(
    stream: S,
    id: ConnectionId,
    peer: SocketAddr,
    roles: Arc<[ServerRole]>,
    state: Arc<NodeState>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let limits = &state.config.limits;
    let idle = Duration::from_secs(limits.idle_timeout_secs);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let mut reader_task = tokio::spawn(read_loop(reader, inbound_tx, limits.max_frame_size, idle));

    let (own_mailbox, mut mailbox_rx) = mailbox();
    let mut shutdown = state.supervisor.subscribe();
    let mut conn = Connection::new(id, peer, roles, state.clone(), own_mailbox);
    info!(%id, %peer, roles = ?conn.roles, "Connection opened");

    let ending = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(Inbound::Message(msg)) => {
                    if let Err(e) = conn.on_message(&mut writer, msg).await {
                        break Ending::WriteFailed(e);
                    }
                }
                Some(Inbound::Violation { id, reason }) => break Ending::Violation { id, reason },
                Some(Inbound::IdleTimeout) => break Ending::IdleTimeout,
                Some(Inbound::Closed) | None => break Ending::PeerClosed,
            },
            Some(event) = mailbox_rx.recv() => match conn.on_event(&mut writer, event).await {
                Ok(None) => {}
                Ok(Some(ending)) => break ending,
                Err(e) => break Ending::WriteFailed(e),
            },
            Some(joined) = conn.deferred.join_next(), if !conn.deferred.is_empty() => match joined {
                Ok(done) => {
                    if done.bind_failed {
                        conn.relay_token = None;
                    }
                    if let Err(e) = conn.respond(&mut writer, done.request_id, done.response).await {
                        break Ending::WriteFailed(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(%id, error = %e, "Deferred request handler failed"),
            },
            _ = shutdown.changed() => break Ending::Shutdown,
        }
    };

    if let Ending::Violation { id: request_id, reason } = &ending {
        warn!(%id, %peer, %reason, "Protocol violation, closing connection");
        state.supervisor.record_violation();
        let response = WireResponse::error(Status::ErrorProtocolViolation, reason.clone());
        let _ = conn.respond(&mut writer, *request_id, response).await;
        let _ = writer.shutdown().await;
        // The reader drains what the peer already sent so the response is not lost to a reset.
        let _ = tokio::time::timeout(VIOLATION_DRAIN, &mut reader_task).await;
    }

    reader_task.abort();
    conn.deferred.abort_all();
    state.relay.connection_closed(id);
    info!(%id, %peer, reason = %ending, "Connection closed");
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Inbound>, max_frame_size: usize, idle: Duration)
where
    R: AsyncRead + Unpin,
{
    loop {
        let inbound = match tokio::time::timeout(idle, read_frame(&mut reader, max_frame_size)).await {
            Err(_) => Inbound::IdleTimeout,
            Ok(Ok(body)) => match decode_message(&body) {
                Ok(msg) => Inbound::Message(msg),
                Err(e) => Inbound::Violation {
                    id: peek_message_id(&body).unwrap_or(UNKNOWN_MESSAGE_ID),
                    reason: format!("malformed message: {e}"),
                },
            },
            Ok(Err(e)) if e.is_protocol_violation() => Inbound::Violation {
                id: UNKNOWN_MESSAGE_ID,
                reason: e.to_string(),
            },
            Ok(Err(_)) => Inbound::Closed,
        };

        let keep_reading = matches!(inbound, Inbound::Message(_));
        let violation = matches!(inbound, Inbound::Violation { .. });
        if tx.send(inbound).await.is_err() {
            return;
        }
        if violation {
            drain(&mut reader).await;
        }
        if !keep_reading {
            return;
        }
    }
}

async fn drain<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = vec![0u8; 16 * 1024];
    let deadline = Instant::now() + VIOLATION_DRAIN;
    while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, reader.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use waypost_wire::frame::{encode_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};

    fn inbound_channel() -> (mpsc::Sender<Inbound>, mpsc::Receiver<Inbound>) {
        mpsc::channel(INBOUND_QUEUE)
    }

    #[tokio::test]
    async fn test_reader_yields_messages_then_closed() {
        let (mut client, server) = duplex(4096);
        let (tx, mut rx) = inbound_channel();
        tokio::spawn(read_loop(server, tx, DEFAULT_MAX_FRAME_SIZE, Duration::from_secs(5)));

        let msg = WireMessage::request(3, WireRequest::ListRoles);
        let body = serde_json::to_vec(&msg).unwrap();
        write_frame(&mut client, &body, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        drop(client);

        match rx.recv().await {
            Some(Inbound::Message(m)) => assert_eq!(m, msg),
            other => panic!("Expected message, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(Inbound::Closed)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_malformed_body_with_its_id() {
        let (mut client, server) = duplex(4096);
        let (tx, mut rx) = inbound_channel();
        tokio::spawn(read_loop(server, tx, DEFAULT_MAX_FRAME_SIZE, Duration::from_secs(5)));

        let body = br#"{"id":41,"type":"request","method":"teleport"}"#;
        let frame = encode_frame(body, DEFAULT_MAX_FRAME_SIZE).unwrap();
        client.write_all(&frame).await.unwrap();

        match rx.recv().await {
            Some(Inbound::Violation { id, .. }) => assert_eq!(id, 41),
            other => panic!("Expected violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_reports_oversize_frame() {
        let (mut client, server) = duplex(4096);
        let (tx, mut rx) = inbound_channel();
        tokio::spawn(read_loop(server, tx, 64, Duration::from_secs(5)));

        client.write_all(&[0x0D, 0xFF, 0, 0, 0]).await.unwrap();
        match rx.recv().await {
            Some(Inbound::Violation { id, .. }) => assert_eq!(id, UNKNOWN_MESSAGE_ID),
            other => panic!("Expected violation, got {other:?}"),
        }
        // The reader keeps swallowing input instead of reporting it.
        client.write_all(&[0u8; 512]).await.unwrap();
        drop(client);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_idle_timeout() {
        let (_client, server) = duplex(64);
        let (tx, mut rx) = inbound_channel();
        tokio::spawn(read_loop(server, tx, DEFAULT_MAX_FRAME_SIZE, Duration::from_millis(50)));
        assert!(matches!(rx.recv().await, Some(Inbound::IdleTimeout)));
    }
}
