//! Connection mailboxes.
//!
//! Every connection task owns the receiving end of a mailbox. The relay
//! engine and deferred request handlers post [`PeerEvent`]s into it and never
//! touch the connection's state directly.

use std::fmt;
use tokio::sync::{mpsc, oneshot};
use waypost_wire::message::{WireRequest, WireResponse};

/// Process-unique id of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why the engine asks a connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection checked in with the same identity.
    Superseded,
    /// The other side of the relay pairing went away.
    PeerClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Superseded => f.write_str("superseded by a newer session"),
            CloseReason::PeerClosed => f.write_str("relay peer closed"),
        }
    }
}

/// An event for a connection task.
#[derive(Debug)]
pub enum PeerEvent {
    /// Send `request` to the client. The client's response goes to `reply`;
    /// dropping `reply` unanswered tells the poster the connection is gone.
    Request {
        request: WireRequest,
        reply: oneshot::Sender<WireResponse>,
    },
    /// Send a response to an earlier client request.
    Respond { id: u32, response: WireResponse },
    /// Close the connection without a response.
    Close(CloseReason),
}

/// Posting end of a connection mailbox.
///
/// Unbounded: relay deliveries into a mailbox are already capped by the
/// per-direction semaphores.
pub type Mailbox = mpsc::UnboundedSender<PeerEvent>;

/// Receiving end of a connection mailbox.
pub type MailboxReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Create a new mailbox pair.
pub fn mailbox() -> (Mailbox, MailboxReceiver) {
    mpsc::unbounded_channel()
}
