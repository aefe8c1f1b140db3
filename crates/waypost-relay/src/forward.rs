//! Ordered, acknowledged forwarding for one side of a pairing.
//!
//! Each bound side gets a bounded queue and a forwarder task. The forwarder takes
//! messages in the order the side sent them, waits for a flow-control permit,
//! and posts a receive notification to the peer's mailbox. A detached waiter
//! holds the permit until the peer acknowledges, then answers the original
//! send request with the peer's status.

use crate::engine::PairingId;
use crate::mailbox::{Mailbox, PeerEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;
use waypost_wire::message::{WireRequest, WireResponse};

/// A message waiting to be relayed.
#[derive(Debug)]
pub struct Outgoing {
    /// Id of the sender's request, answered once the peer acknowledges.
    pub request_id: u32,
    pub message: Vec<u8>,
}

/// Queue feeding a forwarder. Sends beyond its capacity are refused, not buffered.
pub type OutgoingQueue = mpsc::Sender<Outgoing>;

/// Relay `queue` from `from` to `to` until the queue or the permits close.
pub async fn run_forwarder(
    pairing: PairingId,
    mut queue: mpsc::Receiver<Outgoing>,
    permits: Arc<Semaphore>,
    from: Mailbox,
    to: Mailbox,
) {
    while let Some(out) = queue.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let delivered = to.send(PeerEvent::Request {
            request: WireRequest::ApplicationServiceReceiveMessageNotification {
                message: out.message,
            },
            reply: reply_tx,
        });
        if delivered.is_err() {
            debug!(%pairing, "Relay peer mailbox closed");
            break;
        }

        let from = from.clone();
        let request_id = out.request_id;
        tokio::spawn(async move {
            let ack = reply_rx.await;
            drop(permit);
            // No ack means the peer connection is gone and the pairing is being torn down.
            if let Ok(ack) = ack {
                let response = if ack.status.is_ok() {
                    WireResponse::ok()
                } else {
                    WireResponse::error(ack.status, ack.details)
                };
                let _ = from.send(PeerEvent::Respond {
                    id: request_id,
                    response,
                });
            }
        });
    }
    debug!(%pairing, "Forwarder stopped");
}
