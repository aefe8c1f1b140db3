//! Relay registry and pairing lifecycle.
//!
//! A call goes through three states:
//!
//! 1. **AwaitingCallee**: tokens are minted and the callee's session has been
//!    sent an incoming-call notification.
//! 2. **AwaitingBind**: the callee accepted and the caller holds its token.
//!    Each side opens an application-service connection and binds its token.
//! 3. **Active**: both sides are bound and messages flow through one
//!    forwarder per direction.
//!
//! All registry state sits behind one mutex that is only held for lookups
//! and mutations, never across an await. Closing any bound connection tears
//! the pairing down and closes the surviving side.

use crate::forward::{run_forwarder, Outgoing, OutgoingQueue};
use crate::mailbox::{CloseReason, ConnectionId, Mailbox, PeerEvent};
use crate::token::RelayToken;
use crate::RelayError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use waypost_types::config::LimitsConfig;
use waypost_types::identity::IdentityId;
use waypost_wire::message::{Status, WireRequest};

/// Process-unique pairing id, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairingId(u64);

impl fmt::Display for PairingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pairing-{}", self.0)
    }
}

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Unacknowledged messages allowed in flight per direction. The same
    /// number may wait in the sender's queue; sends past that are refused.
    pub max_outstanding_messages: usize,
    /// How long a callee has to answer an incoming call.
    pub incoming_call_timeout: Duration,
    /// How long both sides have to bind after the callee accepts.
    pub bind_timeout: Duration,
}

impl From<&LimitsConfig> for RelayLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_outstanding_messages: limits.max_outstanding_relay_messages.max(1),
            incoming_call_timeout: Duration::from_secs(limits.incoming_call_timeout_secs),
            bind_timeout: Duration::from_secs(limits.relay_bind_timeout_secs),
        }
    }
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller = 0,
    Callee = 1,
}

impl Side {
    fn index(self) -> usize {
        self as usize
    }

    fn other(self) -> Side {
        match self {
            Side::Caller => Side::Callee,
            Side::Callee => Side::Caller,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Caller => f.write_str("caller"),
            Side::Callee => f.write_str("callee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingState {
    AwaitingCallee,
    AwaitingBind,
    Active,
}

struct Binding {
    conn: ConnectionId,
    mailbox: Mailbox,
    /// Set once the pairing is active.
    queue: Option<OutgoingQueue>,
    /// Resolves the deferred bind response when the other side binds.
    pending: Option<oneshot::Sender<()>>,
}

struct SideSlot {
    token: RelayToken,
    binding: Option<Binding>,
}

struct Pairing {
    state: PairingState,
    callee: IdentityId,
    sides: [SideSlot; 2],
    /// One semaphore per sending direction, indexed by the sending side.
    permits: [Arc<Semaphore>; 2],
}

impl Pairing {
    fn side(&self, side: Side) -> &SideSlot {
        &self.sides[side.index()]
    }

    fn side_mut(&mut self, side: Side) -> &mut SideSlot {
        &mut self.sides[side.index()]
    }

    fn is_bound_on(&self, conn: ConnectionId) -> bool {
        self.sides
            .iter()
            .any(|s| s.binding.as_ref().is_some_and(|b| b.conn == conn))
    }
}

struct LiveSession {
    conn: ConnectionId,
    mailbox: Mailbox,
    /// Application services offered by the identity on this session.
    services: BTreeSet<String>,
}

#[derive(Default)]
struct Registry {
    next_pairing: u64,
    sessions: HashMap<IdentityId, LiveSession>,
    tokens: HashMap<RelayToken, (PairingId, Side)>,
    pairings: HashMap<PairingId, Pairing>,
    /// The one pairing per callee whose callee side has not bound yet.
    callee_slots: HashMap<IdentityId, PairingId>,
}

/// Result of binding a token.
#[derive(Debug)]
pub enum BindOutcome {
    /// Both sides are bound; the connection may send right away.
    Active,
    /// The other side has not bound yet.
    Pending(PendingBind),
}

/// A bind waiting for the other side.
#[derive(Debug)]
pub struct PendingBind {
    rx: oneshot::Receiver<()>,
}

impl PendingBind {
    /// Wait until the pairing becomes active.
    ///
    /// Fails with [`RelayError::NotFound`] when the pairing is torn down first.
    pub async fn wait(self) -> Result<(), RelayError> {
        self.rx.await.map_err(|_| RelayError::NotFound)
    }
}

/// Tears a pairing down on drop unless disarmed.
struct PairingGuard<'a> {
    engine: &'a RelayEngine,
    pairing: PairingId,
    armed: bool,
}

impl PairingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PairingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine.tear_down(self.pairing, None);
        }
    }
}

/// Shared call-relay engine. Cheap to clone.
#[derive(Clone)]
pub struct RelayEngine {
    registry: Arc<Mutex<Registry>>,
    limits: RelayLimits,
}

impl RelayEngine {
    /// Create an empty engine.
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            limits,
        }
    }

    /// Relay tunables in force.
    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Live sessions
    // -----------------------------------------------------------------------

    /// Record `conn` as the live session of `identity`.
    ///
    /// An older session of the same identity on another connection is told
    /// to close.
    pub fn register_session(&self, identity: IdentityId, conn: ConnectionId, mailbox: Mailbox) {
        let previous = self
            .registry()
            .sessions
            .insert(
                identity,
                LiveSession {
                    conn,
                    mailbox,
                    services: BTreeSet::new(),
                },
            );
        if let Some(previous) = previous {
            if previous.conn != conn {
                info!(%identity, old = %previous.conn, new = %conn, "Session superseded");
                let _ = previous
                    .mailbox
                    .send(PeerEvent::Close(CloseReason::Superseded));
            }
        }
    }

    /// Forget the live session of `identity` if it still belongs to `conn`.
    pub fn unregister_session(&self, identity: &IdentityId, conn: ConnectionId) {
        let mut reg = self.registry();
        if reg.sessions.get(identity).is_some_and(|s| s.conn == conn) {
            reg.sessions.remove(identity);
        }
    }

    /// Whether `identity` has a live session.
    pub fn is_online(&self, identity: &IdentityId) -> bool {
        self.registry().sessions.contains_key(identity)
    }

    /// Identities with a live session.
    pub fn online_identities(&self) -> HashSet<IdentityId> {
        self.registry().sessions.keys().copied().collect()
    }

    /// Add `names` to the services of the session of `identity` on `conn`.
    ///
    /// The union is all-or-nothing: if it would exceed `max` nothing is added.
    pub fn add_services(
        &self,
        identity: &IdentityId,
        conn: ConnectionId,
        names: &[String],
        max: usize,
    ) -> Result<(), RelayError> {
        let mut reg = self.registry();
        let session = Self::own_session(&mut reg, identity, conn)?;
        let added = names
            .iter()
            .filter(|n| !session.services.contains(*n))
            .collect::<BTreeSet<_>>()
            .len();
        if session.services.len() + added > max {
            return Err(RelayError::QuotaExceeded(format!(
                "at most {max} application services"
            )));
        }
        session.services.extend(names.iter().cloned());
        Ok(())
    }

    /// Remove one service from the session of `identity` on `conn`.
    pub fn remove_service(
        &self,
        identity: &IdentityId,
        conn: ConnectionId,
        name: &str,
    ) -> Result<(), RelayError> {
        let mut reg = self.registry();
        let session = Self::own_session(&mut reg, identity, conn)?;
        if session.services.remove(name) {
            Ok(())
        } else {
            Err(RelayError::UnknownService)
        }
    }

    /// Services offered by the live session of `identity`, sorted.
    pub fn services(&self, identity: &IdentityId) -> Option<Vec<String>> {
        self.registry()
            .sessions
            .get(identity)
            .map(|s| s.services.iter().cloned().collect())
    }

    fn own_session<'r>(
        reg: &'r mut Registry,
        identity: &IdentityId,
        conn: ConnectionId,
    ) -> Result<&'r mut LiveSession, RelayError> {
        reg.sessions
            .get_mut(identity)
            .filter(|s| s.conn == conn)
            .ok_or_else(|| RelayError::NotAvailable("session is no longer live".into()))
    }

    /// Number of pairings in any state.
    pub fn pairing_count(&self) -> usize {
        self.registry().pairings.len()
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Call `service_name` of `callee` on behalf of the identity holding
    /// `caller_public_key`. Returns the caller's token once the callee accepts.
    pub async fn call(
        &self,
        caller_public_key: &[u8],
        callee: IdentityId,
        service_name: &str,
    ) -> Result<RelayToken, RelayError> {
        let (pairing, callee_token, caller_token, callee_mailbox) =
            self.open_pairing(callee, service_name)?;
        let guard = PairingGuard {
            engine: self,
            pairing,
            armed: true,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let notification = PeerEvent::Request {
            request: WireRequest::IncomingCallNotification {
                caller_public_key: caller_public_key.to_vec(),
                service_name: service_name.to_string(),
                callee_token: callee_token.to_vec(),
            },
            reply: reply_tx,
        };
        if callee_mailbox.send(notification).is_err() {
            return Err(RelayError::NotAvailable("callee session closed".into()));
        }

        let answer = tokio::time::timeout(self.limits.incoming_call_timeout, reply_rx).await;
        match answer {
            Ok(Ok(resp)) if resp.status.is_ok() => {}
            Ok(Ok(resp)) if resp.status == Status::ErrorRejected => {
                debug!(%pairing, "Callee rejected call");
                return Err(RelayError::Rejected);
            }
            Ok(Ok(resp)) => {
                debug!(%pairing, status = ?resp.status, "Callee refused call");
                return Err(RelayError::NotAvailable(
                    "callee did not accept the call".into(),
                ));
            }
            Ok(Err(_)) => {
                return Err(RelayError::NotAvailable("callee session closed".into()));
            }
            Err(_) => {
                debug!(%pairing, "Callee did not answer in time");
                return Err(RelayError::NotAvailable("callee did not answer".into()));
            }
        }

        {
            let mut reg = self.registry();
            let Some(p) = reg.pairings.get_mut(&pairing) else {
                // Superseded while the callee was answering.
                return Err(RelayError::NotAvailable("call was superseded".into()));
            };
            if p.state == PairingState::AwaitingCallee {
                p.state = PairingState::AwaitingBind;
            }
        }
        guard.disarm();

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.limits.bind_timeout).await;
            engine.expire_unbound(pairing);
        });

        info!(%pairing, %callee, service = service_name, "Call accepted");
        Ok(caller_token)
    }

    fn open_pairing(
        &self,
        callee: IdentityId,
        service_name: &str,
    ) -> Result<(PairingId, RelayToken, RelayToken, Mailbox), RelayError> {
        let mut reg = self.registry();
        let session = reg
            .sessions
            .get(&callee)
            .ok_or_else(|| RelayError::NotAvailable("callee is not online".into()))?;
        if !session.services.contains(service_name) {
            return Err(RelayError::NotAvailable(
                "callee does not offer the service".into(),
            ));
        }
        let mailbox = session.mailbox.clone();

        reg.next_pairing += 1;
        let pairing = PairingId(reg.next_pairing);
        let caller_token = RelayToken::generate();
        let callee_token = RelayToken::generate();
        let permits = self.limits.max_outstanding_messages;

        reg.tokens.insert(caller_token, (pairing, Side::Caller));
        reg.tokens.insert(callee_token, (pairing, Side::Callee));
        reg.pairings.insert(
            pairing,
            Pairing {
                state: PairingState::AwaitingCallee,
                callee,
                sides: [
                    SideSlot {
                        token: caller_token,
                        binding: None,
                    },
                    SideSlot {
                        token: callee_token,
                        binding: None,
                    },
                ],
                permits: [
                    Arc::new(Semaphore::new(permits)),
                    Arc::new(Semaphore::new(permits)),
                ],
            },
        );

        // One unbound callee slot per identity: the newer call wins.
        if let Some(old) = reg.callee_slots.insert(callee, pairing) {
            info!(old = %old, new = %pairing, %callee, "Superseding unbound call");
            Self::remove_pairing(&mut reg, old, None);
        }

        debug!(%pairing, %callee, "Pairing opened");
        Ok((pairing, callee_token, caller_token, mailbox))
    }

    fn expire_unbound(&self, pairing: PairingId) {
        let expired = self
            .registry()
            .pairings
            .get(&pairing)
            .is_some_and(|p| p.state != PairingState::Active);
        if expired {
            warn!(%pairing, "Relay bind timed out");
            self.tear_down(pairing, None);
        }
    }

    // -----------------------------------------------------------------------
    // Binding and sending
    // -----------------------------------------------------------------------

    /// Bind `token` to the application-service connection `conn`.
    pub fn bind(
        &self,
        token: &RelayToken,
        conn: ConnectionId,
        mailbox: Mailbox,
    ) -> Result<BindOutcome, RelayError> {
        let mut reg = self.registry();
        let (pairing_id, side) = *reg.tokens.get(token).ok_or(RelayError::NotFound)?;
        let pairing = reg
            .pairings
            .get_mut(&pairing_id)
            .ok_or(RelayError::NotFound)?;

        if pairing.side(side).binding.is_some() {
            return Err(RelayError::NotFound);
        }
        // The caller only learns its token after the callee accepted.
        if side == Side::Caller && pairing.state == PairingState::AwaitingCallee {
            return Err(RelayError::NotFound);
        }

        let other_bound = pairing.side(side.other()).binding.is_some();
        if !other_bound {
            let (tx, rx) = oneshot::channel();
            pairing.side_mut(side).binding = Some(Binding {
                conn,
                mailbox,
                queue: None,
                pending: Some(tx),
            });
            let callee = pairing.callee;
            if side == Side::Callee && reg.callee_slots.get(&callee) == Some(&pairing_id) {
                reg.callee_slots.remove(&callee);
            }
            debug!(pairing = %pairing_id, %side, %conn, "Side bound, waiting for peer");
            return Ok(BindOutcome::Pending(PendingBind { rx }));
        }

        pairing.side_mut(side).binding = Some(Binding {
            conn,
            mailbox,
            queue: None,
            pending: None,
        });
        pairing.state = PairingState::Active;
        for s in [Side::Caller, Side::Callee] {
            let capacity = self.limits.max_outstanding_messages.max(1);
            let (queue_tx, queue_rx) = mpsc::channel::<Outgoing>(capacity);
            let permits = pairing.permits[s.index()].clone();
            let to = match &pairing.side(s.other()).binding {
                Some(b) => b.mailbox.clone(),
                None => continue,
            };
            if let Some(binding) = pairing.side_mut(s).binding.as_mut() {
                binding.queue = Some(queue_tx);
                if let Some(pending) = binding.pending.take() {
                    let _ = pending.send(());
                }
                tokio::spawn(run_forwarder(
                    pairing_id,
                    queue_rx,
                    permits,
                    binding.mailbox.clone(),
                    to,
                ));
            }
        }
        let callee = pairing.callee;
        if side == Side::Callee && reg.callee_slots.get(&callee) == Some(&pairing_id) {
            reg.callee_slots.remove(&callee);
        }
        info!(pairing = %pairing_id, "Relay pairing active");
        Ok(BindOutcome::Active)
    }

    /// Queue `message` from the side bound to `conn` for its peer.
    ///
    /// The response to request `request_id` is posted to the sender's mailbox
    /// once the peer acknowledges.
    pub fn send_message(
        &self,
        conn: ConnectionId,
        token: &RelayToken,
        request_id: u32,
        message: Vec<u8>,
    ) -> Result<(), RelayError> {
        let reg = self.registry();
        let (pairing_id, side) = *reg.tokens.get(token).ok_or(RelayError::NotFound)?;
        let pairing = reg.pairings.get(&pairing_id).ok_or(RelayError::NotFound)?;
        if pairing.state != PairingState::Active {
            return Err(RelayError::NotFound);
        }
        let binding = pairing
            .side(side)
            .binding
            .as_ref()
            .filter(|b| b.conn == conn)
            .ok_or(RelayError::NotFound)?;
        let queue = binding.queue.as_ref().ok_or(RelayError::NotFound)?;
        match queue.try_send(Outgoing {
            request_id,
            message,
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(pairing = %pairing_id, %side, %conn, "Relay queue full");
                Err(RelayError::QuotaExceeded("too many unconfirmed messages".into()))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::NotFound),
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Drop everything `conn` took part in: its live session and any
    /// pairing it is bound to.
    pub fn connection_closed(&self, conn: ConnectionId) {
        let mut reg = self.registry();
        reg.sessions.retain(|_, s| s.conn != conn);
        let bound: Vec<PairingId> = reg
            .pairings
            .iter()
            .filter(|(_, p)| p.is_bound_on(conn))
            .map(|(id, _)| *id)
            .collect();
        for pairing in bound {
            debug!(%pairing, %conn, "Bound connection closed");
            Self::remove_pairing(&mut reg, pairing, Some(conn));
        }
    }

    fn tear_down(&self, pairing: PairingId, closed: Option<ConnectionId>) {
        let mut reg = self.registry();
        Self::remove_pairing(&mut reg, pairing, closed);
    }

    /// Remove a pairing and everything that refers to it.
    ///
    /// Surviving bound sides of an active pairing are told to close. A side
    /// still waiting for its peer gets its pending bind failed instead.
    fn remove_pairing(reg: &mut Registry, id: PairingId, closed: Option<ConnectionId>) {
        let Some(pairing) = reg.pairings.remove(&id) else {
            return;
        };
        for slot in &pairing.sides {
            reg.tokens.remove(&slot.token);
        }
        if reg.callee_slots.get(&pairing.callee) == Some(&id) {
            reg.callee_slots.remove(&pairing.callee);
        }
        for permits in &pairing.permits {
            permits.close();
        }
        let was_active = pairing.state == PairingState::Active;
        for binding in pairing.sides.into_iter().filter_map(|s| s.binding) {
            if Some(binding.conn) == closed {
                continue;
            }
            if was_active {
                let _ = binding.mailbox.send(PeerEvent::Close(CloseReason::PeerClosed));
            }
        }
        info!(pairing = %id, "Relay pairing torn down");
    }
}

impl fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry();
        f.debug_struct("RelayEngine")
            .field("sessions", &reg.sessions.len())
            .field("pairings", &reg.pairings.len())
            .finish()
    }
}
