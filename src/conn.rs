//! Connections — the per-client actor.
//!
//! A connection attaches to an endpoint in the `Unconnected` state,
//! becomes `Active` through [`Connection::hello`] (or `Starter` through
//! [`Connection::register_starter`]), and ends `Disconnected` — a
//! terminal, one-shot transition that flushes the queue, releases every
//! owned name, and wakes all blocked receivers.
//!
//! Each connection serializes its own queue, owned-name set, and
//! pending-reply table behind its own mutex, independent of the bus-wide
//! lock; unrelated connections send and receive without contending on
//! bus state. Lock order is always bus → endpoint → connection.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::bus::Bus;
use crate::config::Limits;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{Body, Destination, Envelope, MessageFlags, MessageSpec, SRC_ID_BUS};
use crate::name::{validate_name, NameFlags};
use crate::notify::{self, IdEvent};
use crate::policy::{PolicyCheck, Verb};
use crate::registry::{AcquireOutcome, NameInfo};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, handshake not yet performed.
    Unconnected,
    /// Participating on the bus.
    Active,
    /// Placeholder for an activatable, not-yet-running service.
    Starter,
    /// Terminal; every further operation fails `ConnectionGone`.
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct PendingReply {
    cookie: u64,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnInner {
    state: ConnState,
    queue: VecDeque<Arc<Envelope>>,
    names: BTreeSet<String>,
    names_queued: BTreeSet<String>,
    pending_replies: HashMap<u64, PendingReply>,
    name_watches: BTreeSet<String>,
    watch_ids: bool,
}

/// One client's session on a bus endpoint.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    uid: u32,
    bus: Weak<Bus>,
    endpoint: Weak<Endpoint>,
    limits: Limits,
    signal: Notify,
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        uid: u32,
        bus: &Arc<Bus>,
        endpoint: &Arc<Endpoint>,
        limits: Limits,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            uid,
            bus: Arc::downgrade(bus),
            endpoint: Arc::downgrade(endpoint),
            limits,
            signal: Notify::new(),
            inner: Mutex::new(ConnInner {
                state: ConnState::Unconnected,
                queue: VecDeque::new(),
                names: BTreeSet::new(),
                names_queued: BTreeSet::new(),
                pending_replies: HashMap::new(),
                name_watches: BTreeSet::new(),
                watch_ids: false,
            }),
        })
    }

    /// Connection id, unique for the bus's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Uid the connection attached with.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// Number of envelopes waiting in the inbound queue.
    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of sent messages still awaiting a reply.
    pub fn pending_reply_count(&self) -> usize {
        self.lock().pending_replies.len()
    }

    fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bus(&self) -> Result<Arc<Bus>> {
        self.bus.upgrade().ok_or(Error::ConnectionGone(self.id))
    }

    fn endpoint_arc(&self) -> Result<Arc<Endpoint>> {
        self.endpoint
            .upgrade()
            .ok_or(Error::ConnectionGone(self.id))
    }

    // ── Handshake ──

    /// Activate the connection (the Hello handshake).
    ///
    /// Idempotent-rejecting: a second hello fails with `AlreadyExists`.
    pub fn hello(&self) -> Result<()> {
        let bus = self.bus()?;
        let state = bus.lock_state();
        if state.disconnected {
            return Err(Error::ConnectionGone(self.id));
        }
        {
            let mut inner = self.lock();
            match inner.state {
                ConnState::Unconnected => inner.state = ConnState::Active,
                ConnState::Active | ConnState::Starter => {
                    return Err(Error::already_exists("connection", self.id.to_string()))
                }
                ConnState::Disconnected => return Err(Error::ConnectionGone(self.id)),
            }
        }
        debug!(conn = self.id, uid = self.uid, "connection active");
        bus.notify_id_change(&state, self.id, IdEvent::Added);
        Ok(())
    }

    /// Register the connection as a starter for `name`.
    ///
    /// The connection transitions `Unconnected` → `Starter` and acquires
    /// the name with `ALLOW_REPLACEMENT` forced, so the real service can
    /// take over with `REPLACE_EXISTING`. Starters cannot send, cannot
    /// hello, and never consume their queue; it parks messages until the
    /// replacing service inherits them.
    pub fn register_starter(self: &Arc<Self>, name: &str) -> Result<()> {
        validate_name(name)?;
        let ep = self.endpoint_arc()?;
        ep.enforce(PolicyCheck {
            uid: self.uid,
            peer_uid: None,
            name: Some(name),
            verb: Verb::Own,
        })?;
        let bus = self.bus()?;
        let mut state = bus.lock_state();
        if state.disconnected {
            return Err(Error::ConnectionGone(self.id));
        }
        {
            let inner = self.lock();
            match inner.state {
                ConnState::Unconnected => {}
                ConnState::Active | ConnState::Starter => {
                    return Err(Error::already_exists("connection", self.id.to_string()))
                }
                ConnState::Disconnected => return Err(Error::ConnectionGone(self.id)),
            }
        }
        let changes = {
            let crate::bus::BusState {
                registry, conns, ..
            } = &mut *state;
            let (_, changes) = registry.acquire(
                conns,
                self,
                name,
                NameFlags::ALLOW_REPLACEMENT | NameFlags::QUEUE,
            )?;
            changes
        };
        // The state flips only once the name is held; a failed acquire
        // leaves the connection unconnected and free to retry or hello.
        self.lock().state = ConnState::Starter;
        debug!(conn = self.id, name, "starter registered");
        bus.notify_owner_changes(&state, &changes);
        Ok(())
    }

    // ── Send / receive ──

    /// Send a message.
    ///
    /// Resolves the destination (id, well-known name, or broadcast),
    /// passes the destination endpoint's policy gate, assigns a message
    /// id, and appends to the destination queue. Never blocks on
    /// delivery. A message carrying a deadline registers a pending-reply
    /// entry on the sender before the envelope is enqueued.
    ///
    /// Returns the assigned message id.
    pub fn send(self: &Arc<Self>, spec: MessageSpec) -> Result<u64> {
        let bus = self.bus()?;
        if self.lock().state != ConnState::Active {
            return Err(Error::ConnectionGone(self.id));
        }
        match spec.destination {
            Destination::Broadcast => self.send_broadcast(&bus, spec),
            Destination::Id(_) | Destination::Name(_) => self.send_direct(&bus, spec),
        }
    }

    fn send_direct(self: &Arc<Self>, bus: &Arc<Bus>, spec: MessageSpec) -> Result<u64> {
        let (dest, named) = {
            let state = bus.lock_state();
            if state.disconnected {
                return Err(Error::ConnectionGone(self.id));
            }
            match &spec.destination {
                Destination::Id(id) => {
                    let dest = state
                        .conns
                        .get(id)
                        .ok_or_else(|| Error::not_found("connection", id.to_string()))?;
                    if !matches!(dest.state(), ConnState::Active | ConnState::Starter) {
                        return Err(Error::not_found("connection", id.to_string()));
                    }
                    (Arc::clone(dest), None)
                }
                Destination::Name(name) => {
                    validate_name(name)?;
                    let owner = state
                        .registry
                        .owner_of(name)
                        .ok_or_else(|| Error::not_found("name", name.clone()))?;
                    let dest = state
                        .conns
                        .get(&owner)
                        .ok_or_else(|| Error::not_found("name", name.clone()))?;
                    if dest.is_starter() && spec.flags.contains(MessageFlags::NO_AUTO_START) {
                        // The name is only held by an activation
                        // placeholder and the sender opted out.
                        return Err(Error::not_found("name", name.clone()));
                    }
                    (Arc::clone(dest), Some(name.clone()))
                }
                Destination::Broadcast => unreachable!("broadcast is handled by send()"),
            }
        };

        let ep = dest.endpoint_arc().map_err(|_| match &spec.destination {
            Destination::Name(name) => Error::not_found("name", name.clone()),
            _ => Error::not_found("connection", dest.id.to_string()),
        })?;
        ep.enforce(PolicyCheck {
            uid: self.uid,
            peer_uid: Some(dest.uid),
            name: named.as_deref(),
            verb: Verb::Send,
        })?;

        let mut flags = spec.flags;
        if spec.deadline.is_some() {
            flags |= MessageFlags::EXPECT_REPLY;
        }
        let env = Arc::new(Envelope {
            id: bus.next_msg_id(),
            src_id: self.id,
            destination: spec.destination,
            cookie: spec.cookie,
            cookie_reply: spec.cookie_reply,
            flags,
            deadline: spec.deadline,
            body: Body::User(spec.payload),
        });

        if let Some(deadline) = env.deadline {
            self.lock().pending_replies.insert(
                env.id,
                PendingReply {
                    cookie: env.cookie,
                    deadline,
                },
            );
        }
        if let Err(e) = dest.push_envelope(&env) {
            self.lock().pending_replies.remove(&env.id);
            return Err(match e {
                Error::ConnectionGone(id) => Error::not_found("connection", id.to_string()),
                other => other,
            });
        }
        trace!(msg = env.id, src = self.id, dst = dest.id, "message queued");
        Ok(env.id)
    }

    fn send_broadcast(self: &Arc<Self>, bus: &Arc<Bus>, spec: MessageSpec) -> Result<u64> {
        let targets: Vec<Arc<Connection>> = {
            let state = bus.lock_state();
            if state.disconnected {
                return Err(Error::ConnectionGone(self.id));
            }
            state
                .conns
                .values()
                .filter(|c| c.id != self.id && c.state() == ConnState::Active)
                .cloned()
                .collect()
        };
        // Broadcasts never expect replies; the deadline is ignored.
        let env = Arc::new(Envelope {
            id: bus.next_msg_id(),
            src_id: self.id,
            destination: Destination::Broadcast,
            cookie: spec.cookie,
            cookie_reply: None,
            flags: spec.flags - MessageFlags::EXPECT_REPLY,
            deadline: None,
            body: Body::User(spec.payload),
        });
        for dest in targets {
            let Ok(ep) = dest.endpoint_arc() else {
                continue;
            };
            let allowed = ep.permits(PolicyCheck {
                uid: self.uid,
                peer_uid: Some(dest.uid),
                name: None,
                verb: Verb::Send,
            });
            if !allowed {
                trace!(msg = env.id, dst = dest.id, "broadcast target denied by policy");
                continue;
            }
            if let Err(e) = dest.push_envelope(&env) {
                debug!(msg = env.id, dst = dest.id, error = %e, "broadcast target skipped");
            }
        }
        Ok(env.id)
    }

    /// Pop the oldest queued envelope, blocking until one arrives or the
    /// connection disconnects (`ConnectionGone`).
    pub async fn recv(&self) -> Result<Arc<Envelope>> {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            // Register before checking the queue so a signal between the
            // check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                match inner.state {
                    ConnState::Active => {}
                    ConnState::Unconnected | ConnState::Starter | ConnState::Disconnected => {
                        return Err(Error::ConnectionGone(self.id))
                    }
                }
                if let Some(env) = inner.queue.pop_front() {
                    return Ok(env);
                }
            }
            notified.as_mut().await;
        }
    }

    /// Pop the oldest queued envelope, failing `WouldBlock` when the
    /// queue is empty.
    pub fn try_recv(&self) -> Result<Arc<Envelope>> {
        let mut inner = self.lock();
        match inner.state {
            ConnState::Active => {}
            ConnState::Unconnected | ConnState::Starter | ConnState::Disconnected => {
                return Err(Error::ConnectionGone(self.id))
            }
        }
        inner.queue.pop_front().ok_or(Error::WouldBlock)
    }

    /// Append an envelope to the inbound queue and wake one receiver.
    ///
    /// Clears the pending-reply entry this envelope answers, if any.
    pub(crate) fn push_envelope(&self, env: &Arc<Envelope>) -> Result<()> {
        {
            let mut inner = self.lock();
            if !matches!(inner.state, ConnState::Active | ConnState::Starter) {
                return Err(Error::ConnectionGone(self.id));
            }
            if inner.queue.len() >= self.limits.max_queue_len {
                return Err(Error::OutOfResources("inbound queue"));
            }
            if let Some(replied) = env.cookie_reply {
                inner.pending_replies.remove(&replied);
            }
            inner.queue.push_back(Arc::clone(env));
        }
        self.signal.notify_one();
        Ok(())
    }

    /// Append a bus-origin notification, bypassing the capacity check —
    /// notifications are never silently dropped for a live connection.
    pub(crate) fn push_notification(&self, env: &Arc<Envelope>) {
        {
            let mut inner = self.lock();
            if inner.state != ConnState::Active {
                return;
            }
            inner.queue.push_back(Arc::clone(env));
        }
        self.signal.notify_one();
    }

    // ── Name operations ──

    /// Acquire a well-known name (see [`crate::registry`]).
    pub fn acquire_name(self: &Arc<Self>, name: &str, flags: NameFlags) -> Result<AcquireOutcome> {
        validate_name(name)?;
        self.ensure_active()?;
        let ep = self.endpoint_arc()?;
        ep.enforce(PolicyCheck {
            uid: self.uid,
            peer_uid: None,
            name: Some(name),
            verb: Verb::Own,
        })?;
        let bus = self.bus()?;
        let mut state = bus.lock_state();
        if state.disconnected {
            return Err(Error::ConnectionGone(self.id));
        }
        let (outcome, changes) = {
            let crate::bus::BusState {
                registry, conns, ..
            } = &mut *state;
            registry.acquire(conns, self, name, flags)?
        };
        // Messages parked at a displaced starter belong to whoever now
        // answers to the name.
        for change in &changes {
            if change.new != Some(self.id) {
                continue;
            }
            let displaced = change
                .old
                .and_then(|old| state.conns.get(&old))
                .filter(|prev| prev.is_starter());
            if let Some(prev) = displaced {
                let parked = prev.take_parked();
                if !parked.is_empty() {
                    debug!(conn = self.id, name, inherited = parked.len(), "starter queue handed over");
                    self.adopt_parked(parked);
                }
            }
        }
        debug!(conn = self.id, name, ?outcome, "name acquire");
        bus.notify_owner_changes(&state, &changes);
        Ok(outcome)
    }

    /// Release a well-known name, promoting the head waiter if any.
    pub fn release_name(self: &Arc<Self>, name: &str) -> Result<()> {
        validate_name(name)?;
        self.ensure_active()?;
        let bus = self.bus()?;
        let mut state = bus.lock_state();
        let changes = {
            let crate::bus::BusState {
                registry, conns, ..
            } = &mut *state;
            registry.release(conns, self, name)?
        };
        debug!(conn = self.id, name, "name released");
        bus.notify_owner_changes(&state, &changes);
        Ok(())
    }

    /// Snapshot of (name, owner) pairs visible to this connection under
    /// its endpoint's policy.
    pub fn list_names(self: &Arc<Self>) -> Result<Vec<NameInfo>> {
        self.ensure_active()?;
        let ep = self.endpoint_arc()?;
        let bus = self.bus()?;
        let state = bus.lock_state();
        let all = state.registry.list();
        Ok(all
            .into_iter()
            .filter(|info| {
                let peer_uid = state.conns.get(&info.owner).map(|c| c.uid);
                ep.permits(PolicyCheck {
                    uid: self.uid,
                    peer_uid,
                    name: Some(&info.name),
                    verb: Verb::See,
                })
            })
            .collect())
    }

    /// Owner identity and flags for one name.
    ///
    /// A name hidden by policy reports `NotFound`, same as an absent one.
    pub fn query_name(self: &Arc<Self>, name: &str) -> Result<NameInfo> {
        validate_name(name)?;
        self.ensure_active()?;
        let ep = self.endpoint_arc()?;
        let bus = self.bus()?;
        let state = bus.lock_state();
        let info = state
            .registry
            .query(name)
            .ok_or_else(|| Error::not_found("name", name))?;
        let peer_uid = state.conns.get(&info.owner).map(|c| c.uid);
        if !ep.permits(PolicyCheck {
            uid: self.uid,
            peer_uid,
            name: Some(name),
            verb: Verb::See,
        }) {
            return Err(Error::not_found("name", name));
        }
        Ok(info)
    }

    /// Names currently owned, in lexical order.
    pub fn owned_names(&self) -> Vec<String> {
        self.lock().names.iter().cloned().collect()
    }

    /// Names this connection waits behind, in lexical order.
    pub fn queued_names(&self) -> Vec<String> {
        self.lock().names_queued.iter().cloned().collect()
    }

    // ── Watches ──

    /// Request owner-changed notifications for `name`.
    pub fn watch_name(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.lock().name_watches.insert(name.to_owned());
        Ok(())
    }

    /// Stop watching `name`.
    pub fn unwatch_name(&self, name: &str) {
        self.lock().name_watches.remove(name);
    }

    /// Opt in or out of connection-created/destroyed notifications.
    pub fn watch_id_changes(&self, on: bool) {
        self.lock().watch_ids = on;
    }

    // ── Timeouts ──

    /// Expire pending replies whose deadline has passed, emitting one
    /// reply-timeout notification per expired entry into this
    /// connection's own queue.
    ///
    /// Invoked periodically (or on demand); returns the number expired.
    pub fn scan_timeouts(&self, now: DateTime<Utc>) -> usize {
        let Some(bus) = self.bus.upgrade() else {
            return 0;
        };
        let expired: Vec<(u64, u64)> = {
            let mut inner = self.lock();
            if inner.state != ConnState::Active {
                return 0;
            }
            let ids: Vec<u64> = inner
                .pending_replies
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.pending_replies.remove(&id).map(|p| (id, p.cookie)))
                .collect()
        };
        for &(msg_id, cookie) in &expired {
            debug!(conn = self.id, msg = msg_id, "reply deadline elapsed");
            let env = notify::reply_timeout(bus.next_msg_id(), self.id, msg_id, cookie);
            self.push_notification(&env);
        }
        expired.len()
    }

    // ── Disconnect ──

    /// Disconnect the connection. One-shot; repeat calls are no-ops.
    ///
    /// Atomically invalidates all pending state: the inbound queue is
    /// flushed (undelivered expect-reply envelopes produce a reply-dead
    /// notification to their sender), every owned name is handed over or
    /// deleted, waiting-queue memberships are removed, and all blocked
    /// receivers wake with `ConnectionGone`.
    pub fn disconnect(self: &Arc<Self>) {
        let Some(bus) = self.bus.upgrade() else {
            self.disconnect_local();
            return;
        };
        {
            let mut state = bus.lock_state();
            let was_active;
            let flushed: Vec<Arc<Envelope>>;
            {
                let mut inner = self.lock();
                if inner.state == ConnState::Disconnected {
                    return;
                }
                was_active = inner.state == ConnState::Active;
                inner.state = ConnState::Disconnected;
                flushed = inner.queue.drain(..).collect();
                inner.pending_replies.clear();
            }
            debug!(conn = self.id, flushed = flushed.len(), "disconnecting");
            let changes = {
                let crate::bus::BusState {
                    registry, conns, ..
                } = &mut *state;
                registry.remove_by_connection(conns, self)
            };
            bus.notify_owner_changes(&state, &changes);
            state.conns.remove(&self.id);
            for env in &flushed {
                if !env.expects_reply() || env.src_id == SRC_ID_BUS {
                    continue;
                }
                let Some(sender) = state.conns.get(&env.src_id) else {
                    continue;
                };
                if sender.forget_pending(env.id).is_some() {
                    let note =
                        notify::reply_dead(bus.next_msg_id(), env.src_id, env.id, env.cookie);
                    sender.push_notification(&note);
                }
            }
            if was_active {
                bus.notify_id_change(&state, self.id, IdEvent::Removed);
            }
        }
        self.signal.notify_waiters();
        if let Some(ep) = self.endpoint.upgrade() {
            ep.detach(self.id);
        }
    }

    /// Disconnect when the owning bus is already gone.
    fn disconnect_local(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ConnState::Disconnected {
                return;
            }
            inner.state = ConnState::Disconnected;
            inner.queue.clear();
            inner.pending_replies.clear();
        }
        self.signal.notify_waiters();
    }

    fn ensure_active(&self) -> Result<()> {
        if self.lock().state == ConnState::Active {
            Ok(())
        } else {
            Err(Error::ConnectionGone(self.id))
        }
    }

    /// Remove one pending-reply entry, returning its cookie.
    pub(crate) fn forget_pending(&self, msg_id: u64) -> Option<u64> {
        self.lock().pending_replies.remove(&msg_id).map(|p| p.cookie)
    }

    /// Drain a starter's parked queue for hand-over to its replacement.
    pub(crate) fn take_parked(&self) -> Vec<Arc<Envelope>> {
        let mut inner = self.lock();
        if inner.state != ConnState::Starter {
            return Vec::new();
        }
        inner.queue.drain(..).collect()
    }

    /// Append inherited envelopes and wake one receiver. Capacity does
    /// not apply; the envelopes were already accepted at the starter.
    pub(crate) fn adopt_parked(&self, envs: Vec<Arc<Envelope>>) {
        {
            let mut inner = self.lock();
            if inner.state != ConnState::Active {
                return;
            }
            inner.queue.extend(envs);
        }
        self.signal.notify_one();
    }

    pub(crate) fn is_starter(&self) -> bool {
        self.lock().state == ConnState::Starter
    }

    pub(crate) fn watches_name(&self, name: &str) -> bool {
        self.lock().name_watches.contains(name)
    }

    pub(crate) fn watches_ids(&self) -> bool {
        self.lock().watch_ids
    }

    pub(crate) fn owned_name_count(&self) -> usize {
        self.lock().names.len()
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    // Registry bookkeeping; called only under the bus lock, which keeps
    // the owned-name set and the registry's owner pointers consistent.

    pub(crate) fn note_name_acquired(&self, name: &str) {
        self.lock().names.insert(name.to_owned());
    }

    pub(crate) fn note_name_released(&self, name: &str) {
        self.lock().names.remove(name);
    }

    pub(crate) fn note_name_queued(&self, name: &str) {
        self.lock().names_queued.insert(name.to_owned());
    }

    pub(crate) fn note_name_unqueued(&self, name: &str) {
        self.lock().names_queued.remove(name);
    }
}
