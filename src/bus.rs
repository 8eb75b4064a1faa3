//! Buses — the fan-out domain for messages and names.
//!
//! A bus owns one lock over everything that must stay mutually
//! consistent: the name registry, the connection map, the endpoint map,
//! and the id counters. Holding that single lock while applying a
//! mutation *and* fanning out its notifications is what gives observers
//! a total order over name events. Per-connection queues live behind
//! their own mutexes (see [`crate::conn`]); lock order is always
//! bus → endpoint → connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Limits;
use crate::conn::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::notify::{self, IdEvent};
use crate::ns::Namespace;
use crate::registry::{NameRegistry, OwnerChange};

/// Name of the default endpoint every bus is created with.
pub const DEFAULT_ENDPOINT: &str = "bus";

/// Everything a bus keeps consistent under one lock.
#[derive(Debug)]
pub(crate) struct BusState {
    pub(crate) disconnected: bool,
    pub(crate) registry: NameRegistry,
    pub(crate) conns: HashMap<u64, Arc<Connection>>,
    pub(crate) endpoints: HashMap<String, Arc<Endpoint>>,
    // Endpoint id 1 is the default endpoint, created below.
    ep_id_next: u64,
    conn_id_next: u64,
}

impl BusState {
    pub(crate) fn alloc_conn_id(&mut self) -> Result<u64> {
        let id = self.conn_id_next;
        self.conn_id_next = id
            .checked_add(1)
            .ok_or(Error::OutOfResources("connection id space"))?;
        Ok(id)
    }

    fn alloc_ep_id(&mut self) -> Result<u64> {
        let id = self.ep_id_next;
        self.ep_id_next = id
            .checked_add(1)
            .ok_or(Error::OutOfResources("endpoint id space"))?;
        Ok(id)
    }
}

/// One message bus inside a namespace.
#[derive(Debug)]
pub struct Bus {
    name: String,
    id: u64,
    ns: Weak<Namespace>,
    limits: Limits,
    msg_id_next: AtomicU64,
    state: Mutex<BusState>,
}

impl Bus {
    pub(crate) fn new(name: &str, id: u64, ns: &Arc<Namespace>, limits: Limits) -> Arc<Self> {
        let bus = Arc::new(Self {
            name: name.to_owned(),
            id,
            ns: Arc::downgrade(ns),
            limits,
            msg_id_next: AtomicU64::new(1),
            state: Mutex::new(BusState {
                disconnected: false,
                registry: NameRegistry::default(),
                conns: HashMap::new(),
                endpoints: HashMap::new(),
                ep_id_next: 2,
                conn_id_next: 1,
            }),
        });
        let ep = Endpoint::new(DEFAULT_ENDPOINT, 1, &bus);
        bus.lock_state()
            .endpoints
            .insert(DEFAULT_ENDPOINT.to_owned(), ep);
        bus
    }

    /// Bus name, unique within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bus id, unique within its namespace.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The namespace this bus belongs to, while it is still alive.
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.ns.upgrade()
    }

    /// The resource limits connections on this bus operate under.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Whether the bus is still accepting operations.
    pub fn is_active(&self) -> bool {
        !self.lock_state().disconnected
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next message id. Ids are unique for the bus's
    /// lifetime and never reused.
    pub(crate) fn next_msg_id(&self) -> u64 {
        self.msg_id_next.fetch_add(1, Ordering::Relaxed)
    }

    /// The default endpoint every bus is created with.
    pub fn default_endpoint(self: &Arc<Self>) -> Arc<Endpoint> {
        let state = self.lock_state();
        match state.endpoints.get(DEFAULT_ENDPOINT) {
            Some(ep) => Arc::clone(ep),
            // Inserted in new() and kept in the map even across
            // disconnect, so the entry always resolves.
            None => unreachable!("default endpoint missing"),
        }
    }

    /// Look up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Result<Arc<Endpoint>> {
        self.lock_state()
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("endpoint", name))
    }

    /// Create an additional endpoint on this bus.
    pub fn create_endpoint(self: &Arc<Self>, name: &str) -> Result<Arc<Endpoint>> {
        let mut state = self.lock_state();
        if state.disconnected {
            return Err(Error::not_found("bus", self.name.clone()));
        }
        if state.endpoints.contains_key(name) {
            return Err(Error::already_exists("endpoint", name));
        }
        let id = state.alloc_ep_id()?;
        let ep = Endpoint::new(name, id, self);
        state.endpoints.insert(name.to_owned(), Arc::clone(&ep));
        debug!(bus = %self.name, endpoint = name, id, "endpoint created");
        Ok(ep)
    }

    /// Remove an endpoint, disconnecting everything attached through it.
    ///
    /// The default endpoint cannot be removed.
    pub fn remove_endpoint(&self, name: &str) -> Result<()> {
        if name == DEFAULT_ENDPOINT {
            return Err(Error::PermissionDenied {
                verb: "remove",
                what: name.to_owned(),
            });
        }
        let ep = {
            let mut state = self.lock_state();
            state
                .endpoints
                .remove(name)
                .ok_or_else(|| Error::not_found("endpoint", name))?
        };
        debug!(bus = %self.name, endpoint = name, "endpoint removed");
        ep.disconnect();
        Ok(())
    }

    /// Look up a connection by id.
    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.lock_state().conns.get(&id).cloned()
    }

    /// Number of connections currently attached to the bus.
    pub fn connection_count(&self) -> usize {
        self.lock_state().conns.len()
    }

    /// Fan out owner-change notifications produced by a registry
    /// mutation. Called while the bus lock is held, so observers see
    /// owner changes in registry order.
    pub(crate) fn notify_owner_changes(&self, state: &BusState, changes: &[OwnerChange]) {
        for change in changes {
            let env =
                notify::name_owner_changed(self.next_msg_id(), &change.name, change.old, change.new);
            let mut recipients: BTreeSet<u64> = BTreeSet::new();
            if let Some(old) = change.old {
                recipients.insert(old);
            }
            if let Some(new) = change.new {
                recipients.insert(new);
            }
            for conn in state.conns.values() {
                if conn.watches_name(&change.name) {
                    recipients.insert(conn.id());
                }
            }
            for id in recipients {
                if let Some(conn) = state.conns.get(&id) {
                    conn.push_notification(&env);
                }
            }
        }
    }

    /// Fan out a connection arrived/departed notification to every
    /// connection that opted into id-change events.
    pub(crate) fn notify_id_change(&self, state: &BusState, subject: u64, event: IdEvent) {
        let env = notify::id_changed(self.next_msg_id(), subject, event);
        for conn in state.conns.values() {
            if conn.id() != subject && conn.watches_ids() {
                conn.push_notification(&env);
            }
        }
    }

    /// Expire overdue reply deadlines across every connection.
    ///
    /// Returns the total number of entries expired.
    pub fn scan_timeouts(&self) -> usize {
        let conns: Vec<Arc<Connection>> = self.lock_state().conns.values().cloned().collect();
        let now = Utc::now();
        conns.iter().map(|c| c.scan_timeouts(now)).sum()
    }

    /// Tear down the bus: every connection disconnects, every endpoint
    /// is removed, and further operations fail.
    pub fn disconnect(&self) {
        let (conns, endpoints) = {
            let mut state = self.lock_state();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            let conns: Vec<Arc<Connection>> = state.conns.values().cloned().collect();
            let endpoints: Vec<Arc<Endpoint>> = state.endpoints.values().cloned().collect();
            // The default endpoint entry stays resolvable; it is
            // disconnected below like the rest.
            state.endpoints.retain(|name, _| name == DEFAULT_ENDPOINT);
            (conns, endpoints)
        };
        info!(bus = %self.name, conns = conns.len(), "bus disconnecting");
        for conn in conns {
            conn.disconnect();
        }
        for ep in endpoints {
            ep.disconnect();
        }
    }
}

/// Periodically expire reply deadlines on `bus` until `shutdown` flips
/// to `true` or the sender side is dropped.
pub async fn run_timeout_scanner(
    bus: Arc<Bus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(bus = %bus.name(), interval_secs = interval.as_secs(), "timeout scanner started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = bus.scan_timeouts();
                if expired > 0 {
                    warn!(bus = %bus.name(), expired, "reply deadlines expired");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(bus = %bus.name(), "timeout scanner stopped");
}
