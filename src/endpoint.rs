//! Bus endpoints — named attachment points with their own policy.
//!
//! Every bus carries a default endpoint; additional endpoints expose the
//! same bus through a stricter (or different) policy database. The
//! endpoint gates sends addressed *to* its connections and filters what
//! its connections can own and see.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::debug;

use crate::bus::Bus;
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::policy::{PolicyCheck, PolicyDb};

#[derive(Debug, Default)]
struct EpInner {
    disconnected: bool,
    conns: HashMap<u64, Arc<Connection>>,
}

/// One attachment point on a bus.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    id: u64,
    bus: Weak<Bus>,
    /// Replaced atomically as a whole set; never edited in place.
    policy: RwLock<Option<PolicyDb>>,
    inner: Mutex<EpInner>,
}

impl Endpoint {
    pub(crate) fn new(name: &str, id: u64, bus: &Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            id,
            bus: Arc::downgrade(bus),
            policy: RwLock::new(None),
            inner: Mutex::new(EpInner::default()),
        })
    }

    /// Endpoint name, unique within its bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint id, unique within its bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, EpInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new connection for the given uid.
    ///
    /// The connection starts `Unconnected`; it must complete the Hello
    /// handshake (or register as a starter) before it can participate.
    pub fn connect(self: &Arc<Self>, uid: u32) -> Result<Arc<Connection>> {
        let bus = self
            .bus
            .upgrade()
            .ok_or_else(|| Error::not_found("endpoint", self.name.clone()))?;
        let mut state = bus.lock_state();
        if state.disconnected {
            return Err(Error::not_found("bus", bus.name()));
        }
        let mut inner = self.lock();
        if inner.disconnected {
            return Err(Error::not_found("endpoint", self.name.clone()));
        }
        let id = state.alloc_conn_id()?;
        let conn = Connection::new(id, uid, &bus, self, *bus.limits());
        inner.conns.insert(id, Arc::clone(&conn));
        state.conns.insert(id, Arc::clone(&conn));
        debug!(endpoint = %self.name, conn = id, uid, "connection attached");
        Ok(conn)
    }

    /// Number of connections attached through this endpoint.
    pub fn connection_count(&self) -> usize {
        self.lock().conns.len()
    }

    /// Replace the endpoint's policy database in one step.
    ///
    /// `None` removes the database entirely, leaving only the default
    /// boundary.
    pub fn set_policy(&self, db: Option<PolicyDb>) {
        let rules = db.as_ref().map_or(0, PolicyDb::len);
        *self
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = db;
        debug!(endpoint = %self.name, rules, "policy replaced");
    }

    /// Evaluate a check against this endpoint's policy (or the default
    /// boundary when no database is installed).
    pub(crate) fn permits(&self, check: PolicyCheck<'_>) -> bool {
        let guard = self.policy.read().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Some(db) => db.check(check),
            None => PolicyDb::default().check(check),
        }
    }

    /// Evaluate a check, mapping denial to `PermissionDenied`.
    pub(crate) fn enforce(&self, check: PolicyCheck<'_>) -> Result<()> {
        let guard = self.policy.read().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Some(db) => db.enforce(check),
            None => PolicyDb::default().enforce(check),
        }
    }

    /// Forget a connection that has disconnected.
    pub(crate) fn detach(&self, conn_id: u64) {
        self.lock().conns.remove(&conn_id);
    }

    /// Tear down the endpoint, disconnecting every attached connection.
    pub(crate) fn disconnect(&self) {
        let conns: Vec<Arc<Connection>> = {
            let mut inner = self.lock();
            if inner.disconnected {
                return;
            }
            inner.disconnected = true;
            inner.conns.drain().map(|(_, c)| c).collect()
        };
        debug!(endpoint = %self.name, conns = conns.len(), "endpoint disconnecting");
        for conn in conns {
            conn.disconnect();
        }
    }
}
