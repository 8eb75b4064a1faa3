//! Namespaces — isolated bus domains, arranged in a tree.
//!
//! A namespace sees only its own buses and its own children. Tearing a
//! namespace down cascades: child namespaces first, then buses, then
//! their endpoints and connections. The root namespace is unnamed and
//! has no parent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::bus::Bus;
use crate::config::Limits;
use crate::error::{Error, Result};

static NS_ID_NEXT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct NsInner {
    disconnected: bool,
    bus_id_next: u64,
    buses: HashMap<String, Arc<Bus>>,
    children: HashMap<String, Arc<Namespace>>,
}

/// One isolation domain for buses.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    id: u64,
    parent: Option<Weak<Namespace>>,
    inner: Mutex<NsInner>,
}

impl Namespace {
    fn alloc(name: &str, parent: Option<&Arc<Namespace>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            id: NS_ID_NEXT.fetch_add(1, Ordering::Relaxed),
            parent: parent.map(Arc::downgrade),
            inner: Mutex::new(NsInner {
                disconnected: false,
                bus_id_next: 1,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    /// Create the root namespace. Unnamed, parentless.
    pub fn root() -> Arc<Self> {
        Self::alloc("", None)
    }

    /// Namespace name; empty for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace id, unique process-wide.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The parent namespace, while it is still alive.
    pub fn parent(&self) -> Option<Arc<Namespace>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn lock(&self) -> MutexGuard<'_, NsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a child namespace.
    pub fn create_namespace(self: &Arc<Self>, name: &str) -> Result<Arc<Namespace>> {
        let mut inner = self.lock();
        if inner.disconnected {
            return Err(Error::not_found("namespace", self.name.clone()));
        }
        // A disconnected child frees its name for reuse.
        if inner
            .children
            .get(name)
            .is_some_and(|ns| !ns.lock().disconnected)
        {
            return Err(Error::already_exists("namespace", name));
        }
        let child = Self::alloc(name, Some(self));
        inner.children.insert(name.to_owned(), Arc::clone(&child));
        info!(parent = %self.name, namespace = name, id = child.id, "namespace created");
        Ok(child)
    }

    /// Look up a live child namespace by name.
    pub fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.lock()
            .children
            .get(name)
            .filter(|ns| !ns.lock().disconnected)
            .cloned()
    }

    /// Create a bus in this namespace.
    pub fn create_bus(self: &Arc<Self>, name: &str, limits: Limits) -> Result<Arc<Bus>> {
        let mut inner = self.lock();
        if inner.disconnected {
            return Err(Error::not_found("namespace", self.name.clone()));
        }
        // A disconnected bus frees its name for reuse.
        if inner.buses.get(name).is_some_and(|bus| bus.is_active()) {
            return Err(Error::already_exists("bus", name));
        }
        let id = inner.bus_id_next;
        inner.bus_id_next = id
            .checked_add(1)
            .ok_or(Error::OutOfResources("bus id space"))?;
        let bus = Bus::new(name, id, self, limits);
        inner.buses.insert(name.to_owned(), Arc::clone(&bus));
        info!(namespace = %self.name, bus = name, id, "bus created");
        Ok(bus)
    }

    /// Look up a live bus by name.
    pub fn bus(&self, name: &str) -> Option<Arc<Bus>> {
        self.lock()
            .buses
            .get(name)
            .filter(|bus| bus.is_active())
            .cloned()
    }

    /// Number of live buses in this namespace.
    ///
    /// Disconnected buses linger in the map until their name is reused;
    /// they are not counted, matching what [`Namespace::bus`] hands out.
    pub fn bus_count(&self) -> usize {
        self.lock()
            .buses
            .values()
            .filter(|bus| bus.is_active())
            .count()
    }

    /// Tear down the namespace: children first, then buses.
    pub fn disconnect(&self) {
        let (buses, children) = {
            let mut inner = self.lock();
            if inner.disconnected {
                return;
            }
            inner.disconnected = true;
            let buses: Vec<Arc<Bus>> = inner.buses.drain().map(|(_, b)| b).collect();
            let children: Vec<Arc<Namespace>> =
                inner.children.drain().map(|(_, ns)| ns).collect();
            (buses, children)
        };
        debug!(namespace = %self.name, buses = buses.len(), children = children.len(), "namespace disconnecting");
        for child in children {
            child.disconnect();
        }
        for bus in buses {
            bus.disconnect();
        }
    }
}
