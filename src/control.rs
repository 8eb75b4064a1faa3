//! The command boundary — one session per client handle.
//!
//! A [`Session`] starts as a plain control handle on a namespace. The
//! first make-style command binds it: creating a namespace or a bus
//! makes the session that object's owner, and attaching to an endpoint
//! makes it a connection holder. Dropping a bound session tears its
//! object down, so an owner crashing takes its namespace, bus, or
//! connection with it — no leaked buses, no orphaned names.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::Bus;
use crate::config::Limits;
use crate::conn::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{Envelope, MessageSpec};
use crate::name::NameFlags;
use crate::notify::Notification;
use crate::ns::Namespace;
use crate::policy::{PolicyDb, PolicyRule};
use crate::registry::{AcquireOutcome, NameInfo};

/// Every operation a session can be asked to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Create a child namespace and bind the session as its owner.
    NsCreate {
        /// Name of the new namespace.
        name: String,
    },
    /// Create a bus and bind the session as its owner.
    BusCreate {
        /// Name of the new bus.
        name: String,
    },
    /// Create an additional endpoint on an existing bus.
    EpCreate {
        /// Bus the endpoint belongs to.
        bus: String,
        /// Name of the new endpoint.
        name: String,
    },
    /// Remove an endpoint, disconnecting everything attached through it.
    EpRemove {
        /// Bus the endpoint belongs to.
        bus: String,
        /// Name of the endpoint to remove.
        name: String,
    },
    /// Activate an attached connection.
    Hello,
    /// Register an attached connection as a starter for a name.
    StarterRegister {
        /// The well-known name to hold as a placeholder.
        name: String,
    },
    /// Disconnect an attached connection.
    ByeBye,
    /// Send a message from an attached connection.
    MsgSend {
        /// The outbound message.
        spec: MessageSpec,
    },
    /// Receive the next queued envelope.
    MsgRecv {
        /// Wait for an envelope instead of failing `WouldBlock`.
        block: bool,
    },
    /// Acquire a well-known name.
    NameAcquire {
        /// The name to acquire.
        name: String,
        /// Queueing and replacement behavior.
        flags: NameFlags,
    },
    /// Release a well-known name.
    NameRelease {
        /// The name to release.
        name: String,
    },
    /// List names visible to the connection.
    NameList,
    /// Query one name's owner and flags.
    NameQuery {
        /// The name to look up.
        name: String,
    },
    /// Subscribe to owner changes for a name.
    NameWatch {
        /// The name to watch.
        name: String,
    },
    /// Opt in or out of connection arrived/departed events.
    IdWatch {
        /// Enable or disable the subscription.
        on: bool,
    },
    /// Replace an endpoint's policy database in one step.
    PolicySet {
        /// Bus the endpoint belongs to.
        bus: String,
        /// Endpoint whose policy is replaced.
        endpoint: String,
        /// The new rule set; `None` removes the database.
        rules: Option<Vec<PolicyRule>>,
    },
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::NsCreate { .. } => "ns_create",
            Command::BusCreate { .. } => "bus_create",
            Command::EpCreate { .. } => "ep_create",
            Command::EpRemove { .. } => "ep_remove",
            Command::Hello => "hello",
            Command::StarterRegister { .. } => "starter_register",
            Command::ByeBye => "bye_bye",
            Command::MsgSend { .. } => "msg_send",
            Command::MsgRecv { .. } => "msg_recv",
            Command::NameAcquire { .. } => "name_acquire",
            Command::NameRelease { .. } => "name_release",
            Command::NameList => "name_list",
            Command::NameQuery { .. } => "name_query",
            Command::NameWatch { .. } => "name_watch",
            Command::IdWatch { .. } => "id_watch",
            Command::PolicySet { .. } => "policy_set",
        }
    }
}

/// Successful outcome of a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// An object was created; carries its id.
    Created {
        /// Id of the new namespace, bus, or endpoint.
        id: u64,
    },
    /// The command completed with nothing to report.
    Done,
    /// A message was queued; carries its assigned id.
    Sent {
        /// The bus-assigned message id.
        id: u64,
    },
    /// One received envelope.
    Message(Envelope),
    /// Outcome of a name acquire.
    Acquired(AcquireOutcome),
    /// Name listing.
    Names(Vec<NameInfo>),
    /// One name's owner and flags.
    Name(NameInfo),
}

impl Reply {
    /// The received envelope, when this reply carries one.
    pub fn into_message(self) -> Option<Envelope> {
        match self {
            Reply::Message(env) => Some(env),
            _ => None,
        }
    }

    /// The notification inside a received envelope, when any.
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            Reply::Message(env) => env.notification(),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum SessionRole {
    /// Unbound control handle.
    Control,
    /// Owns a namespace it created; drop tears the namespace down.
    NamespaceOwner(Arc<Namespace>),
    /// Owns a bus it created; drop tears the bus down.
    BusOwner(Arc<Bus>),
    /// Holds a connection; drop disconnects it.
    Attached(Arc<Connection>),
}

/// One client handle on the bus hierarchy.
///
/// Sessions are bound at most once and their bound object lives exactly
/// as long as they do.
#[derive(Debug)]
pub struct Session {
    ns: Arc<Namespace>,
    limits: Limits,
    role: SessionRole,
}

impl Session {
    /// Open a control session on a namespace.
    ///
    /// Buses created through this session inherit `limits`.
    pub fn control(ns: &Arc<Namespace>, limits: Limits) -> Self {
        Self {
            ns: Arc::clone(ns),
            limits,
            role: SessionRole::Control,
        }
    }

    /// Attach to an endpoint as the given uid.
    ///
    /// The connection starts unactivated; issue [`Command::Hello`] (or
    /// [`Command::StarterRegister`]) before anything else.
    pub fn attach(ns: &Arc<Namespace>, ep: &Arc<Endpoint>, uid: u32) -> Result<Self> {
        let conn = ep.connect(uid)?;
        Ok(Self {
            ns: Arc::clone(ns),
            limits: *conn.limits(),
            role: SessionRole::Attached(conn),
        })
    }

    /// The attached connection, when this session holds one.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match &self.role {
            SessionRole::Attached(conn) => Some(conn),
            _ => None,
        }
    }

    /// Execute one command.
    ///
    /// Control commands require an unbound (or owner) session; connection
    /// commands require an attached one. A command issued against the
    /// wrong role fails `PermissionDenied` without side effects.
    pub async fn execute(&mut self, cmd: Command) -> Result<Reply> {
        debug!(command = cmd.label(), "executing");
        match cmd {
            Command::NsCreate { name } => {
                self.ensure_unbound(&name)?;
                let child = self.ns.create_namespace(&name)?;
                let id = child.id();
                self.role = SessionRole::NamespaceOwner(child);
                Ok(Reply::Created { id })
            }
            Command::BusCreate { name } => {
                self.ensure_unbound(&name)?;
                let bus = self.ns.create_bus(&name, self.limits)?;
                let id = bus.id();
                self.role = SessionRole::BusOwner(bus);
                Ok(Reply::Created { id })
            }
            Command::EpCreate { bus, name } => {
                let bus = self.lookup_bus(&bus)?;
                let ep = bus.create_endpoint(&name)?;
                Ok(Reply::Created { id: ep.id() })
            }
            Command::EpRemove { bus, name } => {
                let bus = self.lookup_bus(&bus)?;
                bus.remove_endpoint(&name)?;
                Ok(Reply::Done)
            }
            Command::PolicySet {
                bus,
                endpoint,
                rules,
            } => {
                let bus = self.lookup_bus(&bus)?;
                let ep = bus.endpoint(&endpoint)?;
                ep.set_policy(rules.map(PolicyDb::new));
                Ok(Reply::Done)
            }
            Command::Hello => {
                self.conn("hello")?.hello()?;
                Ok(Reply::Done)
            }
            Command::StarterRegister { name } => {
                self.conn("starter_register")?.register_starter(&name)?;
                Ok(Reply::Done)
            }
            Command::ByeBye => {
                self.conn("bye_bye")?.disconnect();
                Ok(Reply::Done)
            }
            Command::MsgSend { spec } => {
                let id = self.conn("msg_send")?.send(spec)?;
                Ok(Reply::Sent { id })
            }
            Command::MsgRecv { block } => {
                let conn = Arc::clone(self.conn("msg_recv")?);
                let env = if block {
                    conn.recv().await?
                } else {
                    conn.try_recv()?
                };
                Ok(Reply::Message(Envelope::clone(&env)))
            }
            Command::NameAcquire { name, flags } => {
                let outcome = self.conn("name_acquire")?.acquire_name(&name, flags)?;
                Ok(Reply::Acquired(outcome))
            }
            Command::NameRelease { name } => {
                self.conn("name_release")?.release_name(&name)?;
                Ok(Reply::Done)
            }
            Command::NameList => {
                let names = self.conn("name_list")?.list_names()?;
                Ok(Reply::Names(names))
            }
            Command::NameQuery { name } => {
                let info = self.conn("name_query")?.query_name(&name)?;
                Ok(Reply::Name(info))
            }
            Command::NameWatch { name } => {
                self.conn("name_watch")?.watch_name(&name)?;
                Ok(Reply::Done)
            }
            Command::IdWatch { on } => {
                self.conn("id_watch")?.watch_id_changes(on);
                Ok(Reply::Done)
            }
        }
    }

    fn ensure_unbound(&self, what: &str) -> Result<()> {
        match self.role {
            SessionRole::Control => Ok(()),
            _ => Err(Error::already_exists("session binding", what)),
        }
    }

    fn conn(&self, verb: &'static str) -> Result<&Arc<Connection>> {
        match &self.role {
            SessionRole::Attached(conn) => Ok(conn),
            _ => Err(Error::PermissionDenied {
                verb,
                what: "session is not attached to an endpoint".to_owned(),
            }),
        }
    }

    fn lookup_bus(&self, name: &str) -> Result<Arc<Bus>> {
        if let SessionRole::BusOwner(bus) = &self.role {
            if bus.name() == name {
                return Ok(Arc::clone(bus));
            }
        }
        self.ns
            .bus(name)
            .ok_or_else(|| Error::not_found("bus", name))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        match &self.role {
            SessionRole::Control => {}
            SessionRole::NamespaceOwner(ns) => ns.disconnect(),
            SessionRole::BusOwner(bus) => bus.disconnect(),
            SessionRole::Attached(conn) => conn.disconnect(),
        }
    }
}
