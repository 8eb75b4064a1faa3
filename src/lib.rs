//! Straylight — an in-process message bus with kernel-style semantics.
//!
//! Namespaces isolate buses, buses fan messages out between connections,
//! endpoints gate access with per-endpoint policy, and well-known names
//! move between owners through FIFO waiter queues. Delivery failures
//! after a send has been accepted come back as notifications, never as
//! errors.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;

pub mod message;
pub mod name;
pub mod notify;
pub mod policy;

pub mod bus;
pub mod conn;
pub mod endpoint;
pub mod ns;

pub mod control;
pub mod registry;

pub use bus::{run_timeout_scanner, Bus, DEFAULT_ENDPOINT};
pub use config::{Config, Limits};
pub use conn::{ConnState, Connection};
pub use control::{Command, Reply, Session};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use message::{Body, Destination, Envelope, MessageFlags, MessageSpec, SRC_ID_BUS};
pub use name::NameFlags;
pub use notify::{IdEvent, Notification};
pub use ns::Namespace;
pub use policy::{Effect, PolicyCheck, PolicyDb, PolicyRule, Subject, Verb};
pub use registry::{AcquireOutcome, NameInfo};
