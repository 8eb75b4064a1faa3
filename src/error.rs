//! Crate-wide error taxonomy.
//!
//! Every command on the bus resolves to exactly one of these kinds.
//! Synchronous failures are returned directly to the caller and never
//! retried; asynchronous delivery failures are *not* errors — they come
//! back as [`crate::notify::Notification`] envelopes through the normal
//! receive path.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure kinds surfaced by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Lookup miss: namespace, bus, endpoint, connection, or name.
    #[error("no such {kind}: {what}")]
    NotFound {
        /// What category of object was looked up.
        kind: &'static str,
        /// The identifier that missed.
        what: String,
    },

    /// Duplicate create of a namespace, bus, or endpoint.
    #[error("{kind} '{what}' already exists")]
    AlreadyExists {
        /// What category of object collided.
        kind: &'static str,
        /// The colliding identifier.
        what: String,
    },

    /// Well-known name failed the syntax check.
    #[error("invalid well-known name: '{0}'")]
    InvalidName(String),

    /// A policy rule (or the default-deny boundary) rejected the operation.
    #[error("permission denied: {verb} '{what}'")]
    PermissionDenied {
        /// The verb that was checked.
        verb: &'static str,
        /// The name or id the verb applied to.
        what: String,
    },

    /// Acquire on an owned, non-replaceable name without queueing.
    #[error("name in use: '{0}'")]
    NameInUse(String),

    /// Release of a name the connection does not hold.
    #[error("not the owner of '{0}'")]
    NotOwner(String),

    /// Operation on a disconnected (or never-activated) connection.
    #[error("connection {0} is gone")]
    ConnectionGone(u64),

    /// Non-blocking receive with an empty queue.
    #[error("receive would block")]
    WouldBlock,

    /// A reply deadline elapsed for the message with the given id.
    ///
    /// Expiry reaches the sender as a
    /// [`crate::notify::Notification::ReplyTimeout`] through the receive
    /// path; [`crate::notify::Notification::reply_error`] maps that
    /// notification to this variant.
    #[error("reply deadline elapsed for message {0}")]
    Timeout(u64),

    /// Id space, queue capacity, or per-connection name budget exhausted.
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] with an owned identifier.
    pub(crate) fn not_found(kind: &'static str, what: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            what: what.into(),
        }
    }

    /// Shorthand for a [`Error::AlreadyExists`] with an owned identifier.
    pub(crate) fn already_exists(kind: &'static str, what: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            what: what.into(),
        }
    }
}
