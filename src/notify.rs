//! Bus-synthesized notifications.
//!
//! Other components call these constructors on their state transitions;
//! the resulting envelopes carry [`SRC_ID_BUS`] as their source and are
//! enqueued exactly once per affected connection. The constructors are
//! stateless — fan-out (who receives what) is decided by the caller,
//! which holds the bus lock and can see the affected connections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{Body, Destination, Envelope, MessageFlags, SRC_ID_BUS};

/// Whether an id-changed event reports a connection arriving or leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdEvent {
    /// The connection completed its handshake.
    Added,
    /// The connection disconnected.
    Removed,
}

/// Payload of a bus-origin notification envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    /// Ownership of a well-known name moved.
    NameOwnerChanged {
        /// The name whose owner changed.
        name: String,
        /// Previous owner, `None` when the name was unowned.
        old_owner: Option<u64>,
        /// New owner, `None` when the name became unowned.
        new_owner: Option<u64>,
    },
    /// A connection appeared on or vanished from the bus.
    IdChanged {
        /// The connection id in question.
        id: u64,
        /// Arrival or departure.
        event: IdEvent,
    },
    /// A reply deadline elapsed without a reply arriving.
    ReplyTimeout {
        /// Id of the original expect-reply message.
        message_id: u64,
        /// Correlation cookie of the original message.
        cookie: u64,
    },
    /// The destination vanished while still holding an expect-reply
    /// message, so no reply can ever arrive.
    ReplyDead {
        /// Id of the original expect-reply message.
        message_id: u64,
        /// Correlation cookie of the original message.
        cookie: u64,
    },
}

impl Notification {
    /// The error a reply-timeout notification stands for, for callers
    /// that surface reply expiry as an [`Error`] value.
    pub fn reply_error(&self) -> Option<Error> {
        match self {
            Notification::ReplyTimeout { message_id, .. } => Some(Error::Timeout(*message_id)),
            _ => None,
        }
    }
}

fn envelope(id: u64, destination: Destination, body: Notification) -> Arc<Envelope> {
    Arc::new(Envelope {
        id,
        src_id: SRC_ID_BUS,
        destination,
        cookie: 0,
        cookie_reply: None,
        flags: MessageFlags::empty(),
        deadline: None,
        body: Body::Notification(body),
    })
}

/// Build a name-owner-changed envelope, shared by every receiver.
pub fn name_owner_changed(
    id: u64,
    name: &str,
    old_owner: Option<u64>,
    new_owner: Option<u64>,
) -> Arc<Envelope> {
    envelope(
        id,
        Destination::Broadcast,
        Notification::NameOwnerChanged {
            name: name.to_owned(),
            old_owner,
            new_owner,
        },
    )
}

/// Build an id-changed envelope, shared by every receiver.
pub fn id_changed(id: u64, conn_id: u64, event: IdEvent) -> Arc<Envelope> {
    envelope(
        id,
        Destination::Broadcast,
        Notification::IdChanged { id: conn_id, event },
    )
}

/// Build a reply-timeout envelope for the original sender.
pub fn reply_timeout(id: u64, sender: u64, message_id: u64, cookie: u64) -> Arc<Envelope> {
    envelope(
        id,
        Destination::Id(sender),
        Notification::ReplyTimeout { message_id, cookie },
    )
}

/// Build a reply-dead envelope for the original sender.
pub fn reply_dead(id: u64, sender: u64, message_id: u64, cookie: u64) -> Arc<Envelope> {
    envelope(
        id,
        Destination::Id(sender),
        Notification::ReplyDead { message_id, cookie },
    )
}
