//! Message envelopes — the unit of transfer between connections.
//!
//! An envelope is built once, wrapped in an [`std::sync::Arc`], and never
//! mutated afterwards; the sender, the destination queue, and in-flight
//! notification bookkeeping may all hold references to the same envelope.
//! The payload is opaque to the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notify::Notification;

/// Source connection id used by bus-synthesized notifications.
///
/// Ordinary connection ids start at 1, so 0 can never collide.
pub const SRC_ID_BUS: u64 = 0;

bitflags::bitflags! {
    /// Envelope flags exposed at the command boundary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MessageFlags: u64 {
        /// The sender expects a reply; a deadline is registered.
        const EXPECT_REPLY = 1 << 0;
        /// Do not activate a starter for the destination name.
        const NO_AUTO_START = 1 << 1;
    }
}

/// Where an envelope is headed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    /// A specific connection id on the bus.
    Id(u64),
    /// The current owner of a well-known name.
    Name(String),
    /// Every active connection on the bus except the sender.
    Broadcast,
}

/// Envelope contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    /// Opaque application payload, handed through unexamined.
    User(Vec<u8>),
    /// A bus-synthesized notification.
    Notification(Notification),
}

/// A single message in flight or at rest in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message id, unique for the bus's lifetime.
    pub id: u64,
    /// Sending connection id; [`SRC_ID_BUS`] for notifications.
    pub src_id: u64,
    /// Destination as given by the sender.
    pub destination: Destination,
    /// Sender-chosen correlation cookie.
    pub cookie: u64,
    /// Cookie of the message this one replies to, if it is a reply.
    pub cookie_reply: Option<u64>,
    /// Envelope flags.
    pub flags: MessageFlags,
    /// Absolute reply deadline; `None` means no reply is expected.
    pub deadline: Option<DateTime<Utc>>,
    /// Payload or synthesized notification.
    pub body: Body,
}

impl Envelope {
    /// Total payload size in bytes (0 for notifications).
    pub fn size(&self) -> usize {
        match &self.body {
            Body::User(payload) => payload.len(),
            Body::Notification(_) => 0,
        }
    }

    /// Whether the sender registered a reply deadline for this envelope.
    pub fn expects_reply(&self) -> bool {
        self.deadline.is_some()
    }

    /// The notification carried by this envelope, if any.
    pub fn notification(&self) -> Option<&Notification> {
        match &self.body {
            Body::Notification(n) => Some(n),
            Body::User(_) => None,
        }
    }
}

/// Caller-supplied fields of an outbound message, before the bus assigns
/// an id and stamps the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSpec {
    /// Destination connection id, name, or broadcast.
    pub destination: Destination,
    /// Correlation cookie echoed back by repliers.
    #[serde(default)]
    pub cookie: u64,
    /// Set when this message replies to an earlier one.
    #[serde(default)]
    pub cookie_reply: Option<u64>,
    /// Flags; `EXPECT_REPLY` is implied by a deadline.
    #[serde(default)]
    pub flags: MessageFlags,
    /// Absolute deadline by which a reply is expected.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl MessageSpec {
    /// A plain one-way message to the given destination.
    pub fn to(destination: Destination, payload: Vec<u8>) -> Self {
        Self {
            destination,
            cookie: 0,
            cookie_reply: None,
            flags: MessageFlags::empty(),
            deadline: None,
            payload,
        }
    }

    /// Set the correlation cookie.
    #[must_use]
    pub fn cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }

    /// Expect a reply by `deadline`.
    #[must_use]
    pub fn expect_reply(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self.flags |= MessageFlags::EXPECT_REPLY;
        self
    }

    /// Mark this message as a reply to message id `id`.
    #[must_use]
    pub fn in_reply_to(mut self, id: u64) -> Self {
        self.cookie_reply = Some(id);
        self
    }
}
