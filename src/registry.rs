//! Per-bus well-known name registry.
//!
//! The registry lives inside the bus-wide lock (see [`crate::bus`]), so
//! every operation on the same name is totally ordered. Each entry holds
//! the owning connection id (a plain back-reference, resolved through the
//! bus's connection map) and a FIFO queue of waiters. Ownership moves
//! strictly first-queued, first-served.
//!
//! Methods return [`OwnerChange`] events instead of emitting
//! notifications themselves; the bus fans them out while still holding
//! its lock, so observers see owner changes in registry order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::name::{validate_name, NameFlags};

/// Result of a successful acquire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireOutcome {
    /// The requester owns the name now.
    Owner,
    /// The name is taken; the requester waits in the FIFO queue.
    Queued,
}

/// One (name, owner) pair as reported by list/query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameInfo {
    /// The well-known name.
    pub name: String,
    /// Connection id of the current owner.
    pub owner: u64,
    /// Flags the owner acquired the name with.
    pub flags: NameFlags,
}

/// An ownership transition produced by a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OwnerChange {
    /// The name whose owner changed.
    pub name: String,
    /// Previous owner, `None` when the name was unowned.
    pub old: Option<u64>,
    /// New owner, `None` when the entry was deleted.
    pub new: Option<u64>,
}

#[derive(Debug)]
struct NameEntry {
    owner: u64,
    flags: NameFlags,
    /// Waiters in arrival order, each with the flags it requested.
    queue: VecDeque<(u64, NameFlags)>,
}

/// Flag bits that stick to an entry once a request succeeds.
fn sticky(flags: NameFlags) -> NameFlags {
    flags & (NameFlags::ALLOW_REPLACEMENT | NameFlags::QUEUE)
}

/// The per-bus name table. Only touched under the bus lock.
#[derive(Debug, Default)]
pub(crate) struct NameRegistry {
    entries: BTreeMap<String, NameEntry>,
}

impl NameRegistry {
    /// Acquire `name` for `conn`, queueing or replacing per `flags`.
    ///
    /// The caller has already passed the policy gate for `own`.
    pub(crate) fn acquire(
        &mut self,
        conns: &HashMap<u64, Arc<Connection>>,
        conn: &Arc<Connection>,
        name: &str,
        flags: NameFlags,
    ) -> Result<(AcquireOutcome, Vec<OwnerChange>)> {
        validate_name(name)?;
        if conn.owned_name_count() >= conn.limits().max_names_per_connection {
            return Err(Error::OutOfResources("per-connection name budget"));
        }

        let Some(entry) = self.entries.get_mut(name) else {
            self.entries.insert(
                name.to_owned(),
                NameEntry {
                    owner: conn.id(),
                    flags: sticky(flags),
                    queue: VecDeque::new(),
                },
            );
            conn.note_name_acquired(name);
            let change = OwnerChange {
                name: name.to_owned(),
                old: None,
                new: Some(conn.id()),
            };
            return Ok((AcquireOutcome::Owner, vec![change]));
        };

        if entry.owner == conn.id() {
            // Re-acquire by the owner just refreshes the sticky flags.
            entry.flags = sticky(flags);
            return Ok((AcquireOutcome::Owner, vec![]));
        }

        let replaceable = entry.flags.contains(NameFlags::ALLOW_REPLACEMENT)
            || owner_is_starter(conns, entry.owner);
        if flags.contains(NameFlags::REPLACE_EXISTING) && replaceable {
            let old = entry.owner;
            entry.owner = conn.id();
            entry.flags = sticky(flags);
            if remove_waiter(entry, conn.id()) {
                conn.note_name_unqueued(name);
            }
            if let Some(evicted) = conns.get(&old) {
                evicted.note_name_released(name);
            }
            conn.note_name_acquired(name);
            let change = OwnerChange {
                name: name.to_owned(),
                old: Some(old),
                new: Some(conn.id()),
            };
            return Ok((AcquireOutcome::Owner, vec![change]));
        }

        if flags.contains(NameFlags::QUEUE) {
            if let Some(slot) = entry.queue.iter_mut().find(|(id, _)| *id == conn.id()) {
                slot.1 = flags;
            } else {
                entry.queue.push_back((conn.id(), flags));
                conn.note_name_queued(name);
            }
            return Ok((AcquireOutcome::Queued, vec![]));
        }

        Err(Error::NameInUse(name.to_owned()))
    }

    /// Release `name`, promoting the head waiter if any.
    pub(crate) fn release(
        &mut self,
        conns: &HashMap<u64, Arc<Connection>>,
        conn: &Arc<Connection>,
        name: &str,
    ) -> Result<Vec<OwnerChange>> {
        validate_name(name)?;
        match self.entries.get(name) {
            Some(entry) if entry.owner == conn.id() => {}
            _ => return Err(Error::NotOwner(name.to_owned())),
        }
        conn.note_name_released(name);
        Ok(vec![self.hand_over(conns, name, conn.id())])
    }

    /// Snapshot of all entries, in name order.
    pub(crate) fn list(&self) -> Vec<NameInfo> {
        self.entries
            .iter()
            .map(|(name, entry)| NameInfo {
                name: name.clone(),
                owner: entry.owner,
                flags: entry.flags,
            })
            .collect()
    }

    /// Owner and flags for one name.
    pub(crate) fn query(&self, name: &str) -> Option<NameInfo> {
        self.entries.get(name).map(|entry| NameInfo {
            name: name.to_owned(),
            owner: entry.owner,
            flags: entry.flags,
        })
    }

    /// Current owner id of `name`, if owned.
    pub(crate) fn owner_of(&self, name: &str) -> Option<u64> {
        self.entries.get(name).map(|entry| entry.owner)
    }

    /// Drop every trace of a disconnecting connection: owned names are
    /// handed over (or deleted), waiting-queue memberships are removed.
    ///
    /// Produces exactly one [`OwnerChange`] per owned name.
    pub(crate) fn remove_by_connection(
        &mut self,
        conns: &HashMap<u64, Arc<Connection>>,
        conn: &Arc<Connection>,
    ) -> Vec<OwnerChange> {
        let mut changes = Vec::new();
        for name in conn.owned_names() {
            conn.note_name_released(&name);
            changes.push(self.hand_over(conns, &name, conn.id()));
        }
        for name in conn.queued_names() {
            if let Some(entry) = self.entries.get_mut(&name) {
                remove_waiter(entry, conn.id());
            }
            conn.note_name_unqueued(&name);
        }
        changes
    }

    /// Move `name` from `old` to the head waiter, or delete the entry.
    fn hand_over(
        &mut self,
        conns: &HashMap<u64, Arc<Connection>>,
        name: &str,
        old: u64,
    ) -> OwnerChange {
        let Some(entry) = self.entries.get_mut(name) else {
            return OwnerChange {
                name: name.to_owned(),
                old: Some(old),
                new: None,
            };
        };
        while let Some((next_id, next_flags)) = entry.queue.pop_front() {
            // Waiters are unlinked on disconnect; a stale id is skipped.
            let Some(next) = conns.get(&next_id) else {
                continue;
            };
            entry.owner = next_id;
            entry.flags = sticky(next_flags);
            next.note_name_unqueued(name);
            next.note_name_acquired(name);
            return OwnerChange {
                name: name.to_owned(),
                old: Some(old),
                new: Some(next_id),
            };
        }
        self.entries.remove(name);
        OwnerChange {
            name: name.to_owned(),
            old: Some(old),
            new: None,
        }
    }
}

fn owner_is_starter(conns: &HashMap<u64, Arc<Connection>>, owner: u64) -> bool {
    conns.get(&owner).is_some_and(|c| c.is_starter())
}

/// Remove `id` from the waiter queue; true when it was present.
fn remove_waiter(entry: &mut NameEntry, id: u64) -> bool {
    let before = entry.queue.len();
    entry.queue.retain(|(queued, _)| *queued != id);
    entry.queue.len() != before
}
