//! Per-endpoint access-control policy.
//!
//! A policy database is an ordered rule list; the first rule whose
//! subject and verb match decides. With no matching rule the default
//! boundary applies: privileged operations (owning a name, or talking
//! across a uid boundary) are denied, same-uid traffic is allowed.
//!
//! The only mutation is a whole-set replace — rules are never added or
//! removed incrementally, so readers can never observe a half-loaded
//! policy.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The operation a rule or check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    /// Acquire ownership of a well-known name.
    Own,
    /// Deliver a message to a connection or name.
    Send,
    /// Observe a name in list/query results.
    See,
}

impl Verb {
    /// Static label used in error messages.
    pub(crate) fn label(self) -> &'static str {
        match self {
            Verb::Own => "own",
            Verb::Send => "send",
            Verb::See => "see",
        }
    }
}

/// Who a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    /// The calling user id.
    Uid(u32),
    /// The well-known name involved; exact, or a prefix pattern with a
    /// trailing `.*` segment (`org.example.*`).
    Name(String),
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Permit the operation.
    Allow,
    /// Reject the operation with `PermissionDenied`.
    Deny,
}

/// One access-control rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Who the rule applies to.
    pub subject: Subject,
    /// The operation it covers.
    pub verb: Verb,
    /// Whether a match allows or denies.
    pub effect: Effect,
}

/// One access check, carrying everything the default boundary needs.
#[derive(Debug, Clone, Copy)]
pub struct PolicyCheck<'a> {
    /// Uid of the calling connection.
    pub uid: u32,
    /// Uid of the peer (name owner or destination), when known.
    pub peer_uid: Option<u32>,
    /// The well-known name involved, when any.
    pub name: Option<&'a str>,
    /// The operation being attempted.
    pub verb: Verb,
}

/// An ordered, immutable rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDb {
    rules: Vec<PolicyRule>,
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default, rename = "rule")]
    rules: Vec<PolicyRule>,
}

impl PolicyDb {
    /// Build a database from an ordered rule list.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Parse a rule set from TOML (`[[rule]]` tables).
    ///
    /// # Errors
    ///
    /// Fails with the TOML parse error when the document is malformed.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let file: PolicyFile = toml::from_str(s)?;
        Ok(Self::new(file.rules))
    }

    /// Number of rules in the set.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set carries no rules at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a check: first matching rule wins, then the default
    /// boundary (deny privileged, allow same-uid).
    pub fn check(&self, check: PolicyCheck<'_>) -> bool {
        for rule in &self.rules {
            if rule.verb != check.verb {
                continue;
            }
            let matched = match &rule.subject {
                Subject::Uid(uid) => *uid == check.uid,
                Subject::Name(pattern) => check.name.is_some_and(|n| name_matches(pattern, n)),
            };
            if matched {
                return rule.effect == Effect::Allow;
            }
        }
        match check.verb {
            Verb::Own => false,
            Verb::Send | Verb::See => check.peer_uid == Some(check.uid),
        }
    }

    /// Evaluate a check, mapping denial to [`Error::PermissionDenied`].
    pub fn enforce(&self, check: PolicyCheck<'_>) -> Result<()> {
        if self.check(check) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                verb: check.verb.label(),
                what: check.name.unwrap_or("<peer>").to_owned(),
            })
        }
    }
}

/// Exact match, or prefix match when the pattern ends in `.*`.
fn name_matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(".*") {
        name.strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
    } else {
        pattern == name
    }
}
