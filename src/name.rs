//! Well-known name syntax and acquisition flags.
//!
//! A well-known name is a dot-separated service identifier such as
//! `org.example.Foo`. Syntax is validated before any registry mutation:
//! at least two non-empty segments, each segment made of ASCII
//! alphanumerics and underscore and not starting with a digit.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a well-known name in bytes.
pub const MAX_NAME_LEN: usize = 255;

bitflags! {
    /// Flags supplied with a name-acquire request.
    ///
    /// `ALLOW_REPLACEMENT` and `QUEUE` stick to the resulting entry;
    /// `REPLACE_EXISTING` only affects the single request carrying it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NameFlags: u64 {
        /// The owner consents to losing the name to a replacer.
        const ALLOW_REPLACEMENT = 1 << 0;
        /// Take the name from a consenting current owner.
        const REPLACE_EXISTING = 1 << 1;
        /// Wait in the FIFO queue if the name is taken.
        const QUEUE = 1 << 2;
    }
}

/// Check a well-known name against the syntax rules.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut segments = 0usize;
    for segment in name.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        segments = segments.saturating_add(1);
    }
    segments >= 2
}

/// Validate a name, mapping failure to [`Error::InvalidName`].
pub fn validate_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_owned()))
    }
}
