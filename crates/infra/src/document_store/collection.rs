//! Collection naming and write durability settings.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use docq_core::DomainError;

/// Longest index suffix a backend appends to the name (`_queue_reserved_idx`).
pub const MAX_INDEX_SUFFIX_LEN: usize = 19;

/// Postgres truncates identifiers to 63 bytes; leave room for index suffixes
/// so derived index names stay distinct.
pub const MAX_COLLECTION_NAME_LEN: usize = 63 - MAX_INDEX_SUFFIX_LEN;

/// Name of a collection (a table, for SQL backends).
///
/// Restricted to ASCII letters, digits and `_`, not starting with a digit.
/// SQL backends always interpolate it through [`quoted`](Self::quoted), so
/// reserved words and mixed case are kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::validation("collection name must not be empty"));
        }
        if name.len() > MAX_COLLECTION_NAME_LEN {
            return Err(DomainError::validation(format!(
                "collection name '{name}' exceeds {MAX_COLLECTION_NAME_LEN} characters"
            )));
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "collection name '{name}' must not start with a digit"
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DomainError::validation(format!(
                "collection name '{name}' may only contain ASCII letters, digits and '_'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted SQL identifier for this name.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Double-quoted identifier for an object derived from this name, such
    /// as `<name>_queue_sequence_idx`.
    pub fn quoted_with_suffix(&self, suffix: &str) -> String {
        format!("\"{}{}\"", self.0, suffix)
    }
}

impl Default for CollectionName {
    fn default() -> Self {
        Self("jobs".to_string())
    }
}

impl core::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CollectionName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CollectionName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(value: CollectionName) -> Self {
        value.0
    }
}

/// Durability a mutation must reach before the store acknowledges it.
///
/// A reservation acknowledged below `Majority` can be lost on failover and
/// the job claimed again before its apparent lease ends; that is an accepted
/// at-least-once risk, not a protocol violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    /// Fire and forget.
    Unacknowledged,
    /// Acknowledged by the primary, not yet necessarily on disk.
    Local,
    /// Flushed to the primary's journal / WAL.
    Journaled,
    /// Replicated to a majority (synchronous standbys) before acknowledgment.
    #[default]
    Majority,
}

impl WriteConcern {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteConcern::Unacknowledged => "unacknowledged",
            WriteConcern::Local => "local",
            WriteConcern::Journaled => "journaled",
            WriteConcern::Majority => "majority",
        }
    }

    /// Equivalent Postgres `synchronous_commit` level.
    pub fn synchronous_commit(self) -> &'static str {
        match self {
            WriteConcern::Unacknowledged => "off",
            WriteConcern::Local => "local",
            WriteConcern::Journaled => "on",
            WriteConcern::Majority => "remote_apply",
        }
    }
}

impl core::fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteConcern {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unacknowledged" | "0" => Ok(WriteConcern::Unacknowledged),
            "local" | "acknowledged" | "1" => Ok(WriteConcern::Local),
            "journaled" | "journal" => Ok(WriteConcern::Journaled),
            "majority" => Ok(WriteConcern::Majority),
            other => Err(DomainError::validation(format!(
                "unknown write concern '{other}' (expected unacknowledged, local, journaled or majority)"
            ))),
        }
    }
}
