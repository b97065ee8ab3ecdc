//! Domain identifiers (strongly-typed IDs).
//!
//! Agents, asset groups and commands are all identified by ULIDs. They share a
//! single generic `Id<T>` so the parsing and formatting code exists once, while
//! the phantom marker keeps an `AgentId` from being passed where an
//! `AssetGroupId` is expected.
//!
//! The `Display` form is the bare 26 character ULID. Partition keys and cloud
//! queue names are built from it, so it must stay stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

/// Marker trait for each ID kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Human readable kind, used in parse errors.
    fn kind() -> &'static str;
}

/// Generic ULID-backed identifier.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.ulid, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} id '{value}'")]
pub struct IdParseError {
    pub kind: &'static str,
    pub value: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self::from_ulid)
            .map_err(|_| IdParseError {
                kind: T::kind(),
                value: s.to_string(),
            })
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Agent {}

impl IdMarker for Agent {
    fn kind() -> &'static str {
        "agent"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetGroup {}

impl IdMarker for AssetGroup {
    fn kind() -> &'static str {
        "asset group"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {}

impl IdMarker for Command {
    fn kind() -> &'static str {
        "command"
    }
}

/// External system registered to receive privacy commands.
pub type AgentId = Id<Agent>;

/// Data asset scope a command applies to.
pub type AssetGroupId = Id<AssetGroup>;

/// Identity of a single privacy command.
pub type CommandId = Id<Command>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_bare_ulid() {
        let ulid = Ulid::new();
        let agent = AgentId::from_ulid(ulid);
        assert_eq!(agent.to_string(), ulid.to_string());
        assert_eq!(agent.to_string().len(), 26);
    }

    #[test]
    fn parse_roundtrips_display() {
        let id = CommandId::generate();
        let parsed: CommandId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_error_names_the_kind() {
        let err = "not-a-ulid".parse::<AssetGroupId>().unwrap_err();
        assert_eq!(err.kind, "asset group");
        assert!(err.to_string().contains("not-a-ulid"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = AgentId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<AgentId>(), size_of::<Ulid>());
        assert_eq!(size_of::<CommandId>(), 16);
    }
}
