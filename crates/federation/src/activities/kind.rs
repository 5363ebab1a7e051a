//! Activity type names.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The activity types the kernel dispatches on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Follow,
    Accept,
    Reject,
    Create,
    Announce,
    Like,
    Block,
    Undo,
    Update,
    Delete,
    Move,
    Flag,
    Add,
    Remove,
    Read,
    /// Anything else; kept so the dispatcher can report it.
    Unknown(String),
}

impl ActivityKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Create => "Create",
            Self::Announce => "Announce",
            Self::Like => "Like",
            Self::Block => "Block",
            Self::Undo => "Undo",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Move => "Move",
            Self::Flag => "Flag",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Read => "Read",
            Self::Unknown(name) => name,
        }
    }
}

impl From<&str> for ActivityKind {
    fn from(name: &str) -> Self {
        match name {
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Create" => Self::Create,
            "Announce" => Self::Announce,
            "Like" => Self::Like,
            "Block" => Self::Block,
            "Undo" => Self::Undo,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Move" => Self::Move,
            "Flag" => Self::Flag,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Read" => Self::Read,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ActivityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActivityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name.as_str()))
    }
}
