//! Identifier types for bidloop
//!
//! Every record in the ledger is addressed by a typed id so a purchase id can
//! never be handed to something expecting a cycle id. Users are the exception:
//! their ids come from outside the core (account service, API token subject)
//! and are normalized to one opaque [`UserId`] at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing uuid
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parse the canonical hyphenated form
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "({})"), &self.0.simple().to_string()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Cycle identifier
    CycleId,
    "CycleId"
);
record_id!(
    /// Purchase (investment unit) identifier
    PurchaseId,
    "PurchaseId"
);
record_id!(
    /// Earning identifier
    EarningId,
    "EarningId"
);
record_id!(
    /// Outbox transfer identifier
    TransferId,
    "TransferId"
);
record_id!(
    /// Ledger entry (deposit or investment debit) identifier
    EntryId,
    "EntryId"
);
record_id!(
    /// System event identifier
    EventId,
    "EventId"
);

/// Opaque user identifier
///
/// Callers may know users by numeric id, email-derived key or an object id from
/// another store; all of them become a plain string here.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty ids are rejected at the API boundary
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s.trim())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::new(s.trim().to_string())
    }
}
