//! Identifier newtypes.
//!
//! Numeric identifiers come from the remote source, with two exceptions: synthetic
//! account IDs (allocated locally, see [`AccountId::FIRST_SYNTHETIC`]) and local list IDs.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

int_id!(
    /// Remote account ID, or a locally allocated synthetic one
    AccountId
);
int_id!(PostId);
int_id!(RepostId);
int_id!(NotificationId);
int_id!(ChatMessageId);
int_id!(
    /// Local row id of a list (online lists also carry their remote ID separately)
    ListId
);
string_id!(AudioRoomId);
string_id!(ChatRoomId);

impl AccountId {
    /// Placeholder for "author not known yet"; never stored.
    pub const UNKNOWN: AccountId = AccountId(0);

    /// Synthetic IDs are allocated upwards from here, far above any remote ID.
    pub const FIRST_SYNTHETIC: AccountId = AccountId(0x4000_0000_0000_0000);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    /// Provisional IDs are negative: they only exist inside a [`Trove`](super::trove::Trove)
    /// until the account is saved.
    pub fn is_provisional(self) -> bool {
        self.0 < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&PostId(12)).unwrap(), "12");
        assert_eq!(
            serde_json::to_string(&ChatRoomId::from("1-2")).unwrap(),
            "\"1-2\""
        );
        let id: AccountId = serde_json::from_str("99").unwrap();
        assert_eq!(id, AccountId(99));
    }

    #[test]
    fn test_account_id_classification() {
        assert!(AccountId::UNKNOWN.is_unknown());
        assert!(AccountId(-3).is_provisional());
        assert!(!AccountId::FIRST_SYNTHETIC.is_provisional());
        assert_eq!(AccountId(5).to_string(), "5");
    }
}
