use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, ListId};

/// A named set of accounts. Online lists mirror a remote list (and carry its ID);
/// local lists exist only here and are the one entity that can be hard-deleted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct List {
    pub id: ListId,
    pub online_list_id: Option<i64>,
    pub name: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub member_ids: Vec<AccountId>,
}

impl List {
    pub fn online(online_list_id: i64, name: impl Into<String>) -> Self {
        List {
            id: ListId::default(),
            online_list_id: Some(online_list_id),
            name: name.into(),
            is_public: true,
            created_at: Utc::now(),
            member_ids: Vec::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online_list_id.is_some()
    }
}
