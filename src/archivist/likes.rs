use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, PostId};

/// `sort_index` is the remote ordering key of the like; it only ever grows.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Like {
    pub sort_index: i64,
    pub post_id: PostId,
    pub liker_id: AccountId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bookmark {
    pub sort_index: i64,
    pub post_id: PostId,
    pub account_id: AccountId,
}
