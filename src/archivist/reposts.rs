use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, PostId, RepostId};

/// A repost is immutable: once stored it is never updated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Repost {
    pub id: RepostId,
    pub post_id: PostId,
    pub reposted_by_id: AccountId,
    pub reposted_at: DateTime<Utc>,
}
