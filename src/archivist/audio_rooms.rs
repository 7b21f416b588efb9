use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, AudioRoomId};

/// A live audio broadcast a post can link to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct AudioRoom {
    pub id: AudioRoomId,
    pub created_by_id: Option<AccountId>,
    pub short_url: String,
    pub state: String,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_available_for_replay: bool,
    pub replay_watch_count: i64,
    pub live_listeners_count: i64,
    /// Only rooms fetched from their own detail endpoint carry authoritative metadata.
    pub is_details_fetched: bool,
    pub participant_ids: Vec<AccountId>,
}

impl AudioRoom {
    pub fn new(id: impl Into<AudioRoomId>) -> Self {
        AudioRoom {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some() || self.state == "Ended"
    }
}
