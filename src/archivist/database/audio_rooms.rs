use std::collections::HashMap;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{optional_timestamp_millis, parse_flag, parse_optional_timestamp, placeholders},
};
use crate::archivist::{
    audio_rooms::AudioRoom,
    error::{ArchivistError, Result},
    ids::{AccountId, AudioRoomId},
};

static AUDIO_ROOM_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "audio_rooms",
    conflict_target: &["id"],
    rules: &[
        ("created_by_id", MergeRule::PreferIncoming),
        ("short_url", MergeRule::KeepIfBlank),
        ("state", MergeRule::KeepIfBlank),
        ("title", MergeRule::OverwriteIf("is_details_fetched")),
        ("created_at", MergeRule::Max),
        ("started_at", MergeRule::Max),
        ("ended_at", MergeRule::Max),
        ("updated_at", MergeRule::Max),
        (
            "is_available_for_replay",
            MergeRule::OverwriteIf("is_details_fetched"),
        ),
        (
            "replay_watch_count",
            MergeRule::OverwriteIf("is_details_fetched"),
        ),
        (
            "live_listeners_count",
            MergeRule::OverwriteIf("is_details_fetched"),
        ),
        ("is_details_fetched", MergeRule::Or),
    ],
};

static PARTICIPANT_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "audio_room_participants",
    conflict_target: &["audio_room_id", "account_id"],
    rules: &[],
};

const AUDIO_ROOM_COLUMNS: &str = "id, created_by_id, short_url, state, title, created_at,
    started_at, ended_at, updated_at, is_available_for_replay, replay_watch_count,
    live_listeners_count, is_details_fetched";

struct AudioRoomRow {
    room: AudioRoom,
}

impl<'r, R> sqlx::FromRow<'r, R> for AudioRoomRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let created_by_id: Option<i64> = row.try_get("created_by_id")?;

        Ok(AudioRoomRow {
            room: AudioRoom {
                id: AudioRoomId(id),
                created_by_id: created_by_id.map(AccountId),
                short_url: row.try_get("short_url")?,
                state: row.try_get("state")?,
                title: row.try_get("title")?,
                created_at: parse_optional_timestamp(row, "created_at")?,
                started_at: parse_optional_timestamp(row, "started_at")?,
                ended_at: parse_optional_timestamp(row, "ended_at")?,
                updated_at: parse_optional_timestamp(row, "updated_at")?,
                is_available_for_replay: parse_flag(row, "is_available_for_replay")?,
                replay_watch_count: row.try_get("replay_watch_count")?,
                live_listeners_count: row.try_get("live_listeners_count")?,
                is_details_fetched: parse_flag(row, "is_details_fetched")?,
                participant_ids: Vec::new(),
            },
        })
    }
}

impl AudioRoom {
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("id", self.id.clone().into()),
            ("created_by_id", self.created_by_id.into()),
            ("short_url", self.short_url.clone().into()),
            ("state", self.state.clone().into()),
            ("title", self.title.clone().into()),
            ("created_at", optional_timestamp_millis(self.created_at).into()),
            ("started_at", optional_timestamp_millis(self.started_at).into()),
            ("ended_at", optional_timestamp_millis(self.ended_at).into()),
            ("updated_at", optional_timestamp_millis(self.updated_at).into()),
            ("is_available_for_replay", self.is_available_for_replay.into()),
            ("replay_watch_count", self.replay_watch_count.into()),
            ("live_listeners_count", self.live_listeners_count.into()),
            ("is_details_fetched", self.is_details_fetched.into()),
        ];

        let mut txn = database.pool.begin().await?;
        upsert(&mut *txn, &AUDIO_ROOM_MERGE_POLICY, &values).await?;
        for participant in &self.participant_ids {
            let row: Vec<(&str, SqlValue)> = vec![
                ("audio_room_id", self.id.clone().into()),
                ("account_id", (*participant).into()),
            ];
            upsert(&mut *txn, &PARTICIPANT_MERGE_POLICY, &row).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn find_by_id(id: &AudioRoomId, database: &Database) -> Result<AudioRoom> {
        Self::find_many(std::slice::from_ref(id), database)
            .await?
            .pop()
            .ok_or_else(|| ArchivistError::AudioRoomNotFound(id.clone()))
    }

    pub async fn find_many(ids: &[AudioRoomId], database: &Database) -> Result<Vec<AudioRoom>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let in_list = placeholders(ids.len());

        let query = format!("SELECT {AUDIO_ROOM_COLUMNS} FROM audio_rooms WHERE id IN ({in_list})");
        let mut q = sqlx::query_as::<_, AudioRoomRow>(&query);
        for id in ids {
            q = q.bind(id.0.as_str());
        }
        let mut rooms: Vec<AudioRoom> = q
            .fetch_all(&database.pool)
            .await?
            .into_iter()
            .map(|r| r.room)
            .collect();

        let query = format!(
            "SELECT audio_room_id, account_id FROM audio_room_participants
             WHERE audio_room_id IN ({in_list}) ORDER BY rowid"
        );
        let mut q = sqlx::query_as::<_, (String, i64)>(&query);
        for id in ids {
            q = q.bind(id.0.as_str());
        }
        let mut participants: HashMap<String, Vec<AccountId>> = HashMap::new();
        for (room_id, account_id) in q.fetch_all(&database.pool).await? {
            participants
                .entry(room_id)
                .or_default()
                .push(AccountId(account_id));
        }

        for room in rooms.iter_mut() {
            room.participant_ids = participants.remove(&room.id.0).unwrap_or_default();
        }
        Ok(rooms)
    }
}
