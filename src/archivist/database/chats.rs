use std::collections::HashMap;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{
        create_column_decode_error, optional_timestamp_millis, parse_optional_timestamp,
        parse_timestamp, placeholders,
    },
};
use crate::archivist::{
    chats::{ChatAttachment, ChatMessage, ChatParticipant, ChatReaction, ChatRoom, ChatRoomType},
    error::{ArchivistError, Result},
    ids::{AccountId, ChatMessageId, ChatRoomId, PostId},
};

static CHAT_ROOM_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "chat_rooms",
    conflict_target: &["id"],
    rules: &[
        ("room_type", MergeRule::Overwrite),
        ("created_at", MergeRule::Max),
        ("created_by_id", MergeRule::PreferIncoming),
        ("is_nsfw", MergeRule::Overwrite),
        ("name", MergeRule::Overwrite),
        ("avatar_image_remote_url", MergeRule::Overwrite),
        ("avatar_image_local_path", MergeRule::KeepIfBlank),
        ("last_messaged_at", MergeRule::Max),
    ],
};

static PARTICIPANT_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "chat_room_participants",
    conflict_target: &["chat_room_id", "account_id"],
    rules: &[
        ("last_read_event_id", MergeRule::Max),
        ("is_chat_settings_valid", MergeRule::Or),
        (
            "is_notifications_disabled",
            MergeRule::OverwriteIf("is_chat_settings_valid"),
        ),
        (
            "is_mention_notifications_disabled",
            MergeRule::OverwriteIf("is_chat_settings_valid"),
        ),
        ("is_read_only", MergeRule::OverwriteIf("is_chat_settings_valid")),
        ("is_trusted", MergeRule::OverwriteIf("is_chat_settings_valid")),
        ("is_muted", MergeRule::OverwriteIf("is_chat_settings_valid")),
        ("status", MergeRule::KeepIfBlank),
    ],
};

static MESSAGE_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "chat_messages",
    conflict_target: &["id"],
    rules: &[
        ("chat_room_id", MergeRule::Keep),
        ("sender_id", MergeRule::Keep),
        ("sent_at", MergeRule::Keep),
        ("request_id", MergeRule::KeepIfBlank),
        ("text", MergeRule::Overwrite),
        ("in_reply_to_id", MergeRule::PreferIncoming),
        ("embedded_post_id", MergeRule::PreferIncoming),
    ],
};

static REACTION_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "chat_message_reactions",
    conflict_target: &["message_id", "sender_id"],
    rules: &[],
};

static ATTACHMENT_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "chat_message_attachments",
    conflict_target: &["id"],
    rules: &[
        ("chat_message_id", MergeRule::Keep),
        ("is_video", MergeRule::Keep),
        ("width", MergeRule::Keep),
        ("height", MergeRule::Keep),
        ("remote_url", MergeRule::Keep),
        ("local_filename", MergeRule::Keep),
        ("thumbnail_remote_url", MergeRule::Keep),
        ("thumbnail_local_filename", MergeRule::Keep),
        ("is_downloaded", MergeRule::Or),
    ],
};

const CHAT_ROOM_COLUMNS: &str = "id, room_type, created_at, created_by_id, is_nsfw, name,
    avatar_image_remote_url, avatar_image_local_path, last_messaged_at";

const MESSAGE_COLUMNS: &str =
    "id, chat_room_id, sender_id, sent_at, request_id, text, in_reply_to_id, embedded_post_id";

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidRoomType(String);

struct ChatRoomRow {
    room: ChatRoom,
}

impl<'r, R> sqlx::FromRow<'r, R> for ChatRoomRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let room_type: String = row.try_get("room_type")?;
        let created_by_id: Option<i64> = row.try_get("created_by_id")?;
        let is_nsfw: i64 = row.try_get("is_nsfw")?;

        let room_type = room_type
            .parse::<ChatRoomType>()
            .map_err(|e| create_column_decode_error("room_type", InvalidRoomType(e)))?;

        Ok(ChatRoomRow {
            room: ChatRoom {
                id: ChatRoomId(id),
                room_type,
                created_at: parse_optional_timestamp(row, "created_at")?,
                created_by_id: created_by_id.map(AccountId),
                is_nsfw: is_nsfw != 0,
                name: row.try_get("name")?,
                avatar_image_remote_url: row.try_get("avatar_image_remote_url")?,
                avatar_image_local_path: row.try_get("avatar_image_local_path")?,
                last_messaged_at: parse_optional_timestamp(row, "last_messaged_at")?,
                participants: HashMap::new(),
            },
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    chat_room_id: String,
    account_id: i64,
    last_read_event_id: i64,
    is_chat_settings_valid: bool,
    is_notifications_disabled: bool,
    is_mention_notifications_disabled: bool,
    is_read_only: bool,
    is_trusted: bool,
    is_muted: bool,
    status: String,
}

struct MessageRow {
    message: ChatMessage,
}

impl<'r, R> sqlx::FromRow<'r, R> for MessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let chat_room_id: String = row.try_get("chat_room_id")?;
        let sender_id: i64 = row.try_get("sender_id")?;
        let in_reply_to_id: Option<i64> = row.try_get("in_reply_to_id")?;
        let embedded_post_id: Option<i64> = row.try_get("embedded_post_id")?;

        let mut message = ChatMessage::new(
            ChatMessageId(id),
            ChatRoomId(chat_room_id),
            AccountId(sender_id),
            parse_timestamp(row, "sent_at")?,
            row.try_get::<String, _>("text")?,
        );
        message.request_id = row.try_get("request_id")?;
        message.in_reply_to_id = in_reply_to_id.map(ChatMessageId);
        message.embedded_post_id = embedded_post_id.map(PostId);
        Ok(MessageRow { message })
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: i64,
    chat_message_id: i64,
    is_video: bool,
    width: i64,
    height: i64,
    remote_url: String,
    local_filename: String,
    thumbnail_remote_url: String,
    thumbnail_local_filename: String,
    is_downloaded: bool,
}

impl ChatRoom {
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("id", self.id.clone().into()),
            ("room_type", self.room_type.to_string().into()),
            ("created_at", optional_timestamp_millis(self.created_at).into()),
            ("created_by_id", self.created_by_id.into()),
            ("is_nsfw", self.is_nsfw.into()),
            ("name", self.name.clone().into()),
            (
                "avatar_image_remote_url",
                self.avatar_image_remote_url.clone().into(),
            ),
            (
                "avatar_image_local_path",
                self.avatar_image_local_path.clone().into(),
            ),
            (
                "last_messaged_at",
                optional_timestamp_millis(self.last_messaged_at).into(),
            ),
        ];

        let mut txn = database.pool.begin().await?;
        upsert(&mut *txn, &CHAT_ROOM_MERGE_POLICY, &values).await?;
        for participant in self.participants.values() {
            let row: Vec<(&str, SqlValue)> = vec![
                ("chat_room_id", self.id.clone().into()),
                ("account_id", participant.account_id.into()),
                ("last_read_event_id", participant.last_read_event_id.into()),
                (
                    "is_chat_settings_valid",
                    participant.is_chat_settings_valid.into(),
                ),
                (
                    "is_notifications_disabled",
                    participant.is_notifications_disabled.into(),
                ),
                (
                    "is_mention_notifications_disabled",
                    participant.is_mention_notifications_disabled.into(),
                ),
                ("is_read_only", participant.is_read_only.into()),
                ("is_trusted", participant.is_trusted.into()),
                ("is_muted", participant.is_muted.into()),
                ("status", participant.status.clone().into()),
            ];
            upsert(&mut *txn, &PARTICIPANT_MERGE_POLICY, &row).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn find_by_id(id: &ChatRoomId, database: &Database) -> Result<ChatRoom> {
        let row = sqlx::query_as::<_, ChatRoomRow>(&format!(
            "SELECT {CHAT_ROOM_COLUMNS} FROM chat_rooms WHERE id = ?"
        ))
        .bind(id.0.as_str())
        .fetch_optional(&database.pool)
        .await?;

        let mut rooms = vec![
            row.map(|r| r.room)
                .ok_or_else(|| ArchivistError::ChatRoomNotFound(id.clone()))?,
        ];
        load_participants(&mut rooms, database).await?;
        Ok(rooms.remove(0))
    }

    /// Rooms the account participates in, most recently active first.
    pub async fn list_for_account(
        account_id: AccountId,
        database: &Database,
    ) -> Result<Vec<ChatRoom>> {
        let rows = sqlx::query_as::<_, ChatRoomRow>(&format!(
            "SELECT {CHAT_ROOM_COLUMNS} FROM chat_rooms
             WHERE id IN (SELECT chat_room_id FROM chat_room_participants WHERE account_id = ?)
             ORDER BY last_messaged_at DESC, id"
        ))
        .bind(account_id)
        .fetch_all(&database.pool)
        .await?;

        let mut rooms: Vec<ChatRoom> = rows.into_iter().map(|r| r.room).collect();
        load_participants(&mut rooms, database).await?;
        Ok(rooms)
    }
}

async fn load_participants(rooms: &mut [ChatRoom], database: &Database) -> Result<()> {
    if rooms.is_empty() {
        return Ok(());
    }

    let query = format!(
        "SELECT chat_room_id, account_id, last_read_event_id, is_chat_settings_valid,
                is_notifications_disabled, is_mention_notifications_disabled, is_read_only,
                is_trusted, is_muted, status
         FROM chat_room_participants WHERE chat_room_id IN ({})",
        placeholders(rooms.len())
    );
    let mut q = sqlx::query_as::<_, ParticipantRow>(&query);
    for room in rooms.iter() {
        q = q.bind(room.id.0.as_str());
    }

    let mut by_room: HashMap<String, HashMap<AccountId, ChatParticipant>> = HashMap::new();
    for row in q.fetch_all(&database.pool).await? {
        let participant = ChatParticipant {
            account_id: AccountId(row.account_id),
            last_read_event_id: row.last_read_event_id,
            is_chat_settings_valid: row.is_chat_settings_valid,
            is_notifications_disabled: row.is_notifications_disabled,
            is_mention_notifications_disabled: row.is_mention_notifications_disabled,
            is_read_only: row.is_read_only,
            is_trusted: row.is_trusted,
            is_muted: row.is_muted,
            status: row.status,
        };
        by_room
            .entry(row.chat_room_id)
            .or_default()
            .insert(participant.account_id, participant);
    }

    for room in rooms.iter_mut() {
        room.participants = by_room.remove(&room.id.0).unwrap_or_default();
    }
    Ok(())
}

impl ChatMessage {
    /// Saves the message with its reactions and attachments, and bumps the room's
    /// last-activity time.
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("id", self.id.into()),
            ("chat_room_id", self.chat_room_id.clone().into()),
            ("sender_id", self.sender_id.into()),
            ("sent_at", self.sent_at.into()),
            ("request_id", self.request_id.clone().into()),
            ("text", self.text.clone().into()),
            ("in_reply_to_id", self.in_reply_to_id.into()),
            ("embedded_post_id", self.embedded_post_id.into()),
        ];

        let mut txn = database.pool.begin().await?;
        upsert(&mut *txn, &MESSAGE_MERGE_POLICY, &values).await?;

        for reaction in self.reactions.values() {
            let row: Vec<(&str, SqlValue)> = vec![
                ("id", reaction.id.into()),
                ("message_id", self.id.into()),
                ("sender_id", reaction.sender_id.into()),
                ("sent_at", reaction.sent_at.into()),
                ("emoji", reaction.emoji.clone().into()),
            ];
            upsert(&mut *txn, &REACTION_MERGE_POLICY, &row).await?;
        }

        for attachment in &self.attachments {
            let row: Vec<(&str, SqlValue)> = vec![
                ("id", attachment.id.into()),
                ("chat_message_id", self.id.into()),
                ("is_video", attachment.is_video.into()),
                ("width", attachment.width.into()),
                ("height", attachment.height.into()),
                ("remote_url", attachment.remote_url.clone().into()),
                ("local_filename", attachment.local_filename.clone().into()),
                (
                    "thumbnail_remote_url",
                    attachment.thumbnail_remote_url.clone().into(),
                ),
                (
                    "thumbnail_local_filename",
                    attachment.thumbnail_local_filename.clone().into(),
                ),
                ("is_downloaded", attachment.is_downloaded.into()),
            ];
            upsert(&mut *txn, &ATTACHMENT_MERGE_POLICY, &row).await?;
        }

        sqlx::query(
            "UPDATE chat_rooms SET last_messaged_at = max(last_messaged_at, ?) WHERE id = ?",
        )
        .bind(self.sent_at.timestamp_millis())
        .bind(self.chat_room_id.0.as_str())
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(())
    }

    pub async fn find_by_id(id: ChatMessageId, database: &Database) -> Result<ChatMessage> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&database.pool)
        .await?;

        let mut messages = vec![
            row.map(|r| r.message)
                .ok_or(ArchivistError::ChatMessageNotFound(id))?,
        ];
        load_message_details(&mut messages, database).await?;
        Ok(messages.remove(0))
    }

    /// Up to `limit` messages of a room older than `before` (or the newest ones when
    /// `before` is `None`), newest first.
    pub async fn page(
        room_id: &ChatRoomId,
        before: Option<ChatMessageId>,
        limit: usize,
        database: &Database,
    ) -> Result<Vec<ChatMessage>> {
        let before_clause = if before.is_some() {
            "AND (sent_at, id) < (SELECT sent_at, id FROM chat_messages WHERE id = ?)"
        } else {
            ""
        };
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages
             WHERE chat_room_id = ? {before_clause}
             ORDER BY sent_at DESC, id DESC LIMIT ?"
        );

        let mut q = sqlx::query_as::<_, MessageRow>(&query).bind(room_id.0.as_str());
        if let Some(before) = before {
            q = q.bind(before);
        }
        let mut messages: Vec<ChatMessage> = q
            .bind(limit as i64)
            .fetch_all(&database.pool)
            .await?
            .into_iter()
            .map(|r| r.message)
            .collect();

        load_message_details(&mut messages, database).await?;
        Ok(messages)
    }
}

async fn load_message_details(messages: &mut [ChatMessage], database: &Database) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let ids: Vec<ChatMessageId> = messages.iter().map(|m| m.id).collect();
    let in_list = placeholders(ids.len());

    let query = format!(
        "SELECT id, message_id, sender_id, sent_at, emoji FROM chat_message_reactions
         WHERE message_id IN ({in_list})"
    );
    let mut q = sqlx::query_as::<_, (i64, i64, i64, i64, String)>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    let mut reactions: HashMap<ChatMessageId, HashMap<AccountId, ChatReaction>> = HashMap::new();
    for (id, message_id, sender_id, sent_at, emoji) in q.fetch_all(&database.pool).await? {
        let sent_at = chrono::DateTime::from_timestamp_millis(sent_at).ok_or_else(|| {
            create_column_decode_error(
                "sent_at",
                super::DatabaseError::InvalidTimestamp { timestamp: sent_at },
            )
        })?;
        let reaction = ChatReaction {
            id,
            message_id: ChatMessageId(message_id),
            sender_id: AccountId(sender_id),
            sent_at,
            emoji,
        };
        reactions
            .entry(reaction.message_id)
            .or_default()
            .insert(reaction.sender_id, reaction);
    }

    let query = format!(
        "SELECT * FROM chat_message_attachments WHERE chat_message_id IN ({in_list}) ORDER BY id"
    );
    let mut q = sqlx::query_as::<_, AttachmentRow>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    let mut attachments: HashMap<ChatMessageId, Vec<ChatAttachment>> = HashMap::new();
    for row in q.fetch_all(&database.pool).await? {
        attachments
            .entry(ChatMessageId(row.chat_message_id))
            .or_default()
            .push(ChatAttachment {
                id: row.id,
                is_video: row.is_video,
                width: row.width,
                height: row.height,
                remote_url: row.remote_url,
                local_filename: row.local_filename,
                thumbnail_remote_url: row.thumbnail_remote_url,
                thumbnail_local_filename: row.thumbnail_local_filename,
                is_downloaded: row.is_downloaded,
            });
    }

    for message in messages.iter_mut() {
        message.reactions = reactions.remove(&message.id).unwrap_or_default();
        message.attachments = attachments.remove(&message.id).unwrap_or_default();
    }
    Ok(())
}
