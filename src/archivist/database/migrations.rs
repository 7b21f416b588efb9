//! Versioned schema migrations.
//!
//! The database records a single integer version. Entry `i` of [`MIGRATIONS`] moves the
//! schema from version `i` to `i + 1`, so the current version is the list length. Entries
//! are append-only: once released they are never edited or reordered.

use sqlx::SqlitePool;

use super::DatabaseError;

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub description: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        description: "base accounts, posts, reposts and attachments",
        sql: r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                handle TEXT NOT NULL,
                bio TEXT NOT NULL DEFAULT '',
                following_count INTEGER NOT NULL DEFAULT 0,
                followers_count INTEGER NOT NULL DEFAULT 0,
                location TEXT NOT NULL DEFAULT '',
                website TEXT NOT NULL DEFAULT '',
                join_date INTEGER NOT NULL DEFAULT 0,
                is_private INTEGER NOT NULL DEFAULT 0,
                is_verified INTEGER NOT NULL DEFAULT 0,
                is_banned INTEGER NOT NULL DEFAULT 0,
                profile_image_url TEXT NOT NULL DEFAULT '',
                profile_image_local_path TEXT NOT NULL DEFAULT '',
                banner_image_url TEXT NOT NULL DEFAULT '',
                banner_image_local_path TEXT NOT NULL DEFAULT '',
                pinned_post_id INTEGER,
                is_followed INTEGER NOT NULL DEFAULT 0,
                is_content_downloaded INTEGER NOT NULL DEFAULT 0,
                is_id_fake INTEGER NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX accounts_handle_unique ON accounts (handle COLLATE NOCASE);

            CREATE TABLE fake_account_sequence (latest_fake_id INTEGER NOT NULL);
            INSERT INTO fake_account_sequence (latest_fake_id) VALUES (4611686018427387903);

            CREATE TABLE posts (
                id INTEGER PRIMARY KEY,
                author_id INTEGER NOT NULL DEFAULT 0,
                text TEXT NOT NULL DEFAULT '',
                is_expandable INTEGER NOT NULL DEFAULT 0,
                posted_at INTEGER NOT NULL DEFAULT 0,
                num_likes INTEGER NOT NULL DEFAULT 0,
                num_reposts INTEGER NOT NULL DEFAULT 0,
                num_replies INTEGER NOT NULL DEFAULT 0,
                num_quotes INTEGER NOT NULL DEFAULT 0,
                in_reply_to_id INTEGER,
                quoted_post_id INTEGER,
                tombstone_type TEXT,
                is_stub INTEGER NOT NULL DEFAULT 0,
                is_content_downloaded INTEGER NOT NULL DEFAULT 0,
                last_scraped_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX posts_author_id ON posts (author_id);
            CREATE INDEX posts_posted_at ON posts (posted_at);
            CREATE INDEX posts_in_reply_to_id ON posts (in_reply_to_id);
            CREATE INDEX posts_quoted_post_id ON posts (quoted_post_id);

            CREATE TABLE reposts (
                id INTEGER PRIMARY KEY,
                post_id INTEGER NOT NULL,
                reposted_by_id INTEGER NOT NULL,
                reposted_at INTEGER NOT NULL
            );
            CREATE INDEX reposts_post_id ON reposts (post_id);
            CREATE INDEX reposts_reposted_by_id ON reposts (reposted_by_id);

            CREATE TABLE images (
                id INTEGER PRIMARY KEY,
                post_id INTEGER NOT NULL REFERENCES posts (id),
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                remote_url TEXT NOT NULL,
                local_filename TEXT NOT NULL,
                is_downloaded INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX images_post_id ON images (post_id);

            CREATE TABLE videos (
                id INTEGER PRIMARY KEY,
                post_id INTEGER NOT NULL REFERENCES posts (id),
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                remote_url TEXT NOT NULL,
                local_filename TEXT NOT NULL,
                thumbnail_remote_url TEXT NOT NULL DEFAULT '',
                thumbnail_local_filename TEXT NOT NULL DEFAULT '',
                duration_ms INTEGER NOT NULL DEFAULT 0,
                view_count INTEGER NOT NULL DEFAULT 0,
                is_gif INTEGER NOT NULL DEFAULT 0,
                is_downloaded INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX videos_post_id ON videos (post_id);

            CREATE TABLE link_cards (
                post_id INTEGER NOT NULL REFERENCES posts (id),
                expanded_url TEXT NOT NULL,
                short_url TEXT NOT NULL DEFAULT '',
                domain TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                creator_id INTEGER,
                site_id INTEGER,
                thumbnail_width INTEGER NOT NULL DEFAULT 0,
                thumbnail_height INTEGER NOT NULL DEFAULT 0,
                thumbnail_remote_url TEXT NOT NULL DEFAULT '',
                thumbnail_local_path TEXT NOT NULL DEFAULT '',
                has_card INTEGER NOT NULL DEFAULT 0,
                has_thumbnail INTEGER NOT NULL DEFAULT 0,
                is_content_downloaded INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (post_id, expanded_url)
            );

            CREATE TABLE polls (
                id INTEGER PRIMARY KEY,
                post_id INTEGER NOT NULL REFERENCES posts (id),
                choices TEXT NOT NULL DEFAULT '[]',
                voting_duration_secs INTEGER NOT NULL DEFAULT 0,
                voting_ends_at INTEGER NOT NULL DEFAULT 0,
                last_scraped_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX polls_post_id ON polls (post_id);

            CREATE TABLE post_hashtags (
                post_id INTEGER NOT NULL REFERENCES posts (id),
                text TEXT NOT NULL,
                PRIMARY KEY (post_id, text)
            );
            CREATE TABLE post_mentions (
                post_id INTEGER NOT NULL REFERENCES posts (id),
                handle TEXT NOT NULL,
                PRIMARY KEY (post_id, handle)
            );
            CREATE TABLE post_reply_mentions (
                post_id INTEGER NOT NULL REFERENCES posts (id),
                handle TEXT NOT NULL,
                PRIMARY KEY (post_id, handle)
            );
        "#,
    },
    Migration {
        description: "audio rooms",
        sql: r#"
            CREATE TABLE audio_rooms (
                id TEXT PRIMARY KEY,
                created_by_id INTEGER,
                short_url TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL DEFAULT 0,
                ended_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                is_available_for_replay INTEGER NOT NULL DEFAULT 0,
                replay_watch_count INTEGER NOT NULL DEFAULT 0,
                live_listeners_count INTEGER NOT NULL DEFAULT 0,
                is_details_fetched INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE audio_room_participants (
                audio_room_id TEXT NOT NULL REFERENCES audio_rooms (id) ON DELETE CASCADE,
                account_id INTEGER NOT NULL,
                PRIMARY KEY (audio_room_id, account_id)
            );
            ALTER TABLE posts ADD COLUMN audio_room_id TEXT;
        "#,
    },
    Migration {
        description: "likes and bookmarks",
        sql: r#"
            CREATE TABLE likes (
                sort_index INTEGER NOT NULL,
                post_id INTEGER NOT NULL,
                liker_id INTEGER NOT NULL,
                UNIQUE (liker_id, post_id)
            );
            CREATE INDEX likes_post_id ON likes (post_id);

            CREATE TABLE bookmarks (
                sort_index INTEGER NOT NULL,
                post_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                UNIQUE (account_id, post_id)
            );
            CREATE INDEX bookmarks_post_id ON bookmarks (post_id);
        "#,
    },
    Migration {
        description: "lists",
        sql: r#"
            CREATE TABLE lists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                online_list_id INTEGER UNIQUE,
                name TEXT NOT NULL,
                is_public INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE list_members (
                list_id INTEGER NOT NULL REFERENCES lists (id) ON DELETE CASCADE,
                account_id INTEGER NOT NULL,
                PRIMARY KEY (list_id, account_id)
            );
            CREATE INDEX list_members_account_id ON list_members (account_id);
        "#,
    },
    Migration {
        description: "notifications",
        sql: r#"
            CREATE TABLE notifications (
                id INTEGER PRIMARY KEY,
                notification_type INTEGER NOT NULL,
                sent_at INTEGER NOT NULL DEFAULT 0,
                sort_index INTEGER NOT NULL DEFAULT 0,
                acting_account_id INTEGER,
                post_id INTEGER,
                repost_id INTEGER,
                recipient_id INTEGER NOT NULL,
                has_detail INTEGER NOT NULL DEFAULT 0,
                last_scraped_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX notifications_recipient_sort ON notifications (recipient_id, sort_index);

            CREATE TABLE notification_accounts (
                notification_id INTEGER NOT NULL REFERENCES notifications (id),
                account_id INTEGER NOT NULL,
                PRIMARY KEY (notification_id, account_id)
            );
            CREATE TABLE notification_posts (
                notification_id INTEGER NOT NULL REFERENCES notifications (id),
                post_id INTEGER NOT NULL,
                PRIMARY KEY (notification_id, post_id)
            );
        "#,
    },
    Migration {
        description: "direct messages",
        sql: r#"
            CREATE TABLE chat_rooms (
                id TEXT PRIMARY KEY,
                room_type TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT 0,
                created_by_id INTEGER,
                is_nsfw INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL DEFAULT '',
                avatar_image_remote_url TEXT NOT NULL DEFAULT '',
                avatar_image_local_path TEXT NOT NULL DEFAULT '',
                last_messaged_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE chat_room_participants (
                chat_room_id TEXT NOT NULL REFERENCES chat_rooms (id),
                account_id INTEGER NOT NULL,
                last_read_event_id INTEGER NOT NULL DEFAULT 0,
                is_chat_settings_valid INTEGER NOT NULL DEFAULT 0,
                is_notifications_disabled INTEGER NOT NULL DEFAULT 0,
                is_mention_notifications_disabled INTEGER NOT NULL DEFAULT 0,
                is_read_only INTEGER NOT NULL DEFAULT 0,
                is_trusted INTEGER NOT NULL DEFAULT 0,
                is_muted INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (chat_room_id, account_id)
            );
            CREATE TABLE chat_messages (
                id INTEGER PRIMARY KEY,
                chat_room_id TEXT NOT NULL REFERENCES chat_rooms (id),
                sender_id INTEGER NOT NULL,
                sent_at INTEGER NOT NULL,
                request_id TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                in_reply_to_id INTEGER,
                embedded_post_id INTEGER
            );
            CREATE INDEX chat_messages_room_sent ON chat_messages (chat_room_id, sent_at);

            CREATE TABLE chat_message_reactions (
                id INTEGER NOT NULL,
                message_id INTEGER NOT NULL REFERENCES chat_messages (id),
                sender_id INTEGER NOT NULL,
                sent_at INTEGER NOT NULL,
                emoji TEXT NOT NULL,
                UNIQUE (message_id, sender_id)
            );
            CREATE TABLE chat_message_attachments (
                id INTEGER PRIMARY KEY,
                chat_message_id INTEGER NOT NULL REFERENCES chat_messages (id),
                is_video INTEGER NOT NULL DEFAULT 0,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                remote_url TEXT NOT NULL,
                local_filename TEXT NOT NULL,
                thumbnail_remote_url TEXT NOT NULL DEFAULT '',
                thumbnail_local_filename TEXT NOT NULL DEFAULT '',
                is_downloaded INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX chat_message_attachments_message ON chat_message_attachments (chat_message_id);
        "#,
    },
    Migration {
        description: "deleted accounts, blocked videos, conversation scraping",
        sql: r#"
            ALTER TABLE accounts ADD COLUMN is_deleted INTEGER NOT NULL DEFAULT 0;
            DROP INDEX accounts_handle_unique;
            CREATE UNIQUE INDEX accounts_active_handle_unique
                ON accounts (handle COLLATE NOCASE) WHERE is_deleted = 0;

            ALTER TABLE videos ADD COLUMN is_blocked_by_dmca INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE videos ADD COLUMN is_geoblocked INTEGER NOT NULL DEFAULT 0;

            ALTER TABLE posts ADD COLUMN is_conversation_scraped INTEGER NOT NULL DEFAULT 0;
        "#,
    },
];

/// Applies pending [`Migration`]s, one transaction per step.
#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    migrations: &'static [Migration],
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(MIGRATIONS)
    }
}

impl Migrator {
    pub fn new(migrations: &'static [Migration]) -> Self {
        Self { migrations }
    }

    /// The version a fully migrated database reports.
    pub fn current_version(&self) -> i64 {
        self.migrations.len() as i64
    }

    /// Brings the database up to [`Migrator::current_version`] and returns that version.
    ///
    /// The stored version is bumped inside each step's transaction, so an interrupted
    /// upgrade resumes from the last completed step.
    pub async fn run(&self, pool: &SqlitePool) -> Result<i64, DatabaseError> {
        ensure_version_table(pool).await?;

        let stored = stored_version(pool).await?;
        let current = self.current_version();

        if stored > current {
            tracing::error!(
                target: "archivist::database::migrations",
                "Database is at schema version {} but this build only knows {}",
                stored,
                current
            );
            return Err(DatabaseError::VersionMismatch {
                stored,
                supported: current,
            });
        }

        if stored == current {
            tracing::debug!(
                target: "archivist::database::migrations",
                "Schema is up to date at version {}",
                current
            );
            return Ok(current);
        }

        for (index, migration) in self.migrations.iter().enumerate().skip(stored as usize) {
            let target_version = index as i64 + 1;
            tracing::info!(
                target: "archivist::database::migrations",
                "Migrating schema to version {}: {}",
                target_version,
                migration.description
            );

            let mut txn = pool.begin().await?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *txn)
                .await
                .map_err(|source| DatabaseError::MigrationFailed {
                    version: target_version,
                    source,
                })?;
            sqlx::query("UPDATE db_version SET version_number = ?")
                .bind(target_version)
                .execute(&mut *txn)
                .await?;
            txn.commit().await?;
        }

        Ok(current)
    }
}

async fn ensure_version_table(pool: &SqlitePool) -> Result<(), DatabaseError> {
    let mut txn = pool.begin().await?;
    sqlx::query("CREATE TABLE IF NOT EXISTS db_version (version_number INTEGER NOT NULL)")
        .execute(&mut *txn)
        .await?;
    sqlx::query(
        "INSERT INTO db_version (version_number)
         SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM db_version)",
    )
    .execute(&mut *txn)
    .await?;
    txn.commit().await?;
    Ok(())
}

/// Reads the recorded schema version; a database without a version table is at 0.
pub(crate) async fn stored_version(pool: &SqlitePool) -> Result<i64, DatabaseError> {
    let has_table: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'db_version'",
    )
    .fetch_optional(pool)
    .await?;
    if has_table.is_none() {
        return Ok(0);
    }

    let version: Option<i64> = sqlx::query_scalar("SELECT version_number FROM db_version")
        .fetch_optional(pool)
        .await?;
    Ok(version.unwrap_or(0))
}
