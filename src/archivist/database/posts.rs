use std::collections::HashMap;

use sqlx::SqliteConnection;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{
        create_column_decode_error, optional_timestamp_millis, parse_flag,
        parse_optional_timestamp, placeholders,
    },
};
use crate::archivist::{
    error::{ArchivistError, Result},
    ids::{AccountId, AudioRoomId, PostId},
    posts::{Image, LinkCard, Poll, PollChoice, Post, TombstoneKind, Video},
};

pub(crate) static POST_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "posts",
    conflict_target: &["id"],
    rules: &[
        ("author_id", MergeRule::KeepIf("is_stub")),
        ("text", MergeRule::ReplaceTextIfStubOrNewlyExpandable),
        ("is_expandable", MergeRule::Or),
        ("posted_at", MergeRule::KeepIf("is_stub")),
        ("num_likes", MergeRule::KeepIf("is_stub")),
        ("num_reposts", MergeRule::KeepIf("is_stub")),
        ("num_replies", MergeRule::KeepIf("is_stub")),
        ("num_quotes", MergeRule::KeepIf("is_stub")),
        ("in_reply_to_id", MergeRule::PreferIncoming),
        ("quoted_post_id", MergeRule::PreferIncoming),
        ("audio_room_id", MergeRule::PreferIncoming),
        ("tombstone_type", MergeRule::NoDowngradeToGenericTombstone),
        ("is_stub", MergeRule::And),
        ("is_content_downloaded", MergeRule::Or),
        ("is_conversation_scraped", MergeRule::Or),
        ("last_scraped_at", MergeRule::Max),
    ],
};

static IMAGE_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "images",
    conflict_target: &["id"],
    rules: &[
        ("post_id", MergeRule::Keep),
        ("width", MergeRule::Keep),
        ("height", MergeRule::Keep),
        ("remote_url", MergeRule::Keep),
        ("local_filename", MergeRule::FillIfBlank),
        ("is_downloaded", MergeRule::Or),
    ],
};

static VIDEO_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "videos",
    conflict_target: &["id"],
    rules: &[
        ("post_id", MergeRule::Keep),
        ("width", MergeRule::Keep),
        ("height", MergeRule::Keep),
        ("remote_url", MergeRule::Keep),
        ("local_filename", MergeRule::FillIfBlank),
        ("thumbnail_remote_url", MergeRule::Keep),
        ("thumbnail_local_filename", MergeRule::FillIfBlank),
        ("duration_ms", MergeRule::Keep),
        ("view_count", MergeRule::Max),
        ("is_gif", MergeRule::Keep),
        ("is_downloaded", MergeRule::Or),
        ("is_blocked_by_dmca", MergeRule::Or),
        ("is_geoblocked", MergeRule::Overwrite),
    ],
};

static LINK_CARD_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "link_cards",
    conflict_target: &["post_id", "expanded_url"],
    rules: &[
        ("short_url", MergeRule::KeepIfBlank),
        ("domain", MergeRule::KeepIfBlank),
        ("title", MergeRule::KeepIfBlank),
        ("description", MergeRule::KeepIfBlank),
        ("creator_id", MergeRule::PreferIncoming),
        ("site_id", MergeRule::PreferIncoming),
        ("thumbnail_width", MergeRule::Keep),
        ("thumbnail_height", MergeRule::Keep),
        ("thumbnail_remote_url", MergeRule::KeepIfBlank),
        ("thumbnail_local_path", MergeRule::KeepIfBlank),
        ("has_card", MergeRule::Or),
        ("has_thumbnail", MergeRule::Or),
        ("is_content_downloaded", MergeRule::Or),
    ],
};

static POLL_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "polls",
    conflict_target: &["id"],
    rules: &[
        ("post_id", MergeRule::Keep),
        ("choices", MergeRule::Overwrite),
        ("voting_duration_secs", MergeRule::Keep),
        ("voting_ends_at", MergeRule::Keep),
        ("last_scraped_at", MergeRule::Max),
    ],
};

static HASHTAG_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "post_hashtags",
    conflict_target: &["post_id", "text"],
    rules: &[],
};

static MENTION_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "post_mentions",
    conflict_target: &["post_id", "handle"],
    rules: &[],
};

static REPLY_MENTION_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "post_reply_mentions",
    conflict_target: &["post_id", "handle"],
    rules: &[],
};

const POST_COLUMNS: &str = "id, author_id, text, is_expandable, posted_at, num_likes,
    num_reposts, num_replies, num_quotes, in_reply_to_id, quoted_post_id, audio_room_id,
    tombstone_type, is_stub, is_content_downloaded, is_conversation_scraped, last_scraped_at";

struct PostRow {
    post: Post,
}

impl<'r, R> sqlx::FromRow<'r, R> for PostRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let author_id: i64 = row.try_get("author_id")?;
        let in_reply_to_id: Option<i64> = row.try_get("in_reply_to_id")?;
        let quoted_post_id: Option<i64> = row.try_get("quoted_post_id")?;
        let audio_room_id: Option<String> = row.try_get("audio_room_id")?;
        let tombstone_type: Option<String> = row.try_get("tombstone_type")?;

        let tombstone = tombstone_type
            .map(|code| {
                code.parse::<TombstoneKind>()
                    .map_err(|e| create_column_decode_error("tombstone_type", UnknownCode(e)))
            })
            .transpose()?;

        Ok(PostRow {
            post: Post {
                id: PostId(id),
                author_id: AccountId(author_id),
                text: row.try_get("text")?,
                is_expandable: parse_flag(row, "is_expandable")?,
                posted_at: parse_optional_timestamp(row, "posted_at")?,
                num_likes: row.try_get("num_likes")?,
                num_reposts: row.try_get("num_reposts")?,
                num_replies: row.try_get("num_replies")?,
                num_quotes: row.try_get("num_quotes")?,
                in_reply_to_id: in_reply_to_id.map(PostId),
                quoted_post_id: quoted_post_id.map(PostId),
                audio_room_id: audio_room_id.map(AudioRoomId),
                tombstone,
                is_stub: parse_flag(row, "is_stub")?,
                is_content_downloaded: parse_flag(row, "is_content_downloaded")?,
                is_conversation_scraped: parse_flag(row, "is_conversation_scraped")?,
                last_scraped_at: parse_optional_timestamp(row, "last_scraped_at")?,
                ..Default::default()
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct UnknownCode(String);

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: i64,
    post_id: i64,
    width: i64,
    height: i64,
    remote_url: String,
    local_filename: String,
    is_downloaded: bool,
}

impl From<ImageRow> for Image {
    fn from(row: ImageRow) -> Self {
        Image {
            id: row.id,
            post_id: PostId(row.post_id),
            width: row.width,
            height: row.height,
            remote_url: row.remote_url,
            local_filename: row.local_filename,
            is_downloaded: row.is_downloaded,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VideoRow {
    id: i64,
    post_id: i64,
    width: i64,
    height: i64,
    remote_url: String,
    local_filename: String,
    thumbnail_remote_url: String,
    thumbnail_local_filename: String,
    duration_ms: i64,
    view_count: i64,
    is_gif: bool,
    is_downloaded: bool,
    is_blocked_by_dmca: bool,
    is_geoblocked: bool,
}

impl From<VideoRow> for Video {
    fn from(row: VideoRow) -> Self {
        Video {
            id: row.id,
            post_id: PostId(row.post_id),
            width: row.width,
            height: row.height,
            remote_url: row.remote_url,
            local_filename: row.local_filename,
            thumbnail_remote_url: row.thumbnail_remote_url,
            thumbnail_local_filename: row.thumbnail_local_filename,
            duration_ms: row.duration_ms,
            view_count: row.view_count,
            is_gif: row.is_gif,
            is_downloaded: row.is_downloaded,
            is_blocked_by_dmca: row.is_blocked_by_dmca,
            is_geoblocked: row.is_geoblocked,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LinkCardRow {
    post_id: i64,
    expanded_url: String,
    short_url: String,
    domain: String,
    title: String,
    description: String,
    creator_id: Option<i64>,
    site_id: Option<i64>,
    thumbnail_width: i64,
    thumbnail_height: i64,
    thumbnail_remote_url: String,
    thumbnail_local_path: String,
    has_card: bool,
    has_thumbnail: bool,
    is_content_downloaded: bool,
}

impl From<LinkCardRow> for LinkCard {
    fn from(row: LinkCardRow) -> Self {
        LinkCard {
            post_id: PostId(row.post_id),
            expanded_url: row.expanded_url,
            short_url: row.short_url,
            domain: row.domain,
            title: row.title,
            description: row.description,
            creator_id: row.creator_id.map(AccountId),
            site_id: row.site_id.map(AccountId),
            thumbnail_width: row.thumbnail_width,
            thumbnail_height: row.thumbnail_height,
            thumbnail_remote_url: row.thumbnail_remote_url,
            thumbnail_local_path: row.thumbnail_local_path,
            has_card: row.has_card,
            has_thumbnail: row.has_thumbnail,
            is_content_downloaded: row.is_content_downloaded,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PollRow {
    id: i64,
    post_id: i64,
    choices: String,
    voting_duration_secs: i64,
    voting_ends_at: i64,
    last_scraped_at: i64,
}

impl TryFrom<PollRow> for Poll {
    type Error = ArchivistError;

    fn try_from(row: PollRow) -> Result<Self> {
        let choices: Vec<PollChoice> = serde_json::from_str(&row.choices)?;
        Ok(Poll {
            id: row.id,
            post_id: PostId(row.post_id),
            choices,
            voting_duration_secs: row.voting_duration_secs,
            voting_ends_at: millis_to_datetime(row.voting_ends_at),
            last_scraped_at: millis_to_datetime(row.last_scraped_at),
        })
    }
}

fn millis_to_datetime(millis: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    if millis == 0 {
        None
    } else {
        chrono::DateTime::from_timestamp_millis(millis)
    }
}

impl Post {
    fn merge_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.into()),
            ("author_id", self.author_id.into()),
            ("text", self.text.clone().into()),
            ("is_expandable", self.is_expandable.into()),
            ("posted_at", optional_timestamp_millis(self.posted_at).into()),
            ("num_likes", self.num_likes.into()),
            ("num_reposts", self.num_reposts.into()),
            ("num_replies", self.num_replies.into()),
            ("num_quotes", self.num_quotes.into()),
            ("in_reply_to_id", self.in_reply_to_id.into()),
            ("quoted_post_id", self.quoted_post_id.into()),
            ("audio_room_id", self.audio_room_id.clone().into()),
            (
                "tombstone_type",
                self.tombstone.map(|t| t.short_code()).into(),
            ),
            ("is_stub", self.is_stub.into()),
            ("is_content_downloaded", self.is_content_downloaded.into()),
            ("is_conversation_scraped", self.is_conversation_scraped.into()),
            (
                "last_scraped_at",
                optional_timestamp_millis(self.last_scraped_at).into(),
            ),
        ]
    }

    /// Saves the post and everything it owns in one transaction.
    pub async fn save(&self, database: &Database) -> Result<()> {
        let mut txn = database.pool.begin().await?;
        self.save_in(&mut txn).await?;
        txn.commit().await?;
        Ok(())
    }

    pub(crate) async fn save_in(&self, conn: &mut SqliteConnection) -> Result<()> {
        upsert(&mut *conn, &POST_MERGE_POLICY, &self.merge_values()).await?;

        for image in &self.images {
            let values = vec![
                ("id", image.id.into()),
                ("post_id", self.id.into()),
                ("width", image.width.into()),
                ("height", image.height.into()),
                ("remote_url", image.remote_url.clone().into()),
                ("local_filename", image.local_filename.clone().into()),
                ("is_downloaded", image.is_downloaded.into()),
            ];
            upsert(&mut *conn, &IMAGE_MERGE_POLICY, &values).await?;
        }

        for video in &self.videos {
            let values = vec![
                ("id", video.id.into()),
                ("post_id", self.id.into()),
                ("width", video.width.into()),
                ("height", video.height.into()),
                ("remote_url", video.remote_url.clone().into()),
                ("local_filename", video.local_filename.clone().into()),
                (
                    "thumbnail_remote_url",
                    video.thumbnail_remote_url.clone().into(),
                ),
                (
                    "thumbnail_local_filename",
                    video.thumbnail_local_filename.clone().into(),
                ),
                ("duration_ms", video.duration_ms.into()),
                ("view_count", video.view_count.into()),
                ("is_gif", video.is_gif.into()),
                ("is_downloaded", video.is_downloaded.into()),
                ("is_blocked_by_dmca", video.is_blocked_by_dmca.into()),
                ("is_geoblocked", video.is_geoblocked.into()),
            ];
            upsert(&mut *conn, &VIDEO_MERGE_POLICY, &values).await?;
        }

        for card in &self.link_cards {
            let values = vec![
                ("post_id", self.id.into()),
                ("expanded_url", card.expanded_url.clone().into()),
                ("short_url", card.short_url.clone().into()),
                ("domain", card.domain.clone().into()),
                ("title", card.title.clone().into()),
                ("description", card.description.clone().into()),
                ("creator_id", card.creator_id.into()),
                ("site_id", card.site_id.into()),
                ("thumbnail_width", card.thumbnail_width.into()),
                ("thumbnail_height", card.thumbnail_height.into()),
                (
                    "thumbnail_remote_url",
                    card.thumbnail_remote_url.clone().into(),
                ),
                (
                    "thumbnail_local_path",
                    card.thumbnail_local_path.clone().into(),
                ),
                ("has_card", card.has_card.into()),
                ("has_thumbnail", card.has_thumbnail.into()),
                ("is_content_downloaded", card.is_content_downloaded.into()),
            ];
            upsert(&mut *conn, &LINK_CARD_MERGE_POLICY, &values).await?;
        }

        for poll in &self.polls {
            let values = vec![
                ("id", poll.id.into()),
                ("post_id", self.id.into()),
                ("choices", serde_json::to_string(&poll.choices)?.into()),
                ("voting_duration_secs", poll.voting_duration_secs.into()),
                (
                    "voting_ends_at",
                    optional_timestamp_millis(poll.voting_ends_at).into(),
                ),
                (
                    "last_scraped_at",
                    optional_timestamp_millis(poll.last_scraped_at).into(),
                ),
            ];
            upsert(&mut *conn, &POLL_MERGE_POLICY, &values).await?;
        }

        for (policy, column, values) in [
            (&HASHTAG_MERGE_POLICY, "text", &self.hashtags),
            (&MENTION_MERGE_POLICY, "handle", &self.mentions),
            (&REPLY_MENTION_MERGE_POLICY, "handle", &self.reply_mentions),
        ] {
            for value in values {
                let row = vec![("post_id", self.id.into()), (column, value.clone().into())];
                upsert(&mut *conn, policy, &row).await?;
            }
        }

        tracing::debug!(
            target: "archivist::posts::save",
            "Saved post {} (stub: {}, {} images, {} videos)",
            self.id,
            self.is_stub,
            self.images.len(),
            self.videos.len()
        );
        Ok(())
    }

    pub async fn find_by_id(id: PostId, database: &Database) -> Result<Post> {
        Self::find_many(&[id], database)
            .await?
            .pop()
            .ok_or(ArchivistError::PostNotFound(id))
    }

    /// Batch lookup with attachments; IDs with no stored post are skipped.
    pub async fn find_many(ids: &[PostId], database: &Database) -> Result<Vec<Post>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query_builder = sqlx::query_as::<_, PostRow>(&query);
        for id in ids {
            query_builder = query_builder.bind(*id);
        }
        let mut posts: Vec<Post> = query_builder
            .fetch_all(&database.pool)
            .await?
            .into_iter()
            .map(|r| r.post)
            .collect();

        load_attachments(&mut posts, database).await?;
        Ok(posts)
    }

    /// Direct replies to a post, oldest first.
    pub async fn find_replies(id: PostId, database: &Database) -> Result<Vec<Post>> {
        let reply_ids: Vec<PostId> = sqlx::query_scalar(
            "SELECT id FROM posts WHERE in_reply_to_id = ? ORDER BY posted_at, id",
        )
        .bind(id)
        .fetch_all(&database.pool)
        .await?;

        let mut replies = Self::find_many(&reply_ids, database).await?;
        replies.sort_by_key(|p| (p.posted_at, p.id));
        Ok(replies)
    }

    pub async fn mark_conversation_scraped(id: PostId, database: &Database) -> Result<()> {
        let result = sqlx::query("UPDATE posts SET is_conversation_scraped = 1 WHERE id = ?")
            .bind(id)
            .execute(&database.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArchivistError::PostNotFound(id));
        }
        Ok(())
    }
}

async fn load_attachments(posts: &mut [Post], database: &Database) -> Result<()> {
    if posts.is_empty() {
        return Ok(());
    }
    let ids: Vec<PostId> = posts.iter().map(|p| p.id).collect();
    let in_list = placeholders(ids.len());

    let mut images: HashMap<PostId, Vec<Image>> = HashMap::new();
    let query = format!("SELECT * FROM images WHERE post_id IN ({in_list}) ORDER BY id");
    let mut q = sqlx::query_as::<_, ImageRow>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    for row in q.fetch_all(&database.pool).await? {
        let image = Image::from(row);
        images.entry(image.post_id).or_default().push(image);
    }

    let mut videos: HashMap<PostId, Vec<Video>> = HashMap::new();
    let query = format!("SELECT * FROM videos WHERE post_id IN ({in_list}) ORDER BY id");
    let mut q = sqlx::query_as::<_, VideoRow>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    for row in q.fetch_all(&database.pool).await? {
        let video = Video::from(row);
        videos.entry(video.post_id).or_default().push(video);
    }

    let mut cards: HashMap<PostId, Vec<LinkCard>> = HashMap::new();
    let query =
        format!("SELECT * FROM link_cards WHERE post_id IN ({in_list}) ORDER BY expanded_url");
    let mut q = sqlx::query_as::<_, LinkCardRow>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    for row in q.fetch_all(&database.pool).await? {
        let card = LinkCard::from(row);
        cards.entry(card.post_id).or_default().push(card);
    }

    let mut polls: HashMap<PostId, Vec<Poll>> = HashMap::new();
    let query = format!("SELECT * FROM polls WHERE post_id IN ({in_list}) ORDER BY id");
    let mut q = sqlx::query_as::<_, PollRow>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    for row in q.fetch_all(&database.pool).await? {
        let poll = Poll::try_from(row)?;
        polls.entry(poll.post_id).or_default().push(poll);
    }

    let mut hashtags = load_strings("post_hashtags", "text", &ids, database).await?;
    let mut mentions = load_strings("post_mentions", "handle", &ids, database).await?;
    let mut reply_mentions =
        load_strings("post_reply_mentions", "handle", &ids, database).await?;

    for post in posts.iter_mut() {
        post.images = images.remove(&post.id).unwrap_or_default();
        post.videos = videos.remove(&post.id).unwrap_or_default();
        post.link_cards = cards.remove(&post.id).unwrap_or_default();
        post.polls = polls.remove(&post.id).unwrap_or_default();
        post.hashtags = hashtags.remove(&post.id).unwrap_or_default();
        post.mentions = mentions.remove(&post.id).unwrap_or_default();
        post.reply_mentions = reply_mentions.remove(&post.id).unwrap_or_default();
    }
    Ok(())
}

async fn load_strings(
    table: &str,
    column: &str,
    ids: &[PostId],
    database: &Database,
) -> Result<HashMap<PostId, Vec<String>>> {
    let query = format!(
        "SELECT post_id, {column} FROM {table} WHERE post_id IN ({}) ORDER BY rowid",
        placeholders(ids.len())
    );
    let mut q = sqlx::query_as::<_, (i64, String)>(&query);
    for id in ids {
        q = q.bind(*id);
    }

    let mut by_post: HashMap<PostId, Vec<String>> = HashMap::new();
    for (post_id, value) in q.fetch_all(&database.pool).await? {
        by_post.entry(PostId(post_id)).or_default().push(value);
    }
    Ok(by_post)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::test_utils::{create_test_database, test_post};
    use chrono::DateTime;

    fn full_post() -> Post {
        let mut post = test_post(PostId(100), AccountId(1), "a post with everything");
        post.num_likes = 50;
        post.num_reposts = 5;
        post.images = vec![Image {
            id: 1001,
            post_id: PostId(100),
            width: 640,
            height: 480,
            remote_url: "https://img.example.com/a.jpg".to_string(),
            local_filename: "a.jpg".to_string(),
            is_downloaded: false,
        }];
        post.videos = vec![Video {
            id: 2001,
            post_id: PostId(100),
            remote_url: "https://vid.example.com/v.mp4".to_string(),
            local_filename: "100.mp4".to_string(),
            thumbnail_remote_url: "https://img.example.com/v.jpg".to_string(),
            thumbnail_local_filename: "v.jpg".to_string(),
            view_count: 10,
            ..Default::default()
        }];
        post.link_cards = vec![LinkCard {
            post_id: PostId(100),
            expanded_url: "https://example.com/article".to_string(),
            title: "An article".to_string(),
            domain: "example.com".to_string(),
            has_card: true,
            ..Default::default()
        }];
        post.polls = vec![Poll {
            id: 3001,
            post_id: PostId(100),
            choices: vec![PollChoice {
                label: "yes".to_string(),
                votes: 2,
            }],
            voting_ends_at: DateTime::from_timestamp_millis(1_700_000_000_000),
            ..Default::default()
        }];
        post.hashtags = vec!["rust".to_string()];
        post.mentions = vec!["kashi".to_string()];
        post
    }

    #[tokio::test]
    async fn test_save_and_find_with_attachments() {
        let (db, _dir) = create_test_database().await;
        let post = full_post();
        post.save(&db).await.unwrap();

        let stored = Post::find_by_id(PostId(100), &db).await.unwrap();
        assert_eq!(stored, post);
    }

    #[tokio::test]
    async fn test_missing_post_is_not_found() {
        let (db, _dir) = create_test_database().await;
        let err = Post::find_by_id(PostId(5), &db).await.unwrap_err();
        assert!(matches!(err, ArchivistError::PostNotFound(PostId(5))));
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let (db, _dir) = create_test_database().await;
        let post = full_post();
        post.save(&db).await.unwrap();
        post.save(&db).await.unwrap();

        assert_eq!(Post::find_by_id(PostId(100), &db).await.unwrap(), post);
        let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(images, 1);
    }

    #[tokio::test]
    async fn test_stub_does_not_worsen_full_post() {
        let (db, _dir) = create_test_database().await;
        let mut post = full_post();
        post.is_content_downloaded = true;
        post.is_conversation_scraped = true;
        post.is_expandable = true;
        post.images[0].is_downloaded = true;
        post.last_scraped_at = DateTime::from_timestamp_millis(5_000);
        post.save(&db).await.unwrap();

        let mut stub = Post::stub(PostId(100));
        stub.last_scraped_at = DateTime::from_timestamp_millis(1_000);
        stub.tombstone = Some(TombstoneKind::Unavailable);
        stub.images = vec![Image {
            is_downloaded: false,
            ..post.images[0].clone()
        }];
        stub.save(&db).await.unwrap();

        let stored = Post::find_by_id(PostId(100), &db).await.unwrap();
        assert!(!stored.is_stub);
        assert!(stored.is_content_downloaded);
        assert!(stored.is_conversation_scraped);
        assert!(stored.is_expandable);
        assert!(stored.images[0].is_downloaded);
        assert_eq!(stored.text, post.text);
        assert_eq!(stored.author_id, post.author_id);
        assert_eq!(stored.posted_at, post.posted_at);
        assert_eq!(stored.num_likes, 50);
        assert_eq!(stored.last_scraped_at, post.last_scraped_at);
        // A stub's generic classification does land on an unclassified post
        assert_eq!(stored.tombstone, Some(TombstoneKind::Unavailable));
    }

    #[tokio::test]
    async fn test_specific_tombstone_is_not_downgraded() {
        let (db, _dir) = create_test_database().await;
        let mut post = Post::stub(PostId(7));
        post.tombstone = Some(TombstoneKind::Suspended);
        post.save(&db).await.unwrap();

        post.tombstone = Some(TombstoneKind::Unavailable);
        post.save(&db).await.unwrap();
        assert_eq!(
            Post::find_by_id(PostId(7), &db).await.unwrap().tombstone,
            Some(TombstoneKind::Suspended)
        );

        post.tombstone = Some(TombstoneKind::Deleted);
        post.save(&db).await.unwrap();
        assert_eq!(
            Post::find_by_id(PostId(7), &db).await.unwrap().tombstone,
            Some(TombstoneKind::Deleted)
        );
    }

    #[tokio::test]
    async fn test_full_post_replaces_stub() {
        let (db, _dir) = create_test_database().await;
        Post::stub(PostId(100)).save(&db).await.unwrap();

        let post = full_post();
        post.save(&db).await.unwrap();

        let stored = Post::find_by_id(PostId(100), &db).await.unwrap();
        assert!(!stored.is_stub);
        assert_eq!(stored.text, "a post with everything");
        assert_eq!(stored.num_likes, 50);
        assert_eq!(stored.author_id, AccountId(1));
    }

    #[tokio::test]
    async fn test_counters_update_from_full_posts() {
        let (db, _dir) = create_test_database().await;
        let mut post = full_post();
        post.save(&db).await.unwrap();

        post.num_likes = 75;
        post.text = "edited text is ignored".to_string();
        post.save(&db).await.unwrap();

        let stored = Post::find_by_id(PostId(100), &db).await.unwrap();
        assert_eq!(stored.num_likes, 75);
        assert_eq!(stored.text, "a post with everything");
    }

    #[tokio::test]
    async fn test_find_replies_and_conversation_flag() {
        let (db, _dir) = create_test_database().await;
        full_post().save(&db).await.unwrap();
        for (id, at) in [(102, 3_000), (101, 2_000)] {
            let mut reply = test_post(PostId(id), AccountId(2), "reply");
            reply.in_reply_to_id = Some(PostId(100));
            reply.posted_at = DateTime::from_timestamp_millis(at);
            reply.save(&db).await.unwrap();
        }

        let replies = Post::find_replies(PostId(100), &db).await.unwrap();
        let ids: Vec<PostId> = replies.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PostId(101), PostId(102)]);

        Post::mark_conversation_scraped(PostId(100), &db).await.unwrap();
        assert!(
            Post::find_by_id(PostId(100), &db)
                .await
                .unwrap()
                .is_conversation_scraped
        );
        assert!(
            Post::mark_conversation_scraped(PostId(404), &db)
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
