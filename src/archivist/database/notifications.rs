use std::collections::HashMap;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{
        create_column_decode_error, optional_timestamp_millis, parse_flag,
        parse_optional_timestamp, parse_timestamp, placeholders,
    },
};
use crate::archivist::{
    error::{ArchivistError, Result},
    ids::{AccountId, NotificationId, PostId, RepostId},
    notifications::{Notification, NotificationCursor, NotificationType},
    search::CursorPosition,
};

static NOTIFICATION_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "notifications",
    conflict_target: &["id"],
    rules: &[
        ("notification_type", MergeRule::Overwrite),
        ("sent_at", MergeRule::Max),
        ("sort_index", MergeRule::Max),
        ("acting_account_id", MergeRule::PreferIncoming),
        ("post_id", MergeRule::PreferIncoming),
        ("repost_id", MergeRule::PreferIncoming),
        ("recipient_id", MergeRule::Keep),
        ("has_detail", MergeRule::Or),
        ("last_scraped_at", MergeRule::Max),
    ],
};

static NOTIFICATION_ACCOUNT_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "notification_accounts",
    conflict_target: &["notification_id", "account_id"],
    rules: &[],
};

static NOTIFICATION_POST_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "notification_posts",
    conflict_target: &["notification_id", "post_id"],
    rules: &[],
};

const NOTIFICATION_COLUMNS: &str = "id, notification_type, sent_at, sort_index,
    acting_account_id, post_id, repost_id, recipient_id, has_detail, last_scraped_at";

#[derive(Debug, thiserror::Error)]
#[error("Unknown notification type code {0}")]
struct UnknownNotificationType(i64);

struct NotificationRow {
    notification: Notification,
}

impl<'r, R> sqlx::FromRow<'r, R> for NotificationRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let type_code: i64 = row.try_get("notification_type")?;
        let acting_account_id: Option<i64> = row.try_get("acting_account_id")?;
        let post_id: Option<i64> = row.try_get("post_id")?;
        let repost_id: Option<i64> = row.try_get("repost_id")?;
        let recipient_id: i64 = row.try_get("recipient_id")?;

        let notification_type = NotificationType::from_code(type_code).ok_or_else(|| {
            create_column_decode_error("notification_type", UnknownNotificationType(type_code))
        })?;

        Ok(NotificationRow {
            notification: Notification {
                id: NotificationId(id),
                notification_type,
                sent_at: parse_timestamp(row, "sent_at")?,
                sort_index: row.try_get("sort_index")?,
                acting_account_id: acting_account_id.map(AccountId),
                post_id: post_id.map(PostId),
                repost_id: repost_id.map(RepostId),
                recipient_id: AccountId(recipient_id),
                has_detail: parse_flag(row, "has_detail")?,
                last_scraped_at: parse_optional_timestamp(row, "last_scraped_at")?,
                account_ids: Vec::new(),
                post_ids: Vec::new(),
            },
        })
    }
}

impl Notification {
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("id", self.id.into()),
            ("notification_type", self.notification_type.code().into()),
            ("sent_at", self.sent_at.into()),
            ("sort_index", self.sort_index.into()),
            ("acting_account_id", self.acting_account_id.into()),
            ("post_id", self.post_id.into()),
            ("repost_id", self.repost_id.into()),
            ("recipient_id", self.recipient_id.into()),
            ("has_detail", self.has_detail.into()),
            (
                "last_scraped_at",
                optional_timestamp_millis(self.last_scraped_at).into(),
            ),
        ];

        let mut txn = database.pool.begin().await?;
        upsert(&mut *txn, &NOTIFICATION_MERGE_POLICY, &values).await?;
        for account_id in &self.account_ids {
            let row: Vec<(&str, SqlValue)> = vec![
                ("notification_id", self.id.into()),
                ("account_id", (*account_id).into()),
            ];
            upsert(&mut *txn, &NOTIFICATION_ACCOUNT_MERGE_POLICY, &row).await?;
        }
        for post_id in &self.post_ids {
            let row: Vec<(&str, SqlValue)> = vec![
                ("notification_id", self.id.into()),
                ("post_id", (*post_id).into()),
            ];
            upsert(&mut *txn, &NOTIFICATION_POST_MERGE_POLICY, &row).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    pub async fn find_by_id(id: NotificationId, database: &Database) -> Result<Notification> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&database.pool)
        .await?;

        let mut notifications = vec![
            row.map(|r| r.notification)
                .ok_or(ArchivistError::NotificationNotFound(id))?,
        ];
        load_sets(&mut notifications, database).await?;
        Ok(notifications.remove(0))
    }

    /// Fetches the page after `cursor` and the cursor that resumes after it.
    pub async fn page(
        cursor: &NotificationCursor,
        database: &Database,
    ) -> Result<(Vec<Notification>, NotificationCursor)> {
        if cursor.is_end() {
            return Ok((Vec::new(), cursor.clone()));
        }

        let page_size = cursor.page_size.max(1);
        let position_clause = match cursor.position {
            CursorPosition::Start => "",
            _ => "AND (sort_index, id) < (?, ?)",
        };
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE recipient_id = ? {position_clause}
             ORDER BY sort_index DESC, id DESC
             LIMIT ?"
        );

        let mut q = sqlx::query_as::<_, NotificationRow>(&query).bind(cursor.recipient_id);
        if cursor.position != CursorPosition::Start {
            q = q.bind(cursor.sort_index).bind(cursor.last_id);
        }
        let mut notifications: Vec<Notification> = q
            .bind(page_size as i64 + 1)
            .fetch_all(&database.pool)
            .await?
            .into_iter()
            .map(|r| r.notification)
            .collect();

        let is_exhausted = notifications.len() <= page_size;
        notifications.truncate(page_size);
        load_sets(&mut notifications, database).await?;

        let mut next = cursor.clone();
        if let Some(last) = notifications.last() {
            next.sort_index = last.sort_index;
            next.last_id = last.id;
        }
        next.position = if is_exhausted {
            CursorPosition::End
        } else {
            CursorPosition::Middle
        };

        Ok((notifications, next))
    }
}

async fn load_sets(notifications: &mut [Notification], database: &Database) -> Result<()> {
    if notifications.is_empty() {
        return Ok(());
    }
    let ids: Vec<NotificationId> = notifications.iter().map(|n| n.id).collect();
    let in_list = placeholders(ids.len());

    let query = format!(
        "SELECT notification_id, account_id FROM notification_accounts
         WHERE notification_id IN ({in_list}) ORDER BY rowid"
    );
    let mut q = sqlx::query_as::<_, (i64, i64)>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    let mut accounts: HashMap<NotificationId, Vec<AccountId>> = HashMap::new();
    for (notification_id, account_id) in q.fetch_all(&database.pool).await? {
        accounts
            .entry(NotificationId(notification_id))
            .or_default()
            .push(AccountId(account_id));
    }

    let query = format!(
        "SELECT notification_id, post_id FROM notification_posts
         WHERE notification_id IN ({in_list}) ORDER BY rowid"
    );
    let mut q = sqlx::query_as::<_, (i64, i64)>(&query);
    for id in &ids {
        q = q.bind(*id);
    }
    let mut posts: HashMap<NotificationId, Vec<PostId>> = HashMap::new();
    for (notification_id, post_id) in q.fetch_all(&database.pool).await? {
        posts
            .entry(NotificationId(notification_id))
            .or_default()
            .push(PostId(post_id));
    }

    for notification in notifications.iter_mut() {
        notification.account_ids = accounts.remove(&notification.id).unwrap_or_default();
        notification.post_ids = posts.remove(&notification.id).unwrap_or_default();
    }
    Ok(())
}
