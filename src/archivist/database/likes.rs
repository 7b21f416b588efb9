use std::collections::HashSet;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::placeholders,
};
use crate::archivist::{
    error::Result,
    ids::{AccountId, PostId},
    likes::{Bookmark, Like},
};

static LIKE_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "likes",
    conflict_target: &["liker_id", "post_id"],
    rules: &[("sort_index", MergeRule::Max)],
};

static BOOKMARK_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "bookmarks",
    conflict_target: &["account_id", "post_id"],
    rules: &[("sort_index", MergeRule::Max)],
};

impl Like {
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("sort_index", self.sort_index.into()),
            ("post_id", self.post_id.into()),
            ("liker_id", self.liker_id.into()),
        ];
        let mut conn = database.pool.acquire().await?;
        upsert(&mut *conn, &LIKE_MERGE_POLICY, &values).await?;
        Ok(())
    }

    /// Removes a like locally. Returns whether one existed.
    pub async fn delete(liker_id: AccountId, post_id: PostId, database: &Database) -> Result<bool> {
        let result = sqlx::query("DELETE FROM likes WHERE liker_id = ? AND post_id = ?")
            .bind(liker_id)
            .bind(post_id)
            .execute(&database.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Likes by one account, most recent (highest sort index) first.
    pub async fn find_by_liker(liker_id: AccountId, database: &Database) -> Result<Vec<Like>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT sort_index, post_id, liker_id FROM likes WHERE liker_id = ?
             ORDER BY sort_index DESC",
        )
        .bind(liker_id)
        .fetch_all(&database.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(sort_index, post_id, liker_id)| Like {
                sort_index,
                post_id: PostId(post_id),
                liker_id: AccountId(liker_id),
            })
            .collect())
    }

    /// The subset of `post_ids` that `viewer` has liked.
    pub(crate) async fn liked_among(
        viewer: AccountId,
        post_ids: &[PostId],
        database: &Database,
    ) -> Result<HashSet<PostId>> {
        flagged_among("likes", "liker_id", viewer, post_ids, database).await
    }
}

impl Bookmark {
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("sort_index", self.sort_index.into()),
            ("post_id", self.post_id.into()),
            ("account_id", self.account_id.into()),
        ];
        let mut conn = database.pool.acquire().await?;
        upsert(&mut *conn, &BOOKMARK_MERGE_POLICY, &values).await?;
        Ok(())
    }

    pub async fn delete(
        account_id: AccountId,
        post_id: PostId,
        database: &Database,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE account_id = ? AND post_id = ?")
            .bind(account_id)
            .bind(post_id)
            .execute(&database.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn bookmarked_among(
        viewer: AccountId,
        post_ids: &[PostId],
        database: &Database,
    ) -> Result<HashSet<PostId>> {
        flagged_among("bookmarks", "account_id", viewer, post_ids, database).await
    }
}

async fn flagged_among(
    table: &str,
    account_column: &str,
    viewer: AccountId,
    post_ids: &[PostId],
    database: &Database,
) -> Result<HashSet<PostId>> {
    if post_ids.is_empty() || viewer.is_unknown() {
        return Ok(HashSet::new());
    }

    let query = format!(
        "SELECT post_id FROM {table} WHERE {account_column} = ? AND post_id IN ({})",
        placeholders(post_ids.len())
    );
    let mut q = sqlx::query_scalar::<_, i64>(&query).bind(viewer);
    for id in post_ids {
        q = q.bind(*id);
    }
    let ids = q.fetch_all(&database.pool).await?;
    Ok(ids.into_iter().map(PostId).collect())
}
