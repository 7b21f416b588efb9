use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{parse_timestamp, placeholders},
};
use crate::archivist::{
    error::{ArchivistError, Result},
    ids::{AccountId, PostId, RepostId},
    reposts::Repost,
};

static REPOST_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "reposts",
    conflict_target: &["id"],
    rules: &[
        ("post_id", MergeRule::Keep),
        ("reposted_by_id", MergeRule::Keep),
        ("reposted_at", MergeRule::Keep),
    ],
};

struct RepostRow {
    repost: Repost,
}

impl<'r, R> sqlx::FromRow<'r, R> for RepostRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let post_id: i64 = row.try_get("post_id")?;
        let reposted_by_id: i64 = row.try_get("reposted_by_id")?;
        let reposted_at = parse_timestamp(row, "reposted_at")?;

        Ok(RepostRow {
            repost: Repost {
                id: RepostId(id),
                post_id: PostId(post_id),
                reposted_by_id: AccountId(reposted_by_id),
                reposted_at,
            },
        })
    }
}

impl Repost {
    /// Inserts the repost unless it is already stored; existing reposts are never changed.
    pub async fn save(&self, database: &Database) -> Result<()> {
        let values: Vec<(&str, SqlValue)> = vec![
            ("id", self.id.into()),
            ("post_id", self.post_id.into()),
            ("reposted_by_id", self.reposted_by_id.into()),
            ("reposted_at", self.reposted_at.into()),
        ];
        let mut conn = database.pool.acquire().await?;
        upsert(&mut *conn, &REPOST_MERGE_POLICY, &values).await?;
        Ok(())
    }

    pub async fn find_by_id(id: RepostId, database: &Database) -> Result<Repost> {
        let row = sqlx::query_as::<_, RepostRow>(
            "SELECT id, post_id, reposted_by_id, reposted_at FROM reposts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&database.pool)
        .await?;

        row.map(|r| r.repost)
            .ok_or(ArchivistError::RepostNotFound(id))
    }

    pub async fn find_many(ids: &[RepostId], database: &Database) -> Result<Vec<Repost>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT id, post_id, reposted_by_id, reposted_at FROM reposts WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query_builder = sqlx::query_as::<_, RepostRow>(&query);
        for id in ids {
            query_builder = query_builder.bind(*id);
        }

        let rows = query_builder.fetch_all(&database.pool).await?;
        Ok(rows.into_iter().map(|r| r.repost).collect())
    }
}
