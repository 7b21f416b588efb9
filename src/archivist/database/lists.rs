use chrono::Utc;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::parse_timestamp,
};
use crate::archivist::{
    accounts::Account,
    error::{ArchivistError, Result},
    ids::{AccountId, ListId},
    lists::List,
};

static ONLINE_LIST_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "lists",
    conflict_target: &["online_list_id"],
    rules: &[
        ("name", MergeRule::KeepIfBlank),
        ("is_public", MergeRule::Overwrite),
        ("created_at", MergeRule::Keep),
    ],
};

static LIST_MEMBER_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "list_members",
    conflict_target: &["list_id", "account_id"],
    rules: &[],
};

struct ListRow {
    list: List,
}

impl<'r, R> sqlx::FromRow<'r, R> for ListRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let is_public: i64 = row.try_get("is_public")?;

        Ok(ListRow {
            list: List {
                id: ListId(id),
                online_list_id: row.try_get("online_list_id")?,
                name: row.try_get("name")?,
                is_public: is_public != 0,
                created_at: parse_timestamp(row, "created_at")?,
                member_ids: Vec::new(),
            },
        })
    }
}

impl List {
    /// Saves an online list by its remote ID, adding any members it carries.
    /// `self.id` is set to the local row id.
    pub async fn save(&mut self, database: &Database) -> Result<()> {
        let Some(online_list_id) = self.online_list_id else {
            return self.rename_local(database).await;
        };

        let values: Vec<(&str, SqlValue)> = vec![
            ("online_list_id", online_list_id.into()),
            ("name", self.name.clone().into()),
            ("is_public", self.is_public.into()),
            ("created_at", self.created_at.into()),
        ];

        let mut txn = database.pool.begin().await?;
        upsert(&mut *txn, &ONLINE_LIST_MERGE_POLICY, &values).await?;
        let id: i64 = sqlx::query_scalar("SELECT id FROM lists WHERE online_list_id = ?")
            .bind(online_list_id)
            .fetch_one(&mut *txn)
            .await?;
        self.id = ListId(id);

        for member in &self.member_ids {
            let row: Vec<(&str, SqlValue)> =
                vec![("list_id", self.id.into()), ("account_id", (*member).into())];
            upsert(&mut *txn, &LIST_MEMBER_MERGE_POLICY, &row).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn rename_local(&self, database: &Database) -> Result<()> {
        let result = sqlx::query("UPDATE lists SET name = ?, is_public = ? WHERE id = ?")
            .bind(&self.name)
            .bind(self.is_public)
            .bind(self.id)
            .execute(&database.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArchivistError::ListNotFound(self.id));
        }
        Ok(())
    }

    pub async fn create_local(name: &str, database: &Database) -> Result<List> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, ListRow>(
            "INSERT INTO lists (online_list_id, name, is_public, created_at)
             VALUES (NULL, ?, 0, ?)
             RETURNING id, online_list_id, name, is_public, created_at",
        )
        .bind(name)
        .bind(now.timestamp_millis())
        .fetch_one(&database.pool)
        .await?;

        tracing::debug!(
            target: "archivist::lists::create_local",
            "Created local list {} ({})",
            row.list.id,
            name
        );
        Ok(row.list)
    }

    pub async fn find_by_id(id: ListId, database: &Database) -> Result<List> {
        let row = sqlx::query_as::<_, ListRow>(
            "SELECT id, online_list_id, name, is_public, created_at FROM lists WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&database.pool)
        .await?;

        let mut list = row
            .map(|r| r.list)
            .ok_or(ArchivistError::ListNotFound(id))?;
        list.member_ids = Self::member_ids(id, database).await?;
        Ok(list)
    }

    /// All lists, without their members, ordered by name.
    pub async fn all(database: &Database) -> Result<Vec<List>> {
        let rows = sqlx::query_as::<_, ListRow>(
            "SELECT id, online_list_id, name, is_public, created_at FROM lists
             ORDER BY name COLLATE NOCASE, id",
        )
        .fetch_all(&database.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.list).collect())
    }

    /// Hard-deletes a list and its memberships.
    pub async fn delete(id: ListId, database: &Database) -> Result<()> {
        let result = sqlx::query("DELETE FROM lists WHERE id = ?")
            .bind(id)
            .execute(&database.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArchivistError::ListNotFound(id));
        }
        Ok(())
    }

    pub async fn add_member(id: ListId, account_id: AccountId, database: &Database) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM lists WHERE id = ?")
            .bind(id)
            .fetch_optional(&database.pool)
            .await?;
        if exists.is_none() {
            return Err(ArchivistError::ListNotFound(id));
        }

        let row: Vec<(&str, SqlValue)> = vec![("list_id", id.into()), ("account_id", account_id.into())];
        let mut conn = database.pool.acquire().await?;
        upsert(&mut *conn, &LIST_MEMBER_MERGE_POLICY, &row).await?;
        Ok(())
    }

    /// Returns whether the account was a member.
    pub async fn remove_member(
        id: ListId,
        account_id: AccountId,
        database: &Database,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM list_members WHERE list_id = ? AND account_id = ?")
            .bind(id)
            .bind(account_id)
            .execute(&database.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn members(id: ListId, database: &Database) -> Result<Vec<Account>> {
        let ids = Self::member_ids(id, database).await?;
        let mut accounts = Account::find_many(&ids, database).await?;
        accounts.sort_by(|a, b| a.handle.to_lowercase().cmp(&b.handle.to_lowercase()));
        Ok(accounts)
    }

    async fn member_ids(id: ListId, database: &Database) -> Result<Vec<AccountId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT account_id FROM list_members WHERE list_id = ? ORDER BY rowid",
        )
        .bind(id)
        .fetch_all(&database.pool)
        .await?;
        Ok(ids.into_iter().map(AccountId).collect())
    }
}
