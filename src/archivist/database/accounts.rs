use sqlx::SqliteConnection;

use super::{
    Database,
    merge_policy::{MergePolicy, MergeRule, SqlValue, upsert},
    utils::{optional_timestamp_millis, parse_flag, parse_optional_timestamp, placeholders},
};
use crate::archivist::{
    accounts::{Account, HandleConflict},
    error::{ArchivistError, Result},
    ids::{AccountId, PostId},
};

pub(crate) static ACCOUNT_MERGE_POLICY: MergePolicy = MergePolicy {
    table: "accounts",
    conflict_target: &["id"],
    rules: &[
        ("display_name", MergeRule::KeepIfBlank),
        ("handle", MergeRule::Overwrite),
        ("bio", MergeRule::KeepIfBlank),
        ("following_count", MergeRule::KeepIf("is_banned")),
        ("followers_count", MergeRule::KeepIf("is_banned")),
        ("location", MergeRule::KeepIfBlank),
        ("website", MergeRule::KeepIfBlank),
        ("join_date", MergeRule::Max),
        ("is_private", MergeRule::KeepIf("is_banned")),
        ("is_verified", MergeRule::KeepIf("is_banned")),
        ("is_banned", MergeRule::Overwrite),
        ("is_deleted", MergeRule::Overwrite),
        ("profile_image_url", MergeRule::KeepIfBlank),
        ("profile_image_local_path", MergeRule::KeepIfBlank),
        ("banner_image_url", MergeRule::KeepIfBlank),
        ("banner_image_local_path", MergeRule::KeepIfBlank),
        ("pinned_post_id", MergeRule::KeepIf("is_banned")),
        ("is_followed", MergeRule::Keep),
        ("is_content_downloaded", MergeRule::Or),
        ("is_id_fake", MergeRule::Overwrite),
    ],
};

const ACCOUNT_COLUMNS: &str = "id, display_name, handle, bio, following_count, followers_count,
    location, website, join_date, is_private, is_verified, is_banned, is_deleted,
    profile_image_url, profile_image_local_path, banner_image_url, banner_image_local_path,
    pinned_post_id, is_followed, is_content_downloaded, is_id_fake";

/// References to an account that live outside the accounts table. Each statement binds
/// (new id, old id); rows that would become duplicates are dropped afterwards.
const ACCOUNT_REFERENCE_UPDATES: &[&str] = &[
    "UPDATE posts SET author_id = ? WHERE author_id = ?",
    "UPDATE reposts SET reposted_by_id = ? WHERE reposted_by_id = ?",
    "UPDATE OR IGNORE likes SET liker_id = ? WHERE liker_id = ?",
    "UPDATE OR IGNORE bookmarks SET account_id = ? WHERE account_id = ?",
    "UPDATE OR IGNORE list_members SET account_id = ? WHERE account_id = ?",
    "UPDATE audio_rooms SET created_by_id = ? WHERE created_by_id = ?",
    "UPDATE OR IGNORE audio_room_participants SET account_id = ? WHERE account_id = ?",
    "UPDATE notifications SET acting_account_id = ? WHERE acting_account_id = ?",
    "UPDATE OR IGNORE notification_accounts SET account_id = ? WHERE account_id = ?",
];

const ACCOUNT_REFERENCE_LEFTOVERS: &[&str] = &[
    "DELETE FROM likes WHERE liker_id = ?",
    "DELETE FROM bookmarks WHERE account_id = ?",
    "DELETE FROM list_members WHERE account_id = ?",
    "DELETE FROM audio_room_participants WHERE account_id = ?",
    "DELETE FROM notification_accounts WHERE account_id = ?",
];

#[derive(Debug)]
struct AccountRow {
    account: Account,
}

impl<'r, R> sqlx::FromRow<'r, R> for AccountRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let pinned_post_id: Option<i64> = row.try_get("pinned_post_id")?;

        Ok(AccountRow {
            account: Account {
                id: AccountId(id),
                display_name: row.try_get("display_name")?,
                handle: row.try_get("handle")?,
                bio: row.try_get("bio")?,
                following_count: row.try_get("following_count")?,
                followers_count: row.try_get("followers_count")?,
                location: row.try_get("location")?,
                website: row.try_get("website")?,
                join_date: parse_optional_timestamp(row, "join_date")?,
                is_private: parse_flag(row, "is_private")?,
                is_verified: parse_flag(row, "is_verified")?,
                is_banned: parse_flag(row, "is_banned")?,
                is_deleted: parse_flag(row, "is_deleted")?,
                profile_image_url: row.try_get("profile_image_url")?,
                profile_image_local_path: row.try_get("profile_image_local_path")?,
                banner_image_url: row.try_get("banner_image_url")?,
                banner_image_local_path: row.try_get("banner_image_local_path")?,
                pinned_post_id: pinned_post_id.map(PostId),
                is_followed: parse_flag(row, "is_followed")?,
                is_content_downloaded: parse_flag(row, "is_content_downloaded")?,
                is_id_fake: parse_flag(row, "is_id_fake")?,
                is_needing_fake_id: false,
            },
        })
    }
}

impl Account {
    fn merge_values(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("id", self.id.into()),
            ("display_name", self.display_name.clone().into()),
            ("handle", self.handle.clone().into()),
            ("bio", self.bio.clone().into()),
            ("following_count", self.following_count.into()),
            ("followers_count", self.followers_count.into()),
            ("location", self.location.clone().into()),
            ("website", self.website.clone().into()),
            ("join_date", optional_timestamp_millis(self.join_date).into()),
            ("is_private", self.is_private.into()),
            ("is_verified", self.is_verified.into()),
            ("is_banned", self.is_banned.into()),
            ("is_deleted", self.is_deleted.into()),
            ("profile_image_url", self.profile_image_url.clone().into()),
            (
                "profile_image_local_path",
                self.profile_image_local_path.clone().into(),
            ),
            ("banner_image_url", self.banner_image_url.clone().into()),
            (
                "banner_image_local_path",
                self.banner_image_local_path.clone().into(),
            ),
            ("pinned_post_id", self.pinned_post_id.into()),
            ("is_followed", self.is_followed.into()),
            ("is_content_downloaded", self.is_content_downloaded.into()),
            ("is_id_fake", self.is_id_fake.into()),
        ]
    }

    /// Saves the account, resolving its identity first.
    ///
    /// An account flagged [`Account::is_needing_fake_id`] is matched by handle against the
    /// store: if an account already holds the handle its ID is adopted and nothing is
    /// written, otherwise a synthetic ID is allocated and a placeholder row inserted. In
    /// both cases `self.id` is updated in place.
    ///
    /// A normal save that presents a handle held by a different account supersedes it.
    /// A synthetic placeholder is absorbed silently (its references move to this account);
    /// a real account is flagged deleted and reported as a [`HandleConflict`].
    pub async fn save(&mut self, database: &Database) -> Result<Option<HandleConflict>> {
        let mut txn = database.pool.begin().await?;

        if self.is_needing_fake_id {
            let existing: Option<(i64, i64)> = sqlx::query_as(
                "SELECT id, is_id_fake FROM accounts WHERE handle = ? COLLATE NOCASE
                 ORDER BY is_deleted, id DESC LIMIT 1",
            )
            .bind(&self.handle)
            .fetch_optional(&mut *txn)
            .await?;

            if let Some((id, is_id_fake)) = existing {
                tracing::debug!(
                    target: "archivist::accounts::save",
                    "Resolved handle {} to existing account {}",
                    self.handle,
                    id
                );
                self.id = AccountId(id);
                self.is_id_fake = is_id_fake != 0;
                self.is_needing_fake_id = false;
                txn.commit().await?;
                return Ok(None);
            }

            let fake_id: i64 = sqlx::query_scalar(
                "UPDATE fake_account_sequence SET latest_fake_id = latest_fake_id + 1
                 RETURNING latest_fake_id",
            )
            .fetch_one(&mut *txn)
            .await?;

            tracing::debug!(
                target: "archivist::accounts::save",
                "Allocated synthetic ID {} for handle {}",
                fake_id,
                self.handle
            );
            self.id = AccountId(fake_id);
            self.is_id_fake = true;
            self.is_needing_fake_id = false;
        }

        let conflict = if self.is_deleted {
            None
        } else {
            claim_handle(&mut *txn, self).await?
        };

        upsert(&mut *txn, &ACCOUNT_MERGE_POLICY, &self.merge_values()).await?;
        txn.commit().await?;

        Ok(conflict)
    }

    /// Finds the account holding `handle` (case-insensitive), preferring the active holder
    /// over previously superseded ones.
    pub async fn find_by_handle(handle: &str, database: &Database) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE handle = ? COLLATE NOCASE
             ORDER BY is_deleted, id DESC LIMIT 1"
        ))
        .bind(handle)
        .fetch_optional(&database.pool)
        .await?;

        row.map(|r| r.account)
            .ok_or_else(|| ArchivistError::AccountNotFound(handle.to_string()))
    }

    pub async fn find_by_id(id: AccountId, database: &Database) -> Result<Account> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&database.pool)
        .await?;

        row.map(|r| r.account)
            .ok_or(ArchivistError::AccountIdNotFound(id))
    }

    /// Batch lookup; IDs with no stored account are skipped.
    pub async fn find_many(ids: &[AccountId], database: &Database) -> Result<Vec<Account>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query_builder = sqlx::query_as::<_, AccountRow>(&query);
        for id in ids {
            query_builder = query_builder.bind(*id);
        }

        let rows = query_builder.fetch_all(&database.pool).await?;
        Ok(rows.into_iter().map(|r| r.account).collect())
    }

    /// All accounts the user follows locally.
    pub async fn all_followed(database: &Database) -> Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE is_followed = 1 AND is_deleted = 0
             ORDER BY handle COLLATE NOCASE"
        ))
        .fetch_all(&database.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.account).collect())
    }

    pub async fn set_followed(id: AccountId, is_followed: bool, database: &Database) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET is_followed = ? WHERE id = ?")
            .bind(is_followed)
            .bind(id)
            .execute(&database.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ArchivistError::AccountIdNotFound(id));
        }
        Ok(())
    }
}

/// Frees `account.handle` for `account`, superseding whoever else holds it.
async fn claim_handle(
    conn: &mut SqliteConnection,
    account: &Account,
) -> Result<Option<HandleConflict>> {
    let holder: Option<(i64, i64)> = sqlx::query_as(
        "SELECT id, is_id_fake FROM accounts
         WHERE handle = ? COLLATE NOCASE AND is_deleted = 0 AND id != ?",
    )
    .bind(&account.handle)
    .bind(account.id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((holder_id, holder_is_fake)) = holder else {
        return Ok(None);
    };
    let holder_id = AccountId(holder_id);

    sqlx::query("UPDATE accounts SET is_deleted = 1 WHERE id = ?")
        .bind(holder_id)
        .execute(&mut *conn)
        .await?;

    if holder_is_fake != 0 {
        tracing::debug!(
            target: "archivist::accounts::claim_handle",
            "Absorbing placeholder {} into account {} ({})",
            holder_id,
            account.id,
            account.handle
        );
        rewrite_account_references(conn, holder_id, account.id).await?;
        return Ok(None);
    }

    tracing::warn!(
        target: "archivist::accounts::claim_handle",
        "Handle {} moved from account {} to account {}",
        account.handle,
        holder_id,
        account.id
    );
    Ok(Some(HandleConflict {
        handle: account.handle.clone(),
        superseded_id: holder_id,
    }))
}

async fn rewrite_account_references(
    conn: &mut SqliteConnection,
    from: AccountId,
    to: AccountId,
) -> Result<()> {
    for statement in ACCOUNT_REFERENCE_UPDATES {
        sqlx::query(statement)
            .bind(to)
            .bind(from)
            .execute(&mut *conn)
            .await?;
    }
    for statement in ACCOUNT_REFERENCE_LEFTOVERS {
        sqlx::query(statement).bind(from).execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::test_utils::create_test_database;
    use chrono::DateTime;

    fn kashi() -> Account {
        Account {
            display_name: "Kashi".to_string(),
            bio: "thinks in tanks".to_string(),
            followers_count: 120,
            following_count: 3,
            profile_image_url: "https://img.example.com/kashi.jpg".to_string(),
            join_date: DateTime::from_timestamp_millis(1_500_000_000_000),
            ..Account::new(AccountId(1000), "kashi")
        }
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let (db, _dir) = create_test_database().await;
        let mut account = kashi();
        assert_eq!(account.save(&db).await.unwrap(), None);

        let by_id = Account::find_by_id(AccountId(1000), &db).await.unwrap();
        assert_eq!(by_id, account);

        let by_handle = Account::find_by_handle("KASHI", &db).await.unwrap();
        assert_eq!(by_handle.id, AccountId(1000));
    }

    #[tokio::test]
    async fn test_find_missing_is_not_found() {
        let (db, _dir) = create_test_database().await;

        let err = Account::find_by_handle("nobody", &db).await.unwrap_err();
        assert!(matches!(err, ArchivistError::AccountNotFound(ref h) if h == "nobody"));
        let err = Account::find_by_id(AccountId(5), &db).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_save_twice_is_idempotent() {
        let (db, _dir) = create_test_database().await;
        let mut account = kashi();
        account.save(&db).await.unwrap();
        account.save(&db).await.unwrap();

        let stored = Account::find_by_id(account.id, &db).await.unwrap();
        assert_eq!(stored, account);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_blank_fields_do_not_erase_known_ones() {
        let (db, _dir) = create_test_database().await;
        let mut account = kashi();
        account.is_content_downloaded = true;
        account.save(&db).await.unwrap();

        let mut sparse = Account::new(AccountId(1000), "kashi");
        sparse.followers_count = 130;
        sparse.save(&db).await.unwrap();

        let stored = Account::find_by_id(AccountId(1000), &db).await.unwrap();
        assert_eq!(stored.display_name, "Kashi");
        assert_eq!(stored.bio, "thinks in tanks");
        assert_eq!(stored.profile_image_url, "https://img.example.com/kashi.jpg");
        assert_eq!(stored.followers_count, 130);
        assert!(stored.is_content_downloaded);
        assert_eq!(stored.join_date, account.join_date);
    }

    #[tokio::test]
    async fn test_banned_account_keeps_counts() {
        let (db, _dir) = create_test_database().await;
        kashi().save(&db).await.unwrap();

        let mut banned = Account::new(AccountId(1000), "kashi");
        banned.is_banned = true;
        banned.save(&db).await.unwrap();

        let stored = Account::find_by_id(AccountId(1000), &db).await.unwrap();
        assert!(stored.is_banned);
        assert_eq!(stored.followers_count, 120);
    }

    #[tokio::test]
    async fn test_follow_flag_survives_harvests() {
        let (db, _dir) = create_test_database().await;
        let mut account = kashi();
        account.save(&db).await.unwrap();

        Account::set_followed(AccountId(1000), true, &db).await.unwrap();
        account.save(&db).await.unwrap();

        assert!(Account::find_by_id(AccountId(1000), &db).await.unwrap().is_followed);
        assert_eq!(Account::all_followed(&db).await.unwrap().len(), 1);

        let err = Account::set_followed(AccountId(9), true, &db).await.unwrap_err();
        assert!(matches!(err, ArchivistError::AccountIdNotFound(AccountId(9))));
    }

    #[tokio::test]
    async fn test_handle_collision_supersedes_previous_holder() {
        let (db, _dir) = create_test_database().await;
        let mut original = kashi();
        original.save(&db).await.unwrap();

        let mut newcomer = Account {
            display_name: "Not Kashi".to_string(),
            ..Account::new(AccountId(2000), "Kashi")
        };
        let conflict = newcomer.save(&db).await.unwrap();
        assert_eq!(
            conflict,
            Some(HandleConflict {
                handle: "Kashi".to_string(),
                superseded_id: AccountId(1000),
            })
        );

        let old = Account::find_by_id(AccountId(1000), &db).await.unwrap();
        assert!(old.is_deleted);
        assert_eq!(old.bio, "thinks in tanks");

        let current = Account::find_by_handle("kashi", &db).await.unwrap();
        assert_eq!(current.id, AccountId(2000));
        assert_eq!(current.display_name, "Not Kashi");
        assert!(!current.is_deleted);
    }

    #[tokio::test]
    async fn test_reactivated_account_supersedes_new_holder() {
        let (db, _dir) = create_test_database().await;
        kashi().save(&db).await.unwrap();
        Account::new(AccountId(2000), "kashi").save(&db).await.unwrap();

        let mut returning = kashi();
        let conflict = returning.save(&db).await.unwrap();
        assert_eq!(conflict.map(|c| c.superseded_id), Some(AccountId(2000)));

        assert!(!Account::find_by_id(AccountId(1000), &db).await.unwrap().is_deleted);
        assert!(Account::find_by_id(AccountId(2000), &db).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_placeholder_allocates_synthetic_ids() {
        let (db, _dir) = create_test_database().await;

        let mut first = Account::placeholder("ghost");
        assert_eq!(first.save(&db).await.unwrap(), None);
        assert_eq!(first.id, AccountId::FIRST_SYNTHETIC);
        assert!(first.is_id_fake);

        let mut again = Account::placeholder("GHOST");
        again.save(&db).await.unwrap();
        assert_eq!(again.id, first.id);

        let mut other = Account::placeholder("phantom");
        other.save(&db).await.unwrap();
        assert_eq!(other.id, AccountId(AccountId::FIRST_SYNTHETIC.0 + 1));
    }

    #[tokio::test]
    async fn test_placeholder_resolves_to_real_account() {
        let (db, _dir) = create_test_database().await;
        kashi().save(&db).await.unwrap();

        let mut placeholder = Account::placeholder("Kashi");
        placeholder.save(&db).await.unwrap();
        assert_eq!(placeholder.id, AccountId(1000));
        assert!(!placeholder.is_id_fake);

        // Nothing was written for the placeholder
        let stored = Account::find_by_id(AccountId(1000), &db).await.unwrap();
        assert_eq!(stored.display_name, "Kashi");
    }

    #[tokio::test]
    async fn test_real_account_absorbs_placeholder() {
        let (db, _dir) = create_test_database().await;

        let mut placeholder = Account::placeholder("ghost");
        placeholder.save(&db).await.unwrap();
        let fake_id = placeholder.id;

        sqlx::query("INSERT INTO posts (id, author_id, text) VALUES (1, ?, 'boo')")
            .bind(fake_id)
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO likes (sort_index, post_id, liker_id) VALUES (1, 1, ?)")
            .bind(fake_id)
            .execute(&db.pool)
            .await
            .unwrap();

        let mut real = Account::new(AccountId(77), "ghost");
        assert_eq!(real.save(&db).await.unwrap(), None);

        let author: i64 = sqlx::query_scalar("SELECT author_id FROM posts WHERE id = 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(author, 77);
        let liker: i64 = sqlx::query_scalar("SELECT liker_id FROM likes")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(liker, 77);

        assert!(Account::find_by_id(fake_id, &db).await.unwrap().is_deleted);
        assert_eq!(
            Account::find_by_handle("ghost", &db).await.unwrap().id,
            AccountId(77)
        );
    }

    #[tokio::test]
    async fn test_find_many_skips_missing() {
        let (db, _dir) = create_test_database().await;
        kashi().save(&db).await.unwrap();
        Account::new(AccountId(2), "other").save(&db).await.unwrap();

        let found = Account::find_many(&[AccountId(1000), AccountId(2), AccountId(3)], &db)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(Account::find_many(&[], &db).await.unwrap().is_empty());
    }
}
