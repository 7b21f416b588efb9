use sqlx::{
    Sqlite, SqlitePool,
    migrate::MigrateDatabase,
    sqlite::SqlitePoolOptions,
};
use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod accounts;
pub mod audio_rooms;
pub mod chats;
pub mod likes;
pub mod lists;
pub mod merge_policy;
pub mod migrations;
pub mod notifications;
pub mod posts;
pub mod reposts;
pub mod utils;

use migrations::Migrator;

const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("Invalid timestamp: {timestamp} cannot be converted to DateTime")]
    InvalidTimestamp { timestamp: i64 },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(
        "Database schema version {stored} is newer than the {supported} this build supports; upgrade the application"
    )]
    VersionMismatch { stored: i64, supported: i64 },
    #[error("Migration to version {version} failed: {source}")]
    MigrationFailed {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Clone, Debug)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: PathBuf,
    pub last_connected: SystemTime,
}

impl Database {
    /// Opens (creating if needed) the database file and brings its schema up to date.
    ///
    /// Fails with [`DatabaseError::VersionMismatch`] if the file was written by a newer build.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        Self::with_migrator(db_path, &Migrator::default()).await
    }

    /// Same as [`Database::new`] but upgrades with an explicit migration list.
    pub async fn with_migrator(
        db_path: PathBuf,
        migrator: &Migrator,
    ) -> Result<Self, DatabaseError> {
        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.display());

        tracing::debug!(target: "archivist::database::new", "Checking if DB exists...{:?}", db_url);
        match Sqlite::database_exists(&db_url).await {
            Ok(true) => {
                tracing::debug!(target: "archivist::database::new", "DB exists");
            }
            Ok(false) => {
                tracing::debug!(target: "archivist::database::new", "DB does not exist, creating...");
                Sqlite::create_database(&db_url).await.map_err(|e| {
                    tracing::error!(target: "archivist::database::new", "Error creating DB: {:?}", e);
                    DatabaseError::Sqlx(e)
                })?;
            }
            Err(e) => {
                tracing::warn!(
                    target: "archivist::database::new",
                    "Could not check if database exists: {:?}, attempting to create",
                    e
                );
                Sqlite::create_database(&db_url).await.map_err(|e| {
                    tracing::error!(target: "archivist::database::new", "Error creating DB: {:?}", e);
                    DatabaseError::Sqlx(e)
                })?;
            }
        }

        let pool = Self::create_connection_pool(&db_url).await?;

        migrator.run(&pool).await?;

        Ok(Self {
            pool,
            path: db_path,
            last_connected: SystemTime::now(),
        })
    }

    /// Creates and configures a SQLite connection pool
    async fn create_connection_pool(db_url: &str) -> Result<SqlitePool, DatabaseError> {
        tracing::debug!(target: "archivist::database::new", "Creating connection pool...");
        let pool = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS))
            .max_connections(DB_MAX_CONNECTIONS)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    let conn = &mut *conn;
                    // Readers are never blocked by the writer
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    // Concurrent writers wait on each other instead of failing
                    sqlx::query(&format!("PRAGMA busy_timeout={DB_BUSY_TIMEOUT_MS}"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{db_url}?mode=rwc"))
            .await?;
        Ok(pool)
    }

    /// Runs all pending migrations and returns the resulting schema version.
    ///
    /// Idempotent: a database already at the current version is left untouched.
    pub async fn migrate_up(&self) -> Result<i64, DatabaseError> {
        Migrator::default().run(&self.pool).await
    }

    /// The schema version currently recorded in the database.
    pub async fn schema_version(&self) -> Result<i64, DatabaseError> {
        migrations::stored_version(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::database::migrations::MIGRATIONS;
    use tempfile::TempDir;

    async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path)
            .await
            .expect("Failed to create test database");
        (db, temp_dir)
    }

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(db_path.clone()).await;
        assert!(db.is_ok());

        let db = db.unwrap();
        assert_eq!(db.path, db_path);
        assert!(db.last_connected.elapsed().unwrap().as_secs() < 2);
    }

    #[tokio::test]
    async fn test_database_creation_with_nested_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("nested").join("path").join("test.db");

        let db = Database::new(db_path.clone()).await;
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_database_schema_is_current() {
        let (db, _temp_dir) = create_test_db().await;

        assert_eq!(db.schema_version().await.unwrap(), MIGRATIONS.len() as i64);

        for table in ["accounts", "posts", "reposts", "likes", "lists", "notifications", "chat_rooms"] {
            let result = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name=?")
                .bind(table)
                .fetch_optional(&db.pool)
                .await
                .unwrap();
            assert!(result.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_database_pragma_settings() {
        let (db, _temp_dir) = create_test_db().await;

        let foreign_keys: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to check foreign_keys pragma");
        assert_eq!(foreign_keys.0, 1);

        let journal_mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to check journal_mode pragma");
        assert_eq!(journal_mode.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_migrate_up_is_idempotent() {
        let (db, _temp_dir) = create_test_db().await;

        let version = db.migrate_up().await.unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
        let version = db.migrate_up().await.unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_database_reopen_existing() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");

        let db1 = Database::new(db_path.clone())
            .await
            .expect("Failed to create database");
        sqlx::query("INSERT INTO accounts (id, handle, display_name) VALUES (1, 'kashi', 'Kashi')")
            .execute(&db1.pool)
            .await
            .expect("Failed to insert test account");
        db1.pool.close().await;
        drop(db1);

        let db2 = Database::new(db_path.clone())
            .await
            .expect("Failed to reopen database");
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM accounts")
            .fetch_one(&db2.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_database_clone_shares_pool() {
        let (db, _temp_dir) = create_test_db().await;
        let db_clone = db.clone();
        assert_eq!(db.path, db_clone.path);

        let result: (i64,) = sqlx::query_as("SELECT 2")
            .fetch_one(&db_clone.pool)
            .await
            .unwrap();
        assert_eq!(result.0, 2);
    }
}
