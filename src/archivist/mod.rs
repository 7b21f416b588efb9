use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

pub mod accounts;
pub mod audio_rooms;
pub mod chats;
pub mod database;
pub mod error;
pub mod ids;
pub mod likes;
pub mod lists;
pub mod media_manager;
mod merge;
pub mod notifications;
pub mod posts;
pub mod reposts;
pub mod scheduled_tasks;
pub mod search;
pub mod storage;
pub mod trove;

use crate::init_tracing;

use accounts::{Account, HandleConflict};
use database::Database;
use error::{ArchivistError, Result};
use ids::AccountId;
use media_manager::{Downloader, HttpDownloader, MediaManager, MediaOwner};
use notifications::{NotificationCursor, NotificationFeed};
use posts::Post;
use scheduled_tasks::{Scheduler, SchedulerConfig, SchedulerHandle, Task};
use search::{Cursor, Feed};
use storage::MediaFileStorage;

const DATABASE_FILE_NAME: &str = "archivist.sqlite";

#[derive(Clone, Debug)]
pub struct ArchivistConfig {
    /// Directory holding the database file and the media directories
    pub profile_dir: PathBuf,

    /// Directory for log files; no file logging when unset
    pub logs_dir: Option<PathBuf>,

    /// Download media in the background after every merge
    pub auto_download_media: bool,

    pub scheduler: SchedulerConfig,
}

impl ArchivistConfig {
    pub fn new(profile_dir: &Path) -> Self {
        Self {
            profile_dir: profile_dir.to_path_buf(),
            logs_dir: None,
            auto_download_media: false,
            scheduler: SchedulerConfig::default(),
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: &Path) -> Self {
        self.logs_dir = Some(logs_dir.to_path_buf());
        self
    }

    pub fn with_auto_download_media(mut self, enabled: bool) -> Self {
        self.auto_download_media = enabled;
        self
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.profile_dir.join(DATABASE_FILE_NAME)
    }
}

/// Handle to one profile: its database, its media directories and the download pipeline.
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Archivist {
    pub config: ArchivistConfig,
    database: Arc<Database>,
    media: Arc<MediaManager>,
}

impl std::fmt::Debug for Archivist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archivist")
            .field("config", &self.config)
            .field("database", &"<REDACTED>")
            .field("media", &"<REDACTED>")
            .finish()
    }
}

impl Archivist {
    /// Opens the profile described by `config`, downloading media over HTTP.
    ///
    /// Creates the profile (and logs) directories, installs tracing when a logs directory
    /// is configured, opens the database and brings its schema up to date. Fails with
    /// [`DatabaseError::VersionMismatch`](database::DatabaseError::VersionMismatch) when
    /// the database was written by a newer build.
    pub async fn initialize(config: ArchivistConfig) -> Result<Self> {
        let downloader = HttpDownloader::new()?;
        Self::initialize_with_downloader(config, Arc::new(downloader)).await
    }

    pub async fn initialize_with_downloader(
        config: ArchivistConfig,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        let profile_dir = &config.profile_dir;
        std::fs::create_dir_all(profile_dir)
            .with_context(|| format!("Failed to create profile directory: {:?}", profile_dir))
            .map_err(ArchivistError::from)?;

        if let Some(logs_dir) = &config.logs_dir {
            std::fs::create_dir_all(logs_dir)
                .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))
                .map_err(ArchivistError::from)?;
            init_tracing(logs_dir);
            tracing::debug!(target: "archivist::initialize", "Logging initialized in directory: {:?}", logs_dir);
        }

        let database = Arc::new(Database::new(config.database_path()).await?);
        let storage = MediaFileStorage::new(profile_dir)?;
        let media = Arc::new(MediaManager::new(storage, database.clone(), downloader));

        tracing::info!(
            target: "archivist::initialize",
            "Opened profile {:?} at schema version {}",
            profile_dir,
            database.schema_version().await?
        );

        Ok(Self {
            config,
            database,
            media,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn media(&self) -> &MediaManager {
        &self.media
    }

    /// Saves an account, resolving a synthetic ID in place when the account needs one.
    ///
    /// Returns the conflict when the account's handle was held by another account, which
    /// is then flagged deleted.
    pub async fn save_account(&self, account: &mut Account) -> Result<Option<HandleConflict>> {
        account.save(&self.database).await
    }

    pub async fn get_account_by_handle(&self, handle: &str) -> Result<Account> {
        Account::find_by_handle(handle, &self.database).await
    }

    /// The page after `cursor`, with liked/bookmarked flags set for `viewer`.
    pub async fn next_page(&self, cursor: &Cursor, viewer: AccountId) -> Result<Feed> {
        search::next_page(cursor, viewer, &self.database).await
    }

    pub async fn next_notifications_page(
        &self,
        cursor: &NotificationCursor,
    ) -> Result<NotificationFeed> {
        search::next_notifications_page(cursor, &self.database).await
    }

    pub fn content_download_needed(&self, entity: &impl MediaOwner) -> bool {
        self.media.content_download_needed(entity)
    }

    pub async fn download_post_content(&self, post: &mut Post) -> Result<()> {
        let downloader = self.media.downloader();
        self.media
            .download_post_content(post, downloader.as_ref())
            .await
    }

    pub async fn download_account_content(&self, account: &mut Account) -> Result<()> {
        let downloader = self.media.downloader();
        self.media
            .download_account_content(account, downloader.as_ref())
            .await
    }

    /// Starts `tasks` on the background scheduler, unless the scheduler is disabled in the
    /// configuration.
    pub fn start_scheduler(&self, tasks: Vec<Arc<dyn Task>>) -> SchedulerHandle {
        let mut scheduler = Scheduler::new(self.config.scheduler.clone());
        for task in tasks {
            scheduler.register(task);
        }
        scheduler.start(self.clone())
    }
}

#[cfg(test)]
pub mod test_utils {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use tempfile::TempDir;

    use super::*;
    use crate::archivist::ids::{NotificationId, PostId, RepostId};
    use crate::archivist::media_manager::DownloadError;
    use crate::archivist::notifications::{Notification, NotificationType};
    use crate::archivist::reposts::Repost;

    /// In-memory [`Downloader`]: answers every URL with its own bytes unless told to fail,
    /// and records what was requested.
    #[derive(Default)]
    pub(crate) struct MockDownloader {
        failures: Mutex<HashMap<String, DownloadError>>,
        requests: Mutex<Vec<String>>,
    }

    impl MockDownloader {
        pub(crate) fn fail(&self, url: &str, error: DownloadError) {
            self.failures
                .lock()
                .unwrap()
                .insert(url.to_string(), error);
        }

        pub(crate) fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        async fn download(&self, url: &str) -> std::result::Result<Vec<u8>, DownloadError> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.failures.lock().unwrap().get(url) {
                Some(error) => Err(error.clone()),
                None => Ok(url.as_bytes().to_vec()),
            }
        }
    }

    pub(crate) async fn create_test_database() -> (Database, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let database = Database::new(temp_dir.path().join("test.sqlite"))
            .await
            .expect("Failed to open test database");
        (database, temp_dir)
    }

    pub(crate) async fn create_test_archivist() -> (Archivist, Arc<MockDownloader>, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let downloader = Arc::new(MockDownloader::default());
        let config = ArchivistConfig::new(temp_dir.path());
        let archivist = Archivist::initialize_with_downloader(config, downloader.clone())
            .await
            .expect("Failed to initialize archivist");
        (archivist, downloader, temp_dir)
    }

    /// A fully harvested post, posted at `id` seconds after the epoch.
    pub(crate) fn test_post(id: PostId, author_id: AccountId, text: &str) -> Post {
        let mut post = Post::new(id, author_id, text);
        post.posted_at = DateTime::from_timestamp_millis(id.0 * 1000);
        post
    }

    pub(crate) fn test_repost(
        id: RepostId,
        post_id: PostId,
        reposted_by_id: AccountId,
        reposted_at_millis: i64,
    ) -> Repost {
        Repost {
            id,
            post_id,
            reposted_by_id,
            reposted_at: DateTime::from_timestamp_millis(reposted_at_millis).unwrap_or_default(),
        }
    }

    pub(crate) fn test_notification(
        id: NotificationId,
        recipient_id: AccountId,
        sort_index: i64,
    ) -> Notification {
        Notification {
            id,
            notification_type: NotificationType::Like,
            sent_at: DateTime::from_timestamp_millis(sort_index).unwrap_or_default(),
            sort_index,
            acting_account_id: Some(AccountId(1)),
            post_id: None,
            repost_id: None,
            recipient_id,
            has_detail: false,
            last_scraped_at: None,
            account_ids: Vec::new(),
            post_ids: Vec::new(),
        }
    }
}
