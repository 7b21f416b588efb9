//! Media download pipeline.
//!
//! Posts and accounts name the files they own (image, video, thumbnail, link preview,
//! avatar and banner). The pipeline fetches whatever is missing through an injected
//! [`Downloader`], writes it into [`MediaFileStorage`], and marks the entity downloaded
//! only when every file it should own made it to disk. A failed pass leaves the entity
//! eligible for a later retry.

mod downloader;
mod errors;

use std::sync::Arc;

use dashmap::DashMap;

pub use downloader::{Downloader, HttpDownloader};
pub use errors::{DownloadError, MediaError};

use crate::archivist::{
    accounts::Account,
    database::Database,
    error::Result,
    posts::Post,
    storage::{MediaFileStorage, MediaKind},
};

/// Suffix of the smaller banner variant, tried when the full-size banner is gone.
const BANNER_FALLBACK_SUFFIX: &str = "/600x200";

/// Something that owns files in [`MediaFileStorage`].
pub trait MediaOwner {
    fn is_content_downloaded(&self) -> bool;

    /// Every file this entity should have on disk.
    fn expected_files(&self) -> Vec<(MediaKind, String)>;
}

impl MediaOwner for Post {
    fn is_content_downloaded(&self) -> bool {
        self.is_content_downloaded
    }

    fn expected_files(&self) -> Vec<(MediaKind, String)> {
        let mut files: Vec<(MediaKind, String)> = self
            .images
            .iter()
            .map(|image| (MediaKind::Image, image.local_filename.clone()))
            .collect();
        for video in self
            .videos
            .iter()
            .filter(|v| !v.is_geoblocked && !v.is_blocked_by_dmca)
        {
            files.push((MediaKind::Video, video.local_filename.clone()));
            if !video.thumbnail_remote_url.is_empty() {
                files.push((
                    MediaKind::VideoThumbnail,
                    video.thumbnail_local_filename.clone(),
                ));
            }
        }
        for card in self.link_cards.iter().filter(|c| has_link_thumbnail(c)) {
            files.push((MediaKind::LinkPreviewImage, card.thumbnail_local_path.clone()));
        }
        files
    }
}

impl MediaOwner for Account {
    fn is_content_downloaded(&self) -> bool {
        self.is_content_downloaded
    }

    fn expected_files(&self) -> Vec<(MediaKind, String)> {
        let mut files = Vec::new();
        if !self.profile_image_url.is_empty() {
            files.push((MediaKind::ProfileImage, self.profile_image_local_path.clone()));
        }
        if !self.banner_image_url.is_empty() {
            files.push((MediaKind::ProfileImage, self.banner_image_local_path.clone()));
        }
        files
    }
}

fn has_link_thumbnail(card: &crate::archivist::posts::LinkCard) -> bool {
    card.has_thumbnail && !card.thumbnail_remote_url.is_empty()
}

/// Last path segment of `url`, without query string or fragment.
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

fn ensure_file_name(local: &mut String, fallback: impl FnOnce() -> String) {
    if local.is_empty() {
        *local = fallback();
    }
}

/// Removes its key from the in-flight map when dropped.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

pub struct MediaManager {
    storage: MediaFileStorage,
    database: Arc<Database>,
    downloader: Arc<dyn Downloader>,
    /// Entities with a download pass running, keyed `post:<id>` / `account:<id>`.
    in_flight: DashMap<String, ()>,
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("storage", &self.storage)
            .field("downloader", &"<dyn Downloader>")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl MediaManager {
    pub(crate) fn new(
        storage: MediaFileStorage,
        database: Arc<Database>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            storage,
            database,
            downloader,
            in_flight: DashMap::new(),
        }
    }

    pub fn storage(&self) -> &MediaFileStorage {
        &self.storage
    }

    pub fn downloader(&self) -> Arc<dyn Downloader> {
        self.downloader.clone()
    }

    /// False only when the entity is flagged downloaded and every file it owns is on disk.
    pub fn content_download_needed(&self, entity: &impl MediaOwner) -> bool {
        if !entity.is_content_downloaded() {
            return true;
        }
        entity
            .expected_files()
            .iter()
            .any(|(kind, filename)| !self.storage.file_exists(*kind, filename))
    }

    fn claim(&self, key: String) -> Option<InFlightGuard<'_>> {
        if self.in_flight.insert(key.clone(), ()).is_some() {
            tracing::debug!(
                target: "archivist::media_manager::claim",
                "Download of {} already in flight, skipping",
                key
            );
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            key,
        })
    }

    async fn fetch_into(
        &self,
        downloader: &dyn Downloader,
        url: &str,
        kind: MediaKind,
        filename: &str,
    ) -> Result<()> {
        let data = downloader.download(url).await?;
        self.storage.store_file(kind, filename, &data).await?;
        Ok(())
    }

    /// Downloads a post's images, then its videos (skipping geoblocked ones), then its
    /// link preview thumbnails. A video blocked for legal reasons is flagged and skipped for
    /// good; any other failure aborts the pass without marking the post downloaded.
    pub async fn download_post_content(
        &self,
        post: &mut Post,
        downloader: &dyn Downloader,
    ) -> Result<()> {
        let Some(_guard) = self.claim(format!("post:{}", post.id)) else {
            return Ok(());
        };

        for image in post.images.iter_mut() {
            ensure_file_name(&mut image.local_filename, || url_file_name(&image.remote_url));
            if !self
                .storage
                .file_exists(MediaKind::Image, &image.local_filename)
            {
                self.fetch_into(
                    downloader,
                    &image.remote_url,
                    MediaKind::Image,
                    &image.local_filename,
                )
                .await?;
            }
            image.is_downloaded = true;
        }

        for video in post.videos.iter_mut() {
            if video.is_geoblocked || video.is_blocked_by_dmca {
                continue;
            }
            ensure_file_name(&mut video.local_filename, || url_file_name(&video.remote_url));
            if !self
                .storage
                .file_exists(MediaKind::Video, &video.local_filename)
            {
                match self
                    .fetch_into(
                        downloader,
                        &video.remote_url,
                        MediaKind::Video,
                        &video.local_filename,
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(crate::ArchivistError::Download(DownloadError::Blocked(url))) => {
                        tracing::info!(
                            target: "archivist::media_manager::download_post_content",
                            "Video of post {} is blocked: {}",
                            post.id,
                            url
                        );
                        video.is_blocked_by_dmca = true;
                        video.is_downloaded = false;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !video.thumbnail_remote_url.is_empty() {
                ensure_file_name(&mut video.thumbnail_local_filename, || {
                    url_file_name(&video.thumbnail_remote_url)
                });
                if !self.storage.file_exists(
                    MediaKind::VideoThumbnail,
                    &video.thumbnail_local_filename,
                ) {
                    self.fetch_into(
                        downloader,
                        &video.thumbnail_remote_url,
                        MediaKind::VideoThumbnail,
                        &video.thumbnail_local_filename,
                    )
                    .await?;
                }
            }
            video.is_downloaded = true;
        }

        for card in post.link_cards.iter_mut() {
            if !has_link_thumbnail(card) {
                continue;
            }
            ensure_file_name(&mut card.thumbnail_local_path, || {
                url_file_name(&card.thumbnail_remote_url)
            });
            if !self
                .storage
                .file_exists(MediaKind::LinkPreviewImage, &card.thumbnail_local_path)
            {
                self.fetch_into(
                    downloader,
                    &card.thumbnail_remote_url,
                    MediaKind::LinkPreviewImage,
                    &card.thumbnail_local_path,
                )
                .await?;
            }
            card.is_content_downloaded = true;
        }

        post.is_content_downloaded = true;
        post.save(&self.database).await?;

        tracing::debug!(
            target: "archivist::media_manager::download_post_content",
            "Downloaded content of post {}",
            post.id
        );
        Ok(())
    }

    /// Downloads an account's full-size avatar and banner. A missing banner is retried once
    /// against its smaller variant.
    pub async fn download_account_content(
        &self,
        account: &mut Account,
        downloader: &dyn Downloader,
    ) -> Result<()> {
        let Some(_guard) = self.claim(format!("account:{}", account.id)) else {
            return Ok(());
        };

        if !account.profile_image_url.is_empty() {
            let handle = account.handle.clone();
            ensure_file_name(&mut account.profile_image_local_path, || {
                format!(
                    "{}_profile_{}",
                    handle,
                    url_file_name(&account.profile_image_url)
                )
            });
            if !self
                .storage
                .file_exists(MediaKind::ProfileImage, &account.profile_image_local_path)
            {
                self.fetch_into(
                    downloader,
                    &account.profile_image_url,
                    MediaKind::ProfileImage,
                    &account.profile_image_local_path,
                )
                .await?;
            }
        }

        if !account.banner_image_url.is_empty() {
            let handle = account.handle.clone();
            ensure_file_name(&mut account.banner_image_local_path, || {
                let name = url_file_name(&account.banner_image_url);
                if name.contains('.') {
                    format!("{handle}_banner_{name}")
                } else {
                    format!("{handle}_banner_{name}.jpg")
                }
            });
            if !self
                .storage
                .file_exists(MediaKind::ProfileImage, &account.banner_image_local_path)
            {
                let data = match downloader.download(&account.banner_image_url).await {
                    Err(DownloadError::NotFound(_)) => {
                        let fallback =
                            format!("{}{}", account.banner_image_url, BANNER_FALLBACK_SUFFIX);
                        tracing::debug!(
                            target: "archivist::media_manager::download_account_content",
                            "Banner of {} not found, trying {}",
                            account.handle,
                            fallback
                        );
                        downloader.download(&fallback).await?
                    }
                    other => other?,
                };
                self.storage
                    .store_file(
                        MediaKind::ProfileImage,
                        &account.banner_image_local_path,
                        &data,
                    )
                    .await?;
            }
        }

        account.is_content_downloaded = true;
        if let Some(conflict) = account.save(&self.database).await? {
            tracing::warn!(
                target: "archivist::media_manager::download_account_content",
                "Saving {} superseded account {}",
                conflict.handle,
                conflict.superseded_id
            );
        }
        Ok(())
    }

    /// Fetches the small avatar shown next to posts. Does not touch the account's flags.
    pub async fn download_tiny_profile_image(
        &self,
        account: &Account,
        downloader: &dyn Downloader,
    ) -> Result<()> {
        let (Some(url), Some(filename)) = (
            account.tiny_profile_image_url(),
            account.tiny_profile_image_local_path(),
        ) else {
            return Ok(());
        };
        if self.storage.file_exists(MediaKind::ProfileImage, &filename) {
            return Ok(());
        }
        let Some(_guard) = self.claim(format!("tiny:{}", account.id)) else {
            return Ok(());
        };
        self.fetch_into(downloader, &url, MediaKind::ProfileImage, &filename)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::ids::{AccountId, PostId};
    use crate::archivist::posts::{Image, LinkCard, Video};
    use crate::archivist::test_utils::{MockDownloader, create_test_database, test_post};
    use tempfile::TempDir;

    async fn manager(downloader: Arc<MockDownloader>) -> (MediaManager, TempDir) {
        let (database, dir) = create_test_database().await;
        let storage = MediaFileStorage::new(dir.path()).unwrap();
        (
            MediaManager::new(storage, Arc::new(database), downloader.clone()),
            dir,
        )
    }

    fn post_with_media() -> Post {
        let mut post = test_post(PostId(1), AccountId(1), "media");
        post.images = vec![Image {
            id: 10,
            post_id: PostId(1),
            remote_url: "https://img.example.com/media/a.jpg".to_string(),
            local_filename: "a.jpg".to_string(),
            ..Default::default()
        }];
        post.videos = vec![
            Video {
                id: 20,
                post_id: PostId(1),
                remote_url: "https://video.example.com/v.mp4".to_string(),
                local_filename: "v.mp4".to_string(),
                thumbnail_remote_url: "https://img.example.com/thumb/v.jpg".to_string(),
                thumbnail_local_filename: "v.jpg".to_string(),
                ..Default::default()
            },
            Video {
                id: 21,
                post_id: PostId(1),
                remote_url: "https://video.example.com/geo.mp4".to_string(),
                local_filename: "geo.mp4".to_string(),
                is_geoblocked: true,
                ..Default::default()
            },
        ];
        post.link_cards = vec![LinkCard {
            post_id: PostId(1),
            expanded_url: "https://example.com/article".to_string(),
            has_card: true,
            has_thumbnail: true,
            thumbnail_remote_url: "https://img.example.com/card/c.png".to_string(),
            ..Default::default()
        }];
        post
    }

    #[tokio::test]
    async fn test_post_download_in_order_and_marks_downloaded() {
        let downloader = Arc::new(MockDownloader::default());
        let (manager, _dir) = manager(downloader.clone()).await;
        let mut post = post_with_media();
        post.save(&manager.database).await.unwrap();
        assert!(manager.content_download_needed(&post));

        manager
            .download_post_content(&mut post, downloader.as_ref())
            .await
            .unwrap();

        assert_eq!(
            downloader.requests(),
            vec![
                "https://img.example.com/media/a.jpg",
                "https://video.example.com/v.mp4",
                "https://img.example.com/thumb/v.jpg",
                "https://img.example.com/card/c.png",
            ]
        );
        assert!(post.is_content_downloaded);
        assert_eq!(post.link_cards[0].thumbnail_local_path, "c.png");
        assert!(!manager.content_download_needed(&post));

        let stored = Post::find_by_id(PostId(1), &manager.database).await.unwrap();
        assert!(stored.is_content_downloaded);
        assert!(stored.images[0].is_downloaded);
        assert!(!manager.content_download_needed(&stored));
    }

    #[tokio::test]
    async fn test_derived_file_names_are_stored() {
        let downloader = Arc::new(MockDownloader::default());
        let (manager, _dir) = manager(downloader.clone()).await;
        let mut post = post_with_media();
        post.images[0].local_filename.clear();
        post.videos[0].local_filename.clear();
        post.videos[0].thumbnail_local_filename.clear();
        post.save(&manager.database).await.unwrap();

        manager
            .download_post_content(&mut post, downloader.as_ref())
            .await
            .unwrap();

        let stored = Post::find_by_id(PostId(1), &manager.database).await.unwrap();
        assert_eq!(stored.images[0].local_filename, "a.jpg");
        let video = stored.videos.iter().find(|v| v.id == 20).unwrap();
        assert_eq!(video.local_filename, "v.mp4");
        assert_eq!(video.thumbnail_local_filename, "v.jpg");
        assert_eq!(stored.link_cards[0].thumbnail_local_path, "c.png");
        assert!(stored.is_content_downloaded);
        assert!(!manager.content_download_needed(&stored));

        // A later harvest carrying no file names keeps the stored ones
        let mut harvested = post_with_media();
        harvested.images[0].local_filename.clear();
        harvested.save(&manager.database).await.unwrap();
        let stored = Post::find_by_id(PostId(1), &manager.database).await.unwrap();
        assert_eq!(stored.images[0].local_filename, "a.jpg");
        assert!(!manager.content_download_needed(&stored));
    }

    #[tokio::test]
    async fn test_missing_file_means_download_needed() {
        let downloader = Arc::new(MockDownloader::default());
        let (manager, dir) = manager(downloader.clone()).await;
        let mut post = post_with_media();
        manager
            .download_post_content(&mut post, downloader.as_ref())
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join("images").join("a.jpg")).unwrap();
        assert!(manager.content_download_needed(&post));
    }

    #[tokio::test]
    async fn test_blocked_video_is_terminal() {
        let downloader = Arc::new(MockDownloader::default());
        downloader.fail(
            "https://video.example.com/v.mp4",
            DownloadError::Blocked("https://video.example.com/v.mp4".to_string()),
        );
        let (manager, _dir) = manager(downloader.clone()).await;
        let mut post = post_with_media();

        manager
            .download_post_content(&mut post, downloader.as_ref())
            .await
            .unwrap();

        assert!(post.videos[0].is_blocked_by_dmca);
        assert!(!post.videos[0].is_downloaded);
        assert!(post.is_content_downloaded);
        assert!(
            !downloader
                .requests()
                .contains(&"https://img.example.com/thumb/v.jpg".to_string())
        );
        assert!(!manager.content_download_needed(&post));
    }

    #[tokio::test]
    async fn test_other_failure_aborts_without_marking() {
        let downloader = Arc::new(MockDownloader::default());
        downloader.fail(
            "https://img.example.com/media/a.jpg",
            DownloadError::Timeout("https://img.example.com/media/a.jpg".to_string()),
        );
        let (manager, _dir) = manager(downloader.clone()).await;
        let mut post = post_with_media();
        post.save(&manager.database).await.unwrap();

        let result = manager
            .download_post_content(&mut post, downloader.as_ref())
            .await;

        assert!(matches!(
            result,
            Err(crate::ArchivistError::Download(DownloadError::Timeout(_)))
        ));
        assert!(!post.is_content_downloaded);
        assert_eq!(downloader.requests().len(), 1);
        let stored = Post::find_by_id(PostId(1), &manager.database).await.unwrap();
        assert!(!stored.is_content_downloaded);
    }

    #[tokio::test]
    async fn test_banner_not_found_retries_smaller_variant() {
        let downloader = Arc::new(MockDownloader::default());
        downloader.fail(
            "https://img.example.com/banners/1/1500",
            DownloadError::NotFound("https://img.example.com/banners/1/1500".to_string()),
        );
        let (manager, dir) = manager(downloader.clone()).await;
        let mut account = Account::new(AccountId(1), "kashi");
        account.profile_image_url = "https://img.example.com/p/abc.jpg".to_string();
        account.banner_image_url = "https://img.example.com/banners/1/1500".to_string();

        manager
            .download_account_content(&mut account, downloader.as_ref())
            .await
            .unwrap();

        assert_eq!(
            downloader.requests(),
            vec![
                "https://img.example.com/p/abc.jpg",
                "https://img.example.com/banners/1/1500",
                "https://img.example.com/banners/1/1500/600x200",
            ]
        );
        assert_eq!(account.profile_image_local_path, "kashi_profile_abc.jpg");
        assert_eq!(account.banner_image_local_path, "kashi_banner_1500.jpg");
        assert!(dir.path().join("profile_images/kashi_banner_1500.jpg").is_file());
        assert!(account.is_content_downloaded);
        assert!(!manager.content_download_needed(&account));
    }

    #[tokio::test]
    async fn test_tiny_profile_image() {
        let downloader = Arc::new(MockDownloader::default());
        let (manager, _dir) = manager(downloader.clone()).await;
        let mut account = Account::new(AccountId(1), "kashi");
        account.profile_image_url = "https://img.example.com/p/abc.jpg".to_string();

        manager
            .download_tiny_profile_image(&account, downloader.as_ref())
            .await
            .unwrap();
        // Already on disk
        manager
            .download_tiny_profile_image(&account, downloader.as_ref())
            .await
            .unwrap();

        assert_eq!(
            downloader.requests(),
            vec!["https://img.example.com/p/abc_normal.jpg"]
        );
        assert!(
            manager
                .storage()
                .file_exists(MediaKind::ProfileImage, "kashi_profile_abc_normal.jpg")
        );
    }

    #[test]
    fn test_url_file_name() {
        assert_eq!(url_file_name("https://a.com/x/y.jpg?name=small"), "y.jpg");
        assert_eq!(url_file_name("https://a.com/banners/1/1500/"), "1500");
    }
}
