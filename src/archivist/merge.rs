use futures::stream::{self, StreamExt};

use super::Archivist;
use crate::archivist::{error::Result, ids::AccountId, lists::List, posts::Post, trove::Trove};

/// Concurrent transfers per background download batch.
const DOWNLOAD_CONCURRENCY: usize = 4;

impl Archivist {
    /// Persists every entity of `trove` and returns the accounts that lost their handle to
    /// an account of this trove.
    ///
    /// Accounts go first so everything saved after them references resolved IDs: a
    /// placeholder that turns out to match a stored account has all its in-trove
    /// references rewritten to the stored ID. Then audio rooms, posts (with their
    /// attachments), reposts, likes, bookmarks, notifications, chats and lists.
    ///
    /// A storage error aborts the pass. Entities saved before it stay saved; every save is
    /// an idempotent upsert, so merging the same trove again converges.
    pub async fn merge(&self, mut trove: Trove) -> Result<Vec<AccountId>> {
        trove.fill_missing_account_ids();

        let mut superseded = Vec::new();

        // Real IDs before provisional ones, so placeholders can resolve to them
        let mut account_ids: Vec<AccountId> = trove.accounts.keys().copied().collect();
        account_ids.sort_by_key(|id| (id.is_provisional(), *id));

        for original_id in account_ids {
            let Some(mut account) = trove.accounts.get(&original_id).cloned() else {
                continue;
            };
            if original_id.is_provisional() {
                account.is_needing_fake_id = true;
            }

            if let Some(conflict) = account.save(self.database()).await? {
                tracing::info!(
                    target: "archivist::merge::merge",
                    "Handle {} moved from account {} to {}",
                    conflict.handle,
                    conflict.superseded_id,
                    account.id
                );
                superseded.push(conflict.superseded_id);
            }

            if account.id == original_id {
                trove.accounts.insert(original_id, account);
            } else {
                trove.rewrite_account_id(original_id, account.id);
            }
        }

        for room in trove.audio_rooms.values() {
            room.save(self.database()).await?;
        }

        let mut posts: Vec<&Post> = trove.posts.values().collect();
        posts.sort_by_key(|post| post.id);
        for post in posts {
            post.save(self.database()).await?;
        }

        for repost in trove.reposts.values() {
            repost.save(self.database()).await?;
        }
        for like in trove.likes.values() {
            like.save(self.database()).await?;
        }
        for bookmark in trove.bookmarks.values() {
            bookmark.save(self.database()).await?;
        }
        for notification in trove.notifications.values() {
            notification.save(self.database()).await?;
        }
        for room in trove.chat_rooms.values() {
            room.save(self.database()).await?;
        }
        for message in trove.chat_messages.values() {
            message.save(self.database()).await?;
        }
        let lists: Vec<List> = trove.lists.values().cloned().collect();
        for mut list in lists {
            list.save(self.database()).await?;
        }

        tracing::debug!(
            target: "archivist::merge::merge",
            "Merged {} accounts, {} posts, {} reposts, {} notifications, {} chat messages ({} superseded)",
            trove.accounts.len(),
            trove.posts.len(),
            trove.reposts.len(),
            trove.notifications.len(),
            trove.chat_messages.len(),
            superseded.len()
        );

        if self.config.auto_download_media {
            self.spawn_media_downloads(&trove);
        }

        Ok(superseded)
    }

    /// Detached downloads for what `trove` brought in: tiny avatars of accounts without
    /// downloaded content, and the full content of every post that still needs it.
    /// Failures are logged; the next merge covering the same entity retries.
    fn spawn_media_downloads(&self, trove: &Trove) {
        let accounts: Vec<_> = trove
            .accounts
            .values()
            .filter(|account| !account.is_content_downloaded && !account.is_id_fake)
            .cloned()
            .collect();
        let posts: Vec<Post> = trove
            .posts
            .values()
            .filter(|post| !post.is_stub && !post.is_tombstoned())
            .filter(|post| self.content_download_needed(*post))
            .cloned()
            .collect();

        if accounts.is_empty() && posts.is_empty() {
            return;
        }

        let media = self.media.clone();
        tokio::spawn(async move {
            let downloader = media.downloader();

            stream::iter(accounts)
                .for_each_concurrent(DOWNLOAD_CONCURRENCY, |account| {
                    let media = media.clone();
                    let downloader = downloader.clone();
                    async move {
                        if let Err(e) = media
                            .download_tiny_profile_image(&account, downloader.as_ref())
                            .await
                        {
                            tracing::warn!(
                                target: "archivist::merge::download",
                                "Failed to download avatar of {}: {}",
                                account.handle,
                                e
                            );
                        }
                    }
                })
                .await;

            stream::iter(posts)
                .for_each_concurrent(DOWNLOAD_CONCURRENCY, |mut post| {
                    let media = media.clone();
                    let downloader = downloader.clone();
                    async move {
                        if let Err(e) = media
                            .download_post_content(&mut post, downloader.as_ref())
                            .await
                        {
                            tracing::warn!(
                                target: "archivist::merge::download",
                                "Failed to download content of post {}: {}",
                                post.id,
                                e
                            );
                        }
                    }
                })
                .await;
        });
    }
}
