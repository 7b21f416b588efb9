use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, PostId};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Account {
    pub id: AccountId,
    pub display_name: String,
    pub handle: String,
    pub bio: String,
    pub following_count: i64,
    pub followers_count: i64,
    pub location: String,
    pub website: String,
    pub join_date: Option<DateTime<Utc>>,
    pub is_private: bool,
    pub is_verified: bool,
    pub is_banned: bool,
    pub is_deleted: bool,
    pub profile_image_url: String,
    pub profile_image_local_path: String,
    pub banner_image_url: String,
    pub banner_image_local_path: String,
    pub pinned_post_id: Option<PostId>,
    /// Local follow flag; harvests never change it.
    pub is_followed: bool,
    pub is_content_downloaded: bool,
    pub is_id_fake: bool,
    /// Set on accounts known only by handle. Saving resolves the handle to an existing
    /// account's ID or allocates a synthetic one.
    #[serde(skip)]
    pub is_needing_fake_id: bool,
}

/// Returned by [`Account::save`] when the saved account took over a handle that another
/// (real) account held. The superseded account has been flagged deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleConflict {
    pub handle: String,
    pub superseded_id: AccountId,
}

impl Account {
    pub fn new(id: AccountId, handle: impl Into<String>) -> Self {
        Account {
            id,
            handle: handle.into(),
            ..Default::default()
        }
    }

    /// An account referenced by handle only, e.g. from a mention or a tombstoned reply.
    pub fn placeholder(handle: impl Into<String>) -> Self {
        Account {
            handle: handle.into(),
            is_needing_fake_id: true,
            is_id_fake: true,
            ..Default::default()
        }
    }

    /// URL of the small avatar variant (`_normal` suffix before the extension).
    pub fn tiny_profile_image_url(&self) -> Option<String> {
        if self.profile_image_url.is_empty() {
            return None;
        }
        let url = &self.profile_image_url;
        let file_start = url.rfind('/').map(|i| i + 1).unwrap_or(0);
        match url[file_start..].rfind('.') {
            Some(dot) => {
                let dot = file_start + dot;
                if url[..dot].ends_with("_normal") {
                    Some(url.clone())
                } else {
                    Some(format!("{}_normal{}", &url[..dot], &url[dot..]))
                }
            }
            None => Some(format!("{url}_normal")),
        }
    }

    /// File name of the tiny avatar inside the profile image directory.
    pub fn tiny_profile_image_local_path(&self) -> Option<String> {
        let url = self.tiny_profile_image_url()?;
        let file_name = url.rsplit('/').next().unwrap_or(url.as_str());
        Some(format!("{}_profile_{}", self.handle, file_name))
    }
}
