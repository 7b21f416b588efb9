use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, NotificationId, PostId, RepostId};
use crate::archivist::search::CursorPosition;
use crate::archivist::trove::Trove;

/// Stable integer codes; stored in `notifications.notification_type`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Like,
    Repost,
    Quote,
    Reply,
    Follow,
    Mention,
    UserIsLive,
    PollEnded,
    Login,
    CommunityPinnedPost,
    RecommendedPost,
}

impl NotificationType {
    pub fn code(&self) -> i64 {
        match self {
            NotificationType::Like => 1,
            NotificationType::Repost => 2,
            NotificationType::Quote => 3,
            NotificationType::Reply => 4,
            NotificationType::Follow => 5,
            NotificationType::Mention => 6,
            NotificationType::UserIsLive => 7,
            NotificationType::PollEnded => 8,
            NotificationType::Login => 9,
            NotificationType::CommunityPinnedPost => 10,
            NotificationType::RecommendedPost => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => NotificationType::Like,
            2 => NotificationType::Repost,
            3 => NotificationType::Quote,
            4 => NotificationType::Reply,
            5 => NotificationType::Follow,
            6 => NotificationType::Mention,
            7 => NotificationType::UserIsLive,
            8 => NotificationType::PollEnded,
            9 => NotificationType::Login,
            10 => NotificationType::CommunityPinnedPost,
            11 => NotificationType::RecommendedPost,
            _ => return None,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub notification_type: NotificationType,
    pub sent_at: DateTime<Utc>,
    pub sort_index: i64,
    pub acting_account_id: Option<AccountId>,
    pub post_id: Option<PostId>,
    pub repost_id: Option<RepostId>,
    pub recipient_id: AccountId,
    /// Whether the aggregated account/post sets below were fetched.
    pub has_detail: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,
    /// For "N people liked your post" style notifications.
    pub account_ids: Vec<AccountId>,
    pub post_ids: Vec<PostId>,
}

/// Resume position in one recipient's notifications, newest (highest sort index) first.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NotificationCursor {
    pub recipient_id: AccountId,
    pub position: CursorPosition,
    pub sort_index: i64,
    pub last_id: NotificationId,
    pub page_size: usize,
}

impl NotificationCursor {
    pub fn new(recipient_id: AccountId, page_size: usize) -> Self {
        NotificationCursor {
            recipient_id,
            position: CursorPosition::Start,
            sort_index: 0,
            last_id: NotificationId::default(),
            page_size,
        }
    }

    pub fn is_end(&self) -> bool {
        self.position == CursorPosition::End
    }
}

/// One page of notifications plus every post and account needed to render them.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    pub notifications: Vec<Notification>,
    pub trove: Trove,
    pub cursor: NotificationCursor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(NotificationType::Like.code(), 1);
        assert_eq!(NotificationType::RecommendedPost.code(), 11);
        for code in 1..=11 {
            let kind = NotificationType::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(NotificationType::from_code(0), None);
    }
}
