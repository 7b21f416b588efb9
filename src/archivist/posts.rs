use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, AudioRoomId, PostId};

/// Why a post can no longer be viewed on the remote side.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TombstoneKind {
    Deleted,
    Suspended,
    Hidden,
    /// The generic classification, used when nothing more specific is known.
    Unavailable,
    Violated,
    NoLongerExists,
    AgeRestricted,
    NewerVersionAvailable,
}

impl TombstoneKind {
    pub fn short_code(&self) -> &'static str {
        match self {
            TombstoneKind::Deleted => "deleted",
            TombstoneKind::Suspended => "suspended",
            TombstoneKind::Hidden => "hidden",
            TombstoneKind::Unavailable => "unavailable",
            TombstoneKind::Violated => "violated",
            TombstoneKind::NoLongerExists => "no longer exists",
            TombstoneKind::AgeRestricted => "age-restricted",
            TombstoneKind::NewerVersionAvailable => "newer-version-available",
        }
    }

    pub fn display_text(&self) -> &'static str {
        match self {
            TombstoneKind::Deleted => "This post was deleted by the post author",
            TombstoneKind::Suspended => "This post is from a suspended account",
            TombstoneKind::Hidden => {
                "You're unable to view this post because this account owner limits who can view their posts"
            }
            TombstoneKind::Unavailable => "This post is unavailable",
            TombstoneKind::Violated => "This post violated the platform rules",
            TombstoneKind::NoLongerExists => "This post is from an account that no longer exists",
            TombstoneKind::AgeRestricted => {
                "Age-restricted adult content. This content might not be appropriate for people under 18 years old"
            }
            TombstoneKind::NewerVersionAvailable => "There's a new version of this post",
        }
    }
}

impl fmt::Display for TombstoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_code())
    }
}

impl FromStr for TombstoneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deleted" => Ok(TombstoneKind::Deleted),
            "suspended" => Ok(TombstoneKind::Suspended),
            "hidden" => Ok(TombstoneKind::Hidden),
            "unavailable" => Ok(TombstoneKind::Unavailable),
            "violated" => Ok(TombstoneKind::Violated),
            "no longer exists" => Ok(TombstoneKind::NoLongerExists),
            "age-restricted" => Ok(TombstoneKind::AgeRestricted),
            "newer-version-available" => Ok(TombstoneKind::NewerVersionAvailable),
            _ => Err(format!("Unknown tombstone type: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Image {
    pub id: i64,
    pub post_id: PostId,
    pub width: i64,
    pub height: i64,
    pub remote_url: String,
    pub local_filename: String,
    pub is_downloaded: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Video {
    pub id: i64,
    pub post_id: PostId,
    pub width: i64,
    pub height: i64,
    pub remote_url: String,
    pub local_filename: String,
    pub thumbnail_remote_url: String,
    pub thumbnail_local_filename: String,
    pub duration_ms: i64,
    pub view_count: i64,
    pub is_gif: bool,
    pub is_downloaded: bool,
    /// Set when the download was refused for copyright reasons; such videos are not retried.
    pub is_blocked_by_dmca: bool,
    pub is_geoblocked: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct LinkCard {
    pub post_id: PostId,
    pub expanded_url: String,
    pub short_url: String,
    pub domain: String,
    pub title: String,
    pub description: String,
    pub creator_id: Option<AccountId>,
    pub site_id: Option<AccountId>,
    pub thumbnail_width: i64,
    pub thumbnail_height: i64,
    pub thumbnail_remote_url: String,
    pub thumbnail_local_path: String,
    pub has_card: bool,
    pub has_thumbnail: bool,
    pub is_content_downloaded: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct PollChoice {
    pub label: String,
    pub votes: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Poll {
    pub id: i64,
    pub post_id: PostId,
    pub choices: Vec<PollChoice>,
    pub voting_duration_secs: i64,
    pub voting_ends_at: Option<DateTime<Utc>>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn total_votes(&self) -> i64 {
        self.choices.iter().map(|c| c.votes).sum()
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.voting_ends_at.is_some_and(|ends_at| ends_at > now)
    }

    /// Share of the votes per choice, in percent. All zero when nobody voted.
    pub fn percentages(&self) -> Vec<f64> {
        let total = self.total_votes();
        self.choices
            .iter()
            .map(|c| {
                if total == 0 {
                    0.0
                } else {
                    c.votes as f64 * 100.0 / total as f64
                }
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Post {
    pub id: PostId,
    pub author_id: AccountId,
    /// Author handle as harvested. Only used to resolve `author_id` before saving.
    #[serde(default)]
    pub author_handle: String,
    pub text: String,
    pub is_expandable: bool,
    pub posted_at: Option<DateTime<Utc>>,
    pub num_likes: i64,
    pub num_reposts: i64,
    pub num_replies: i64,
    pub num_quotes: i64,
    pub in_reply_to_id: Option<PostId>,
    pub quoted_post_id: Option<PostId>,
    pub audio_room_id: Option<AudioRoomId>,
    pub tombstone: Option<TombstoneKind>,
    /// Known to exist (e.g. as a reply target) but not harvested in full.
    pub is_stub: bool,
    pub is_content_downloaded: bool,
    pub is_conversation_scraped: bool,
    pub last_scraped_at: Option<DateTime<Utc>>,

    pub images: Vec<Image>,
    pub videos: Vec<Video>,
    pub link_cards: Vec<LinkCard>,
    pub polls: Vec<Poll>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub reply_mentions: Vec<String>,

    /// Filled in per viewer at read time; never stored.
    #[serde(default)]
    pub is_liked_by_viewer: bool,
    #[serde(default)]
    pub is_bookmarked_by_viewer: bool,
}

impl Post {
    pub fn new(id: PostId, author_id: AccountId, text: impl Into<String>) -> Self {
        Post {
            id,
            author_id,
            text: text.into(),
            ..Default::default()
        }
    }

    /// A post known only by ID.
    pub fn stub(id: PostId) -> Self {
        Post {
            id,
            is_stub: true,
            ..Default::default()
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstone.is_some()
    }

    pub fn tombstone_text(&self) -> Option<&'static str> {
        self.tombstone.map(|t| t.display_text())
    }

    pub fn has_media(&self) -> bool {
        !self.images.is_empty() || !self.videos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_codes_round_trip_through_str() {
        for kind in [
            TombstoneKind::Deleted,
            TombstoneKind::Suspended,
            TombstoneKind::Hidden,
            TombstoneKind::Unavailable,
            TombstoneKind::Violated,
            TombstoneKind::NoLongerExists,
            TombstoneKind::AgeRestricted,
            TombstoneKind::NewerVersionAvailable,
        ] {
            assert_eq!(kind.short_code().parse::<TombstoneKind>(), Ok(kind));
        }
        assert!("gone fishing".parse::<TombstoneKind>().is_err());
    }

    #[test]
    fn test_poll_tallies() {
        let poll = Poll {
            choices: vec![
                PollChoice {
                    label: "yes".to_string(),
                    votes: 3,
                },
                PollChoice {
                    label: "no".to_string(),
                    votes: 1,
                },
            ],
            voting_ends_at: DateTime::from_timestamp_millis(2_000),
            ..Default::default()
        };
        assert_eq!(poll.total_votes(), 4);
        assert_eq!(poll.percentages(), vec![75.0, 25.0]);
        assert!(poll.is_open(DateTime::from_timestamp_millis(1_000).unwrap()));
        assert!(!poll.is_open(DateTime::from_timestamp_millis(3_000).unwrap()));
    }

    #[test]
    fn test_stub_post() {
        let post = Post::stub(PostId(9));
        assert!(post.is_stub);
        assert!(!post.is_tombstoned());
        assert_eq!(post.tombstone_text(), None);
    }
}
