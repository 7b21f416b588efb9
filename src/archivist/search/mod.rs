//! Cursor-based pagination and search over posts and reposts.
//!
//! A [`Cursor`] is an immutable resume token: the sort order, where the previous page
//! stopped, and the filters that produced it. Each call to
//! [`Archivist::next_page`](crate::Archivist::next_page) returns a [`Feed`] carrying the
//! cursor for the following page. The end of a feed is signaled by
//! [`CursorPosition::End`], never by an error.

mod engine;
mod query;

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archivist::ids::{AccountId, ListId, PostId, RepostId};
use crate::archivist::trove::Trove;

pub(crate) use engine::{next_notifications_page, next_page};
pub use query::parse_search_query;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("Unmatched quotes in query: {0}")]
    UnmatchedQuotes(String),
    #[error("Invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("Unknown filter {0:?}")]
    UnknownFilter(String),
    #[error("Invalid post ID {0:?}")]
    InvalidPostId(String),
    #[error("Invalid cursor token: {0}")]
    InvalidToken(String),
    #[error("Sorting by like time needs a liked-by account")]
    LikedAtWithoutLiker,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    MostLiked,
    MostReposted,
    /// When the `liked_by` account liked the post, most recent first.
    LikedAt,
}

impl SortOrder {
    pub fn is_ascending(self) -> bool {
        self == SortOrder::OldestFirst
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CursorPosition {
    /// Before the first item; no position predicate applies.
    #[default]
    Start,
    Middle,
    /// Exhausted; fetching again yields an empty page.
    End,
}

/// Include, exclude, or restrict to a kind of item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    Include,
    Exclude,
    Only,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentFilter {
    Links,
    Images,
    Videos,
    Polls,
    Spaces,
    /// Images or videos.
    Media,
}

impl fmt::Display for ContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentFilter::Links => "links",
            ContentFilter::Images => "images",
            ContentFilter::Videos => "videos",
            ContentFilter::Polls => "polls",
            ContentFilter::Spaces => "spaces",
            ContentFilter::Media => "media",
        };
        f.write_str(name)
    }
}

impl FromStr for ContentFilter {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "links" => Ok(ContentFilter::Links),
            "images" => Ok(ContentFilter::Images),
            "videos" => Ok(ContentFilter::Videos),
            "polls" => Ok(ContentFilter::Polls),
            "spaces" => Ok(ContentFilter::Spaces),
            "media" => Ok(ContentFilter::Media),
            _ => Err(SearchError::UnknownFilter(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SearchFilters {
    /// Case-insensitive substrings of the post text.
    pub keywords: Vec<String>,
    /// Handle of the account that posted (or reposted) the item.
    pub from_handle: Option<String>,
    /// Handles the post replies to or mentions; all must match.
    pub to_handles: Vec<String>,
    pub reposted_by_handle: Option<String>,
    /// Inclusive lower bound on the item time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the item time.
    pub until: Option<DateTime<Utc>>,
    pub required_content: Vec<ContentFilter>,
    pub excluded_content: Vec<ContentFilter>,
    pub quoted_post_id: Option<PostId>,
    pub liked_by: Option<AccountId>,
    pub bookmarked_by: Option<AccountId>,
    pub list_id: Option<ListId>,
    /// Only items by accounts the user follows.
    pub followed_only: bool,
    pub replies: FilterMode,
    pub reposts: FilterMode,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub sort_order: SortOrder,
    pub position: CursorPosition,
    /// Sort key of the last item returned: item time in milliseconds for chronological
    /// orders, a count for popularity orders, the like's sort index for [`SortOrder::LikedAt`].
    pub sort_key: i64,
    /// Tie-break keys of the last item returned.
    pub last_post_id: PostId,
    pub last_repost_id: RepostId,
    pub page_size: usize,
    pub filters: SearchFilters,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::new(SortOrder::default(), DEFAULT_PAGE_SIZE)
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 50;

impl Cursor {
    pub fn new(sort_order: SortOrder, page_size: usize) -> Self {
        Cursor {
            sort_order,
            position: CursorPosition::Start,
            sort_key: 0,
            last_post_id: PostId::default(),
            last_repost_id: RepostId::default(),
            page_size,
            filters: SearchFilters::default(),
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// A start cursor for a search expression such as `"think tank" from:kashi filter:images`.
    pub fn from_search_query(query: &str) -> Result<Self, SearchError> {
        let filters = parse_search_query(query)?;
        Ok(Cursor::new(SortOrder::NewestFirst, DEFAULT_PAGE_SIZE).with_filters(filters))
    }

    /// The latest items by one account (its posts and reposts).
    pub fn user_feed(handle: &str, page_size: usize) -> Self {
        Cursor::new(SortOrder::NewestFirst, page_size).with_filters(SearchFilters {
            from_handle: Some(handle.to_string()),
            ..Default::default()
        })
    }

    /// Posts an account liked, in the order it liked them.
    pub fn likes_feed(liker_id: AccountId, page_size: usize) -> Self {
        Cursor::new(SortOrder::LikedAt, page_size).with_filters(SearchFilters {
            liked_by: Some(liker_id),
            ..Default::default()
        })
    }

    pub fn is_start(&self) -> bool {
        self.position == CursorPosition::Start
    }

    pub fn is_end(&self) -> bool {
        self.position == CursorPosition::End
    }

    /// Serializes the cursor into an opaque, URL-safe token.
    pub fn to_token(&self) -> Result<String, SearchError> {
        let json =
            serde_json::to_vec(self).map_err(|e| SearchError::InvalidToken(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn from_token(token: &str) -> Result<Self, SearchError> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| SearchError::InvalidToken(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| SearchError::InvalidToken(e.to_string()))
    }
}

/// One entry of a feed: a post, or a repost of it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FeedItem {
    pub post_id: PostId,
    pub repost_id: Option<RepostId>,
}

/// One page: the ordered items, everything needed to render them, and the next cursor.
#[derive(Debug, Clone)]
pub struct Feed {
    pub items: Vec<FeedItem>,
    pub trove: Trove,
    pub cursor: Cursor,
}

impl Feed {
    pub fn is_end(&self) -> bool {
        self.cursor.is_end()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip_keeps_filters_and_position() {
        let mut cursor = Cursor::from_search_query("\"think tank\" from:kashi filter:images")
            .unwrap();
        cursor.position = CursorPosition::Middle;
        cursor.sort_key = 1_600_000_000_000;
        cursor.last_post_id = PostId(42);

        let token = cursor.to_token().unwrap();
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert_eq!(Cursor::from_token(&token).unwrap(), cursor);
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(matches!(
            Cursor::from_token("not a token!"),
            Err(SearchError::InvalidToken(_))
        ));
        let not_json = URL_SAFE_NO_PAD.encode(b"{\"sort_order\": 12}");
        assert!(matches!(
            Cursor::from_token(&not_json),
            Err(SearchError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_content_filter_names() {
        assert_eq!("Images".parse::<ContentFilter>(), Ok(ContentFilter::Images));
        assert_eq!(ContentFilter::Spaces.to_string(), "spaces");
        assert_eq!(
            "gifs".parse::<ContentFilter>(),
            Err(SearchError::UnknownFilter("gifs".to_string()))
        );
    }

    #[test]
    fn test_new_cursor_starts_at_start() {
        let cursor = Cursor::user_feed("kashi", 20);
        assert!(cursor.is_start());
        assert_eq!(cursor.filters.from_handle.as_deref(), Some("kashi"));
        assert!(!SortOrder::NewestFirst.is_ascending());
        assert!(SortOrder::OldestFirst.is_ascending());
    }
}
