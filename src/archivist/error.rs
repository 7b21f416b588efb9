use thiserror::Error;

use crate::archivist::database::DatabaseError;
use crate::archivist::ids::{
    AccountId, AudioRoomId, ChatMessageId, ChatRoomId, ListId, NotificationId, PostId, RepostId,
};
use crate::archivist::media_manager::{DownloadError, MediaError};
use crate::archivist::search::SearchError;

pub type Result<T> = core::result::Result<T, ArchivistError>;

#[derive(Error, Debug)]
pub enum ArchivistError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account ID not found: {0}")]
    AccountIdNotFound(AccountId),

    #[error("Post not found: {0}")]
    PostNotFound(PostId),

    #[error("Repost not found: {0}")]
    RepostNotFound(RepostId),

    #[error("Audio room not found: {0}")]
    AudioRoomNotFound(AudioRoomId),

    #[error("Notification not found: {0}")]
    NotificationNotFound(NotificationId),

    #[error("Chat room not found: {0}")]
    ChatRoomNotFound(ChatRoomId),

    #[error("Chat message not found: {0}")]
    ChatMessageNotFound(ChatMessageId),

    #[error("List not found: {0}")]
    ListNotFound(ListId),

    #[error("Invalid search query: {0}")]
    InvalidQuery(#[from] SearchError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ArchivistError {
    /// True for the point-lookup misses callers are expected to branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArchivistError::AccountNotFound(_)
                | ArchivistError::AccountIdNotFound(_)
                | ArchivistError::PostNotFound(_)
                | ArchivistError::RepostNotFound(_)
                | ArchivistError::AudioRoomNotFound(_)
                | ArchivistError::NotificationNotFound(_)
                | ArchivistError::ChatRoomNotFound(_)
                | ArchivistError::ChatMessageNotFound(_)
                | ArchivistError::ListNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ArchivistError::PostNotFound(PostId(1)).is_not_found());
        assert!(ArchivistError::AccountNotFound("kashi".to_string()).is_not_found());
        assert!(!ArchivistError::Configuration("bad".to_string()).is_not_found());
        assert!(
            !ArchivistError::InvalidQuery(SearchError::UnmatchedQuotes("\"a".to_string()))
                .is_not_found()
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ArchivistError::PostNotFound(PostId(42));
        assert_eq!(err.to_string(), "Post not found: 42");

        let err: ArchivistError = DatabaseError::VersionMismatch {
            stored: 9,
            supported: 7,
        }
        .into();
        assert!(err.to_string().contains("9"));
        assert!(err.to_string().contains("7"));
    }
}
