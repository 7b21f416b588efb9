use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod archivist;

pub use crate::archivist::accounts::{Account, HandleConflict};
pub use crate::archivist::audio_rooms::AudioRoom;
pub use crate::archivist::chats::{
    ChatAttachment, ChatMessage, ChatParticipant, ChatReaction, ChatRoom, ChatRoomType,
};
pub use crate::archivist::database::migrations::{MIGRATIONS, Migration, Migrator};
pub use crate::archivist::database::{Database, DatabaseError};
pub use crate::archivist::error::{ArchivistError, Result};
pub use crate::archivist::ids::{
    AccountId, AudioRoomId, ChatMessageId, ChatRoomId, ListId, NotificationId, PostId, RepostId,
};
pub use crate::archivist::likes::{Bookmark, Like};
pub use crate::archivist::lists::List;
pub use crate::archivist::media_manager::{
    DownloadError, Downloader, HttpDownloader, MediaError, MediaManager, MediaOwner,
};
pub use crate::archivist::notifications::{
    Notification, NotificationCursor, NotificationFeed, NotificationType,
};
pub use crate::archivist::posts::{Image, LinkCard, Poll, PollChoice, Post, TombstoneKind, Video};
pub use crate::archivist::reposts::Repost;
pub use crate::archivist::scheduled_tasks::{
    HarvestKind, HarvestTask, Harvester, Scheduler, SchedulerConfig, SchedulerHandle, Task,
};
pub use crate::archivist::search::{
    ContentFilter, Cursor, CursorPosition, DEFAULT_PAGE_SIZE, Feed, FeedItem, FilterMode,
    SearchError, SearchFilters, SortOrder, parse_search_query,
};
pub use crate::archivist::storage::{MediaFileStorage, MediaKind};
pub use crate::archivist::trove::Trove;
pub use crate::archivist::{Archivist, ArchivistConfig};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber: stdout plus a daily-rolling file in `logs_dir`.
///
/// Only the first call in a process has any effect.
pub fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = match tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("archivist")
            .filename_suffix("log")
            .build(logs_dir)
        {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Failed to create file appender in {:?}: {}", logs_dir, e);
                return;
            }
        };

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // Another subscriber may already be installed (e.g. by the embedding binary)
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
}
