use std::path::{Path, PathBuf};

use tokio::fs;

use crate::archivist::media_manager::MediaError;

/// Which sibling directory of the profile a file belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
    VideoThumbnail,
    LinkPreviewImage,
    ProfileImage,
}

impl MediaKind {
    pub const ALL: [MediaKind; 5] = [
        MediaKind::Image,
        MediaKind::Video,
        MediaKind::VideoThumbnail,
        MediaKind::LinkPreviewImage,
        MediaKind::ProfileImage,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
            MediaKind::VideoThumbnail => "video_thumbnails",
            MediaKind::LinkPreviewImage => "link_preview_images",
            MediaKind::ProfileImage => "profile_images",
        }
    }
}

/// Downloaded media on disk, one directory per [`MediaKind`] under the profile directory:
///
/// ```text
/// <profile_dir>/
///   images/<local_filename>
///   videos/<local_filename>
///   video_thumbnails/<thumbnail_local_filename>
///   link_preview_images/<thumbnail_local_path>
///   profile_images/<profile or banner file>
/// ```
///
/// File names come from the entity records. This type only deals with the filesystem;
/// flags on the records are the pipeline's business.
#[derive(Debug, Clone)]
pub struct MediaFileStorage {
    root: PathBuf,
}

impl MediaFileStorage {
    /// Creates the per-kind directories under `profile_dir` if missing.
    pub(crate) fn new(profile_dir: &Path) -> Result<Self, MediaError> {
        for kind in MediaKind::ALL {
            let dir = profile_dir.join(kind.dir_name());
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .map_err(|source| MediaError::CreateDirectory { path: dir, source })?;
            }
        }
        Ok(Self {
            root: profile_dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, kind: MediaKind, filename: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(filename)
    }

    /// Writes `data` atomically: to a temp file first, then renamed into place.
    pub(crate) async fn store_file(
        &self,
        kind: MediaKind,
        filename: &str,
        data: &[u8],
    ) -> Result<PathBuf, MediaError> {
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Err(MediaError::InvalidFileName(filename.to_string()));
        }
        let file_path = self.path_for(kind, filename);
        let temp_path = self.path_for(kind, &format!("{filename}.tmp"));

        fs::write(&temp_path, data)
            .await
            .map_err(|source| MediaError::Write {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &file_path)
            .await
            .map_err(|source| MediaError::Write {
                path: file_path.clone(),
                source,
            })?;

        tracing::debug!(
            target: "archivist::storage::store_file",
            "Stored {} bytes at {:?}",
            data.len(),
            file_path
        );
        Ok(file_path)
    }

    pub fn file_exists(&self, kind: MediaKind, filename: &str) -> bool {
        !filename.is_empty() && self.path_for(kind, filename).is_file()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
