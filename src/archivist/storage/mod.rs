pub mod media_files;

pub use media_files::{MediaFileStorage, MediaKind};
