//! Upload queue management.
//!
//! Turns the stream of filesystem change events into reliable,
//! rate-limited uploads: per-path debounce, FIFO admission, a bounded
//! concurrency gate, bounded retry, and a continuously published
//! progress aggregate.

pub mod config;
pub mod manager;
pub mod uploader;

pub use config::{ConfigError, UploadConfig};
pub use manager::{FileStatusEvent, UploadHandle, UploadManager, UploadProgress, UploadStatus};
pub use uploader::{HttpUploader, Uploader};

/// One file awaiting upload. At most one live item exists per relative
/// path; a newer change event replaces the older item.
#[derive(Debug, Clone)]
pub struct UploadItem {
    /// Absolute path on disk
    pub path: std::path::PathBuf,
    /// Path relative to the watched root; doubles as the remote name
    pub relative_path: String,
    /// Unix seconds of the event that created this item
    pub timestamp: u64,
    pub retry_count: u32,
}
