use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

/// Debounce delay before a changed file is admitted to the queue.
/// 2s coalesces editor save bursts into one upload.
const DEFAULT_UPLOAD_DELAY_MS: u64 = 2000;

const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 5;

/// Allowed range for the concurrency ceiling
pub const MIN_CONCURRENT_UPLOADS: usize = 1;
pub const MAX_CONCURRENT_UPLOADS: usize = 20;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent_uploads must be between 1 and 20, got {0}")]
    ConcurrencyOutOfRange(usize),

    #[error("Duplicate ignore pattern: {0}")]
    DuplicatePattern(String),

    #[error("Invalid ignore pattern '{0}': {1}")]
    InvalidPattern(String, String),

    #[error("Upload manager is not running")]
    ManagerStopped,
}

/// Upload behavior knobs. Persisted in the settings store; mutated only
/// through `update_config`, which validates before anything is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub enabled: bool,
    pub server_url: String,
    /// Ordered, unique glob patterns matched against the relative path
    pub ignored_patterns: Vec<String>,
    pub upload_delay_ms: u64,
    pub max_concurrent_uploads: usize,
    /// Skip files already present when watching began
    pub ignore_existing_files: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_url: "http://localhost:3000".to_string(),
            ignored_patterns: vec![
                "*.tmp".to_string(),
                ".git/**".to_string(),
                "node_modules/**".to_string(),
                ".DS_Store".to_string(),
            ],
            upload_delay_ms: DEFAULT_UPLOAD_DELAY_MS,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            ignore_existing_files: false,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_uploads < MIN_CONCURRENT_UPLOADS
            || self.max_concurrent_uploads > MAX_CONCURRENT_UPLOADS
        {
            return Err(ConfigError::ConcurrencyOutOfRange(
                self.max_concurrent_uploads,
            ));
        }

        for (i, pattern) in self.ignored_patterns.iter().enumerate() {
            if self.ignored_patterns[..i].contains(pattern) {
                return Err(ConfigError::DuplicatePattern(pattern.clone()));
            }
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::InvalidPattern(pattern.clone(), e.to_string()));
            }
        }

        Ok(())
    }

    /// Whether a relative path matches any ignore pattern.
    pub fn should_ignore(&self, relative_path: &str) -> bool {
        for pattern in &self.ignored_patterns {
            match glob::Pattern::new(pattern) {
                Ok(glob) if glob.matches(relative_path) => {
                    debug!(path = relative_path, pattern, "Path matches ignore pattern");
                    return true;
                }
                _ => {}
            }
        }
        false
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert_eq!(UploadConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_concurrency_bounds() {
        let mut config = UploadConfig::default();

        config.max_concurrent_uploads = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ConcurrencyOutOfRange(0))
        );

        config.max_concurrent_uploads = 21;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ConcurrencyOutOfRange(21))
        );

        config.max_concurrent_uploads = 1;
        assert_eq!(config.validate(), Ok(()));
        config.max_concurrent_uploads = 20;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_duplicate_pattern_rejected() {
        let mut config = UploadConfig::default();
        config.ignored_patterns.push("*.tmp".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicatePattern("*.tmp".to_string()))
        );
    }

    #[test]
    fn test_should_ignore_matches_glob() {
        let config = UploadConfig::default();
        assert!(config.should_ignore("notes.tmp"));
        assert!(config.should_ignore(".DS_Store"));
        assert!(config.should_ignore(".git/objects/ab/cdef"));
        assert!(config.should_ignore("node_modules/pkg/index.js"));
        assert!(!config.should_ignore("notes.txt"));
        assert!(!config.should_ignore("src/main.rs"));
    }
}
