//! Configuration surfaces: indexing options and the structured search query.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Preference for the master-file-table fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MftMode {
    /// Use the MFT path when the platform and privileges allow it.
    #[default]
    Auto,
    /// Prefer the MFT path; an ineligible volume degrades to the standard
    /// walker with a warning.
    Always,
    /// Never use the MFT path.
    Never,
}

/// Options controlling a volume enumeration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingOptions {
    /// Roots to index: drives, mount points or specific directories.
    pub locations: Vec<PathBuf>,
    /// Substrings that disqualify a full path.
    pub excluded_paths: Vec<String>,
    /// Extensions (with or without leading dot) to skip.
    pub excluded_extensions: Vec<String>,
    pub include_hidden: bool,
    pub include_system: bool,
    pub follow_symlinks: bool,
    /// Start the change observer once enumeration completes.
    pub enable_monitoring: bool,
    /// Files larger than this are skipped. `None` = unbounded.
    pub max_file_size: Option<i64>,
    /// Worker threads for directory scanning. `0` = one per cpu thread.
    pub parallel_threads: usize,
    /// Records applied to the index per write section.
    pub batch_size: usize,
    pub mft_mode: MftMode,
    /// MFT enumeration buffer size; clamped to [64 KiB, 4 MiB], 4 KiB aligned.
    pub mft_buffer_size: usize,
    /// Stat files for sizes on paths where size is not free.
    pub collect_file_size: bool,
    /// Capacity of the record and change-event channels.
    pub channel_capacity: usize,
    /// Drop the oldest change event instead of back-pressuring the watcher.
    pub drop_oldest_on_overflow: bool,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            excluded_paths: Vec::new(),
            excluded_extensions: Vec::new(),
            include_hidden: false,
            include_system: false,
            follow_symlinks: false,
            enable_monitoring: false,
            max_file_size: None,
            parallel_threads: 0,
            batch_size: 1024,
            mft_mode: MftMode::Auto,
            mft_buffer_size: crate::enumerate::mft::DEFAULT_BUFFER_SIZE,
            collect_file_size: true,
            channel_capacity: 4096,
            drop_oldest_on_overflow: true,
        }
    }
}

impl IndexingOptions {
    pub fn with_locations(mut self, locations: Vec<PathBuf>) -> Self {
        self.locations = locations;
        self
    }

    pub fn with_monitoring(mut self, enable: bool) -> Self {
        self.enable_monitoring = enable;
        self
    }

    pub fn with_excluded_paths(mut self, excluded: Vec<String>) -> Self {
        self.excluded_paths = excluded;
        self
    }

    pub fn with_mft_mode(mut self, mode: MftMode) -> Self {
        self.mft_mode = mode;
        self
    }

    /// Effective scan worker count: configured threads bounded by the cpu
    /// count, capped at 3x cpu threads, at least 1.
    pub fn effective_threads(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let configured = if self.parallel_threads == 0 {
            cpus
        } else {
            self.parallel_threads
        };
        configured.min(cpus * 3).max(1)
    }
}

/// A structured search query. Empty `search_text` lists every record that
/// passes the non-text predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub search_text: String,
    /// Root for candidate selection; takes precedence over `search_locations`.
    pub base_path: Option<PathBuf>,
    /// Roots consulted when no `base_path` is given.
    pub search_locations: Vec<PathBuf>,
    pub include_subdirectories: bool,
    /// Match against the file name only instead of the full path.
    pub search_file_name_only: bool,
    /// Interpret `search_text` as a regular expression.
    pub use_regex: bool,
    pub case_sensitive: bool,
    /// Single extension, with or without leading dot.
    pub extension_filter: Option<String>,
    pub include_files: bool,
    pub include_directories: bool,
    pub include_hidden: bool,
    pub include_system: bool,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub min_created_date: Option<DateTime<Utc>>,
    pub max_created_date: Option<DateTime<Utc>>,
    pub min_modified_date: Option<DateTime<Utc>>,
    pub max_modified_date: Option<DateTime<Utc>>,
    /// Substrings that disqualify a full path.
    pub excluded_paths: Vec<String>,
    pub max_results: Option<usize>,
    pub timeout: Option<Duration>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search_text: String::new(),
            base_path: None,
            search_locations: Vec::new(),
            include_subdirectories: true,
            search_file_name_only: false,
            use_regex: false,
            case_sensitive: false,
            extension_filter: None,
            include_files: true,
            include_directories: true,
            include_hidden: false,
            include_system: false,
            min_size: None,
            max_size: None,
            min_created_date: None,
            max_created_date: None,
            min_modified_date: None,
            max_modified_date: None,
            excluded_paths: Vec::new(),
            max_results: None,
            timeout: None,
        }
    }
}

impl SearchQuery {
    /// Convenience constructor for a plain text query.
    pub fn text(search_text: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            ..Self::default()
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension_filter = Some(extension.into());
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Structural validation; regex compilation errors are caught separately
    /// when the query is compiled.
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min > max {
                return Err(SearchError::InvalidQuery(format!(
                    "min_size {min} exceeds max_size {max}"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_created_date, self.max_created_date) {
            if min > max {
                return Err(SearchError::InvalidQuery(
                    "min_created_date exceeds max_created_date".to_string(),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_modified_date, self.max_modified_date) {
            if min > max {
                return Err(SearchError::InvalidQuery(
                    "min_modified_date exceeds max_modified_date".to_string(),
                ));
            }
        }
        if !self.include_files && !self.include_directories {
            return Err(SearchError::InvalidQuery(
                "query excludes both files and directories".to_string(),
            ));
        }
        Ok(())
    }

    /// The extension filter in canonical form: lowercase, no leading dot.
    pub fn normalized_extension(&self) -> Option<String> {
        self.extension_filter
            .as_deref()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let query = SearchQuery::default();
        assert!(query.include_subdirectories);
        assert!(query.include_files);
        assert!(query.include_directories);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn inverted_size_bounds_rejected() {
        let query = SearchQuery {
            min_size: Some(100),
            max_size: Some(10),
            ..SearchQuery::default()
        };
        assert!(matches!(
            query.validate(),
            Err(SearchError::InvalidQuery(_))
        ));
    }

    #[test]
    fn no_types_rejected() {
        let query = SearchQuery {
            include_files: false,
            include_directories: false,
            ..SearchQuery::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn extension_normalization() {
        assert_eq!(
            SearchQuery::text("x").with_extension(".CS").normalized_extension(),
            Some("cs".to_string())
        );
        assert_eq!(
            SearchQuery::text("x").with_extension("log").normalized_extension(),
            Some("log".to_string())
        );
        assert_eq!(SearchQuery::text("x").normalized_extension(), None);
    }

    #[test]
    fn effective_threads_bounded() {
        let options = IndexingOptions {
            parallel_threads: 10_000,
            ..IndexingOptions::default()
        };
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert!(options.effective_threads() <= cpus * 3);
        assert!(options.effective_threads() >= 1);
    }
}
