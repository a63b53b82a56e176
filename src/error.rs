use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("query timed out")]
    Timeout,

    #[error("access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("I/O error on {path}: {source}")]
    IoTransient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    IoFatal(#[from] std::io::Error),

    #[error("corrupt enumeration record at offset {0}")]
    CorruptRecord(usize),

    #[error("invalid string id: {0}")]
    InvalidId(u32),
}

impl SearchError {
    /// True for errors that are recovered locally during enumeration
    /// (the offending path is skipped and counted, the session continues).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SearchError::AccessDenied(_)
                | SearchError::IoTransient { .. }
                | SearchError::CorruptRecord(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
