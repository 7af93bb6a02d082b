//! Cache errors.

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
///
/// Never surfaced to listeners: the pipeline treats every one of them as a
/// cache miss.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Entry not present.
    #[error("Entry not found: {0}")]
    NotFound(String),
    /// I/O error during cache operation.
    #[error("IO error: {0}")]
    IoError(String),
    /// Journal could not be parsed or written.
    #[error("Journal error: {0}")]
    JournalError(String),
    /// Entry larger than the whole cache budget.
    #[error("Entry of {size} bytes exceeds cache budget of {budget} bytes")]
    TooLarge {
        /// Entry size.
        size: u64,
        /// Configured budget.
        budget: u64,
    },
}
