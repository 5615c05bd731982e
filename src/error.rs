use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Tree cache error types.
///
/// A stale response for an old filter generation is not represented here:
/// discarding it is an expected race outcome, logged at debug level and
/// never surfaced as a failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TreeError {
    /// A child-load request failed at the record source. The cache is left
    /// in its last-known-good state; retry is the caller's decision.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A child or sync event references a parent that is not in the cache.
    #[error("dangling reference: {0}")]
    DanglingReference(String),

    /// Criteria cannot be decomposed into server and client subsets as
    /// required by the active filter mode.
    #[error("criteria cannot be split: {0}")]
    InvalidCriteriaSplit(String),

    /// The tree configuration cannot work as specified.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request or event channel backing this tree has been closed.
    #[error("tree channel closed")]
    ChannelClosed,
}
