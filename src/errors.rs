/*!
Application error taxonomy.

Read endpoints never let upstream failures crash the request; they degrade
to empty results or map to 401/500 at the handler boundary.
*/

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upstream token endpoint rejected an exchange or refresh,
    /// carrying the upstream status text.
    #[error("upstream auth error: {0}")]
    UpstreamAuth(String),

    /// An upstream call failed to complete (network error or timeout).
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The upstream answered with something unusable.
    #[error("upstream data error: {0}")]
    UpstreamData(String),

    /// No usable credential is stored. Endpoints report this as a 401
    /// with a stable machine-readable code, never as a server error.
    #[error("not connected")]
    NotConnected,

    #[error("{0}")]
    Internal(String),
}

/// Shorthand for an `Error::Internal` built from a format string
#[macro_export]
macro_rules! se {
    ($($arg:tt)*) => {
        $crate::errors::Error::Internal(format!($($arg)*))
    };
}
