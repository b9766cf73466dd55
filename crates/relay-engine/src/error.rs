use reqwest::StatusCode;

/// Errors produced while fetching a remote resource.
///
/// Errors that occur after [`crate::ChunkedFetcher::fetch`] has returned are
/// delivered as the stream's terminal error, wrapped in a `std::io::Error`
/// (the stream is already being read by a concurrent consumer at that point).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("unexpected status {status} for range request at offset {offset}")]
    UnexpectedStatus { status: StatusCode, offset: u64 },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn unexpected_status(status: StatusCode, offset: u64) -> Self {
        Self::UnexpectedStatus { status, offset }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Wrap this error for delivery through the in-memory pipe.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Self::Io { source } => source,
            other => std::io::Error::other(other),
        }
    }
}

/// Extract a [`FetchError`] that was carried through the pipe as the
/// stream's terminal error.
pub fn fetch_error_from_io(err: &std::io::Error) -> Option<&FetchError> {
    err.get_ref().and_then(|inner| inner.downcast_ref())
}
