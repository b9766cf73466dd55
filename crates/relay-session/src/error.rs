use relay_engine::{FetchError, ResolveError, TranscodeError, fetch_error_from_io};

/// Error type delivery sinks report; concrete sinks live outside this
/// crate, so the cause stays opaque here.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Terminal failure of one transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("a transfer is already in progress for this user")]
    AlreadyActive,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("failed to resolve link: {source}")]
    Resolve {
        #[from]
        source: ResolveError,
    },

    #[error("failed to start fetch: {source}")]
    Fetch {
        #[from]
        source: FetchError,
    },

    #[error("failed to start transcoder: {source}")]
    Transcode {
        #[from]
        source: TranscodeError,
    },

    #[error("stream read failed: {source}")]
    Stream {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to deliver part {index}: {source}")]
    Delivery {
        index: u64,
        #[source]
        source: SinkError,
    },

    #[error("failed to notify user: {source}")]
    Notify {
        #[source]
        source: SinkError,
    },
}

impl TransferError {
    /// Classify a terminal stream error, recognizing a cancellation that
    /// travelled through the pipe as a wrapped io error.
    pub(crate) fn from_stream(source: std::io::Error) -> Self {
        match fetch_error_from_io(&source) {
            Some(err) if err.is_cancelled() => Self::Cancelled,
            _ => Self::Stream { source },
        }
    }

    /// User-initiated (or deadline-initiated) abort rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Fetch { source } => source.is_cancelled(),
            _ => false,
        }
    }
}
