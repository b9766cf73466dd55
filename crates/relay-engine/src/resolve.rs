//! Interface to the remote metadata/URL resolution service.
//!
//! Resolution (turning a user-supplied link into a direct stream URL plus
//! metadata) is an external collaborator; the engine only defines the
//! boundary it consumes.

use async_trait::async_trait;
use url::Url;

/// Outcome of resolving a user-supplied link.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    /// Direct URL of the selected stream.
    pub url: Url,
    /// Display name of the media.
    pub title: String,
    /// Total stream size in bytes when the platform reports it, `0` when
    /// unknown.
    pub total_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid link `{input}`: {reason}")]
    InvalidLink { input: String, reason: String },

    #[error("media unavailable: {reason}")]
    Unavailable { reason: String },
}

impl ResolveError {
    pub fn invalid_link(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLink {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resolve `link` to a fetchable stream URL and its metadata.
    async fn resolve(&self, link: &str) -> Result<ResolvedMedia, ResolveError>;

    /// Cheap syntactic check used to tell links apart from other chat text.
    /// Must not perform network I/O.
    fn looks_like_link(&self, text: &str) -> bool;
}
