//! Interface to the chat delivery client.
//!
//! The wire-level chat protocol (message sending, attachment upload,
//! keyboards) is an external collaborator; a sink instance is already
//! scoped to one user's chat.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::SinkError;

pub type UserId = i64;

/// Identifier of a sent chat message, used for later deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub i64);

/// Byte stream handed to the delivery sink for one part.
pub type PartStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Upload one part as an attachment named `file_name`. Blocks until the
    /// stream is fully consumed or delivery fails.
    async fn send_part(&self, stream: PartStream, file_name: &str) -> Result<(), SinkError>;

    /// Send a text message, returning its id.
    async fn send_text(&self, text: &str) -> Result<MessageId, SinkError>;

    /// Best-effort batch deletion of previously sent messages.
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), SinkError>;
}
