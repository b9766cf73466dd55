//! One user's transfer: live session state and the pipeline driver.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_engine::{
    ChunkedFetcher, MediaResolver, PartSplitter, ProgressCounter, TranscodeSpec, Transcoder,
    DEFAULT_MAX_PART_BYTES, expected_parts, observe,
};

use crate::chat::{ChatSink, MessageId};
use crate::error::TransferError;
use crate::state::{SessionEvent, SessionState};

/// Buffer of the per-part handoff pipe between the splitter and the
/// delivery sink.
const PART_PIPE_CAPACITY: usize = 64 * 1024;

/// Transfer parameters, consumed by value.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Per-part ceiling in bytes; `0` selects [`DEFAULT_MAX_PART_BYTES`].
    pub max_part_bytes: u64,
    /// Overall transfer deadline; zero = unbounded (still cancellable).
    pub timeout: Duration,
    /// External transcoder to route the stream through; `None` delivers the
    /// fetched bytes as-is.
    pub transcode: Option<TranscodeSpec>,
    /// File extension of delivered parts.
    pub file_extension: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_part_bytes: 0,
            timeout: Duration::from_secs(0),
            transcode: Some(TranscodeSpec::mp3_audio()),
            file_extension: "mp3".to_owned(),
        }
    }
}

impl TransferConfig {
    fn effective_max_part_bytes(&self) -> u64 {
        if self.max_part_bytes == 0 {
            DEFAULT_MAX_PART_BYTES
        } else {
            self.max_part_bytes
        }
    }
}

struct TransferDetails {
    title: String,
    progress: Arc<ProgressCounter>,
}

/// Live state of one user's in-progress transfer.
///
/// Created when the registry claim succeeds, mutated by the transfer task
/// and by cancellation requests, dropped when the slot clears.
pub struct TransferSession {
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    details: Mutex<Option<TransferDetails>>,
    /// Transient message ids, append-only during the transfer, drained once
    /// at cleanup.
    pending_messages: Mutex<Vec<MessageId>>,
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSession {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Idle),
            details: Mutex::new(None),
            pending_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation; the transfer loop observes it at
    /// its next read/write and unwinds.
    pub fn cancel(&self) {
        self.apply(SessionEvent::CancelRequested);
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn apply(&self, event: SessionEvent) -> SessionState {
        let mut state = self.state.lock();
        *state = state.advance(event);
        *state
    }

    /// Record a transient message for best-effort deletion at cleanup.
    pub fn track_message(&self, id: MessageId) {
        self.pending_messages.lock().push(id);
    }

    /// Drain the cleanup ledger.
    pub fn take_tracked_messages(&self) -> Vec<MessageId> {
        std::mem::take(&mut self.pending_messages.lock())
    }

    fn set_details(&self, title: String, progress: Arc<ProgressCounter>) {
        *self.details.lock() = Some(TransferDetails { title, progress });
    }

    pub fn title(&self) -> Option<String> {
        self.details.lock().as_ref().map(|d| d.title.clone())
    }

    /// Point-in-time view of the transfer; safe to call concurrently with
    /// the transfer loop, never blocks it. Progress figures whose
    /// preconditions do not hold yet come back as `None` placeholders.
    pub fn status(&self) -> StatusSnapshot {
        let state = self.state();
        let details = self.details.lock();
        match details.as_ref() {
            None => StatusSnapshot {
                title: None,
                transferred_bytes: 0,
                total_bytes: None,
                percentage: None,
                eta: None,
                state,
            },
            Some(details) => {
                let total = details.progress.total_bytes();
                StatusSnapshot {
                    title: Some(details.title.clone()),
                    transferred_bytes: details.progress.transferred_bytes(),
                    total_bytes: (total > 0).then_some(total),
                    percentage: details.progress.percentage().ok(),
                    eta: details.progress.estimated_time_remaining().ok(),
                    state,
                }
            }
        }
    }
}

/// Snapshot returned by [`TransferSession::status`].
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub title: Option<String>,
    pub transferred_bytes: u64,
    /// `None` when the total is unknown.
    pub total_bytes: Option<u64>,
    pub percentage: Option<f64>,
    pub eta: Option<Duration>,
    pub state: SessionState,
}

/// Drives the fetch → transcode → split → deliver chain for one transfer.
pub struct TransferService {
    fetcher: ChunkedFetcher,
    resolver: Arc<dyn MediaResolver>,
    config: TransferConfig,
}

impl TransferService {
    pub fn new(
        fetcher: ChunkedFetcher,
        resolver: Arc<dyn MediaResolver>,
        config: TransferConfig,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &dyn MediaResolver {
        self.resolver.as_ref()
    }

    /// Run one transfer end to end. The terminal outcome maps onto the
    /// session state machine: `Ok` = completed, a cancellation error =
    /// cancelled, anything else = failed. Registry cleanup belongs to the
    /// caller and must happen regardless of the outcome.
    pub async fn run(
        &self,
        session: &Arc<TransferSession>,
        sink: &Arc<dyn ChatSink>,
        link: &str,
    ) -> Result<(), TransferError> {
        let token = session.cancel_token();
        self.arm_deadline(&token);

        let resolved = tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            resolved = self.resolver.resolve(link) => resolved?,
        };
        info!(title = %resolved.title, total = resolved.total_bytes, "link resolved");

        let media = self
            .fetcher
            .fetch(resolved.url.clone(), resolved.total_bytes, token.clone())
            .await?;
        let total_bytes = media.total_bytes();

        let progress = Arc::new(ProgressCounter::new(total_bytes));
        session.set_details(resolved.title.clone(), progress.clone());

        let source: Box<dyn AsyncRead + Send + Unpin> = match &self.config.transcode {
            Some(spec) => Box::new(Transcoder::new(spec.clone()).spawn(media)?),
            None => Box::new(media),
        };
        let counted = observe(source, progress);

        let max_part_bytes = self.config.effective_max_part_bytes();
        let total_parts = (total_bytes > 0).then(|| expected_parts(total_bytes, max_part_bytes));
        // An unknown total always counts as multipart: the number of parts
        // cannot be promised up front.
        let multipart = total_parts.is_none_or(|n| n > 1);

        self.notify(sink, &token, &start_message(multipart, total_parts))
            .await?;

        session.apply(SessionEvent::StreamReady);
        let mut splitter = PartSplitter::new(counted, max_part_bytes);
        let mut part_number: u64 = 1;
        loop {
            let file_name = part_file_name(
                &resolved.title,
                &self.config.file_extension,
                multipart.then_some(part_number),
            );
            debug!(part = part_number, file_name = %file_name, "starting part upload");

            let (reader, mut writer) = tokio::io::duplex(PART_PIPE_CAPACITY);
            let mut upload = tokio::spawn({
                let sink = Arc::clone(sink);
                async move { sink.send_part(Box::new(reader), &file_name).await }
            });

            let copied = tokio::select! {
                _ = token.cancelled() => {
                    upload.abort();
                    return Err(TransferError::Cancelled);
                }
                copied = splitter.copy_next(&mut writer) => copied,
            };
            let part = match copied {
                Ok(Some(part)) => part,
                // The previous part already ended the sequence.
                Ok(None) => {
                    upload.abort();
                    break;
                }
                Err(err) => {
                    upload.abort();
                    return Err(TransferError::from_stream(err));
                }
            };

            // Close the write half so the uploader sees end-of-part. The
            // sink may block here as well, so cancellation stays racing.
            drop(writer);
            let uploaded = tokio::select! {
                _ = token.cancelled() => {
                    upload.abort();
                    return Err(TransferError::Cancelled);
                }
                uploaded = &mut upload => uploaded,
            };
            match uploaded {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(TransferError::Delivery {
                        index: part.index,
                        source,
                    });
                }
                Err(join_err) => {
                    return Err(TransferError::Delivery {
                        index: part.index,
                        source: Box::new(join_err),
                    });
                }
            }

            session.apply(SessionEvent::PartDelivered {
                last: part.is_last,
            });
            info!(part = part.index, len = part.len, last = part.is_last, "part delivered");

            if multipart {
                let text = match total_parts {
                    Some(n) => format!("Part {}/{} of your media has been delivered.", part.index, n),
                    None => format!("Part {} of your media has been delivered.", part.index),
                };
                self.notify(sink, &token, &text).await?;
            }

            if part.is_last {
                break;
            }
            part_number += 1;
        }

        self.notify(
            sink,
            &token,
            &format!("\u{201c}{}\u{201d} has been transferred completely.", resolved.title),
        )
        .await?;
        Ok(())
    }

    /// A configured timeout is the same cancellation mechanism with an
    /// automatic deadline.
    fn arm_deadline(&self, token: &CancellationToken) {
        if self.config.timeout.is_zero() {
            return;
        }
        let timeout = self.config.timeout;
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(?timeout, "transfer deadline reached, cancelling");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    async fn notify(
        &self,
        sink: &Arc<dyn ChatSink>,
        token: &CancellationToken,
        text: &str,
    ) -> Result<(), TransferError> {
        let sent = tokio::select! {
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            sent = sink.send_text(text) => sent,
        };
        sent.map(|_| ())
            .map_err(|source| TransferError::Notify { source })
    }
}

fn start_message(multipart: bool, total_parts: Option<u64>) -> String {
    let mut text = String::from(
        "Transfer started. You can cancel it or query its status at any time.",
    );
    if multipart {
        match total_parts {
            Some(n) => text.push_str(&format!(
                "\n\nDue to the chat upload limit, this media will be split into {n} parts. \
                 Each part will be sent to you as soon as it is ready."
            )),
            None => text.push_str(
                "\n\nDue to the chat upload limit, this media may be split into an \
                 undetermined number of parts, because its total size cannot be known \
                 in advance. Each part will be sent to you as soon as it is ready.",
            ),
        }
    }
    text
}

fn part_file_name(title: &str, extension: &str, part_number: Option<u64>) -> String {
    match part_number {
        Some(n) => format!("p{n}_{title}.{extension}"),
        None => format!("{title}.{extension}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_before_resolution_is_all_placeholders() {
        let session = TransferSession::new();
        let status = session.status();
        assert_eq!(status.title, None);
        assert_eq!(status.transferred_bytes, 0);
        assert_eq!(status.total_bytes, None);
        assert!(status.percentage.is_none());
        assert!(status.eta.is_none());
        assert_eq!(status.state, SessionState::Idle);
    }

    #[test]
    fn status_substitutes_placeholders_for_unknown_total() {
        let session = TransferSession::new();
        assert_eq!(session.title(), None);
        let progress = Arc::new(ProgressCounter::new(0));
        progress.record(1_234);
        session.set_details("clip".into(), progress);
        assert_eq!(session.title().as_deref(), Some("clip"));

        let status = session.status();
        assert_eq!(status.title.as_deref(), Some("clip"));
        assert_eq!(status.transferred_bytes, 1_234);
        assert_eq!(status.total_bytes, None);
        assert!(status.percentage.is_none());
        assert!(status.eta.is_none());
    }

    #[test]
    fn cancel_is_observable_and_terminal() {
        let session = TransferSession::new();
        session.apply(SessionEvent::TransferAccepted);
        session.cancel();
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(session.state(), SessionState::Cancelled);
        // Late events do not resurrect the session.
        session.apply(SessionEvent::StreamReady);
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn part_file_names() {
        assert_eq!(part_file_name("talk", "mp3", None), "talk.mp3");
        assert_eq!(part_file_name("talk", "mp3", Some(2)), "p2_talk.mp3");
    }

    #[test]
    fn tracked_messages_drain_once() {
        let session = TransferSession::new();
        session.track_message(MessageId(1));
        session.track_message(MessageId(2));
        assert_eq!(
            session.take_tracked_messages(),
            vec![MessageId(1), MessageId(2)]
        );
        assert!(session.take_tracked_messages().is_empty());
    }
}
