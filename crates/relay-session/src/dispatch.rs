//! Message routing: one inbound chat message in, one action out.
//!
//! The dispatcher owns the per-user concurrency rules. Messages from the
//! same user are serialized through the [`UserGate`]; whether a transfer is
//! running is a separate non-blocking check against the registry, so a
//! status query gets an immediate answer while a transfer streams in the
//! background.

use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::chat::{ChatSink, MessageId, UserId};
use crate::error::TransferError;
use crate::gate::UserGate;
use crate::registry::SessionRegistry;
use crate::session::{StatusSnapshot, TransferService, TransferSession};
use crate::state::SessionEvent;

pub const CANCEL_COMMAND: &str = "/cancel";

const BYTES_PER_MEGABYTE: f64 = 1_048_576.0;

pub struct Dispatcher {
    service: Arc<TransferService>,
    registry: Arc<SessionRegistry>,
    gate: Arc<UserGate>,
}

impl Dispatcher {
    pub fn new(service: TransferService) -> Self {
        Self {
            service: Arc::new(service),
            registry: Arc::new(SessionRegistry::new()),
            gate: Arc::new(UserGate::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route one inbound message. Returns once the message is handled; a
    /// transfer it starts keeps running in the background.
    pub async fn handle_message(
        &self,
        user_id: UserId,
        sink: Arc<dyn ChatSink>,
        text: &str,
        message_id: MessageId,
    ) {
        let request_id = Uuid::new_v4();
        let span = info_span!("message", %request_id, user_id);
        async {
            let _serialized = self.gate.acquire(user_id).await;
            match self.registry.get(user_id) {
                Some(session) => {
                    self.handle_during_transfer(&session, &sink, text, message_id)
                        .await;
                }
                None => self.handle_idle(user_id, sink, text).await,
            }
        }
        .instrument(span)
        .await;
    }

    async fn handle_during_transfer(
        &self,
        session: &Arc<TransferSession>,
        sink: &Arc<dyn ChatSink>,
        text: &str,
        message_id: MessageId,
    ) {
        // Everything the user sends while a transfer runs is transient chat
        // noise, cleaned up when the transfer ends.
        session.track_message(message_id);

        let reply = if text == CANCEL_COMMAND {
            info!("cancellation requested");
            session.cancel();
            "Cancelling your transfer.".to_owned()
        } else if self.service.resolver().looks_like_link(text) {
            "A transfer is already in progress. Cancel it with /cancel before starting \
             another one."
                .to_owned()
        } else if session.state().is_active() {
            format_status(&session.status())
        } else {
            // Terminal but not yet cleaned out of the registry.
            "Your transfer is wrapping up.".to_owned()
        };
        match sink.send_text(&reply).await {
            Ok(id) => session.track_message(id),
            Err(err) => warn!(error = %err, "failed to reply during transfer"),
        }
    }

    async fn handle_idle(&self, user_id: UserId, sink: Arc<dyn ChatSink>, text: &str) {
        if !self.service.resolver().looks_like_link(text) {
            if let Err(err) = sink
                .send_text("Send me a media link and I will transfer it to you.")
                .await
            {
                warn!(error = %err, "failed to send prompt");
            }
            return;
        }

        let session = Arc::new(TransferSession::new());
        if let Err(err) = self.registry.begin(user_id, session.clone()) {
            // Lost the claim to a concurrent message of the same user.
            warn!(error = %err, "rejecting transfer start");
            if let Err(err) = sink
                .send_text("A transfer is already in progress for you.")
                .await
            {
                warn!(error = %err, "failed to send rejection");
            }
            return;
        }
        session.apply(SessionEvent::TransferAccepted);
        info!(link = %text, "transfer accepted");

        let service = Arc::clone(&self.service);
        let registry = Arc::clone(&self.registry);
        let link = text.to_owned();
        tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = service.run(&session, &sink, &link).await;
                // The slot frees before any best-effort cleanup so a failed
                // cleanup cannot wedge the user.
                registry.clear(user_id);
                finish_transfer(&session, &sink, outcome).await;
                info!(elapsed = ?started.elapsed(), "transfer finished");
            }
            .in_current_span(),
        );
    }
}

/// Terminal bookkeeping for one transfer: report the outcome to the user,
/// then delete the transient messages accumulated along the way. Cleanup
/// failures are logged, never escalated.
async fn finish_transfer(
    session: &Arc<TransferSession>,
    sink: &Arc<dyn ChatSink>,
    outcome: Result<(), TransferError>,
) {
    match outcome {
        Ok(()) => info!("transfer completed"),
        Err(err) if err.is_cancellation() => {
            session.apply(SessionEvent::CancelRequested);
            info!("transfer cancelled");
            let ack = match session.title() {
                Some(title) => format!("Transfer of \u{201c}{title}\u{201d} has been cancelled."),
                None => "Your transfer has been cancelled.".to_owned(),
            };
            if let Err(err) = sink.send_text(&ack).await {
                warn!(error = %err, "failed to acknowledge cancellation");
            }
        }
        Err(err) => {
            session.apply(SessionEvent::TransferFailed);
            error!(error = %err, "transfer failed");
            let text = format!("Sorry, the transfer failed: {err}");
            if let Err(err) = sink.send_text(&text).await {
                warn!(error = %err, "failed to report failure");
            }
        }
    }

    let stale = session.take_tracked_messages();
    if stale.is_empty() {
        return;
    }
    if let Err(err) = sink.delete_messages(&stale).await {
        warn!(count = stale.len(), error = %err, "failed to delete transient messages");
    }
}

/// Human-readable status line; figures without a valid value yet come out
/// as explicit placeholders instead of zeros.
fn format_status(status: &StatusSnapshot) -> String {
    let title = status.title.as_deref().unwrap_or("your media");
    let transferred = bytes_to_megabytes(status.transferred_bytes);
    let mut text = match status.total_bytes {
        Some(total) => format!(
            "\u{201c}{title}\u{201d}: {transferred:.1} MB of {:.1} MB transferred",
            bytes_to_megabytes(total)
        ),
        None => format!("\u{201c}{title}\u{201d}: {transferred:.1} MB transferred (total size unknown)"),
    };
    if let Some(percentage) = status.percentage {
        text.push_str(&format!(" ({percentage:.1}%)"));
    }
    match status.eta {
        Some(eta) => text.push_str(&format!(", about {}s remaining.", eta.as_secs())),
        None => text.push('.'),
    }
    text
}

fn bytes_to_megabytes(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MEGABYTE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;

    #[test]
    fn status_line_with_known_total() {
        let status = StatusSnapshot {
            title: Some("talk".into()),
            transferred_bytes: 52_428_800,
            total_bytes: Some(104_857_600),
            percentage: Some(50.0),
            eta: Some(std::time::Duration::from_secs(42)),
            state: SessionState::AwaitingPartUpload,
        };
        assert_eq!(
            format_status(&status),
            "\u{201c}talk\u{201d}: 50.0 MB of 100.0 MB transferred (50.0%), about 42s remaining."
        );
    }

    #[test]
    fn status_line_with_unknown_figures() {
        let status = StatusSnapshot {
            title: Some("talk".into()),
            transferred_bytes: 1_048_576,
            total_bytes: None,
            percentage: None,
            eta: None,
            state: SessionState::AwaitingPartUpload,
        };
        assert_eq!(
            format_status(&status),
            "\u{201c}talk\u{201d}: 1.0 MB transferred (total size unknown)."
        );
    }
}
