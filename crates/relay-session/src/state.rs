//! Explicit transfer state machine.
//!
//! The state space is small and closed, so session kinds are a plain enum
//! with one transition function instead of interchangeable polymorphic
//! handlers. `Idle` is both initial and terminal; the transient states
//! belong to a single transfer.

/// Lifecycle state of one user's transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transfer active; re-entrant per new request.
    #[default]
    Idle,
    /// Link accepted, resolving and opening the source stream.
    Fetching,
    /// Streaming parts to the delivery sink.
    AwaitingPartUpload,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Registry claim succeeded, the transfer task is starting.
    TransferAccepted,
    /// The source stream is open and the delivery loop begins.
    StreamReady,
    /// One part was fully delivered and acknowledged.
    PartDelivered { last: bool },
    CancelRequested,
    TransferFailed,
}

impl SessionState {
    /// Apply `event`, returning the next state. Terminal states absorb all
    /// events; unexpected events in transient states fail the transfer
    /// rather than being silently ignored.
    pub fn advance(self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        use SessionState::*;

        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (_, CancelRequested) => Cancelled,
            (_, TransferFailed) => Failed,
            (Idle, TransferAccepted) => Fetching,
            (Fetching, StreamReady) => AwaitingPartUpload,
            (AwaitingPartUpload, PartDelivered { last: false }) => AwaitingPartUpload,
            (AwaitingPartUpload, PartDelivered { last: true }) => Completed,
            _ => Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Whether a transfer currently occupies the slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Fetching | SessionState::AwaitingPartUpload
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SessionEvent::*;
    use super::SessionState::*;

    #[test]
    fn happy_path_reaches_completed() {
        let mut state = Idle;
        for event in [
            TransferAccepted,
            StreamReady,
            PartDelivered { last: false },
            PartDelivered { last: false },
            PartDelivered { last: true },
        ] {
            state = state.advance(event);
        }
        assert_eq!(state, Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn cancel_wins_from_any_transient_state() {
        assert_eq!(Idle.advance(CancelRequested), Cancelled);
        assert_eq!(Fetching.advance(CancelRequested), Cancelled);
        assert_eq!(AwaitingPartUpload.advance(CancelRequested), Cancelled);
    }

    #[test]
    fn terminal_states_absorb_events() {
        for terminal in [Completed, Cancelled, Failed] {
            assert_eq!(terminal.advance(TransferAccepted), terminal);
            assert_eq!(terminal.advance(CancelRequested), terminal);
            assert_eq!(terminal.advance(TransferFailed), terminal);
        }
    }

    #[test]
    fn only_transient_states_are_active() {
        assert!(!Idle.is_active());
        assert!(Fetching.is_active());
        assert!(AwaitingPartUpload.is_active());
        for terminal in [Completed, Cancelled, Failed] {
            assert!(!terminal.is_active());
        }
    }

    #[test]
    fn out_of_order_events_fail() {
        assert_eq!(Idle.advance(StreamReady), Failed);
        assert_eq!(Fetching.advance(PartDelivered { last: true }), Failed);
    }
}
