//! Session states and the events delivered to the application.

use std::fmt;

use tokio::sync::mpsc;

use crate::descriptor::PairingDescriptor;
use crate::error::{ProtocolError, TransferError};
use crate::phrase::ComparisonPhrase;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Listens and shows the descriptor.
    Server,
    /// Connects using a scanned descriptor or a typed host and port.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    ConnectionLost,
    AuthenticationFailed,
    PhraseMismatch,
    ProtocolViolation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connecting,
    Established,
    AwaitingConfirmation,
    Transferring,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The one payload was sent or received.
    Completed,
    /// Closed by the local user.
    Cancelled,
    /// A newer session took the manager's slot.
    Replaced,
    Failed(FailureReason),
}

impl CloseReason {
    pub fn terminal_state(&self) -> SessionState {
        match self {
            CloseReason::Failed(reason) => SessionState::Failed(*reason),
            _ => SessionState::Closed,
        }
    }
}

impl From<&TransferError> for CloseReason {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::Cancelled => CloseReason::Cancelled,
            TransferError::Network(_) | TransferError::Setup(_) => {
                CloseReason::Failed(FailureReason::ConnectionLost)
            }
            TransferError::Authentication => {
                CloseReason::Failed(FailureReason::AuthenticationFailed)
            }
            TransferError::Protocol(ProtocolError::PhraseMismatch) => {
                CloseReason::Failed(FailureReason::PhraseMismatch)
            }
            TransferError::Protocol(_) | TransferError::NoActiveSession => {
                CloseReason::Failed(FailureReason::ProtocolViolation)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Sent,
    Received,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    DescriptorReady {
        session: SessionId,
        descriptor: PairingDescriptor,
    },
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    PeerConnected {
        session: SessionId,
        peer: String,
    },
    PhraseReady {
        session: SessionId,
        phrase: ComparisonPhrase,
    },
    TransferComplete {
        session: SessionId,
        direction: TransferDirection,
        payload: Vec<u8>,
    },
    Closed {
        session: SessionId,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::DescriptorReady { session, .. }
            | SessionEvent::StateChanged { session, .. }
            | SessionEvent::PeerConnected { session, .. }
            | SessionEvent::PhraseReady { session, .. }
            | SessionEvent::TransferComplete { session, .. }
            | SessionEvent::Closed { session, .. } => *session,
        }
    }

    pub fn dispatch(&self, observer: &dyn TransferObserver) {
        match self {
            SessionEvent::DescriptorReady {
                session,
                descriptor,
            } => observer.on_descriptor_ready(*session, descriptor),
            SessionEvent::StateChanged { session, state } => {
                observer.on_state_changed(*session, *state)
            }
            SessionEvent::PeerConnected { session, peer } => {
                observer.on_peer_connected(*session, peer)
            }
            SessionEvent::PhraseReady { session, phrase } => {
                observer.on_phrase_ready(*session, phrase)
            }
            SessionEvent::TransferComplete {
                session,
                direction,
                payload,
            } => observer.on_transfer_complete(*session, *direction, payload),
            SessionEvent::Closed { session, reason } => observer.on_closed(*session, *reason),
        }
    }
}

/// Receives session events, serially, on the manager's dispatcher task.
///
/// Callbacks may call back into the `SessionManager` (including `close`).
pub trait TransferObserver: Send + Sync + 'static {
    fn on_descriptor_ready(&self, session: SessionId, descriptor: &PairingDescriptor);
    fn on_peer_connected(&self, session: SessionId, peer: &str);
    fn on_phrase_ready(&self, session: SessionId, phrase: &ComparisonPhrase);
    fn on_transfer_complete(&self, session: SessionId, direction: TransferDirection, payload: &[u8]);
    fn on_closed(&self, session: SessionId, reason: CloseReason);

    fn on_state_changed(&self, _session: SessionId, _state: SessionState) {}
}

/// Observer that forwards every event into an mpsc channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        // The receiver going away just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl TransferObserver for ChannelObserver {
    fn on_descriptor_ready(&self, session: SessionId, descriptor: &PairingDescriptor) {
        self.forward(SessionEvent::DescriptorReady {
            session,
            descriptor: descriptor.clone(),
        });
    }

    fn on_peer_connected(&self, session: SessionId, peer: &str) {
        self.forward(SessionEvent::PeerConnected {
            session,
            peer: peer.to_string(),
        });
    }

    fn on_phrase_ready(&self, session: SessionId, phrase: &ComparisonPhrase) {
        self.forward(SessionEvent::PhraseReady {
            session,
            phrase: phrase.clone(),
        });
    }

    fn on_transfer_complete(&self, session: SessionId, direction: TransferDirection, payload: &[u8]) {
        self.forward(SessionEvent::TransferComplete {
            session,
            direction,
            payload: payload.to_vec(),
        });
    }

    fn on_closed(&self, session: SessionId, reason: CloseReason) {
        self.forward(SessionEvent::Closed { session, reason });
    }

    fn on_state_changed(&self, session: SessionId, state: SessionState) {
        self.forward(SessionEvent::StateChanged { session, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;

    #[test]
    fn errors_map_to_close_reasons() {
        assert_eq!(
            CloseReason::from(&TransferError::Cancelled),
            CloseReason::Cancelled
        );
        assert_eq!(
            CloseReason::from(&TransferError::Network(NetworkError::EndOfStream)),
            CloseReason::Failed(FailureReason::ConnectionLost)
        );
        assert_eq!(
            CloseReason::from(&TransferError::Authentication),
            CloseReason::Failed(FailureReason::AuthenticationFailed)
        );
        assert_eq!(
            CloseReason::from(&TransferError::Protocol(ProtocolError::PhraseMismatch)),
            CloseReason::Failed(FailureReason::PhraseMismatch)
        );
        assert_eq!(
            CloseReason::Replaced.terminal_state(),
            SessionState::Closed
        );
    }

    #[test]
    fn dispatch_reaches_the_matching_callback() {
        let (observer, mut rx) = ChannelObserver::new();
        let event = SessionEvent::Closed {
            session: SessionId(7),
            reason: CloseReason::Completed,
        };
        event.dispatch(&observer);
        match rx.try_recv().unwrap() {
            SessionEvent::Closed { session, reason } => {
                assert_eq!(session, SessionId(7));
                assert_eq!(reason, CloseReason::Completed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
