//! One pairing plus one key-ring transfer, driven by a dedicated worker task.
//!
//! The worker owns the socket. Everything else talks to it through the
//! session handle: a one-slot payload queue, a one-slot confirmation queue and
//! the shared [`ChannelCloser`]. State and the terminal flag live under one
//! mutex, so a session reports exactly one `Closed` event and nothing after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{
    key_ring_frame_len, ChannelCloser, Incoming, SecureChannel, SecureListener, WireMessage,
};
use crate::config::TransferConfig;
use crate::descriptor::PairingDescriptor;
use crate::error::{NetworkError, ProtocolError, TransferError};
use crate::event::{CloseReason, Role, SessionEvent, SessionId, SessionState, TransferDirection};
use crate::phrase::derive_phrase;
use crate::psk::PresharedKey;

/// State plus event feed for one session.
pub(crate) struct SessionShared {
    id: SessionId,
    state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    pub(crate) fn new(
        id: SessionId,
        initial: SessionState,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(initial),
            events,
        }
    }

    fn send(&self, event: SessionEvent) {
        // A missing dispatcher means the manager is gone; nothing to report to.
        let _ = self.events.send(event);
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        debug!(session = %self.id, from = ?*state, to = ?next, "State change");
        *state = next;
        self.send(SessionEvent::StateChanged {
            session: self.id,
            state: next,
        });
        true
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            self.send(event);
        }
    }

    /// Move to the terminal state. Only the first call has any effect.
    pub(crate) fn finish(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        *state = reason.terminal_state();
        self.send(SessionEvent::StateChanged {
            session: self.id,
            state: *state,
        });
        self.send(SessionEvent::Closed {
            session: self.id,
            reason,
        });
        info!(session = %self.id, reason = ?reason, "Session closed");
        true
    }
}

/// Where the worker gets its channel from.
pub(crate) enum Endpoint {
    Listen {
        listener: SecureListener,
        descriptor: PairingDescriptor,
    },
    Dial {
        host: String,
        port: u16,
        psk: Option<PresharedKey>,
    },
}

pub struct TransferSession {
    id: SessionId,
    role: Role,
    shared: Arc<SessionShared>,
    closer: ChannelCloser,
    outgoing: mpsc::Sender<Vec<u8>>,
    payload_queued: AtomicBool,
    max_frame_len: usize,
    confirmations: mpsc::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferSession {
    /// Spawn the worker. Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        id: SessionId,
        endpoint: Endpoint,
        closer: ChannelCloser,
        cfg: Arc<TransferConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (role, initial) = match &endpoint {
            Endpoint::Listen { .. } => (Role::Server, SessionState::Listening),
            Endpoint::Dial { .. } => (Role::Client, SessionState::Idle),
        };
        let shared = Arc::new(SessionShared::new(id, initial, events));
        if let Endpoint::Listen { descriptor, .. } = &endpoint {
            shared.send(SessionEvent::StateChanged {
                session: id,
                state: initial,
            });
            // Published before the worker exists, so it precedes every other event.
            shared.send(SessionEvent::DescriptorReady {
                session: id,
                descriptor: descriptor.clone(),
            });
        }

        let max_frame_len = cfg.max_frame_len;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(1);
        let (confirm_tx, confirm_rx) = mpsc::channel(1);

        let worker = Worker {
            shared: shared.clone(),
            closer: closer.clone(),
            cfg,
            outgoing: outgoing_rx,
            confirmations: confirm_rx,
        };
        info!(session = %id, role = ?role, "Starting transfer session");
        let handle = tokio::spawn(worker.run(endpoint));

        Self {
            id,
            role,
            shared,
            closer,
            outgoing: outgoing_tx,
            payload_queued: AtomicBool::new(false),
            max_frame_len,
            confirmations: confirm_tx,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Queue the session's single payload; it is sent once the channel is
    /// ready for transfer. A payload the peer would reject as too large is
    /// refused here and does not use up the slot.
    pub fn queue_payload(&self, payload: Vec<u8>) -> Result<(), TransferError> {
        if self.state().is_terminal() {
            return Err(TransferError::NoActiveSession);
        }
        let framed = key_ring_frame_len(payload.len());
        if framed > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge(framed).into());
        }
        if self.payload_queued.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::PayloadAlreadyQueued.into());
        }
        self.outgoing
            .try_send(payload)
            .map_err(|_| TransferError::NoActiveSession)
    }

    /// Report the local user's phrase comparison. Only valid while a phrase
    /// is waiting to be compared.
    pub fn confirm(&self, confirmed: bool) -> Result<(), TransferError> {
        match self.state() {
            SessionState::AwaitingConfirmation => {}
            state if state.is_terminal() => return Err(TransferError::NoActiveSession),
            _ => {
                return Err(ProtocolError::UnexpectedMessage("no phrase awaiting confirmation").into())
            }
        }
        self.confirmations.try_send(confirmed).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ProtocolError::UnexpectedMessage("phrase already confirmed").into()
            }
            mpsc::error::TrySendError::Closed(_) => TransferError::NoActiveSession,
        })
    }

    /// Idempotent. Emits `Closed(reason)` unless the session already ended,
    /// then wakes the worker so it drops the socket.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.shared.finish(reason);
        self.closer.close();
        first
    }

    /// Wait for the worker to exit and release its socket.
    pub async fn join(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(session = %self.id, error = %e, "Session worker panicked");
            }
        }
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.closer.close();
    }
}

struct Worker {
    shared: Arc<SessionShared>,
    closer: ChannelCloser,
    cfg: Arc<TransferConfig>,
    outgoing: mpsc::Receiver<Vec<u8>>,
    confirmations: mpsc::Receiver<bool>,
}

impl Worker {
    async fn run(mut self, endpoint: Endpoint) {
        let result = self.drive(endpoint).await;
        let reason = match &result {
            Ok(()) => CloseReason::Completed,
            Err(TransferError::Cancelled) => CloseReason::Cancelled,
            Err(e) => {
                warn!(session = %self.shared.id, error = %e, "Session failed");
                CloseReason::from(e)
            }
        };
        self.shared.finish(reason);
        self.closer.close();
    }

    async fn drive(&mut self, endpoint: Endpoint) -> Result<(), TransferError> {
        let mut channel = match endpoint {
            Endpoint::Listen {
                listener,
                descriptor,
            } => {
                // One peer per session; the listener is dropped right after.
                listener.accept(&descriptor.preshared_key, &self.cfg).await?
            }
            Endpoint::Dial { host, port, psk } => {
                self.shared.transition(SessionState::Connecting);
                info!(session = %self.shared.id, host = %host, port, keyed = psk.is_some(), "Connecting");
                SecureChannel::connect(
                    &host,
                    port,
                    psk.as_ref(),
                    self.cfg.connect_timeout(),
                    &self.closer,
                    &self.cfg,
                )
                .await?
            }
        };

        self.shared.transition(SessionState::Established);
        info!(session = %self.shared.id, peer = %channel.peer(), "Peer connected");
        self.shared.emit(SessionEvent::PeerConnected {
            session: self.shared.id,
            peer: channel.peer().to_string(),
        });

        if channel.requires_confirmation() {
            let phrase = derive_phrase(channel.phrase_material());
            self.shared.transition(SessionState::AwaitingConfirmation);
            self.shared.emit(SessionEvent::PhraseReady {
                session: self.shared.id,
                phrase,
            });
            self.await_confirmation(&mut channel).await?;
        }

        self.shared.transition(SessionState::Transferring);
        self.exchange(channel).await
    }

    /// Both users must accept the phrase: the local answer is sent to the
    /// peer, and the peer's answer only counts together with our own.
    async fn await_confirmation(
        &mut self,
        channel: &mut SecureChannel<TcpStream>,
    ) -> Result<(), TransferError> {
        let idle = self.cfg.idle_poll_interval();
        let mut local_confirmed = false;
        let mut peer_confirmed = false;
        loop {
            tokio::select! {
                local = self.confirmations.recv(), if !local_confirmed => {
                    let Some(confirmed) = local else {
                        return Err(TransferError::Cancelled);
                    };
                    debug!(session = %self.shared.id, confirmed, "Sending phrase confirmation");
                    channel.send(&WireMessage::Confirmation { confirmed }).await?;
                    if !confirmed {
                        return Err(ProtocolError::PhraseMismatch.into());
                    }
                    local_confirmed = true;
                    if peer_confirmed {
                        return Ok(());
                    }
                }
                incoming = channel.poll_incoming(idle) => match incoming? {
                    Incoming::Idle => continue,
                    Incoming::EndOfStream => return Err(NetworkError::EndOfStream.into()),
                    Incoming::Ready => match channel.read_message().await? {
                        WireMessage::Confirmation { confirmed: true } if !peer_confirmed => {
                            debug!(session = %self.shared.id, "Peer accepted the phrase");
                            peer_confirmed = true;
                            if local_confirmed {
                                return Ok(());
                            }
                        }
                        WireMessage::Confirmation { confirmed: true } => {
                            return Err(ProtocolError::UnexpectedMessage(
                                "repeated phrase confirmation",
                            )
                            .into())
                        }
                        WireMessage::Confirmation { confirmed: false } => {
                            return Err(ProtocolError::PhraseMismatch.into())
                        }
                        WireMessage::KeyRing { .. } => {
                            return Err(ProtocolError::UnexpectedMessage(
                                "key ring before phrase confirmation",
                            )
                            .into())
                        }
                    },
                },
            }
        }
    }

    async fn exchange(
        &mut self,
        mut channel: SecureChannel<TcpStream>,
    ) -> Result<(), TransferError> {
        let idle = self.cfg.idle_poll_interval();
        loop {
            tokio::select! {
                Some(payload) = self.outgoing.recv() => {
                    info!(session = %self.shared.id, bytes = payload.len(), "Sending key ring");
                    channel
                        .send(&WireMessage::KeyRing { payload: payload.clone() })
                        .await?;
                    channel.finish().await;
                    self.shared.emit(SessionEvent::TransferComplete {
                        session: self.shared.id,
                        direction: TransferDirection::Sent,
                        payload,
                    });
                    return Ok(());
                }
                incoming = channel.poll_incoming(idle) => match incoming? {
                    Incoming::Idle => continue,
                    Incoming::EndOfStream => return Err(NetworkError::EndOfStream.into()),
                    Incoming::Ready => match channel.read_message().await? {
                        WireMessage::KeyRing { payload } => {
                            info!(session = %self.shared.id, bytes = payload.len(), "Received key ring");
                            drop(channel);
                            self.shared.emit(SessionEvent::TransferComplete {
                                session: self.shared.id,
                                direction: TransferDirection::Received,
                                payload,
                            });
                            return Ok(());
                        }
                        WireMessage::Confirmation { confirmed: false } => {
                            return Err(ProtocolError::PhraseMismatch.into())
                        }
                        WireMessage::Confirmation { confirmed: true } => {
                            return Err(ProtocolError::UnexpectedMessage(
                                "phrase confirmation during transfer",
                            )
                            .into())
                        }
                    },
                },
            }
        }
    }
}
