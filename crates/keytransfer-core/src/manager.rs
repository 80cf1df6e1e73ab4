//! Application-facing coordinator.
//!
//! The application root owns one [`SessionManager`] and hands clones to
//! whatever starts transfers. It keeps a single current session; starting a
//! new one closes the old one with [`CloseReason::Replaced`] and waits for its
//! worker to release the socket before binding or dialing again.
//!
//! Observer callbacks run one at a time on a dispatcher task, in the order the
//! events were produced. `close` never blocks on that task, so it is safe to
//! call from inside a callback or from any other thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use lan::InterfaceIp;
use tracing::{debug, info};

use crate::channel::{ChannelCloser, SecureListener};
use crate::config::TransferConfig;
use crate::descriptor::PairingDescriptor;
use crate::error::TransferError;
use crate::event::{CloseReason, SessionEvent, SessionId, SessionState, TransferObserver};
use crate::psk::PresharedKeySource;
use crate::session::{Endpoint, TransferSession};

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cfg: Arc<TransferConfig>,
    events: mpsc::UnboundedSender<SessionEvent>,
    current: Mutex<Option<Arc<TransferSession>>>,
    starting: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    keys: Mutex<PresharedKeySource>,
}

impl SessionManager {
    /// Create the manager and its dispatcher. Must be called inside a Tokio runtime.
    pub fn new(cfg: TransferConfig, observer: Arc<dyn TransferObserver>) -> Self {
        let (events, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                event.dispatch(observer.as_ref());
            }
            debug!("Event dispatcher stopped");
        });

        Self {
            inner: Arc::new(ManagerInner {
                cfg: Arc::new(cfg),
                events,
                current: Mutex::new(None),
                starting: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
                keys: Mutex::new(PresharedKeySource::default()),
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.cfg
    }

    /// Listen for a peer and return the descriptor to show as a QR code.
    pub async fn start_server(&self) -> Result<PairingDescriptor, TransferError> {
        let _starting = self.inner.starting.lock().await;
        self.replace_current().await;

        let cfg = &self.inner.cfg;
        let psk = self
            .inner
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate()?;
        let closer = ChannelCloser::new();
        let listener = SecureListener::bind(&cfg.listen_addr(), closer.clone()).await?;
        let local = listener.local_addr();
        let host = advertised_host(cfg, local, lan::list_interface_ips_result)?;
        let descriptor = PairingDescriptor::new(host, local.port(), psk)?
            .with_wifi_ssid(cfg.wifi_ssid.clone());

        let endpoint = Endpoint::Listen {
            listener,
            descriptor: descriptor.clone(),
        };
        self.install(endpoint, closer);
        Ok(descriptor)
    }

    /// Connect using a scanned descriptor. No phrase step.
    pub async fn start_client(&self, descriptor: PairingDescriptor) -> Result<(), TransferError> {
        let _starting = self.inner.starting.lock().await;
        self.replace_current().await;

        if let Some(ssid) = &descriptor.wifi_ssid {
            info!(ssid = %ssid, "Peer advertises Wi-Fi network");
        }
        let PairingDescriptor {
            host,
            port,
            preshared_key,
            ..
        } = descriptor;
        self.install(
            Endpoint::Dial {
                host,
                port,
                psk: Some(preshared_key),
            },
            ChannelCloser::new(),
        );
        Ok(())
    }

    /// Connect to a typed-in host and port; both users then compare a phrase.
    pub async fn start_client_manual(&self, host: &str, port: u16) -> Result<(), TransferError> {
        if host.trim().is_empty() || port == 0 {
            return Err(TransferError::malformed("host and a non-zero port are required"));
        }
        let _starting = self.inner.starting.lock().await;
        self.replace_current().await;

        self.install(
            Endpoint::Dial {
                host: host.trim().to_string(),
                port,
                psk: None,
            },
            ChannelCloser::new(),
        );
        Ok(())
    }

    /// Queue the key ring to send. One payload per session.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransferError> {
        self.current()
            .ok_or(TransferError::NoActiveSession)?
            .queue_payload(payload)
    }

    pub fn confirm_phrase(&self, confirmed: bool) -> Result<(), TransferError> {
        self.current()
            .ok_or(TransferError::NoActiveSession)?
            .confirm(confirmed)
    }

    /// Close the current session. Idempotent; returns `true` if this call
    /// ended a live session.
    pub fn close(&self) -> bool {
        match self.current() {
            Some(session) => session.close(CloseReason::Cancelled),
            None => false,
        }
    }

    pub fn state(&self) -> Option<SessionState> {
        self.current().map(|s| s.state())
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current().map(|s| s.id())
    }

    fn current(&self) -> Option<Arc<TransferSession>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn replace_current(&self) {
        let previous = self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            if previous.close(CloseReason::Replaced) {
                info!(session = %previous.id(), "Replacing active session");
            }
            previous.join().await;
        }
    }

    fn install(&self, endpoint: Endpoint, closer: ChannelCloser) {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let session = TransferSession::spawn(
            id,
            endpoint,
            closer,
            self.inner.cfg.clone(),
            self.inner.events.clone(),
        );
        *self
            .inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(session));
    }
}

/// Host a peer should dial: the configured host, else the bound address, else
/// an interface address when bound to a wildcard.
fn advertised_host<F>(
    cfg: &TransferConfig,
    local: SocketAddr,
    interfaces: F,
) -> Result<String, TransferError>
where
    F: FnOnce() -> std::io::Result<Vec<InterfaceIp>>,
{
    if let Some(host) = &cfg.advertised_host {
        return Ok(host.clone());
    }
    if !local.ip().is_unspecified() {
        return Ok(local.ip().to_string());
    }
    let ips = interfaces()
        .map_err(|e| TransferError::Setup(format!("failed to list network interfaces: {e}")))?;
    let ip = lan::select_advertised_ip(&ips, cfg.advertised_interface.as_deref()).ok_or_else(|| {
        TransferError::Setup("no non-loopback address to advertise; set advertised_host".into())
    })?;
    debug!(ip = %ip, "Advertising interface address");
    Ok(ip.to_string())
}
