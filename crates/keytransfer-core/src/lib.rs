//! KeyTransfer Core - device-to-device OpenPGP key-ring transfer
//!
//! Pairs two devices on the same network through a scanned descriptor or a
//! compared phrase, then moves exactly one key ring over an encrypted channel.

pub mod channel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod handshake;
pub mod manager;
pub mod phrase;
pub mod psk;
pub mod session;

// Re-export commonly used types
pub use config::TransferConfig;
pub use descriptor::PairingDescriptor;
pub use error::{NetworkError, ProtocolError, TransferError};
pub use event::{
    ChannelObserver, CloseReason, FailureReason, Role, SessionEvent, SessionId, SessionState,
    TransferDirection, TransferObserver,
};
pub use manager::SessionManager;
pub use phrase::{derive_phrase, ComparisonPhrase};
pub use psk::{PresharedKey, PresharedKeySource};
pub use session::TransferSession;
