//! Error taxonomy for pairing and transfer.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// RNG or socket setup failed before a session existed.
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Handshake rejected. Wrong key and wrong peer are not distinguished.
    #[error("peer authentication failed")]
    Authentication,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session or channel was closed locally.
    #[error("closed")]
    Cancelled,

    #[error("no active session")]
    NoActiveSession,
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("end of stream")]
    EndOfStream,
    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),
    #[error("comparison phrase rejected")]
    PhraseMismatch,
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("undecodable frame: {0}")]
    Decode(String),
    #[error("a payload is already queued for this session")]
    PayloadAlreadyQueued,
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkError::Timeout,
            io::ErrorKind::ConnectionRefused => NetworkError::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetworkError::ConnectionReset,
            io::ErrorKind::UnexpectedEof => NetworkError::EndOfStream,
            _ => NetworkError::Io(err),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Network(err.into())
    }
}

impl TransferError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        TransferError::Protocol(ProtocolError::MalformedDescriptor(reason.into()))
    }

    /// Idle poll timeouts are checkpoints, not failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Network(NetworkError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused: TransferError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(
            refused,
            TransferError::Network(NetworkError::ConnectionRefused)
        ));

        let eof: TransferError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(eof, TransferError::Network(NetworkError::EndOfStream)));

        let pipe: TransferError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(pipe, TransferError::Network(NetworkError::ConnectionReset)));

        let timeout: TransferError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(timeout.is_timeout());
    }
}
