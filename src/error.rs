//! Error types for the messaging core.

use crate::protocol::ErrorCode;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The signature on a peer's signed prekey failed to verify.
    /// Scoped to one bundle; other bundles in the same batch proceed.
    #[error("signed prekey signature verification failed for {device_id}")]
    BundleSignatureInvalid {
        /// Device the rejected bundle belongs to
        device_id: String,
    },

    /// A peer device is already known under a different identity key
    #[error("peer {device_id} is already known with a different identity key")]
    PeerIdentityConflict {
        /// Device whose identity changed
        device_id: String,
    },

    /// The signed prekey referenced by an incoming handshake is not in
    /// the local store. There is no fallback to the current prekey.
    #[error("signed prekey {0} not found")]
    SpkNotFound(u32),

    /// The one-time prekey referenced by an incoming handshake is not in
    /// the local store. A replayed handshake message lands here.
    #[error("one-time prekey {0} not found")]
    OpkNotFound(u32),

    /// Ratchet skip budget exceeded; the message key on the old chain is
    /// gone. The session remains usable for later messages.
    #[error("too many skipped messages")]
    TooManySkipped,

    /// Authentication tag mismatch across every candidate session
    #[error("decryption failed")]
    DecryptionFailed,

    /// Wire framing, protocol version, or curve mismatch
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Typed error response from the directory server
    #[error("directory server error: {0:?}")]
    Server(ErrorCode),

    /// Transport-level failure talking to the directory
    #[error("directory transport failure")]
    Transport,

    /// Transactional storage failure; the enclosing operation rolls back
    #[error("storage error: {0}")]
    Storage(String),

    /// The owning device was destroyed while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// A key or point failed to decode
    #[error("invalid key material")]
    InvalidKey,

    /// The ratchet cannot serve the requested direction yet (a responder
    /// session must decrypt once before it can send)
    #[error("ratchet session not ready")]
    SessionNotReady,

    /// Session blob failed to round-trip through the serializer
    #[error("session serialization error")]
    SessionEncoding,
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::InvalidKey
    }
}
