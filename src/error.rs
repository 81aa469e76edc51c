//! Error types for the key-management and session engine.
//!
//! Display strings are deliberately generic: no key bytes, plaintext or
//! peer-controlled detail ever ends up in an error message.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Peer bundle malformed, unsigned, or the handshake could not complete.
    ///
    /// Not retriable without fetching a fresh bundle.
    #[error("handshake failed")]
    HandshakeFailed,

    /// AEAD tag mismatch on a message; the ciphertext must not be retried.
    #[error("decryption failed")]
    DecryptionFailed,

    /// No session for the sender and the envelope is not a `PreKeyMessage`.
    #[error("unknown session")]
    UnknownSession,

    /// An encrypted record did not verify under the supplied key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The master key is not loaded.
    #[error("engine is locked")]
    Locked,

    /// The recovery code could not unwrap the stored key material.
    #[error("invalid recovery code")]
    InvalidRecoveryCode,

    /// Identity keys already exist for this device.
    #[error("device already initialized")]
    AlreadyInitialized,

    /// Device has no identity yet.
    #[error("device not initialized")]
    NotInitialized,

    /// Requested record is absent.
    #[error("record not found")]
    NotFound,

    /// Signature verification failed
    #[error("invalid signature")]
    InvalidSignature,

    /// Public key does not decode to a usable curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Wire envelope could not be parsed
    #[error("invalid envelope")]
    InvalidEnvelope,

    /// Gap in a receiving chain exceeds the configured bound
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// Referenced one-time prekey is consumed, pending, or unknown
    #[error("one-time prekey unavailable")]
    OneTimePrekeyUnavailable,

    /// Serialization failed
    #[error("serialization error")]
    SerializationError,

    /// Deserialization failed
    #[error("deserialization error")]
    DeserializationError,

    /// Internal cryptographic error
    #[error("cryptographic error")]
    CryptoError,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Blob store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Directory service failure (network or server side)
    #[error("directory error: {0}")]
    Directory(String),
}

impl Error {
    /// Whether the caller may retry the operation as-is (possibly after
    /// triggering a fresh handshake or backing off).
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::UnknownSession | Error::Directory(_))
    }

    /// Text suitable for showing to an end user.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::DecryptionFailed | Error::TooManySkippedMessages | Error::InvalidEnvelope => {
                "Message could not be decrypted."
            }
            Error::HandshakeFailed | Error::InvalidSignature | Error::InvalidPublicKey => {
                "Secure session could not be established. Verify the safety number with your contact."
            }
            Error::UnknownSession => "Secure session is missing. A new one will be set up.",
            Error::Locked => "Unlock to continue.",
            Error::InvalidRecoveryCode => "The recovery code is not valid.",
            Error::AuthenticationFailed => "Stored keys could not be unlocked.",
            _ => "Something went wrong with encryption.",
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(_: bincode::error::EncodeError) -> Self {
        Error::SerializationError
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::DeserializationError
    }
}
