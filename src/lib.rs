//! Key-management and session-encryption engine for end-to-end encrypted
//! messaging.
//!
//! Devices publish prekey bundles to a directory, establish pairwise
//! sessions with X3DH and encrypt every message under the Double Ratchet.
//! All private key material and session state is stored encrypted under a
//! master key that the password (or the recovery code) unwraps.
//!
//! # Security Properties
//!
//! ## Forward Secrecy
//! Each message key is derived from a chain key that is advanced and
//! discarded immediately, so a later compromise does not expose earlier
//! messages.
//!
//! ## Post-Compromise Security
//! Every reply carries a fresh ratchet key; one honest round trip heals a
//! compromised session.
//!
//! ## Exactly-once Prekeys
//! A one-time prekey is reserved for one handshake, parked until the
//! directory acknowledges its consumption, then deleted. It is never
//! accepted twice.
//!
//! ## Identity Verification
//! Safety numbers let two users compare identity keys out of band; a peer
//! identity change is audited and clears the stored verification.
//!
//! # Threat Model
//!
//! **Assumed adversary capabilities:**
//! - Active network attacker (inject, modify, delay, drop, replay envelopes)
//! - Read access to the blob store
//!
//! **Security assumptions:**
//! - X25519 ECDH provides computational security
//! - HKDF-SHA256 and PBKDF2-HMAC-SHA256 are secure key derivation functions
//! - AES-256-GCM is a secure AEAD cipher
//! - The operating system random number generator is cryptographically secure
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use e2ee_core::{DeviceAddress, E2eeConfig, E2eeManager, InMemoryBlobStore, InMemoryDirectory};
//!
//! # async fn demo() -> e2ee_core::Result<()> {
//! let directory = Arc::new(InMemoryDirectory::new());
//! let alice = E2eeManager::new(
//!     DeviceAddress::new("alice", 1),
//!     Arc::new(InMemoryBlobStore::new()),
//!     directory.clone(),
//!     E2eeConfig::default(),
//! )?;
//! let bob = E2eeManager::new(
//!     DeviceAddress::new("bob", 1),
//!     Arc::new(InMemoryBlobStore::new()),
//!     directory,
//!     E2eeConfig::default(),
//! )?;
//!
//! // Shown to the user once; never stored.
//! let recovery_code = alice.initialize("correct-horse").await?;
//! bob.initialize("battery-staple").await?;
//!
//! let envelope = alice.encrypt_for_send("bob", 1, b"hi").await?;
//! let plaintext = bob.decrypt_received(&envelope).await?;
//! assert_eq!(&plaintext[..], b"hi");
//!
//! let number = alice.safety_number("bob", 1).await?;
//! println!("{number}");
//! # let _ = recovery_code;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`manager`]: [`E2eeManager`], the entry point
//! - [`session_manager`]: per-peer session state machine
//! - [`key_manager`]: identity, signed prekey and one-time prekey lifecycle
//! - [`x3dh`]: Extended Triple Diffie-Hellman key agreement
//! - [`double_ratchet`]: Double Ratchet with a bounded skipped-key cache
//! - [`envelope`]: wire format
//! - [`safety_number`]: identity fingerprints
//! - [`store`]: encrypted record storage over a [`BlobStore`]
//! - [`directory`]: prekey directory seam
//! - [`primitives`], [`kdf`], [`keys`], [`xeddsa`]: cryptographic building blocks

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug
)]

pub mod address;
pub mod audit;
pub mod clock;
pub mod config;
pub mod directory;
pub mod double_ratchet;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key_manager;
pub mod keys;
pub mod manager;
pub mod primitives;
pub mod safety_number;
pub mod session_manager;
pub mod store;
pub mod x3dh;
pub mod xeddsa;

// Re-export main types
pub use address::DeviceAddress;
pub use audit::{AuditEvent, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::E2eeConfig;
pub use directory::{Directory, InMemoryDirectory, SignedPrekeyPublic};
pub use double_ratchet::{DoubleRatchet, Header, RatchetLimits, RatchetMessage};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{Error, Result};
pub use key_manager::{KeyManager, PrekeyStatus};
pub use keys::{IdentityKeyPair, KeyPair, MasterKey, PublicKey, SecretKey, Signature};
pub use manager::{E2eeManager, MaintenanceReport, RecoveryCode};
pub use safety_number::{SafetyNumber, SafetyNumberService};
pub use session_manager::{SessionManager, SessionState};
pub use store::{BlobStore, EncryptedKeyStore, InMemoryBlobStore, KeyScope};
pub use x3dh::{InitialMessage, PreKeyBundle};
