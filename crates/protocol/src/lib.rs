//! # Tether Protocol Library
//!
//! This crate provides the pairing primitives and message definitions for
//! Tether, a secure device-pairing system.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Tether's session layer, providing:
//!
//! - **Device Fingerprints**: salted SHA-256 identities for out-of-band comparison
//! - **Session Codes**: short, checksummed, human-typable pairing codes
//! - **Key Exchange**: ephemeral X25519 agreement with HKDF-SHA256 derivation
//! - **AEAD**: ChaCha20-Poly1305 / AES-256-GCM envelope with key rotation
//! - **Message Definitions**: signaling requests/responses and application events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Events             │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │           AEAD Envelope                 │  nonce || ciphertext || tag
//! ├─────────────────────────────────────────┤
//! │    X25519 + HKDF session key            │
//! ├─────────────────────────────────────────┤
//! │       Transport (opaque byte pipe)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tether_protocol::{AeadAlgorithm, KeyExchange, SessionCode, establish_cipher};
//!
//! // The host generates a code and reads it to the guest
//! let code = SessionCode::generate();
//! assert!(SessionCode::is_valid(&code.to_string()));
//!
//! // Both sides agree on a key
//! let host = KeyExchange::new();
//! let guest = KeyExchange::new();
//! let host_cipher = establish_cipher(
//!     &host, &guest.public_key(), None, None, AeadAlgorithm::ChaCha20Poly1305,
//! ).unwrap();
//! let guest_cipher = establish_cipher(
//!     &guest, &host.public_key(), None, None, AeadAlgorithm::ChaCha20Poly1305,
//! ).unwrap();
//!
//! let sealed = host_cipher.encrypt(b"hello", None).unwrap();
//! assert_eq!(guest_cipher.decrypt(&sealed, None).unwrap(), b"hello");
//! ```
//!
//! ## Modules
//!
//! - [`fingerprint`]: Device ids, fingerprints and salts
//! - [`code`]: Session code generation and validation
//! - [`key_exchange`]: X25519 key agreement and key derivation
//! - [`aead`]: Authenticated encryption
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod aead;
pub mod code;
pub mod error;
pub mod fingerprint;
pub mod key_exchange;
pub mod messages;

pub use aead::{AeadAlgorithm, AeadCipher, RotatedKey, KEY_LENGTH, NONCE_LENGTH, TAG_LENGTH};
pub use code::{SessionCode, ALPHABET, CODE_LEN};
pub use error::{ProtocolError, Result};
pub use fingerprint::{DeviceFingerprint, DeviceId, FingerprintSalt, FINGERPRINT_LENGTH};
pub use key_exchange::{
    derive_encryption_key, establish_cipher, DerivedKey, KeyExchange, SharedSecret,
    DEFAULT_DERIVED_KEY_LENGTH,
};
pub use messages::{
    AppEvent, Envelope, ErrorCode, ErrorMessage, SessionFeatures, SignalingRequest,
    SignalingResponse, PROTOCOL_VERSION,
};
