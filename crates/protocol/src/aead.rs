//! Authenticated encryption envelope.
//!
//! Every sealed message has the layout:
//!
//! ```text
//! +----------------+------------------------+----------------+
//! | Nonce (12)     | Ciphertext (N)         | Tag (16)       |
//! +----------------+------------------------+----------------+
//! ```
//!
//! Nonces are drawn from the OS CSPRNG for every message. Each key carries a
//! message budget; once it is spent `encrypt` refuses to continue until the
//! key is rotated, which keeps the random-nonce collision probability
//! negligible.

use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Nonce, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Symmetric key length for both supported algorithms.
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LENGTH: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LENGTH: usize = 16;

/// Shortest buffer `decrypt` will look at: an empty plaintext.
pub const MIN_SEALED_LENGTH: usize = NONCE_LENGTH + TAG_LENGTH;

/// Messages that may be sealed under a single key before rotation (2^32).
pub const MAX_MESSAGES_PER_KEY: u64 = 1 << 32;

/// Supported AEAD constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// ChaCha20-Poly1305 (RFC 8439).
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// AES-256 in Galois/Counter Mode.
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl std::fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AeadAlgorithm::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
            AeadAlgorithm::Aes256Gcm => write!(f, "aes-256-gcm"),
        }
    }
}

/// Fresh key material produced by [`AeadCipher::rotate_key`].
///
/// Zeroized on drop; hand it to the peer over the existing secure channel
/// before dropping.
pub type RotatedKey = Zeroizing<[u8; KEY_LENGTH]>;

enum CipherImpl {
    ChaCha(Box<ChaCha20Poly1305>),
    Aes(Box<Aes256Gcm>),
}

impl CipherImpl {
    fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(ProtocolError::InvalidKeyLength {
                expected: KEY_LENGTH,
                got: key.len(),
            });
        }
        let invalid = |_| ProtocolError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        };
        Ok(match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?;
                CipherImpl::ChaCha(Box::new(cipher))
            }
            AeadAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(invalid)?;
                CipherImpl::Aes(Box::new(cipher))
            }
        })
    }

    fn seal(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            CipherImpl::ChaCha(c) => seal_with(c.as_ref(), nonce, payload),
            CipherImpl::Aes(c) => seal_with(c.as_ref(), nonce, payload),
        }
    }

    fn open(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
        match self {
            CipherImpl::ChaCha(c) => open_with(c.as_ref(), nonce, payload),
            CipherImpl::Aes(c) => open_with(c.as_ref(), nonce, payload),
        }
    }
}

fn seal_with<A: Aead>(cipher: &A, nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
    cipher.encrypt(Nonce::<A>::from_slice(nonce), payload).ok()
}

fn open_with<A: Aead>(cipher: &A, nonce: &[u8], payload: Payload<'_, '_>) -> Option<Vec<u8>> {
    cipher.decrypt(Nonce::<A>::from_slice(nonce), payload).ok()
}

/// An AEAD cipher bound to one key epoch at a time.
pub struct AeadCipher {
    algorithm: AeadAlgorithm,
    inner: Option<CipherImpl>,
    epoch: u64,
    sealed: AtomicU64,
}

impl AeadCipher {
    /// Creates a cipher from a 32-byte key.
    pub fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self> {
        Ok(Self {
            algorithm,
            inner: Some(CipherImpl::new(algorithm, key)?),
            epoch: 0,
            sealed: AtomicU64::new(0),
        })
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    /// Number of completed key rotations.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Messages sealed under the current key.
    pub fn messages_sealed(&self) -> u64 {
        self.sealed.load(Ordering::Relaxed)
    }

    /// Returns true once [`AeadCipher::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_none()
    }

    /// Seals `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let cipher = self.inner.as_ref().ok_or(ProtocolError::Disposed)?;

        if self.sealed.fetch_add(1, Ordering::Relaxed) >= MAX_MESSAGES_PER_KEY {
            return Err(ProtocolError::KeyRotationRequired { epoch: self.epoch });
        }

        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);

        let payload = Payload {
            msg: plaintext,
            aad: aad.unwrap_or_default(),
        };
        let sealed = cipher.seal(&nonce, payload).ok_or_else(|| {
            ProtocolError::InvalidArgument("plaintext exceeds the cipher's maximum length".into())
        })?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens a buffer produced by [`AeadCipher::encrypt`].
    ///
    /// Fails with `MalformedInput` if the buffer cannot hold a nonce and tag,
    /// and with `AuthenticationFailed` if anything was tampered with or the
    /// wrong key or associated data is used. No partial plaintext is ever
    /// returned.
    pub fn decrypt(&self, data: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let cipher = self.inner.as_ref().ok_or(ProtocolError::Disposed)?;

        if data.len() < MIN_SEALED_LENGTH {
            return Err(ProtocolError::MalformedInput {
                len: data.len(),
                min: MIN_SEALED_LENGTH,
            });
        }

        let (nonce, sealed) = data.split_at(NONCE_LENGTH);
        let payload = Payload {
            msg: sealed,
            aad: aad.unwrap_or_default(),
        };
        cipher
            .open(nonce, payload)
            .ok_or(ProtocolError::AuthenticationFailed)
    }

    /// Switches to fresh random key material and returns it.
    ///
    /// Ciphertext sealed under the previous key no longer opens.
    pub fn rotate_key(&mut self) -> Result<RotatedKey> {
        if self.inner.is_none() {
            return Err(ProtocolError::Disposed);
        }
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key[..]);
        self.install_key(&key[..])?;
        Ok(key)
    }

    /// Switches to key material received from the peer's rotation.
    pub fn install_key(&mut self, key: &[u8]) -> Result<()> {
        if self.inner.is_none() {
            return Err(ProtocolError::Disposed);
        }
        self.inner = Some(CipherImpl::new(self.algorithm, key)?);
        self.epoch += 1;
        self.sealed.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Drops the key schedule. Later calls fail with `Disposed`.
    pub fn dispose(&mut self) {
        self.inner = None;
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("algorithm", &self.algorithm)
            .field("epoch", &self.epoch)
            .field("key", &"[REDACTED]")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
