//! Ephemeral X25519 key agreement and HKDF key derivation.
//!
//! Each device generates a fresh [`KeyExchange`] per session, sends its
//! public key over the signaling channel, and derives a [`SharedSecret`] from
//! the peer's public key. The shared secret is never used directly: it is run
//! through HKDF-SHA256 to obtain a [`DerivedKey`] for the AEAD layer.
//!
//! All secret material is zeroized when dropped, rotated or disposed.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::aead::{AeadAlgorithm, AeadCipher};
use crate::error::{ProtocolError, Result};

/// Length of an X25519 public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Minimum derived key length in bytes.
pub const MIN_DERIVED_KEY_LENGTH: usize = 16;

/// Maximum derived key length in bytes.
pub const MAX_DERIVED_KEY_LENGTH: usize = 64;

/// Derived key length used when the caller does not choose one.
pub const DEFAULT_DERIVED_KEY_LENGTH: usize = 32;

/// HKDF info string used when no context is supplied.
pub const DEFAULT_KDF_CONTEXT: &[u8] = b"tether-session-key-v1";

/// A 32-byte X25519 shared secret. Zeroized on drop.
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl SharedSecret {
    /// Returns the raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// HKDF output key material. Zeroized on drop.
pub type DerivedKey = Zeroizing<Vec<u8>>;

/// An ephemeral X25519 key pair.
///
/// The private half is owned exclusively by this value; it is never exposed
/// and is zeroized on drop, on [`KeyExchange::rotate_key_pair`] and on
/// [`KeyExchange::dispose`].
pub struct KeyExchange {
    secret: Option<StaticSecret>,
    public: PublicKey,
}

impl KeyExchange {
    /// Generates a fresh key pair from the operating system's CSPRNG.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    /// Returns the public key, safe to transmit.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Returns true once [`KeyExchange::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.secret.is_none()
    }

    /// Computes the shared secret with a remote public key.
    ///
    /// Fails with `InvalidKey` if the key is not 32 bytes or if it is a
    /// low-order point that would yield a non-contributory (all-zero) secret.
    pub fn derive_shared_secret(&self, remote_public_key: &[u8]) -> Result<SharedSecret> {
        let secret = self.secret.as_ref().ok_or(ProtocolError::Disposed)?;

        let bytes: [u8; PUBLIC_KEY_LENGTH] = remote_public_key.try_into().map_err(|_| {
            ProtocolError::InvalidKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                remote_public_key.len()
            ))
        })?;

        let shared = secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidKey(
                "remote key is a low-order point".to_string(),
            ));
        }
        Ok(SharedSecret(shared))
    }

    /// Discards the current key pair and generates a new one.
    ///
    /// Secrets derived from the old pair remain valid for whoever holds them,
    /// but no new secret can be derived from it.
    pub fn rotate_key_pair(&mut self) -> Result<()> {
        if self.secret.is_none() {
            return Err(ProtocolError::Disposed);
        }
        *self = Self::new();
        Ok(())
    }

    /// Zeroizes the private key. Later derivations fail with `Disposed`.
    pub fn dispose(&mut self) {
        // StaticSecret zeroizes itself on drop
        self.secret = None;
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public_key", &hex::encode(self.public.as_bytes()))
            .field("secret_key", &"[REDACTED]")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Derives a symmetric key from a shared secret with HKDF-SHA256.
///
/// `length` must be within 16..=64 bytes. The derivation is deterministic:
/// identical secret, salt, context and length always produce identical
/// output. Without a `context` the [`DEFAULT_KDF_CONTEXT`] info string is used.
pub fn derive_encryption_key(
    shared_secret: &SharedSecret,
    salt: Option<&[u8]>,
    context: Option<&[u8]>,
    length: usize,
) -> Result<DerivedKey> {
    if !(MIN_DERIVED_KEY_LENGTH..=MAX_DERIVED_KEY_LENGTH).contains(&length) {
        return Err(ProtocolError::InvalidArgument(format!(
            "derived key length must be between {} and {} bytes, got {}",
            MIN_DERIVED_KEY_LENGTH, MAX_DERIVED_KEY_LENGTH, length
        )));
    }

    let hkdf = Hkdf::<Sha256>::new(salt, shared_secret.as_bytes());
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hkdf.expand(context.unwrap_or(DEFAULT_KDF_CONTEXT), &mut okm)
        .map_err(|e| ProtocolError::InvalidArgument(e.to_string()))?;
    Ok(okm)
}

/// Runs the full agreement and returns a ready cipher.
///
/// The shared secret and derived key live only for the duration of this
/// call and are zeroized before it returns.
pub fn establish_cipher(
    key_exchange: &KeyExchange,
    remote_public_key: &[u8],
    salt: Option<&[u8]>,
    context: Option<&[u8]>,
    algorithm: AeadAlgorithm,
) -> Result<AeadCipher> {
    let shared = key_exchange.derive_shared_secret(remote_public_key)?;
    let key = derive_encryption_key(&shared, salt, context, DEFAULT_DERIVED_KEY_LENGTH)?;
    AeadCipher::new(algorithm, &key)
}
