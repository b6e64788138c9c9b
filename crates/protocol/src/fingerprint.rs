//! Device identity and fingerprinting for Tether devices.
//!
//! A device fingerprint is a SHA-256 digest over a structured, length-prefixed
//! encoding of the device's platform, machine id, installation id and a
//! per-installation random salt. The salt never leaves the device; only the
//! digest (or one of its display forms) is shown to the other side for manual
//! out-of-band comparison.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};

/// Length of a device fingerprint in bytes (full SHA-256 output).
pub const FINGERPRINT_LENGTH: usize = 32;

/// Length of a fingerprint salt in bytes.
pub const SALT_LENGTH: usize = 32;

/// Version of the fingerprint input encoding, mixed into every digest.
pub const FINGERPRINT_VERSION: u8 = 1;

/// Number of hex characters in the short display form (48 bits).
pub const SHORT_DISPLAY_LEN: usize = 12;

/// Number of hex characters in the medium display form (64 bits).
pub const MEDIUM_DISPLAY_LEN: usize = 16;

/// Domain separation prefix hashed before the encoded input.
const FINGERPRINT_DOMAIN: &[u8] = b"tether-device-fingerprint";

/// An opaque device identifier as announced on the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id, rejecting empty or whitespace-only values.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidArgument(
                "device id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for DeviceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Per-installation random salt. Zeroized on drop and never transmitted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct FingerprintSalt([u8; SALT_LENGTH]);

impl FingerprintSalt {
    /// Generates a fresh salt from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a salt from raw bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }

    /// Hex encoding used when persisting the salt locally.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a salt previously written with [`FingerprintSalt::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; SALT_LENGTH];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ProtocolError::InvalidArgument(format!("invalid salt: {}", e)))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for FingerprintSalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FingerprintSalt([REDACTED])")
    }
}

/// The structured input that is encoded and hashed into a fingerprint.
///
/// MessagePack length-prefixes every field, so no two distinct inputs share
/// an encoding.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    version: u8,
    platform: &'a str,
    machine_id: &'a str,
    installation_id: &'a str,
    #[serde(with = "serde_bytes")]
    salt: &'a [u8],
}

/// A 32-byte device fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFingerprint(#[serde(with = "serde_bytes")] [u8; FINGERPRINT_LENGTH]);

impl DeviceFingerprint {
    /// Generates the fingerprint of a device.
    ///
    /// When `salt` is `None` a new random salt is generated. The salt that was
    /// used is returned alongside the fingerprint so the caller can persist it;
    /// the same inputs and salt always produce the same fingerprint.
    pub fn generate(
        platform: &str,
        machine_id: &str,
        installation_id: &str,
        salt: Option<FingerprintSalt>,
    ) -> Result<(Self, FingerprintSalt)> {
        for (name, value) in [
            ("platform", platform),
            ("machine id", machine_id),
            ("installation id", installation_id),
        ] {
            if value.trim().is_empty() {
                return Err(ProtocolError::InvalidArgument(format!(
                    "{} must not be empty",
                    name
                )));
            }
        }

        let salt = salt.unwrap_or_else(FingerprintSalt::generate);
        let input = FingerprintInput {
            version: FINGERPRINT_VERSION,
            platform,
            machine_id,
            installation_id,
            salt: salt.as_bytes(),
        };
        let mut encoded = rmp_serde::to_vec(&input)?;

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&encoded);
        encoded.zeroize();

        let mut digest = [0u8; FINGERPRINT_LENGTH];
        digest.copy_from_slice(&hasher.finalize());
        Ok((Self(digest), salt))
    }

    /// Creates a fingerprint from raw bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LENGTH] {
        &self.0
    }

    /// Full lowercase hex form (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the full 64-character hex form.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; FINGERPRINT_LENGTH];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ProtocolError::InvalidArgument(format!("invalid fingerprint: {}", e)))?;
        Ok(Self(bytes))
    }

    /// First 12 hex characters, for quick visual comparison.
    pub fn short_display(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_DISPLAY_LEN);
        hex
    }

    /// First 16 hex characters, grouped in fours: `a1b2-c3d4-e5f6-7890`.
    pub fn medium_display(&self) -> String {
        self.to_hex()[..MEDIUM_DISPLAY_LEN]
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Returns true if `prefix` is a hex prefix of this fingerprint.
    ///
    /// Separators (`-`, `:` and spaces) are ignored and the comparison is
    /// case-insensitive. Prefixes shorter than the short display form never
    /// match.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let normalized: String = prefix
            .chars()
            .filter(|c| !matches!(c, '-' | ':' | ' '))
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if normalized.len() < SHORT_DISPLAY_LEN || normalized.len() > FINGERPRINT_LENGTH * 2 {
            return false;
        }
        self.to_hex().starts_with(&normalized)
    }
}

impl std::fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.medium_display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_salt() -> FingerprintSalt {
        FingerprintSalt::from_bytes([7u8; SALT_LENGTH])
    }

    #[test]
    fn test_generate_is_deterministic_with_same_salt() {
        let (a, _) =
            DeviceFingerprint::generate("linux", "machine-1", "install-1", Some(fixed_salt()))
                .unwrap();
        let (b, _) =
            DeviceFingerprint::generate("linux", "machine-1", "install-1", Some(fixed_salt()))
                .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_without_salt_returns_new_salt() {
        let (a, salt_a) = DeviceFingerprint::generate("linux", "m", "i", None).unwrap();
        let (b, salt_b) = DeviceFingerprint::generate("linux", "m", "i", None).unwrap();
        assert_ne!(salt_a, salt_b);
        assert_ne!(a, b);

        // Regenerating with the returned salt reproduces the fingerprint
        let (again, _) = DeviceFingerprint::generate("linux", "m", "i", Some(salt_a)).unwrap();
        assert_eq!(a, again);
    }

    #[test]
    fn test_each_field_changes_the_fingerprint() {
        let (base, _) =
            DeviceFingerprint::generate("linux", "m", "i", Some(fixed_salt())).unwrap();
        let (platform, _) =
            DeviceFingerprint::generate("macos", "m", "i", Some(fixed_salt())).unwrap();
        let (machine, _) =
            DeviceFingerprint::generate("linux", "m2", "i", Some(fixed_salt())).unwrap();
        let (install, _) =
            DeviceFingerprint::generate("linux", "m", "i2", Some(fixed_salt())).unwrap();
        let (salted, _) = DeviceFingerprint::generate(
            "linux",
            "m",
            "i",
            Some(FingerprintSalt::from_bytes([8u8; SALT_LENGTH])),
        )
        .unwrap();

        for other in [platform, machine, install, salted] {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // Concatenation would make these collide; the structured encoding must not
        let (a, _) =
            DeviceFingerprint::generate("linux", "ab", "c", Some(fixed_salt())).unwrap();
        let (b, _) =
            DeviceFingerprint::generate("linux", "a", "bc", Some(fixed_salt())).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(matches!(
            DeviceFingerprint::generate("", "m", "i", None),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            DeviceFingerprint::generate("linux", "  ", "i", None),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            DeviceFingerprint::generate("linux", "m", "", None),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_display_forms() {
        let fp = DeviceFingerprint::from_bytes([0xab; FINGERPRINT_LENGTH]);
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(fp.short_display(), "abababababab");
        assert_eq!(fp.medium_display(), "abab-abab-abab-abab");
        assert_eq!(fp.to_string(), fp.medium_display());
    }

    #[test]
    fn test_hex_roundtrip() {
        let (fp, _) = DeviceFingerprint::generate("linux", "m", "i", None).unwrap();
        let parsed = DeviceFingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
        assert!(DeviceFingerprint::from_hex("not-hex").is_err());
        assert!(DeviceFingerprint::from_hex("abcd").is_err());
    }

    #[test]
    fn test_matches_prefix() {
        let (fp, _) = DeviceFingerprint::generate("linux", "m", "i", None).unwrap();
        assert!(fp.matches_prefix(&fp.short_display()));
        assert!(fp.matches_prefix(&fp.short_display().to_uppercase()));
        assert!(fp.matches_prefix(&fp.medium_display()));
        assert!(fp.matches_prefix(&fp.to_hex()));
        // Too short to be meaningful
        assert!(!fp.matches_prefix(&fp.to_hex()[..8]));
        let other = DeviceFingerprint::from_bytes([0u8; FINGERPRINT_LENGTH]);
        assert!(!other.matches_prefix(&fp.short_display()) || fp == other);
    }

    #[test]
    fn test_salt_hex_roundtrip_and_redacted_debug() {
        let salt = FingerprintSalt::generate();
        let restored = FingerprintSalt::from_hex(&salt.to_hex()).unwrap();
        assert_eq!(salt, restored);
        assert!(!format!("{:?}", salt).contains(&salt.to_hex()));
    }

    #[test]
    fn test_device_id_rejects_empty() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("   ").is_err());
        let id: DeviceId = "laptop-1".parse().unwrap();
        assert_eq!(id.as_str(), "laptop-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"laptop-1\"");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
    }
}
