//! Human-typable session codes.
//!
//! A session code is 8 uniformly random symbols followed by a checksum
//! symbol, drawn from a 32-symbol alphabet with the easily confused
//! characters `I`, `O`, `0` and `1` removed. 8 random symbols carry 40 bits
//! of entropy.
//!
//! The checksum is a weighted sum `Σ (2i + 1) · v(i) mod 32`. Every odd weight
//! is invertible modulo 32, so any single-symbol substitution in the random
//! part changes the checksum.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// The code alphabet, indexed by symbol value.
pub const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of random symbols in a code.
pub const CODE_RANDOM_LEN: usize = 8;

/// Total symbols in a code, including the checksum.
pub const CODE_LEN: usize = CODE_RANDOM_LEN + 1;

/// A validated session code in canonical form (9 uppercase symbols).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

fn symbol_value(symbol: u8) -> Option<u8> {
    ALPHABET.iter().position(|&s| s == symbol).map(|v| v as u8)
}

fn checksum(values: &[u8]) -> u8 {
    let sum: u32 = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (2 * i as u32 + 1) * v as u32)
        .sum();
    (sum % 32) as u8
}

impl SessionCode {
    /// Generates a fresh code from the operating system's CSPRNG.
    ///
    /// The alphabet size divides 256, so masking a random byte to five bits
    /// is unbiased.
    pub fn generate() -> Self {
        let mut random = [0u8; CODE_RANDOM_LEN];
        OsRng.fill_bytes(&mut random);
        let values: Vec<u8> = random.iter().map(|b| b & 0x1f).collect();

        let mut code = String::with_capacity(CODE_LEN);
        for &v in &values {
            code.push(ALPHABET[v as usize] as char);
        }
        code.push(ALPHABET[checksum(&values) as usize] as char);
        Self(code)
    }

    /// Parses an untrusted code.
    ///
    /// Input is normalized first: surrounding whitespace, `-` separators and
    /// inner spaces are removed and letters are uppercased.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| !matches!(c, '-' | ' ' | '\t'))
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != CODE_LEN {
            return Err(ProtocolError::InvalidFormat(format!(
                "expected {} symbols, got {}",
                CODE_LEN,
                normalized.chars().count()
            )));
        }

        let mut values = Vec::with_capacity(CODE_LEN);
        for (i, byte) in normalized.bytes().enumerate() {
            match symbol_value(byte) {
                Some(v) => values.push(v),
                None => {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "symbol at position {} is not in the code alphabet",
                        i
                    )))
                }
            }
        }

        if checksum(&values[..CODE_RANDOM_LEN]) != values[CODE_RANDOM_LEN] {
            return Err(ProtocolError::ChecksumMismatch);
        }

        Ok(Self(normalized))
    }

    /// Returns true if `input` parses as a valid code.
    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    /// Canonical 9-symbol form, as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display form with separators: `ABCD-EFGH-K`.
    pub fn to_display(&self) -> String {
        format!("{}-{}-{}", &self.0[..4], &self.0[4..8], &self.0[8..])
    }
}

impl std::fmt::Display for SessionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_display())
    }
}

impl std::str::FromStr for SessionCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}
