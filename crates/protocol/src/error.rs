//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Input validation errors
    /// An argument was outside its accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A session code had the wrong length or an unknown symbol.
    #[error("invalid session code format: {0}")]
    InvalidFormat(String),

    /// A session code's checksum symbol did not match its body.
    #[error("session code checksum mismatch")]
    ChecksumMismatch,

    // Key material errors
    /// A remote public key was malformed or of low order.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A symmetric key had the wrong length for the selected cipher.
    #[error("invalid key length: expected {expected} bytes, got {got} bytes")]
    InvalidKeyLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        got: usize,
    },

    // AEAD errors
    /// Ciphertext or associated data failed authentication.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Buffer too short to contain a nonce and tag.
    #[error("malformed input: {len} bytes is shorter than the minimum of {min} bytes")]
    MalformedInput {
        /// Actual buffer length.
        len: usize,
        /// Minimum accepted length.
        min: usize,
    },

    /// The per-key message budget is spent.
    #[error("key rotation required: message budget for epoch {epoch} exhausted")]
    KeyRotationRequired {
        /// Epoch whose budget ran out.
        epoch: u64,
    },

    /// Key material was disposed and the object can no longer be used.
    #[error("key material has been disposed")]
    Disposed,

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_error_display() {
        let err = ProtocolError::InvalidArgument("platform must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "invalid argument: platform must not be empty"
        );
    }

    #[test]
    fn test_invalid_format_error_display() {
        let err = ProtocolError::InvalidFormat("expected 9 symbols, got 4".to_string());
        assert_eq!(
            err.to_string(),
            "invalid session code format: expected 9 symbols, got 4"
        );
    }

    #[test]
    fn test_checksum_mismatch_error_display() {
        let err = ProtocolError::ChecksumMismatch;
        assert_eq!(err.to_string(), "session code checksum mismatch");
    }

    #[test]
    fn test_invalid_key_error_display() {
        let err = ProtocolError::InvalidKey("low order point".to_string());
        assert_eq!(err.to_string(), "invalid key: low order point");
    }

    #[test]
    fn test_invalid_key_length_error_display() {
        let err = ProtocolError::InvalidKeyLength {
            expected: 32,
            got: 16,
        };
        assert_eq!(
            err.to_string(),
            "invalid key length: expected 32 bytes, got 16 bytes"
        );
    }

    #[test]
    fn test_authentication_failed_error_display() {
        let err = ProtocolError::AuthenticationFailed;
        assert_eq!(err.to_string(), "authentication failed");
    }

    #[test]
    fn test_malformed_input_error_display() {
        let err = ProtocolError::MalformedInput { len: 10, min: 28 };
        assert_eq!(
            err.to_string(),
            "malformed input: 10 bytes is shorter than the minimum of 28 bytes"
        );
    }

    #[test]
    fn test_key_rotation_required_error_display() {
        let err = ProtocolError::KeyRotationRequired { epoch: 3 };
        assert_eq!(
            err.to_string(),
            "key rotation required: message budget for epoch 3 exhausted"
        );
    }

    #[test]
    fn test_disposed_error_display() {
        assert_eq!(
            ProtocolError::Disposed.to_string(),
            "key material has been disposed"
        );
    }

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
