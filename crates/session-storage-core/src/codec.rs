use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// How session bytes are stored in the `sessdata` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    /// Bytes are stored as-is.
    #[default]
    Raw,
    /// Bytes are stored as standard base64 text.
    Base64,
}

impl DataEncoding {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DataEncoding::Raw => data.to_vec(),
            DataEncoding::Base64 => STANDARD.encode(data).into_bytes(),
        }
    }

    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            DataEncoding::Raw => Ok(stored.to_vec()),
            DataEncoding::Base64 => STANDARD.decode(stored).map_err(|e| {
                StorageError::Serialization(format!("Invalid base64 session data: {}", e))
            }),
        }
    }
}

impl std::fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataEncoding::Raw => write!(f, "raw"),
            DataEncoding::Base64 => write!(f, "base64"),
        }
    }
}

/// Hex SHA-256 of session bytes, used to skip redundant writes.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hash_is_stable() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"A"), content_hash(b"B"));
    }

    #[test]
    fn test_base64_decode_rejects_garbage() {
        let err = DataEncoding::Base64.decode(b"not base64!!").unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn test_base64_stores_text() {
        let stored = DataEncoding::Base64.encode(&[0xff, 0x00, 0x10]);
        assert_eq!(stored, b"/wAQ".to_vec());
        assert_eq!(DataEncoding::Base64.decode(&stored).unwrap(), vec![0xff, 0x00, 0x10]);
    }
}
