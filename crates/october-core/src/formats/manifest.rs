//! # Route Manifest Format
//!
//! A baked route table for themes served in production, so routing can
//! skip listing and parsing every page on a cold start.
//!
//! Format: Header (5 bytes) + postcard-serialized entries.
//! - 4 bytes: Magic ("OCRM")
//! - 1 byte: Version
//!
//! Size and header are validated before the payload is decoded.

use crate::CmsError;
use crate::primitives::{MANIFEST_MAGIC, MANIFEST_VERSION};
use serde::{Deserialize, Serialize};

/// Largest manifest accepted (16 MB).
pub const MAX_MANIFEST_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// One page and the URL pattern it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_name: String,
    pub pattern: String,
}

/// The header preceding every manifest payload.
#[derive(Debug, Clone, Copy)]
pub struct ManifestHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl ManifestHeader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *MANIFEST_MAGIC,
            version: MANIFEST_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), CmsError> {
        if &self.magic != MANIFEST_MAGIC {
            return Err(CmsError::Serialization(
                "Invalid route manifest magic bytes".to_string(),
            ));
        }
        if self.version != MANIFEST_VERSION {
            return Err(CmsError::Serialization(format!(
                "Unsupported route manifest version: {} (expected {})",
                self.version, MANIFEST_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CmsError> {
        let Some(head) = bytes.get(..HEADER_LEN) else {
            return Err(CmsError::Serialization(
                "Route manifest header too short".to_string(),
            ));
        };
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&head[0..4]);
        Ok(Self {
            magic,
            version: head[4],
        })
    }
}

impl Default for ManifestHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize route entries to bytes (header + payload).
pub fn manifest_to_bytes(entries: &[ManifestEntry]) -> Result<Vec<u8>, CmsError> {
    let payload =
        postcard::to_stdvec(entries).map_err(|e| CmsError::Serialization(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_LEN + payload.len());
    result.extend_from_slice(&ManifestHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize route entries, validating size and header first.
pub fn manifest_from_bytes(bytes: &[u8]) -> Result<Vec<ManifestEntry>, CmsError> {
    if bytes.len() > MAX_MANIFEST_SIZE {
        return Err(CmsError::Serialization(format!(
            "Route manifest is {} bytes, above the {} byte limit",
            bytes.len(),
            MAX_MANIFEST_SIZE
        )));
    }

    let header = ManifestHeader::from_bytes(bytes)?;
    header.validate()?;

    postcard::from_bytes(&bytes[HEADER_LEN..]).map_err(|e| {
        CmsError::Serialization(format!("Failed to decode route manifest: {}", e))
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ManifestEntry> {
        vec![
            ManifestEntry {
                file_name: "home.htm".into(),
                pattern: "/".into(),
            },
            ManifestEntry {
                file_name: "blog/post.htm".into(),
                pattern: "/blog/:post_id".into(),
            },
        ]
    }

    #[test]
    fn bytes_are_stable() {
        let first = manifest_to_bytes(&entries()).expect("encode");
        let decoded = manifest_from_bytes(&first).expect("decode");
        assert_eq!(decoded, entries());
        assert_eq!(manifest_to_bytes(&decoded).expect("encode"), first);
        assert_eq!(&first[0..4], b"OCRM");
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut bytes = manifest_to_bytes(&entries()).expect("encode");
        bytes[0..4].copy_from_slice(b"KREM");
        assert!(manifest_from_bytes(&bytes).is_err());
    }

    #[test]
    fn future_version_rejected() {
        let mut bytes = manifest_to_bytes(&entries()).expect("encode");
        bytes[4] = MANIFEST_VERSION + 1;
        assert!(manifest_from_bytes(&bytes).is_err());
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(manifest_from_bytes(b"OCR").is_err());
    }
}
