//! # Formats Module
//!
//! On-disk file formats. Pure byte transformations; file I/O stays with
//! the callers.

mod manifest;

pub use manifest::{
    MAX_MANIFEST_SIZE, ManifestEntry, ManifestHeader, manifest_from_bytes, manifest_to_bytes,
};
