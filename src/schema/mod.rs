//! The schema-blob model layered over raw blobs.
//!
//! Schema blobs are raw blobs whose bytes are JSON objects in a canonical
//! layout; the hash of that layout is the blob's identity, so builders and
//! parsers here are careful about every byte.  Higher-level objects
//! (files, directories, permanodes, claims) are all expressed as schema
//! blobs referencing other blobs by content address.

/// Construction of schema blobs and claims.
pub mod builder;
/// Canonical JSON byte layout.
pub mod canonical;
/// Byte-safe file name encoding.
pub mod filename;
/// Permissive parsed view of any schema blob.
pub mod superset;
/// RFC 3339 timestamps inside schema blobs.
pub mod time;

pub use builder::{Builder, ClaimType, SchemaBlob};
pub use canonical::{canonical_json, canonicalize, SCHEMA_VERSION};
pub use filename::{bytes_from_mixed_array, is_valid_name, mixed_array_from_bytes};
pub use superset::{CamliType, Part, Superset};
pub use time::{format_rfc3339, Time3339};
