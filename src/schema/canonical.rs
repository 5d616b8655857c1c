//! Canonical JSON emission for schema blobs.
//!
//! A schema blob's BlobRef is the hash of its canonical byte form, so the
//! layout is fixed down to the byte: the first line is exactly
//! `{"camliVersion": N,`, the remaining top-level keys follow sorted
//! lexicographically with two-space indentation, and the object closes
//! with `}` on its own line.  The header line is emitted by hand; the
//! remainder rides on `serde_json`'s pretty printer, whose map backing is
//! already sorted.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Key carrying the schema version in every schema blob.
pub const VERSION_KEY: &str = "camliVersion";

/// Current schema version written by builders.
pub const SCHEMA_VERSION: u64 = 1;

/// Serializes a schema map into its canonical byte form.
///
/// The map must contain an integer `camliVersion` of at least 1 and at
/// least one further field.
pub fn canonical_json(map: &Map<String, Value>) -> Result<String> {
    let version = map
        .get(VERSION_KEY)
        .ok_or(Error::MissingField("camliVersion"))?;
    let version = version
        .as_u64()
        .filter(|v| *v >= 1)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("camliVersion must be a positive integer, got {version}"))
        })?;
    let mut rest = map.clone();
    rest.remove(VERSION_KEY);
    if rest.is_empty() {
        return Err(Error::InvalidArgument(
            "schema blob needs at least one field besides camliVersion".into(),
        ));
    }
    let pretty = serde_json::to_string_pretty(&Value::Object(rest))
        .map_err(|err| Error::InvalidArgument(format!("unserializable schema map: {err}")))?;
    let body = pretty.strip_prefix("{\n").ok_or_else(|| {
        Error::InvalidArgument("unexpected pretty-printer output for schema map".into())
    })?;
    Ok(format!("{{\"camliVersion\": {version},\n{body}"))
}

/// Re-emits arbitrary schema JSON in canonical form.
///
/// Canonicalization is idempotent: feeding the output back in yields the
/// same bytes.
pub fn canonicalize(json: &str) -> Result<String> {
    let value: Value = serde_json::from_str(json)
        .map_err(|err| Error::corrupt(None, format!("invalid schema JSON: {err}")))?;
    match value {
        Value::Object(map) => canonical_json(&map),
        other => Err(Error::InvalidArgument(format!(
            "schema blob must be a JSON object, got {other}"
        ))),
    }
}
