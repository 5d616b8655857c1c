//! Construction of schema blobs.
//!
//! A [`Builder`] accumulates the JSON fields of one schema blob and
//! freezes them into a [`SchemaBlob`]: the canonical JSON bytes plus the
//! blob ref computed over them.  Builders never mutate stored blobs;
//! freezing the same fields always yields the same ref.

use crate::blobref::{Algorithm, BlobRef};
use crate::error::{Error, Result};
use crate::schema::canonical::{canonical_json, SCHEMA_VERSION, VERSION_KEY};
use crate::schema::filename::{is_valid_name_bytes, mixed_array_from_bytes};
use crate::schema::superset::{CamliType, Part, Superset};
use crate::schema::time::{format_rfc3339, Time3339};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::{Map, Value};
use std::fmt;

/// Number of random bytes seeding a new permanode.
const PERMANODE_RANDOM_LEN: usize = 20;

/// The recognized claim kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimType {
    /// Replace an attribute's values with a single value.
    SetAttribute,
    /// Append a value to an attribute.
    AddAttribute,
    /// Remove one value of an attribute, or the whole attribute.
    DelAttribute,
}

impl ClaimType {
    /// Returns the wire name of the claim kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetAttribute => "set-attribute",
            Self::AddAttribute => "add-attribute",
            Self::DelAttribute => "del-attribute",
        }
    }

    /// Looks up a claim kind by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "set-attribute" => Some(Self::SetAttribute),
            "add-attribute" => Some(Self::AddAttribute),
            "del-attribute" => Some(Self::DelAttribute),
            _ => None,
        }
    }
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frozen schema blob: canonical JSON plus the ref computed over it.
#[derive(Debug, Clone)]
pub struct SchemaBlob {
    blob_ref: BlobRef,
    json: String,
    ss: Superset,
}

impl SchemaBlob {
    /// Computes the ref over already-serialized schema JSON and parses it.
    ///
    /// Used for signed claims, whose bytes are fixed by the signer and
    /// must not be re-canonicalized.
    pub fn from_json(json: impl Into<String>) -> Result<Self> {
        let json = json.into();
        let blob_ref = BlobRef::for_bytes(Algorithm::default(), json.as_bytes());
        let ss = Superset::parse(Some(blob_ref.clone()), json.as_bytes())?;
        Ok(Self { blob_ref, json, ss })
    }

    /// Returns the blob's content address.
    pub fn blob_ref(&self) -> &BlobRef {
        &self.blob_ref
    }

    /// Returns the blob's exact byte form.
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Returns the parsed superset view of the blob.
    pub fn superset(&self) -> &Superset {
        &self.ss
    }

    /// Returns the blob's recognized camliType, if any.
    pub fn camli_type(&self) -> Option<CamliType> {
        self.ss.camli_type()
    }
}

/// Accumulates fields for one schema blob.
#[derive(Debug, Clone)]
pub struct Builder {
    m: Map<String, Value>,
}

impl Builder {
    fn base(typ: CamliType) -> Self {
        let mut m = Map::new();
        m.insert(VERSION_KEY.to_string(), Value::from(SCHEMA_VERSION));
        m.insert("camliType".to_string(), Value::from(typ.as_str()));
        Self { m }
    }

    /// Starts a `file` blob.
    pub fn new_file() -> Self {
        Self::base(CamliType::File)
    }

    /// Starts an anonymous `bytes` blob.
    pub fn new_bytes() -> Self {
        Self::base(CamliType::Bytes)
    }

    /// Starts a `directory` blob pointing at a static-set of children.
    pub fn new_directory(entries: &BlobRef) -> Self {
        let mut b = Self::base(CamliType::Directory);
        b.m.insert("entries".to_string(), Value::from(entries.to_string()));
        b
    }

    /// Starts a `static-set` blob; fill it with [`set_members`] or
    /// [`set_merge_sets`].
    ///
    /// [`set_members`]: Self::set_members
    /// [`set_merge_sets`]: Self::set_merge_sets
    pub fn new_static_set() -> Self {
        Self::base(CamliType::StaticSet)
    }

    /// Starts a `symlink` blob with the given target.
    ///
    /// Unlike file names, targets are full paths and may contain
    /// separators.
    pub fn new_symlink(target: &[u8]) -> Result<Self> {
        if target.is_empty() {
            return Err(Error::InvalidArgument("empty symlink target".into()));
        }
        let mut b = Self::base(CamliType::Symlink);
        b.set_raw_name_field(target, "symlinkTarget", "symlinkTargetBytes");
        Ok(b)
    }

    /// Starts a `permanode` blob with a fresh random seed.
    ///
    /// The blob is only valid once signed.
    pub fn new_permanode() -> Self {
        let mut seed = [0u8; PERMANODE_RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        let mut b = Self::base(CamliType::Permanode);
        b.m.insert(
            "random".to_string(),
            Value::from(base64_seed(&seed)),
        );
        b
    }

    /// Starts a bare `claim` blob against `permanode`.
    pub fn new_claim(permanode: &BlobRef, claim_type: ClaimType, date: Time3339) -> Self {
        let mut b = Self::base(CamliType::Claim);
        b.m.insert(
            "permaNode".to_string(),
            Value::from(permanode.to_string()),
        );
        b.m.insert(
            "claimType".to_string(),
            Value::from(claim_type.as_str()),
        );
        b.m.insert(
            "claimDate".to_string(),
            Value::from(date.as_str().to_string()),
        );
        b
    }

    /// Builds a `set-attribute` claim.
    pub fn new_set_attribute(
        permanode: &BlobRef,
        attr: &str,
        value: &str,
        date: Time3339,
    ) -> Self {
        let mut b = Self::new_claim(permanode, ClaimType::SetAttribute, date);
        b.m.insert("attribute".to_string(), Value::from(attr));
        b.m.insert("value".to_string(), Value::from(value));
        b
    }

    /// Builds an `add-attribute` claim.
    pub fn new_add_attribute(
        permanode: &BlobRef,
        attr: &str,
        value: &str,
        date: Time3339,
    ) -> Self {
        let mut b = Self::new_claim(permanode, ClaimType::AddAttribute, date);
        b.m.insert("attribute".to_string(), Value::from(attr));
        b.m.insert("value".to_string(), Value::from(value));
        b
    }

    /// Builds a `del-attribute` claim; with `value` absent the whole
    /// attribute is removed.
    pub fn new_del_attribute(
        permanode: &BlobRef,
        attr: &str,
        value: Option<&str>,
        date: Time3339,
    ) -> Self {
        let mut b = Self::new_claim(permanode, ClaimType::DelAttribute, date);
        b.m.insert("attribute".to_string(), Value::from(attr));
        if let Some(value) = value {
            b.m.insert("value".to_string(), Value::from(value));
        }
        b
    }

    /// Sets the file name from raw bytes, choosing `fileName` or
    /// `fileNameBytes` by UTF-8 validity.
    pub fn set_file_name(&mut self, raw: &[u8]) -> Result<()> {
        self.set_name_field(raw, "fileName", "fileNameBytes")
    }

    fn set_name_field(
        &mut self,
        raw: &[u8],
        utf8_key: &str,
        bytes_key: &str,
    ) -> Result<()> {
        if !is_valid_name_bytes(raw) {
            return Err(Error::InvalidArgument(format!(
                "invalid name {:?}",
                String::from_utf8_lossy(raw)
            )));
        }
        self.set_raw_name_field(raw, utf8_key, bytes_key);
        Ok(())
    }

    fn set_raw_name_field(&mut self, raw: &[u8], utf8_key: &str, bytes_key: &str) {
        self.m.remove(utf8_key);
        self.m.remove(bytes_key);
        match std::str::from_utf8(raw) {
            Ok(s) => {
                self.m.insert(utf8_key.to_string(), Value::from(s));
            }
            Err(_) => {
                self.m.insert(
                    bytes_key.to_string(),
                    Value::Array(mixed_array_from_bytes(raw)),
                );
            }
        }
    }

    /// Sets the file modification time.
    pub fn set_unix_mtime(&mut self, t: DateTime<Utc>) {
        self.m.insert(
            "unixMtime".to_string(),
            Value::from(format_rfc3339(&t)),
        );
    }

    /// Sets the parts of a `file`/`bytes` blob.
    pub fn set_parts(&mut self, parts: &[Part]) -> Result<()> {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            part.validate()?;
            let value = serde_json::to_value(part)
                .map_err(|err| Error::InvalidArgument(format!("unserializable part: {err}")))?;
            out.push(value);
        }
        self.m.insert("parts".to_string(), Value::Array(out));
        Ok(())
    }

    /// Sets the leaf members of a `static-set` blob.
    pub fn set_members(&mut self, refs: &[BlobRef]) {
        let members: Vec<Value> = refs.iter().map(|r| Value::from(r.to_string())).collect();
        self.m.insert("members".to_string(), Value::Array(members));
    }

    /// Sets the nested subsets of a `static-set` blob.
    pub fn set_merge_sets(&mut self, refs: &[BlobRef]) {
        let sets: Vec<Value> = refs.iter().map(|r| Value::from(r.to_string())).collect();
        self.m.insert("mergeSets".to_string(), Value::Array(sets));
    }

    /// Sets an arbitrary top-level field.
    pub fn set_raw(&mut self, key: &str, value: Value) {
        self.m.insert(key.to_string(), value);
    }

    /// Returns the accumulated field map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.m
    }

    /// Consumes the builder, returning the field map.
    pub fn into_map(self) -> Map<String, Value> {
        self.m
    }

    /// Serializes the accumulated fields into canonical JSON.
    pub fn json(&self) -> Result<String> {
        canonical_json(&self.m)
    }

    /// Freezes the builder into a schema blob.
    pub fn blob(&self) -> Result<SchemaBlob> {
        SchemaBlob::from_json(self.json()?)
    }
}

fn base64_seed(seed: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    BASE64.encode(seed)
}
