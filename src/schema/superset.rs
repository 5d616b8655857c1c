//! Permissive decoded form of a schema blob.
//!
//! A [`Superset`] is the union of every field any schema type can carry.
//! Parsing only enforces the envelope (a JSON object with `camliVersion`
//! and `camliType`); typed accessors then interpret the fields relevant
//! to one camliType and fail when asked about a different variant.

use crate::blobref::BlobRef;
use crate::error::{Error, Result};
use crate::schema::filename::{bytes_from_mixed_array, is_valid_name_bytes};
use crate::schema::time::Time3339;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The recognized schema blob types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CamliType {
    /// A named byte stream assembled from parts.
    File,
    /// An anonymous byte stream assembled from parts (subtree node).
    Bytes,
    /// A directory pointing at a static-set of children.
    Directory,
    /// A flat or merged list of directory children.
    StaticSet,
    /// A mutable object identity with a random seed.
    Permanode,
    /// A signed mutation on a permanode.
    Claim,
    /// A symbolic link.
    Symlink,
}

impl CamliType {
    /// Returns the wire name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Bytes => "bytes",
            Self::Directory => "directory",
            Self::StaticSet => "static-set",
            Self::Permanode => "permanode",
            Self::Claim => "claim",
            Self::Symlink => "symlink",
        }
    }

    /// Looks up a type by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(Self::File),
            "bytes" => Some(Self::Bytes),
            "directory" => Some(Self::Directory),
            "static-set" => Some(Self::StaticSet),
            "permanode" => Some(Self::Permanode),
            "claim" => Some(Self::Claim),
            "symlink" => Some(Self::Symlink),
            _ => None,
        }
    }
}

impl fmt::Display for CamliType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn offset_is_zero(v: &u64) -> bool {
    *v == 0
}

/// One element of a `file`/`bytes` blob's `parts` array.
///
/// Exactly one of `blob_ref` and `bytes_ref` may be set.  With neither
/// set the part is a sparse hole of `size` zero bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Raw blob supplying the part's bytes.
    #[serde(rename = "blobRef", default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<BlobRef>,
    /// Schema blob (`bytes`) whose reconstructed stream supplies the bytes.
    #[serde(rename = "bytesRef", default, skip_serializing_if = "Option::is_none")]
    pub bytes_ref: Option<BlobRef>,
    /// Number of bytes this part contributes.
    pub size: u64,
    /// Offset into the referenced stream at which the part begins.
    #[serde(default, skip_serializing_if = "offset_is_zero")]
    pub offset: u64,
}

impl Part {
    /// Validates the mutual-exclusion rule on the two refs.
    pub fn validate(&self) -> Result<()> {
        if self.blob_ref.is_some() && self.bytes_ref.is_some() {
            return Err(Error::corrupt(
                None,
                "part has both blobRef and bytesRef set",
            ));
        }
        Ok(())
    }

    /// Reports whether the part is a sparse hole (neither ref set).
    pub fn is_sparse(&self) -> bool {
        self.blob_ref.is_none() && self.bytes_ref.is_none()
    }
}

/// Union of all fields a schema blob may carry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Superset {
    /// Ref of the blob this superset was parsed from, when known.
    #[serde(skip)]
    pub blob_ref: Option<BlobRef>,
    /// Schema version; at least 1 in every valid blob.
    #[serde(rename = "camliVersion")]
    pub version: u64,
    /// The blob's camliType as a raw string.
    #[serde(rename = "camliType")]
    pub typ: String,
    /// Ref of the signer's public-key blob, present on signed blobs.
    #[serde(rename = "camliSigner")]
    pub signer: Option<BlobRef>,
    /// Armored signature text, present on signed blobs.
    #[serde(rename = "camliSig")]
    pub sig: Option<String>,
    /// UTF-8 file name, if representable.
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
    /// Mixed string/byte array file name for non-UTF-8 names.
    #[serde(rename = "fileNameBytes")]
    pub file_name_bytes: Option<Vec<Value>>,
    /// UTF-8 symlink target, if representable.
    #[serde(rename = "symlinkTarget")]
    pub symlink_target: Option<String>,
    /// Mixed string/byte array symlink target.
    #[serde(rename = "symlinkTargetBytes")]
    pub symlink_target_bytes: Option<Vec<Value>>,
    /// File modification time in RFC 3339 form.
    #[serde(rename = "unixMtime")]
    pub unix_mtime: Option<String>,
    /// Parts of a `file`/`bytes` blob.
    pub parts: Option<Vec<Part>>,
    /// Static-set ref of a `directory` blob.
    pub entries: Option<BlobRef>,
    /// Leaf children of a `static-set` blob.
    pub members: Vec<BlobRef>,
    /// Nested subsets of a `static-set` blob.
    #[serde(rename = "mergeSets")]
    pub merge_sets: Vec<BlobRef>,
    /// Random seed of a `permanode` blob.
    pub random: Option<String>,
    /// Claim kind (`set-attribute`, `add-attribute`, `del-attribute`).
    #[serde(rename = "claimType")]
    pub claim_type: Option<String>,
    /// Claim date in RFC 3339 form.
    #[serde(rename = "claimDate")]
    pub claim_date: Option<String>,
    /// Target permanode of a claim.
    #[serde(rename = "permaNode")]
    pub permanode: Option<BlobRef>,
    /// Attribute named by a claim.
    pub attribute: Option<String>,
    /// Value carried by a claim.
    pub value: Option<String>,
}

impl Superset {
    /// Parses schema blob bytes, recording the source ref when known.
    ///
    /// Enforces only the envelope: a JSON object with `camliVersion >= 1`
    /// and a non-empty `camliType`.
    pub fn parse(blob_ref: Option<BlobRef>, json: &[u8]) -> Result<Self> {
        let mut ss: Superset = serde_json::from_slice(json).map_err(|err| {
            Error::corrupt(
                blob_ref.as_ref().map(|br| br.to_string()),
                format!("invalid schema JSON: {err}"),
            )
        })?;
        if ss.version == 0 {
            return Err(Error::MissingField("camliVersion"));
        }
        if ss.typ.is_empty() {
            return Err(Error::MissingField("camliType"));
        }
        ss.blob_ref = blob_ref;
        Ok(ss)
    }

    /// Parses a schema map already decoded to JSON values.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let json = serde_json::to_vec(&Value::Object(map))
            .map_err(|err| Error::InvalidArgument(format!("unserializable map: {err}")))?;
        Self::parse(None, &json)
    }

    /// Returns the recognized camliType, if any.
    pub fn camli_type(&self) -> Option<CamliType> {
        CamliType::from_name(&self.typ)
    }

    /// Fails with `InvalidArgument` unless the blob has camliType `want`.
    pub fn require_type(&self, want: CamliType) -> Result<()> {
        if self.camli_type() == Some(want) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "expected camliType {want:?}, got {:?}",
                self.typ
            )))
        }
    }

    /// Decodes the raw file name bytes, preferring `fileName` over
    /// `fileNameBytes`.
    ///
    /// Names containing `/` or `\`, undecodable names, and absent names
    /// all come back empty.
    pub fn file_name_raw(&self) -> Vec<u8> {
        let bytes = decode_raw(self.file_name.as_deref(), self.file_name_bytes.as_deref());
        if is_valid_name_bytes(&bytes) {
            bytes
        } else {
            Vec::new()
        }
    }

    /// Returns the file name as a display string (lossy for non-UTF-8).
    pub fn file_name(&self) -> String {
        String::from_utf8_lossy(&self.file_name_raw()).into_owned()
    }

    /// Decodes the raw symlink target bytes.
    ///
    /// Targets are full paths, so separators are allowed here.
    pub fn symlink_target_raw(&self) -> Vec<u8> {
        decode_raw(
            self.symlink_target.as_deref(),
            self.symlink_target_bytes.as_deref(),
        )
    }

    /// Returns the parts list of a `file`/`bytes` blob.
    pub fn file_parts(&self) -> Result<&[Part]> {
        match self.camli_type() {
            Some(CamliType::File) | Some(CamliType::Bytes) => self
                .parts
                .as_deref()
                .ok_or(Error::MissingField("parts")),
            _ => Err(Error::InvalidArgument(format!(
                "no parts on camliType {:?}",
                self.typ
            ))),
        }
    }

    /// Sums the declared part sizes; the declared stream length.
    pub fn total_part_size(&self) -> u64 {
        self.parts
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| p.size)
            .sum()
    }

    /// Returns the parsed mtime, if present and well-formed.
    pub fn mtime(&self) -> Option<Time3339> {
        self.unix_mtime
            .as_deref()
            .and_then(|s| Time3339::parse(s).ok())
    }

    /// Returns the parsed claim date of a `claim` blob.
    pub fn parsed_claim_date(&self) -> Result<Time3339> {
        self.require_type(CamliType::Claim)?;
        let raw = self
            .claim_date
            .as_deref()
            .ok_or(Error::MissingField("claimDate"))?;
        Time3339::parse(raw)
    }
}

fn decode_raw(utf8: Option<&str>, mixed: Option<&[Value]>) -> Vec<u8> {
    match (utf8, mixed) {
        (Some(s), _) => s.as_bytes().to_vec(),
        (None, Some(parts)) => bytes_from_mixed_array(parts).unwrap_or_default(),
        (None, None) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{CamliType, Part, Superset};
    use crate::blobref::{Algorithm, BlobRef};
    use crate::error::ErrorKind;

    #[test]
    fn parse_requires_envelope() {
        let ok = Superset::parse(None, b"{\"camliVersion\": 1, \"camliType\": \"file\"}").unwrap();
        assert_eq!(ok.camli_type(), Some(CamliType::File));

        let no_version = Superset::parse(None, b"{\"camliType\": \"file\"}").unwrap_err();
        assert_eq!(no_version.kind(), ErrorKind::MissingField);

        let no_type = Superset::parse(None, b"{\"camliVersion\": 1}").unwrap_err();
        assert_eq!(no_type.kind(), ErrorKind::MissingField);

        let garbage = Superset::parse(None, b"...").unwrap_err();
        assert_eq!(garbage.kind(), ErrorKind::CorruptBlob);
    }

    #[test]
    fn unknown_type_is_kept_raw() {
        let ss =
            Superset::parse(None, b"{\"camliVersion\": 1, \"camliType\": \"fancy\"}").unwrap();
        assert_eq!(ss.camli_type(), None);
        assert_eq!(ss.typ, "fancy");
        assert!(ss.require_type(CamliType::File).is_err());
    }

    #[test]
    fn file_name_rules() {
        let json = b"{\"camliVersion\":1,\"camliType\":\"file\",\"fileName\":\"a.txt\",\"parts\":[]}";
        assert_eq!(Superset::parse(None, json).unwrap().file_name(), "a.txt");

        let slash =
            b"{\"camliVersion\":1,\"camliType\":\"file\",\"fileName\":\"a/b\",\"parts\":[]}";
        assert_eq!(Superset::parse(None, slash).unwrap().file_name(), "");

        let mixed = b"{\"camliVersion\":1,\"camliType\":\"file\",\"fileNameBytes\":[\"Am\",233,\"lie.jpg\"],\"parts\":[]}";
        let name = Superset::parse(None, mixed).unwrap().file_name_raw();
        assert_eq!(name, b"Am\xe9lie.jpg");
        assert_eq!(name.len(), 10);
    }

    #[test]
    fn parts_accessors() {
        let json = b"{\"camliVersion\":1,\"camliType\":\"file\",\"parts\":[{\"blobRef\":\"sha1-aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d\",\"size\":5},{\"size\":100}]}";
        let ss = Superset::parse(None, json).unwrap();
        let parts = ss.file_parts().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[1].is_sparse());
        assert_eq!(ss.total_part_size(), 105);
    }

    #[test]
    fn part_both_refs_is_rejected() {
        let br = BlobRef::for_bytes(Algorithm::Sha1, b"x");
        let part = Part {
            blob_ref: Some(br.clone()),
            bytes_ref: Some(br),
            size: 1,
            offset: 0,
        };
        assert_eq!(part.validate().unwrap_err().kind(), ErrorKind::CorruptBlob);
    }
}
