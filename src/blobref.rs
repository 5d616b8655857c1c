//! Content-address identity for blobs.
//!
//! A [`BlobRef`] names an opaque byte sequence by the hash of its contents.
//! The canonical string form is `<algo>-<lowercase-hex-digest>`, and the
//! algorithm registry is closed: only the algorithms listed in
//! [`Algorithm`] are recognized, each with a fixed digest length.  Parsing
//! is strict; anything that is not a recognized algorithm followed by a
//! digest of exactly the right length is rejected.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use sha2::Sha224;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Largest digest length (in bytes) among the recognized algorithms.
pub const MAX_DIGEST_LEN: usize = 28;

/// The closed registry of recognized hash algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-1, 20-byte digest. The default for newly written blobs.
    #[default]
    Sha1,
    /// SHA-224, 28-byte digest.
    Sha224,
}

impl Algorithm {
    /// Returns the lowercase wire name of the algorithm.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
        }
    }

    /// Returns the digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
        }
    }

    /// Returns the digest length in lowercase hex characters.
    pub fn hex_len(self) -> usize {
        self.digest_len() * 2
    }

    /// Looks up an algorithm by wire name. Unknown names return `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha224" => Some(Self::Sha224),
            _ => None,
        }
    }

    /// Creates an incremental hasher for this algorithm.
    pub fn new_hasher(self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Sha224 => Hasher::Sha224(Sha224::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher matching one of the recognized algorithms.
pub enum Hasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-224 state.
    Sha224(Sha224),
}

impl Hasher {
    /// Feeds bytes into the hash state.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
        }
    }

    /// Returns the algorithm this hasher computes.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Sha1(_) => Algorithm::Sha1,
            Self::Sha224(_) => Algorithm::Sha224,
        }
    }

    /// Consumes the hasher and returns the finalized digest bytes.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha224(h) => h.finalize().to_vec(),
        }
    }
}

/// A content-address: algorithm plus digest, printed as `<algo>-<hex>`.
///
/// `BlobRef` values are immutable and always valid; every constructor
/// checks the digest length against the algorithm.  Equality and ordering
/// agree with equality and ordering of the canonical string form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    algo: Algorithm,
    digest: [u8; MAX_DIGEST_LEN],
    len: u8,
}

impl BlobRef {
    /// Parses the strict `<algo>-<lowercase-hex>` form.
    ///
    /// Unknown algorithms, wrong digest lengths, uppercase hex, or any
    /// other deviation returns `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, hex_digest) = s.split_once('-')?;
        let algo = Algorithm::from_name(name)?;
        if hex_digest.len() != algo.hex_len() {
            return None;
        }
        if !hex_digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        let bytes = hex::decode(hex_digest).ok()?;
        Self::from_hash(algo, &bytes).ok()
    }

    /// Builds a ref from an algorithm and raw digest bytes.
    ///
    /// Fails with `InvalidArgument` if the digest length does not match
    /// the algorithm.
    pub fn from_hash(algo: Algorithm, digest: &[u8]) -> Result<Self> {
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidArgument(format!(
                "digest length {} does not match algorithm {algo}",
                digest.len()
            )));
        }
        let mut buf = [0u8; MAX_DIGEST_LEN];
        buf[..digest.len()].copy_from_slice(digest);
        Ok(Self {
            algo,
            digest: buf,
            len: digest.len() as u8,
        })
    }

    /// Hashes `data` with `algo` and returns the resulting ref.
    pub fn for_bytes(algo: Algorithm, data: &[u8]) -> Self {
        let mut hasher = algo.new_hasher();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Finalizes `hasher` and returns the resulting ref.
    pub fn from_hasher(hasher: Hasher) -> Self {
        let algo = hasher.algorithm();
        let digest = hasher.finalize();
        let mut buf = [0u8; MAX_DIGEST_LEN];
        buf[..digest.len()].copy_from_slice(&digest);
        Self {
            algo,
            digest: buf,
            len: digest.len() as u8,
        }
    }

    /// Consumes a finalized hasher and reports whether its digest equals
    /// this ref's digest.
    pub fn hash_matches(&self, hasher: Hasher) -> bool {
        hasher.algorithm() == self.algo && hasher.finalize() == self.digest()
    }

    /// Returns the raw digest bytes.
    pub fn digest(&self) -> &[u8] {
        &self.digest[..self.len as usize]
    }

    /// Returns the hash algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algo
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algo, hex::encode(self.digest()))
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({self})")
    }
}

impl Ord for BlobRef {
    fn cmp(&self, other: &Self) -> Ordering {
        // Comparing (name, digest) agrees with comparing the canonical
        // string forms: names diverge before the dash, and lowercase hex
        // preserves byte order.
        self.algo
            .name()
            .cmp(other.algo.name())
            .then_with(|| self.digest().cmp(other.digest()))
    }
}

impl PartialOrd for BlobRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidArgument(format!("invalid blob ref {s:?}")))
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid blob ref {s:?}")))
    }
}

/// A blob ref paired with the blob's size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedRef {
    /// The blob's content address.
    pub blob_ref: BlobRef,
    /// The blob's size in bytes.
    pub size: u64,
}
