//! Detached signing of schema blobs.
//!
//! Only `permanode` and `claim` blobs are signable.  The signature is
//! computed over the canonical JSON from the opening `{` up to (but not
//! including) the final `}`, and then spliced into the document itself:
//! the closing brace is replaced by `,"camliSig":"<armored>"}`.  Because
//! the signed bytes are a prefix of the stored bytes, verification can
//! split the document at the last `,"camliSig":` token and check the
//! prefix against the armored signature.
//!
//! Keys are ed25519.  The armored public key text is itself stored as a
//! blob; its ref is the `camliSigner` value, and verifiers fetch it
//! through any [`BlobFetcher`].

use crate::blobref::{Algorithm, BlobRef, SizedRef};
use crate::error::{Error, Result};
use crate::schema::canonical::canonical_json;
use crate::schema::superset::{CamliType, Superset};
use crate::schema::time::{format_rfc3339, Time3339};
use crate::schema::Builder;
use crate::store::{fetch_bytes, BlobFetcher, BlobReceiver};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Armor block label for public keys.
pub const PUBLIC_KEY_BLOCK: &str = "ED25519 PUBLIC KEY";

/// Armor block label for signatures.
pub const SIGNATURE_BLOCK: &str = "ED25519 SIGNATURE";

/// Token separating the signed prefix from the spliced signature.
const SIG_SEPARATOR: &str = ",\"camliSig\":";

const ARMOR_WIDTH: usize = 64;

/// Wraps bytes in an ASCII armor block with optional headers.
pub fn armor(block: &str, headers: &[(&str, String)], data: &[u8]) -> String {
    let mut out = format!("-----BEGIN {block}-----\n");
    for (key, value) in headers {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    let b64 = BASE64.encode(data);
    let mut rest = b64.as_str();
    while !rest.is_empty() {
        let line = rest.len().min(ARMOR_WIDTH);
        out.push_str(&rest[..line]);
        out.push('\n');
        rest = &rest[line..];
    }
    out.push_str("-----END ");
    out.push_str(block);
    out.push_str("-----\n");
    out
}

/// Parses an ASCII armor block, returning its headers and payload.
pub fn dearmor(block: &str, text: &str) -> Result<(Vec<(String, String)>, Vec<u8>)> {
    let begin = format!("-----BEGIN {block}-----");
    let end = format!("-----END {block}-----");
    let mut lines = text.lines().map(str::trim_end);
    match lines.next() {
        Some(line) if line == begin => {}
        _ => {
            return Err(Error::SignatureInvalid(format!(
                "missing {begin:?} marker"
            )))
        }
    }
    let mut headers = Vec::new();
    let mut b64 = String::new();
    let mut in_headers = true;
    for line in lines {
        if line == end {
            let data = BASE64
                .decode(b64.as_bytes())
                .map_err(|err| Error::SignatureInvalid(format!("bad armor base64: {err}")))?;
            return Ok((headers, data));
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            match line.split_once(": ") {
                Some((key, value)) => headers.push((key.to_string(), value.to_string())),
                // Header section without a blank separator; treat the
                // line as payload.
                None => {
                    in_headers = false;
                    b64.push_str(line);
                }
            }
            continue;
        }
        b64.push_str(line);
    }
    Err(Error::SignatureInvalid(format!("missing {end:?} marker")))
}

/// Returns the hex fingerprint of a verifying key.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// A signing identity: ed25519 key pair plus the armored public key blob.
pub struct KeySigner {
    signing: SigningKey,
    verifying: VerifyingKey,
    pub_ref: BlobRef,
    armored_public_key: String,
    key_id: String,
    sig_time: Option<DateTime<Utc>>,
}

impl KeySigner {
    /// Wraps an existing signing key.
    pub fn new(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let armored_public_key = armor(PUBLIC_KEY_BLOCK, &[], verifying.as_bytes());
        let pub_ref = BlobRef::for_bytes(Algorithm::default(), armored_public_key.as_bytes());
        let key_id = key_fingerprint(&verifying);
        Self {
            signing,
            verifying,
            pub_ref,
            armored_public_key,
            key_id,
            sig_time: None,
        }
    }

    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Derives a deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(&seed))
    }

    /// Returns the ref of the armored public key blob.
    pub fn public_key_ref(&self) -> &BlobRef {
        &self.pub_ref
    }

    /// Returns the armored public key text.
    pub fn armored_public_key(&self) -> &str {
        &self.armored_public_key
    }

    /// Returns the hex fingerprint of the public key.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Pins the time recorded in signature armor; unset means "now".
    pub fn set_signature_time(&mut self, t: DateTime<Utc>) {
        self.sig_time = Some(t);
    }

    /// Stores the armored public key blob so verifiers can fetch it.
    pub async fn upload_public_key(&self, dst: &dyn BlobReceiver) -> Result<SizedRef> {
        let mut rd = self.armored_public_key.as_bytes();
        dst.receive(&self.pub_ref, &mut rd).await
    }

    /// Signs a schema map, returning the full signed JSON document.
    ///
    /// Any existing `camliSig` is discarded; `camliSigner` is set to this
    /// identity's public key ref before canonicalization.
    pub fn sign_json(&self, map: &Map<String, Value>) -> Result<String> {
        let typ = map
            .get("camliType")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("camliType"))?;
        match CamliType::from_name(typ) {
            Some(CamliType::Permanode) | Some(CamliType::Claim) => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "cannot sign camliType {typ:?}"
                )))
            }
        }
        let mut m = map.clone();
        m.remove("camliSig");
        m.insert(
            "camliSigner".to_string(),
            Value::from(self.pub_ref.to_string()),
        );
        let canonical = canonical_json(&m)?;
        let close = canonical
            .rfind('}')
            .ok_or_else(|| Error::InvalidArgument("canonical JSON has no closing brace".into()))?;
        let payload = &canonical[..close];
        let sig = self.signing.sign(payload.as_bytes());
        let when = self.sig_time.unwrap_or_else(Utc::now);
        let armored = armor(
            SIGNATURE_BLOCK,
            &[("Time", format_rfc3339(&when))],
            &sig.to_bytes(),
        );
        let sig_json = serde_json::to_string(&Value::from(armored))
            .map_err(|err| Error::InvalidArgument(format!("unserializable signature: {err}")))?;
        Ok(format!("{payload}{SIG_SEPARATOR}{sig_json}}}\n"))
    }

    /// Convenience wrapper over [`sign_json`] for a builder.
    ///
    /// [`sign_json`]: Self::sign_json
    pub fn sign_builder(&self, builder: &Builder) -> Result<String> {
        self.sign_json(builder.as_map())
    }

    /// Returns the verifying half of the key pair.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }
}

/// Result of a successful signature verification.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    /// The unsigned payload fields (everything but `camliSig`).
    pub payload: Map<String, Value>,
    /// Ref of the public key blob named by `camliSigner`.
    pub signer_ref: BlobRef,
    /// Hex fingerprint of the verified public key.
    pub signer_key_id: String,
    /// Signature time recorded in the armor, when present.
    pub sig_time: Option<Time3339>,
}

impl VerifiedSignature {
    /// Parses the payload as a schema superset.
    pub fn superset(&self) -> Result<Superset> {
        Superset::from_map(self.payload.clone())
    }
}

/// Verifies a signed schema document.
///
/// The signer's armored public key blob is fetched through `key_fetcher`
/// by the ref in `camliSigner`.  On success the payload map, signer ref,
/// and key fingerprint are returned.
pub async fn verify_json(
    signed: &str,
    key_fetcher: &dyn BlobFetcher,
) -> Result<VerifiedSignature> {
    let idx = signed.rfind(SIG_SEPARATOR).ok_or_else(|| {
        Error::SignatureInvalid("document carries no camliSig".into())
    })?;
    let payload_bytes = &signed[..idx];

    let full: Value = serde_json::from_str(signed)
        .map_err(|err| Error::SignatureInvalid(format!("signed document does not parse: {err}")))?;
    let full = full
        .as_object()
        .ok_or_else(|| Error::SignatureInvalid("signed document is not an object".into()))?;
    let armored_sig = full
        .get("camliSig")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SignatureInvalid("camliSig missing or not a string".into()))?;

    let payload_json = format!("{payload_bytes}}}");
    let payload: Value = serde_json::from_str(&payload_json).map_err(|err| {
        Error::SignatureInvalid(format!("unsigned prefix does not parse: {err}"))
    })?;
    let payload = match payload {
        Value::Object(m) => m,
        _ => {
            return Err(Error::SignatureInvalid(
                "unsigned prefix is not an object".into(),
            ))
        }
    };
    let typ = payload
        .get("camliType")
        .and_then(Value::as_str)
        .ok_or(Error::MissingField("camliType"))?;
    match CamliType::from_name(typ) {
        Some(CamliType::Permanode) | Some(CamliType::Claim) => {}
        _ => {
            return Err(Error::SignatureInvalid(format!(
                "camliType {typ:?} is not signable"
            )))
        }
    }
    let signer_str = payload
        .get("camliSigner")
        .and_then(Value::as_str)
        .ok_or(Error::MissingField("camliSigner"))?;
    let signer_ref = BlobRef::parse(signer_str).ok_or_else(|| {
        Error::SignatureInvalid(format!("invalid camliSigner ref {signer_str:?}"))
    })?;

    let key_blob = fetch_bytes(key_fetcher, &signer_ref)
        .await
        .map_err(|err| err.context("fetching signer public key"))?;
    let key_text = std::str::from_utf8(&key_blob)
        .map_err(|_| Error::SignatureInvalid("public key blob is not UTF-8".into()))?;
    let (_, key_bytes) = dearmor(PUBLIC_KEY_BLOCK, key_text)?;
    let verifying = VerifyingKey::try_from(key_bytes.as_slice())
        .map_err(|err| Error::SignatureInvalid(format!("bad public key: {err}")))?;

    let (headers, sig_bytes) = dearmor(SIGNATURE_BLOCK, armored_sig)?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|err| Error::SignatureInvalid(format!("bad signature bytes: {err}")))?;
    verifying
        .verify(payload_bytes.as_bytes(), &signature)
        .map_err(|_| Error::SignatureInvalid("signature does not verify".into()))?;

    let sig_time = headers
        .iter()
        .find(|(key, _)| key == "Time")
        .and_then(|(_, value)| Time3339::parse(value).ok());

    Ok(VerifiedSignature {
        payload,
        signer_ref,
        signer_key_id: key_fingerprint(&verifying),
        sig_time,
    })
}
