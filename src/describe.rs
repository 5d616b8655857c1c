//! Resolving permanodes into described views by walking signed claims.
//!
//! A permanode's state at time T is the fold of every claim targeting it
//! with `claimDate <= T` whose signature verifies against a trusted
//! signer.  [`StoreDescriber`] implements that fold directly over a blob
//! store by scanning for claim blobs; it is the reference collaborator
//! behind the filesystem view cache.  Production deployments would back
//! [`Describer`] with an index instead of a scan.

use crate::blobref::BlobRef;
use crate::dirreader::DirReader;
use crate::error::{Error, Result};
use crate::jsonsign::{verify_json, VerifiedSignature};
use crate::schema::builder::ClaimType;
use crate::schema::superset::{CamliType, Superset};
use crate::schema::time::Time3339;
use crate::store::{fetch_bytes, BlobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Claim blobs are small; larger blobs are skipped during the scan.
const CLAIM_SCAN_MAX: u64 = 16 << 10;

/// Enumeration page size for the claim scan.
const CLAIM_SCAN_PAGE: usize = 256;

/// Basic file metadata resolved from a described blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Decoded display name (possibly empty).
    pub name: String,
    /// Declared size in bytes; zero for directories.
    pub size: u64,
    /// Whether the blob describes a directory.
    pub is_dir: bool,
    /// Modification time, when recorded.
    pub mtime: Option<Time3339>,
}

/// One blob's description within a [`DescribeResponse`].
#[derive(Debug, Clone)]
pub struct DescribedBlob {
    /// The described blob.
    pub blob_ref: BlobRef,
    /// Recognized camliType, if any.
    pub camli_type: Option<CamliType>,
    /// Permanode `title` attribute, when set.
    pub title: Option<String>,
    /// Permanode `camliContent` target, when set.
    pub content: Option<BlobRef>,
    /// Named children: `camliPath:<name>` attributes of a permanode, or
    /// the entries of a directory.
    pub members: Vec<(String, BlobRef)>,
    /// File metadata for `file`/`bytes`/`directory` blobs, and for
    /// permanodes whose content resolves to one.
    pub file: Option<FileInfo>,
}

/// A depth-limited description of a blob and its neighborhood.
#[derive(Debug, Clone)]
pub struct DescribeResponse {
    /// The blob the request was about.
    pub root: BlobRef,
    /// Descriptions keyed by blob ref string form.
    pub meta: HashMap<String, DescribedBlob>,
}

impl DescribeResponse {
    /// Looks up a description by ref.
    pub fn get(&self, br: &BlobRef) -> Option<&DescribedBlob> {
        self.meta.get(&br.to_string())
    }
}

/// The describe service consumed by the filesystem view cache.
#[async_trait]
pub trait Describer: Send + Sync {
    /// Describes `br` and everything reachable within `depth` hops
    /// through content refs and members.
    async fn describe(&self, br: &BlobRef, depth: usize) -> Result<DescribeResponse>;
}

/// A verified, parsed claim.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Ref of the claim blob itself.
    pub blob_ref: BlobRef,
    /// The permanode the claim mutates.
    pub permanode: BlobRef,
    /// The claim kind.
    pub claim_type: ClaimType,
    /// The claim date.
    pub date: Time3339,
    /// Attribute the claim touches, when applicable.
    pub attribute: Option<String>,
    /// Value the claim carries, when applicable.
    pub value: Option<String>,
    /// Ref of the signer's public key blob.
    pub signer: BlobRef,
}

impl Claim {
    /// Extracts a claim from a verified signature payload.
    pub fn from_verified(blob_ref: BlobRef, vs: &VerifiedSignature) -> Result<Self> {
        let ss = vs.superset()?;
        ss.require_type(CamliType::Claim)?;
        let claim_type = ss
            .claim_type
            .as_deref()
            .and_then(ClaimType::from_name)
            .ok_or(Error::MissingField("claimType"))?;
        let date = ss.parsed_claim_date()?;
        let permanode = ss.permanode.clone().ok_or(Error::MissingField("permaNode"))?;
        Ok(Self {
            blob_ref,
            permanode,
            claim_type,
            date,
            attribute: ss.attribute.clone(),
            value: ss.value.clone(),
            signer: vs.signer_ref.clone(),
        })
    }
}

/// Folds claims into the attribute map they produce.
///
/// Claims must already be sorted by date; set replaces, add appends,
/// del removes one value or the whole attribute.
pub fn fold_claims(claims: &[Claim]) -> BTreeMap<String, Vec<String>> {
    let mut attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for claim in claims {
        let Some(attr) = claim.attribute.as_deref() else {
            continue;
        };
        match claim.claim_type {
            ClaimType::SetAttribute => {
                if let Some(value) = claim.value.clone() {
                    attrs.insert(attr.to_string(), vec![value]);
                }
            }
            ClaimType::AddAttribute => {
                if let Some(value) = claim.value.clone() {
                    attrs.entry(attr.to_string()).or_default().push(value);
                }
            }
            ClaimType::DelAttribute => match claim.value.as_deref() {
                Some(value) => {
                    if let Some(values) = attrs.get_mut(attr) {
                        values.retain(|v| v != value);
                        if values.is_empty() {
                            attrs.remove(attr);
                        }
                    }
                }
                None => {
                    attrs.remove(attr);
                }
            },
        }
    }
    attrs
}

/// [`Describer`] backed by a blob store scan.
///
/// Only claims signed by one of the trusted signer keys count toward a
/// permanode's state.  With `as_of` set, later claims are ignored.
pub struct StoreDescriber<S> {
    store: Arc<S>,
    trusted: Vec<BlobRef>,
    as_of: Option<DateTime<Utc>>,
}

impl<S: BlobStore + 'static> StoreDescriber<S> {
    /// Creates a describer trusting the given signer key blob refs.
    pub fn new(store: Arc<S>, trusted: Vec<BlobRef>) -> Self {
        Self {
            store,
            trusted,
            as_of: None,
        }
    }

    /// Restricts the fold to claims dated at or before `t`.
    pub fn at(mut self, t: DateTime<Utc>) -> Self {
        self.as_of = Some(t);
        self
    }

    /// Collects the verified claims targeting `permanode`, sorted by
    /// claim date.  Blobs that fail to parse or verify are skipped.
    pub async fn permanode_claims(&self, permanode: &BlobRef) -> Result<Vec<Claim>> {
        let mut claims = Vec::new();
        let mut after = String::new();
        loop {
            let page = self.store.enumerate(&after, CLAIM_SCAN_PAGE).await?;
            if page.is_empty() {
                break;
            }
            after = page
                .last()
                .map(|sr| sr.blob_ref.to_string())
                .unwrap_or_default();
            for sized in page {
                if sized.size > CLAIM_SCAN_MAX {
                    continue;
                }
                let bytes = match fetch_bytes(self.store.as_ref(), &sized.blob_ref).await {
                    Ok(bytes) => bytes,
                    // Concurrent removal between enumerate and fetch.
                    Err(err) if err.is_not_exist() => continue,
                    Err(err) => return Err(err),
                };
                if !bytes.starts_with(b"{\"camliVersion\"") {
                    continue;
                }
                let Ok(text) = std::str::from_utf8(&bytes) else {
                    continue;
                };
                if !text.contains(",\"camliSig\":") {
                    continue;
                }
                let Ok(verified) = verify_json(text, self.store.as_ref()).await else {
                    continue;
                };
                let Ok(claim) = Claim::from_verified(sized.blob_ref.clone(), &verified) else {
                    continue;
                };
                if claim.permanode != *permanode {
                    continue;
                }
                if !self.trusted.contains(&claim.signer) {
                    debug!(claim = %claim.blob_ref, signer = %claim.signer, "untrusted signer");
                    continue;
                }
                if let Some(as_of) = self.as_of {
                    if claim.date.utc() > as_of {
                        continue;
                    }
                }
                claims.push(claim);
            }
        }
        claims.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.blob_ref.cmp(&b.blob_ref))
        });
        Ok(claims)
    }

    /// Returns the folded attribute map of `permanode`.
    pub async fn permanode_attrs(
        &self,
        permanode: &BlobRef,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(fold_claims(&self.permanode_claims(permanode).await?))
    }

    async fn describe_one(&self, br: &BlobRef) -> Result<DescribedBlob> {
        let bytes = fetch_bytes(self.store.as_ref(), br).await?;
        let ss = match Superset::parse(Some(br.clone()), &bytes) {
            Ok(ss) => ss,
            // Raw (non-schema) blob.
            Err(_) => {
                return Ok(DescribedBlob {
                    blob_ref: br.clone(),
                    camli_type: None,
                    title: None,
                    content: None,
                    members: Vec::new(),
                    file: None,
                })
            }
        };
        let mut described = DescribedBlob {
            blob_ref: br.clone(),
            camli_type: ss.camli_type(),
            title: None,
            content: None,
            members: Vec::new(),
            file: None,
        };
        match ss.camli_type() {
            Some(CamliType::Permanode) => {
                let attrs = self.permanode_attrs(br).await?;
                described.title = attrs
                    .get("title")
                    .and_then(|values| values.first())
                    .cloned();
                if let Some(content) = attrs
                    .get("camliContent")
                    .and_then(|values| values.last())
                {
                    let content_ref = BlobRef::parse(content).ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "camliContent of {br} is not a blob ref: {content:?}"
                        ))
                    })?;
                    described.file = Some(self.content_info(&content_ref, &described).await?);
                    described.content = Some(content_ref);
                }
                // camliPath:<name> attributes define named children; on
                // conflicting duplicates the first value wins.
                for (attr, values) in &attrs {
                    let Some(name) = attr.strip_prefix("camliPath:") else {
                        continue;
                    };
                    let Some(target) = values.first().and_then(|v| BlobRef::parse(v)) else {
                        continue;
                    };
                    described.members.push((name.to_string(), target));
                }
            }
            Some(CamliType::File) | Some(CamliType::Bytes) => {
                described.file = Some(FileInfo {
                    name: ss.file_name(),
                    size: ss.total_part_size(),
                    is_dir: false,
                    mtime: ss.mtime(),
                });
            }
            Some(CamliType::Directory) => {
                described.file = Some(FileInfo {
                    name: ss.file_name(),
                    size: 0,
                    is_dir: true,
                    mtime: ss.mtime(),
                });
                let fetcher: Arc<dyn crate::store::BlobFetcher> = self.store.clone();
                let mut dir = DirReader::new(fetcher, br).await?;
                for entry in dir.readdir(0).await? {
                    described
                        .members
                        .push((entry.file_name().to_string(), entry.blob_ref().clone()));
                }
            }
            _ => {}
        }
        Ok(described)
    }

    /// Resolves the metadata of a permanode's content target.
    ///
    /// Content pointing at anything but a `file` or `directory` is an
    /// error.
    async fn content_info(
        &self,
        content: &BlobRef,
        permanode: &DescribedBlob,
    ) -> Result<FileInfo> {
        let bytes = fetch_bytes(self.store.as_ref(), content).await?;
        let ss = Superset::parse(Some(content.clone()), &bytes)?;
        let mut info = match ss.camli_type() {
            Some(CamliType::File) => FileInfo {
                name: ss.file_name(),
                size: ss.total_part_size(),
                is_dir: false,
                mtime: ss.mtime(),
            },
            Some(CamliType::Directory) => FileInfo {
                name: ss.file_name(),
                size: 0,
                is_dir: true,
                mtime: ss.mtime(),
            },
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "camliContent of {} points at camliType {:?}",
                    permanode.blob_ref, ss.typ
                )))
            }
        };
        if let Some(title) = &permanode.title {
            info.name = title.clone();
        }
        Ok(info)
    }
}

#[async_trait]
impl<S: BlobStore + 'static> Describer for StoreDescriber<S> {
    async fn describe(&self, br: &BlobRef, depth: usize) -> Result<DescribeResponse> {
        let mut resp = DescribeResponse {
            root: br.clone(),
            meta: HashMap::new(),
        };
        let mut queue = VecDeque::new();
        queue.push_back((br.clone(), depth));
        while let Some((current, depth)) = queue.pop_front() {
            if depth == 0 || resp.meta.contains_key(&current.to_string()) {
                continue;
            }
            let described = match self.describe_one(&current).await {
                Ok(d) => d,
                // The root must resolve; reachable children may be
                // missing without failing the whole description.
                Err(err) if current == *br => return Err(err),
                Err(_) => continue,
            };
            if let Some(content) = &described.content {
                queue.push_back((content.clone(), depth - 1));
            }
            for (_, member) in &described.members {
                queue.push_back((member.clone(), depth - 1));
            }
            resp.meta.insert(current.to_string(), described);
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::{Describer, StoreDescriber};
    use crate::blobref::BlobRef;
    use crate::error::ErrorKind;
    use crate::filewriter::{write_file, WriteFileOptions};
    use crate::jsonsign::KeySigner;
    use crate::schema::time::Time3339;
    use crate::schema::{Builder, SchemaBlob};
    use crate::store::{BlobReceiver, BlobStore, MemoryStore};
    use std::sync::Arc;

    async fn put_signed(store: &MemoryStore, signer: &KeySigner, b: &Builder) -> BlobRef {
        let signed = signer.sign_builder(b).unwrap();
        let blob = SchemaBlob::from_json(signed).unwrap();
        let mut rd = blob.json().as_bytes();
        store
            .receive_no_hash(blob.blob_ref(), &mut rd)
            .await
            .unwrap();
        blob.blob_ref().clone()
    }

    fn date(s: &str) -> Time3339 {
        Time3339::parse(s).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, KeySigner, BlobRef) {
        let store = Arc::new(MemoryStore::new());
        let signer = KeySigner::from_seed([3u8; 32]);
        signer.upload_public_key(store.as_ref()).await.unwrap();
        let permanode = put_signed(&store, &signer, &Builder::new_permanode()).await;
        (store, signer, permanode)
    }

    #[tokio::test]
    async fn claims_fold_in_date_order() {
        let (store, signer, permanode) = setup().await;
        // Stored out of order on purpose; the fold sorts by date.
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(&permanode, "title", "Newer", date("2021-01-02T00:00:00Z")),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(&permanode, "title", "Older", date("2021-01-01T00:00:00Z")),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_add_attribute(&permanode, "tag", "a", date("2021-01-03T00:00:00Z")),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_add_attribute(&permanode, "tag", "b", date("2021-01-04T00:00:00Z")),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_del_attribute(&permanode, "tag", Some("a"), date("2021-01-05T00:00:00Z")),
        )
        .await;

        let describer =
            StoreDescriber::new(store.clone(), vec![signer.public_key_ref().clone()]);
        let attrs = describer.permanode_attrs(&permanode).await.unwrap();
        assert_eq!(attrs.get("title"), Some(&vec!["Newer".to_string()]));
        assert_eq!(attrs.get("tag"), Some(&vec!["b".to_string()]));
    }

    #[tokio::test]
    async fn as_of_ignores_later_claims() {
        let (store, signer, permanode) = setup().await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(&permanode, "title", "Early", date("2021-01-01T00:00:00Z")),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(&permanode, "title", "Late", date("2022-01-01T00:00:00Z")),
        )
        .await;

        let describer = StoreDescriber::new(store.clone(), vec![signer.public_key_ref().clone()])
            .at(date("2021-06-01T00:00:00Z").utc());
        let attrs = describer.permanode_attrs(&permanode).await.unwrap();
        assert_eq!(attrs.get("title"), Some(&vec!["Early".to_string()]));
    }

    #[tokio::test]
    async fn untrusted_claims_do_not_count() {
        let (store, signer, permanode) = setup().await;
        let stranger = KeySigner::from_seed([9u8; 32]);
        stranger.upload_public_key(store.as_ref()).await.unwrap();
        put_signed(
            &store,
            &stranger,
            &Builder::new_set_attribute(&permanode, "title", "Spoof", date("2021-01-01T00:00:00Z")),
        )
        .await;

        let describer =
            StoreDescriber::new(store.clone(), vec![signer.public_key_ref().clone()]);
        let attrs = describer.permanode_attrs(&permanode).await.unwrap();
        assert!(attrs.get("title").is_none());
    }

    #[tokio::test]
    async fn describe_resolves_content_and_paths() {
        let (store, signer, permanode) = setup().await;
        let dyn_store: Arc<dyn BlobStore> = store.clone();
        let file_root = write_file(
            dyn_store,
            WriteFileOptions {
                file_name: Some(b"doc.txt".to_vec()),
                ..Default::default()
            },
            &b"contents"[..],
        )
        .await
        .unwrap();
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(
                &permanode,
                "camliContent",
                &file_root.to_string(),
                date("2021-01-01T00:00:00Z"),
            ),
        )
        .await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(&permanode, "title", "My Doc", date("2021-01-02T00:00:00Z")),
        )
        .await;

        let child = put_signed(&store, &signer, &Builder::new_permanode()).await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(
                &permanode,
                "camliPath:sub",
                &child.to_string(),
                date("2021-01-03T00:00:00Z"),
            ),
        )
        .await;

        let describer =
            StoreDescriber::new(store.clone(), vec![signer.public_key_ref().clone()]);
        let resp = describer.describe(&permanode, 3).await.unwrap();
        let root = resp.get(&permanode).unwrap();
        assert_eq!(root.content.as_ref(), Some(&file_root));
        assert_eq!(root.title.as_deref(), Some("My Doc"));
        let info = root.file.as_ref().unwrap();
        assert_eq!(info.name, "My Doc");
        assert_eq!(info.size, 8);
        assert!(!info.is_dir);
        assert_eq!(root.members, vec![("sub".to_string(), child.clone())]);
        // Depth 3 pulled the content blob and the child permanode in.
        assert!(resp.get(&file_root).is_some());
        assert!(resp.get(&child).is_some());
    }

    #[tokio::test]
    async fn content_must_be_file_or_directory() {
        let (store, signer, permanode) = setup().await;
        let other = put_signed(&store, &signer, &Builder::new_permanode()).await;
        put_signed(
            &store,
            &signer,
            &Builder::new_set_attribute(
                &permanode,
                "camliContent",
                &other.to_string(),
                date("2021-01-01T00:00:00Z"),
            ),
        )
        .await;

        let describer =
            StoreDescriber::new(store.clone(), vec![signer.public_key_ref().clone()]);
        let err = describer.describe(&permanode, 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
