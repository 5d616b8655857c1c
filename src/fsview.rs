//! Read-only hierarchical view over blob storage.
//!
//! Each node caches the resolution of one blob: a static schema blob, or
//! a permanode whose `camliContent` and `camliPath:*` attributes are
//! re-resolved through the describe service.  Dynamic nodes go stale
//! after a TTL and refresh on the next traversal that touches them; a
//! per-node mutex guarantees at most one refresh per node while distinct
//! nodes refresh in parallel.  The child merge retains names that vanish
//! from a fresh description, so a briefly-inconsistent describe result
//! never makes children disappear.
//!
//! The whole surface is read-only: mutating operations fail with
//! `PermissionDenied`.

use crate::blobref::BlobRef;
use crate::describe::{DescribeResponse, Describer};
use crate::error::{Error, Result};
use crate::filereader::FileReader;
use crate::schema::superset::CamliType;
use crate::schema::time::Time3339;
use crate::store::BlobFetcher;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a dynamic node's resolution stays fresh by default.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(60);

/// Mode bits reported for files.
pub const FILE_MODE: u32 = 0o400;

/// Mode bits reported for directories.
pub const DIR_MODE: u32 = 0o500;

/// Depth requested from the describe service per refresh.
const DESCRIBE_DEPTH: usize = 3;

/// Tunables for a [`FsView`].
#[derive(Debug, Clone)]
pub struct ViewConfig {
    /// TTL after which a dynamic node re-resolves on traversal.
    pub refresh_ttl: Duration,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

/// Metadata reported for one view node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name (the path component, or the resolved title at the root).
    pub name: String,
    /// File size in bytes; zero for directories.
    pub size: u64,
    /// Read-only mode bits.
    pub mode: u32,
    /// Modification time, when known.
    pub mtime: Option<Time3339>,
    /// Whether the node is a directory.
    pub is_dir: bool,
}

struct ChildEntry {
    source: BlobRef,
    node: Arc<Node>,
}

struct NodeState {
    source: BlobRef,
    is_static: bool,
    content: Option<BlobRef>,
    info: NodeInfo,
    children: BTreeMap<String, ChildEntry>,
    last_refreshed: Option<Instant>,
}

struct Node {
    state: Mutex<NodeState>,
}

impl Node {
    fn unresolved(name: &str, source: BlobRef) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NodeState {
                source,
                is_static: false,
                content: None,
                info: NodeInfo {
                    name: name.to_string(),
                    size: 0,
                    mode: FILE_MODE,
                    mtime: None,
                    is_dir: false,
                },
                children: BTreeMap::new(),
                last_refreshed: None,
            }),
        })
    }
}

/// Handle to a resolved node in the view tree.
pub struct ViewNode {
    node: Arc<Node>,
}

impl ViewNode {
    /// Returns the node's metadata.
    pub async fn info(&self) -> NodeInfo {
        self.node.state.lock().await.info.clone()
    }

    /// Returns the resolved content ref of a dynamic file node.
    pub async fn content_ref(&self) -> Option<BlobRef> {
        self.node.state.lock().await.content.clone()
    }

    /// Returns the blob the node resolves from.
    pub async fn source_ref(&self) -> BlobRef {
        self.node.state.lock().await.source.clone()
    }
}

/// Read-only filesystem view rooted at one blob.
pub struct FsView {
    describer: Arc<dyn Describer>,
    fetcher: Arc<dyn BlobFetcher>,
    cfg: ViewConfig,
    root: Arc<Node>,
}

impl FsView {
    /// Creates a view rooted at `root`; nothing is resolved until the
    /// first traversal.
    pub fn new(
        describer: Arc<dyn Describer>,
        fetcher: Arc<dyn BlobFetcher>,
        root: BlobRef,
        cfg: ViewConfig,
    ) -> Self {
        Self {
            describer,
            fetcher,
            cfg,
            root: Node::unresolved("", root),
        }
    }

    /// Resolves `path` (components separated by `/`), refreshing stale
    /// nodes along the way.
    pub async fn lookup(&self, path: &str) -> Result<ViewNode> {
        self.lookup_with(path, &CancellationToken::new()).await
    }

    /// [`lookup`] with cooperative cancellation.
    ///
    /// [`lookup`]: Self::lookup
    pub async fn lookup_with(&self, path: &str, cancel: &CancellationToken) -> Result<ViewNode> {
        let mut node = self.root.clone();
        self.refresh_if_stale(&node, cancel).await?;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let child = {
                let st = node.state.lock().await;
                st.children.get(comp).map(|e| e.node.clone())
            };
            let child = child.ok_or_else(|| Error::not_exist(format!("{path:?}")))?;
            node = child;
            self.refresh_if_stale(&node, cancel).await?;
        }
        Ok(ViewNode { node })
    }

    /// Returns the metadata at `path`.
    pub async fn stat(&self, path: &str) -> Result<NodeInfo> {
        Ok(self.lookup(path).await?.info().await)
    }

    /// Lists the children of the directory at `path` in name order.
    pub async fn readdir(&self, path: &str) -> Result<Vec<NodeInfo>> {
        let vn = self.lookup(path).await?;
        let children: Vec<(String, Arc<Node>)> = {
            let st = vn.node.state.lock().await;
            if !st.info.is_dir {
                return Err(Error::InvalidArgument(format!("{path:?} is not a directory")));
            }
            st.children
                .iter()
                .map(|(name, entry)| (name.clone(), entry.node.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(children.len());
        for (name, child) in children {
            let mut info = child.state.lock().await.info.clone();
            info.name = name;
            out.push(info);
        }
        Ok(out)
    }

    /// Opens the file at `path` for reading.
    ///
    /// The returned reader holds no node lock; reads proceed while the
    /// node refreshes.
    pub async fn open(&self, path: &str) -> Result<FileReader> {
        let vn = self.lookup(path).await?;
        let target = {
            let st = vn.node.state.lock().await;
            if st.info.is_dir {
                return Err(Error::InvalidArgument(format!("{path:?} is a directory")));
            }
            match (&st.content, st.is_static) {
                (Some(content), _) => content.clone(),
                (None, true) => st.source.clone(),
                (None, false) => {
                    return Err(Error::not_exist(format!(
                        "{path:?} (permanode has no content)"
                    )))
                }
            }
        };
        FileReader::new(self.fetcher.clone(), &target).await
    }

    /// Creation is not supported; the view is read-only.
    pub fn create(&self, path: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!(
            "create {path:?}: view is read-only"
        )))
    }

    /// Removal is not supported; the view is read-only.
    pub fn remove(&self, path: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!(
            "remove {path:?}: view is read-only"
        )))
    }

    /// Renames are not supported; the view is read-only.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        Err(Error::PermissionDenied(format!(
            "rename {from:?} to {to:?}: view is read-only"
        )))
    }

    /// Re-resolves `node` when unresolved, or when dynamic and past the
    /// TTL.  The per-node mutex is held across the refresh, so at most
    /// one refresh per node runs and the triggering traverser blocks.
    async fn refresh_if_stale(&self, node: &Arc<Node>, cancel: &CancellationToken) -> Result<()> {
        let mut st = node.state.lock().await;
        let stale = match st.last_refreshed {
            None => true,
            Some(at) => !st.is_static && at.elapsed() >= self.cfg.refresh_ttl,
        };
        if !stale {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let source = st.source.clone();
        debug!(node = %source, "refreshing view node");
        let resp = self.describer.describe(&source, DESCRIBE_DEPTH).await?;
        self.apply_describe(&mut st, &resp).await?;
        st.last_refreshed = Some(Instant::now());
        Ok(())
    }

    async fn apply_describe(&self, st: &mut NodeState, resp: &DescribeResponse) -> Result<()> {
        let described = resp
            .get(&st.source)
            .ok_or_else(|| Error::not_exist(st.source.to_string()))?;
        st.is_static = described.camli_type != Some(CamliType::Permanode);
        st.content = described.content.clone();

        match &described.file {
            Some(fi) => {
                st.info.size = fi.size;
                st.info.is_dir = fi.is_dir;
                st.info.mtime = fi.mtime.clone();
                if st.info.name.is_empty() && !fi.name.is_empty() {
                    st.info.name = fi.name.clone();
                }
            }
            None => {
                // A permanode without content acts as a directory of its
                // named members.
                st.info.is_dir = true;
                if st.info.name.is_empty() {
                    if let Some(title) = &described.title {
                        st.info.name = title.clone();
                    }
                }
            }
        }
        if !described.members.is_empty() {
            st.info.is_dir = true;
        }
        st.info.mode = if st.info.is_dir { DIR_MODE } else { FILE_MODE };

        // Merge the fresh child set: same name and ref keeps the cached
        // node (and its subtree); a changed ref replaces it; names no
        // longer described are retained as stale rather than dropped.
        for (name, target) in &described.members {
            let keep = st
                .children
                .get(name)
                .is_some_and(|entry| entry.source == *target);
            if keep {
                continue;
            }
            let child = Node::unresolved(name, target.clone());
            if let Some(child_desc) = resp.get(target) {
                // Depth-3 describe already knows the child; prefill its
                // info so readdir is useful before the child resolves.
                let mut child_st = child.state.lock().await;
                if let Some(fi) = &child_desc.file {
                    child_st.info.size = fi.size;
                    child_st.info.is_dir = fi.is_dir;
                    child_st.info.mtime = fi.mtime.clone();
                    child_st.info.mode = if fi.is_dir { DIR_MODE } else { FILE_MODE };
                }
            }
            st.children.insert(
                name.clone(),
                ChildEntry {
                    source: target.clone(),
                    node: child,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FsView, ViewConfig, FILE_MODE};
    use crate::blobref::{Algorithm, BlobRef};
    use crate::describe::{DescribeResponse, DescribedBlob, Describer, StoreDescriber};
    use crate::error::{ErrorKind, Result};
    use crate::filewriter::{write_file, WriteFileOptions};
    use crate::jsonsign::KeySigner;
    use crate::schema::time::Time3339;
    use crate::schema::{Builder, CamliType, SchemaBlob};
    use crate::store::{BlobFetcher, BlobReceiver, BlobStore, MemoryStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Scripted describer: serves canned responses and counts calls.
    struct FakeDescriber {
        responses: Mutex<HashMap<String, DescribeResponse>>,
        calls: AtomicUsize,
    }

    impl FakeDescriber {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, br: &BlobRef, resp: DescribeResponse) {
            self.responses
                .lock()
                .unwrap()
                .insert(br.to_string(), resp);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Describer for FakeDescriber {
        async fn describe(&self, br: &BlobRef, _depth: usize) -> Result<DescribeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(&br.to_string())
                .cloned()
                .ok_or_else(|| crate::error::Error::not_exist(br.to_string()))
        }
    }

    fn permanode_desc(
        br: &BlobRef,
        members: Vec<(String, BlobRef)>,
        content: Option<BlobRef>,
    ) -> DescribedBlob {
        DescribedBlob {
            blob_ref: br.clone(),
            camli_type: Some(CamliType::Permanode),
            title: None,
            content,
            members,
            file: None,
        }
    }

    fn ref_of(data: &[u8]) -> BlobRef {
        BlobRef::for_bytes(Algorithm::Sha1, data)
    }

    fn response(root: &BlobRef, blobs: Vec<DescribedBlob>) -> DescribeResponse {
        DescribeResponse {
            root: root.clone(),
            meta: blobs
                .into_iter()
                .map(|d| (d.blob_ref.to_string(), d))
                .collect(),
        }
    }

    fn view_over(describer: Arc<FakeDescriber>, root: BlobRef, ttl: Duration) -> FsView {
        let fetcher: Arc<dyn BlobFetcher> = Arc::new(MemoryStore::new());
        FsView::new(describer, fetcher, root, ViewConfig { refresh_ttl: ttl })
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_happens_once_within_ttl() {
        let root = ref_of(b"root");
        let describer = Arc::new(FakeDescriber::new());
        describer.set(&root, response(&root, vec![permanode_desc(&root, vec![], None)]));
        let view = view_over(describer.clone(), root, Duration::from_secs(60));

        view.lookup("").await.unwrap();
        view.lookup("").await.unwrap();
        view.lookup("/").await.unwrap();
        assert_eq!(describer.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        view.lookup("").await.unwrap();
        assert_eq!(describer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_children_are_retained() {
        let root = ref_of(b"root");
        let a = ref_of(b"child-a");
        let b = ref_of(b"child-b");
        let describer = Arc::new(FakeDescriber::new());
        describer.set(
            &root,
            response(
                &root,
                vec![permanode_desc(
                    &root,
                    vec![("a".into(), a.clone()), ("b".into(), b.clone())],
                    None,
                )],
            ),
        );
        describer.set(&a, response(&a, vec![permanode_desc(&a, vec![], None)]));
        describer.set(&b, response(&b, vec![permanode_desc(&b, vec![], None)]));
        let view = view_over(describer.clone(), root.clone(), Duration::from_secs(60));

        let names: Vec<String> = view
            .readdir("")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        // "b" disappears from the fresh description; the merge keeps it.
        describer.set(
            &root,
            response(
                &root,
                vec![permanode_desc(&root, vec![("a".into(), a.clone())], None)],
            ),
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        let names: Vec<String> = view
            .readdir("")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(view.lookup("b").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn changed_child_ref_replaces_node() {
        let root = ref_of(b"root");
        let old = ref_of(b"old");
        let new = ref_of(b"new");
        let describer = Arc::new(FakeDescriber::new());
        describer.set(
            &root,
            response(
                &root,
                vec![permanode_desc(&root, vec![("x".into(), old.clone())], None)],
            ),
        );
        describer.set(&old, response(&old, vec![permanode_desc(&old, vec![], None)]));
        describer.set(&new, response(&new, vec![permanode_desc(&new, vec![], None)]));
        let view = view_over(describer.clone(), root.clone(), Duration::from_secs(60));

        let vn = view.lookup("x").await.unwrap();
        assert_eq!(vn.source_ref().await, old);

        describer.set(
            &root,
            response(
                &root,
                vec![permanode_desc(&root, vec![("x".into(), new.clone())], None)],
            ),
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        let vn = view.lookup("x").await.unwrap();
        assert_eq!(vn.source_ref().await, new);
    }

    #[tokio::test]
    async fn missing_path_is_not_exist_and_writes_are_denied() {
        let root = ref_of(b"root");
        let describer = Arc::new(FakeDescriber::new());
        describer.set(&root, response(&root, vec![permanode_desc(&root, vec![], None)]));
        let view = view_over(describer, root, Duration::from_secs(60));

        let err = match view.lookup("nope").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::NotExist);
        assert_eq!(
            view.create("f").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            view.remove("f").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            view.rename("a", "b").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[tokio::test]
    async fn end_to_end_open_through_store_describer() {
        let store = Arc::new(MemoryStore::new());
        let signer = KeySigner::from_seed([11u8; 32]);
        signer.upload_public_key(store.as_ref()).await.unwrap();

        let signed = signer.sign_builder(&Builder::new_permanode()).unwrap();
        let permanode_blob = SchemaBlob::from_json(signed).unwrap();
        let mut rd = permanode_blob.json().as_bytes();
        store
            .receive_no_hash(permanode_blob.blob_ref(), &mut rd)
            .await
            .unwrap();
        let permanode = permanode_blob.blob_ref().clone();

        let dyn_store: Arc<dyn BlobStore> = store.clone();
        let file_root = write_file(
            dyn_store,
            WriteFileOptions {
                file_name: Some(b"hello.txt".to_vec()),
                ..Default::default()
            },
            &b"hello, view"[..],
        )
        .await
        .unwrap();

        let claim = Builder::new_set_attribute(
            &permanode,
            "camliContent",
            &file_root.to_string(),
            Time3339::parse("2021-01-01T00:00:00Z").unwrap(),
        );
        let signed = signer.sign_builder(&claim).unwrap();
        let claim_blob = SchemaBlob::from_json(signed).unwrap();
        let mut rd = claim_blob.json().as_bytes();
        store
            .receive_no_hash(claim_blob.blob_ref(), &mut rd)
            .await
            .unwrap();

        let describer = Arc::new(StoreDescriber::new(
            store.clone(),
            vec![signer.public_key_ref().clone()],
        ));
        let fetcher: Arc<dyn BlobFetcher> = store.clone();
        let view = FsView::new(describer, fetcher, permanode, ViewConfig::default());

        let info = view.stat("").await.unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.mode, FILE_MODE);
        assert_eq!(info.name, "hello.txt");

        let reader = view.open("").await.unwrap();
        assert_eq!(reader.read_all().await.unwrap(), b"hello, view");
    }
}
