//! Random-access reconstruction of a `file`/`bytes` schema tree.
//!
//! A [`FileReader`] is stateless apart from a shared cache of parsed
//! sub-tree supersets, so one reader can serve many concurrent callers:
//! `read_at` is offset-addressed and re-entrant.  Racing fetches of the
//! same sub-tree collapse through a single-flight cell per ref; at most
//! one fetch per ref is in flight and later callers share the parsed
//! result.  Sparse parts read back as zeros.

use crate::blobref::BlobRef;
use crate::error::{Error, Result};
use crate::schema::superset::{CamliType, Part, Superset};
use crate::store::{fetch_bytes, BlobFetcher};
use futures::future::{BoxFuture, FutureExt};
use lru::LruCache;
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::trace;

/// Number of parsed sub-tree supersets kept by the reader cache.
const SUPERSET_CACHE_CAP: usize = 64;

/// Parsed, validated view of one `bytes`/`file` node in the tree.
struct TreeNode {
    parts: Vec<Part>,
    size: u64,
}

type NodeCell = Arc<OnceCell<Arc<TreeNode>>>;

/// LRU of parsed sub-trees with single-flight population.
struct NodeCache {
    lru: Mutex<LruCache<BlobRef, NodeCell>>,
}

impl NodeCache {
    fn new() -> Self {
        let cap = NonZeroUsize::new(SUPERSET_CACHE_CAP).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the parsed node for `br`, fetching it at most once even
    /// under concurrent callers.
    async fn get(&self, fetcher: &Arc<dyn BlobFetcher>, br: &BlobRef) -> Result<Arc<TreeNode>> {
        let cell: NodeCell = {
            let mut lru = self.lru.lock().await;
            lru.get_or_insert(br.clone(), NodeCell::default).clone()
        };
        let node = cell
            .get_or_try_init(|| async {
                trace!(blob = %br, "loading bytes sub-tree");
                let bytes = fetch_bytes(fetcher.as_ref(), br).await?;
                let ss = Superset::parse(Some(br.clone()), &bytes)?;
                TreeNode::from_superset(&ss).map(Arc::new)
            })
            .await?;
        Ok(node.clone())
    }
}

impl TreeNode {
    fn from_superset(ss: &Superset) -> Result<TreeNode> {
        match ss.camli_type() {
            Some(CamliType::File) | Some(CamliType::Bytes) => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "cannot read camliType {:?} as a byte stream",
                    ss.typ
                )))
            }
        }
        let parts = ss.file_parts()?.to_vec();
        for part in &parts {
            part.validate().map_err(|err| match ss.blob_ref.as_ref() {
                Some(br) => err.context(format!("in {br}")),
                None => err,
            })?;
        }
        Ok(TreeNode {
            size: parts.iter().map(|p| p.size).sum(),
            parts,
        })
    }
}

/// Reader over the byte stream described by a `file`/`bytes` blob.
///
/// Cloning is cheap; clones share the sub-tree cache.
#[derive(Clone)]
pub struct FileReader {
    fetcher: Arc<dyn BlobFetcher>,
    root: BlobRef,
    node: Arc<TreeNode>,
    cache: Arc<NodeCache>,
}

impl FileReader {
    /// Opens the tree rooted at `root`, which must be a `file` or
    /// `bytes` blob.
    pub async fn new(fetcher: Arc<dyn BlobFetcher>, root: &BlobRef) -> Result<Self> {
        let bytes = fetch_bytes(fetcher.as_ref(), root).await?;
        let ss = Superset::parse(Some(root.clone()), &bytes)?;
        let node = Arc::new(TreeNode::from_superset(&ss)?);
        Ok(Self {
            fetcher,
            root: root.clone(),
            node,
            cache: Arc::new(NodeCache::new()),
        })
    }

    /// Returns the declared stream size in bytes.
    pub fn size(&self) -> u64 {
        self.node.size
    }

    /// Returns the root blob ref.
    pub fn blob_ref(&self) -> &BlobRef {
        &self.root
    }

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// Returns the number of bytes read: the full request unless the
    /// stream ends first, and zero exactly at or past end of stream.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() || offset >= self.node.size {
            return Ok(0);
        }
        let want = (self.node.size - offset).min(buf.len() as u64) as usize;
        let dst = &mut buf[..want];
        let n = self.read_parts(&self.node.parts, dst, offset).await?;
        if n < want {
            return Err(Error::corrupt(
                Some(self.root.to_string()),
                format!("parts yielded {n} bytes at offset {offset}, wanted {want}"),
            ));
        }
        Ok(n)
    }

    /// Buffers the entire stream.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.node.size as usize];
        let mut filled = 0usize;
        while (filled as u64) < self.node.size {
            let n = self.read_at(&mut out[filled..], filled as u64).await?;
            if n == 0 {
                return Err(Error::corrupt(
                    Some(self.root.to_string()),
                    format!("stream ended at {filled} of {} bytes", self.node.size),
                ));
            }
            filled += n;
        }
        Ok(out)
    }

    /// Returns a seekable sequential cursor over the stream.
    pub fn cursor(&self) -> FileCursor {
        FileCursor {
            reader: self.clone(),
            pos: 0,
        }
    }

    /// Fills `dst` from `parts` starting `offset` bytes into their
    /// concatenation.  Returns how many bytes were produced; less than
    /// `dst.len()` only when the parts run out.
    fn read_parts<'a>(
        &'a self,
        parts: &'a [Part],
        dst: &'a mut [u8],
        mut offset: u64,
    ) -> BoxFuture<'a, Result<usize>> {
        async move {
            let mut filled = 0usize;
            for part in parts {
                if filled == dst.len() {
                    break;
                }
                if offset >= part.size {
                    offset -= part.size;
                    continue;
                }
                let in_off = offset;
                offset = 0;
                let want = ((part.size - in_off) as usize).min(dst.len() - filled);
                let out = &mut dst[filled..filled + want];
                match (&part.blob_ref, &part.bytes_ref) {
                    (Some(_), Some(_)) => {
                        return Err(Error::corrupt(
                            Some(self.root.to_string()),
                            "part has both blobRef and bytesRef set",
                        ));
                    }
                    (None, None) => {
                        // Sparse hole: size zero bytes.
                        out.fill(0);
                    }
                    (Some(br), None) => {
                        self.read_raw(br, part.offset + in_off, out).await?;
                    }
                    (None, Some(br)) => {
                        let node = self.cache.get(&self.fetcher, br).await?;
                        let n = self
                            .read_parts(&node.parts, out, part.offset + in_off)
                            .await?;
                        if n < out.len() {
                            return Err(Error::corrupt(
                                Some(br.to_string()),
                                format!("sub-tree yielded {n} of {} bytes", out.len()),
                            ));
                        }
                    }
                }
                filled += want;
            }
            Ok(filled)
        }
        .boxed()
    }

    /// Reads exactly `dst.len()` bytes of the raw blob `br`, starting at
    /// `skip`.
    async fn read_raw(&self, br: &BlobRef, skip: u64, dst: &mut [u8]) -> Result<()> {
        let (rd, size) = self.fetcher.fetch(br).await?;
        if skip + dst.len() as u64 > size {
            return Err(Error::corrupt(
                Some(br.to_string()),
                format!(
                    "blob is {size} bytes, part wants [{skip}, {})",
                    skip + dst.len() as u64
                ),
            ));
        }
        let mut rd = rd;
        if skip > 0 {
            let skipped = tokio::io::copy(&mut (&mut rd).take(skip), &mut tokio::io::sink())
                .await?;
            if skipped < skip {
                return Err(Error::corrupt(
                    Some(br.to_string()),
                    format!("blob ended after {skipped} of {skip} skipped bytes"),
                ));
            }
        }
        rd.read_exact(dst).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corrupt(Some(br.to_string()), "blob shorter than declared part")
            } else {
                Error::Io(err)
            }
        })?;
        Ok(())
    }
}

/// Sequential, seekable cursor over a [`FileReader`].
pub struct FileCursor {
    reader: FileReader,
    pos: u64,
}

impl FileCursor {
    /// Reads up to `buf.len()` bytes at the current position and
    /// advances.  Returns zero at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.reader.read_at(buf, self.pos).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Moves the cursor, returning the new position.
    ///
    /// Seeking before the start of the stream is an `InvalidArgument`
    /// error; seeking past the end is allowed and reads EOF.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.reader.size() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => size + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if target < 0 {
            return Err(Error::InvalidArgument(format!(
                "seek to negative offset {target}"
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    /// Returns the current position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::FileReader;
    use crate::blobref::{Algorithm, BlobRef};
    use crate::error::ErrorKind;
    use crate::filewriter::{write_file, WriteFileOptions};
    use crate::schema::superset::Part;
    use crate::schema::Builder;
    use crate::store::{BlobFetcher, BlobReceiver, BlobStore, MemoryStore};
    use std::io::SeekFrom;
    use std::sync::Arc;

    fn lcg_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            out.push((state >> 33) as u8);
        }
        out
    }

    async fn reader_for(store: &Arc<MemoryStore>, data: &[u8]) -> FileReader {
        let dyn_store: Arc<dyn BlobStore> = store.clone();
        let root = write_file(dyn_store, WriteFileOptions::default(), data)
            .await
            .unwrap();
        let fetcher: Arc<dyn BlobFetcher> = store.clone();
        FileReader::new(fetcher, &root).await.unwrap()
    }

    #[tokio::test]
    async fn small_file_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let fr = reader_for(&store, b"hello").await;
        assert_eq!(fr.size(), 5);
        assert_eq!(fr.read_all().await.unwrap(), b"hello");

        let mut buf = [0u8; 3];
        assert_eq!(fr.read_at(&mut buf, 2).await.unwrap(), 3);
        assert_eq!(&buf, b"llo");
        assert_eq!(fr.read_at(&mut buf, 5).await.unwrap(), 0);
        assert_eq!(fr.read_at(&mut buf, 99).await.unwrap(), 0);
        assert_eq!(fr.read_at(&mut [], 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn large_file_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let data = lcg_bytes(123, 3 << 20);
        let fr = reader_for(&store, &data).await;
        assert_eq!(fr.size(), data.len() as u64);
        assert_eq!(fr.read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn random_access_matches_source() {
        let store = Arc::new(MemoryStore::new());
        let data = lcg_bytes(99, 2 << 20);
        let fr = reader_for(&store, &data).await;
        for (offset, len) in [
            (0u64, 10usize),
            (1, 1),
            ((256 << 10) - 3, 7),
            (1 << 20, 64 << 10),
            (data.len() as u64 - 5, 10),
        ] {
            let mut buf = vec![0u8; len];
            let n = fr.read_at(&mut buf, offset).await.unwrap();
            let end = (offset as usize + n).min(data.len());
            assert_eq!(&buf[..n], &data[offset as usize..end], "offset {offset}");
        }
    }

    #[tokio::test]
    async fn sparse_hole_reads_zeros() {
        let store = Arc::new(MemoryStore::new());
        let x_ref = BlobRef::for_bytes(Algorithm::Sha1, b"X");
        let mut rd: &[u8] = b"X";
        store.receive(&x_ref, &mut rd).await.unwrap();

        let mut b = Builder::new_file();
        b.set_parts(&[
            Part {
                blob_ref: None,
                bytes_ref: None,
                size: 1024,
                offset: 0,
            },
            Part {
                blob_ref: Some(x_ref),
                bytes_ref: None,
                size: 1,
                offset: 0,
            },
        ])
        .unwrap();
        let blob = b.blob().unwrap();
        let mut rd = blob.json().as_bytes();
        store.receive_no_hash(blob.blob_ref(), &mut rd).await.unwrap();

        let fetcher: Arc<dyn BlobFetcher> = store.clone();
        let fr = FileReader::new(fetcher, blob.blob_ref()).await.unwrap();
        assert_eq!(fr.size(), 1025);
        let all = fr.read_all().await.unwrap();
        assert_eq!(all.len(), 1025);
        assert!(all[..1024].iter().all(|&b| b == 0));
        assert_eq!(all[1024], b'X');
    }

    #[tokio::test]
    async fn part_with_both_refs_is_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let some = BlobRef::for_bytes(Algorithm::Sha1, b"y");
        // Hand-built JSON since the builder refuses both refs.
        let json = format!(
            "{{\"camliVersion\": 1,\n  \"camliType\": \"file\",\n  \"parts\": [\n    {{\"blobRef\": \"{some}\", \"bytesRef\": \"{some}\", \"size\": 1}}\n  ]\n}}"
        );
        let br = BlobRef::for_bytes(Algorithm::Sha1, json.as_bytes());
        let mut rd = json.as_bytes();
        store.receive_no_hash(&br, &mut rd).await.unwrap();

        let fetcher: Arc<dyn BlobFetcher> = store.clone();
        let err = match FileReader::new(fetcher, &br).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), ErrorKind::CorruptBlob);
    }

    #[tokio::test]
    async fn missing_chunk_surfaces_not_exist() {
        let store = Arc::new(MemoryStore::new());
        let ghost = BlobRef::for_bytes(Algorithm::Sha1, b"never stored");
        let mut b = Builder::new_file();
        b.set_parts(&[Part {
            blob_ref: Some(ghost),
            bytes_ref: None,
            size: 12,
            offset: 0,
        }])
        .unwrap();
        let blob = b.blob().unwrap();
        let mut rd = blob.json().as_bytes();
        store.receive_no_hash(blob.blob_ref(), &mut rd).await.unwrap();

        let fetcher: Arc<dyn BlobFetcher> = store.clone();
        let fr = FileReader::new(fetcher, blob.blob_ref()).await.unwrap();
        let err = fr.read_all().await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn cursor_reads_and_seeks() {
        let store = Arc::new(MemoryStore::new());
        let fr = reader_for(&store, b"0123456789").await;
        let mut cur = fr.cursor();
        let mut buf = [0u8; 4];
        assert_eq!(cur.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
        cur.seek(SeekFrom::End(-2)).unwrap();
        assert_eq!(cur.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(cur.read(&mut buf).await.unwrap(), 0);
        assert!(cur.seek(SeekFrom::Current(-100)).is_err());
        cur.seek(SeekFrom::Start(5)).unwrap();
        assert_eq!(cur.position(), 5);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_reader() {
        let store = Arc::new(MemoryStore::new());
        let data = lcg_bytes(5, 1 << 20);
        let fr = reader_for(&store, &data).await;
        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let fr = fr.clone();
            let expect = data.clone();
            tasks.push(tokio::spawn(async move {
                let offset = i * 100_000;
                let mut buf = vec![0u8; 50_000];
                let n = fr.read_at(&mut buf, offset).await.unwrap();
                assert_eq!(&buf[..n], &expect[offset as usize..offset as usize + n]);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
    }
}
