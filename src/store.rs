//! Raw blob store capability traits and the in-memory reference store.
//!
//! Storage backends are described by four capabilities: receiving blobs,
//! fetching them, statting them, and enumerating them.  Most code takes
//! only the capability it needs; [`BlobStore`] bundles all four for
//! writers that both upload and verify.  [`MemoryStore`] is the reference
//! implementation used throughout the tests.
//!
//! Contracts:
//! - `receive` is atomic: either the whole blob becomes visible or
//!   nothing changes.  Receiving the same blob twice is idempotent.
//! - `fetch` reports a missing blob with the `NotExist` error kind, never
//!   wrapped in a way that hides the kind.
//! - `enumerate` yields refs in lexicographic order of their string form;
//!   `after` is exclusive.

use crate::blobref::{BlobRef, SizedRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::Bound;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

/// Boxed blob content reader returned by [`BlobFetcher::fetch`].
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Read buffer size for hashing incoming blob streams.
const RECEIVE_BUF_SIZE: usize = 32 * 1024;

/// Capability to accept new blobs.
#[async_trait]
pub trait BlobReceiver: Send + Sync {
    /// Reads the stream, hashes it, and stores it under `br`.
    ///
    /// The computed hash must equal `br`; otherwise the store is left
    /// unchanged and a `CorruptBlob` error is returned.
    async fn receive(
        &self,
        br: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedRef>;

    /// Stores the stream under `br` without re-hashing.
    ///
    /// Used when the ref was computed immediately upstream, e.g. for
    /// schema blobs whose ref is derived from their canonical JSON.
    async fn receive_no_hash(
        &self,
        br: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedRef>;
}

/// Capability to read back blob contents.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Opens `br` for reading, returning the content stream and its size.
    ///
    /// A missing blob fails with the `NotExist` kind.
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReader, u64)>;
}

/// Capability to report which blobs are present.
#[async_trait]
pub trait BlobStatter: Send + Sync {
    /// Returns a [`SizedRef`] for each of `refs` that exists.
    ///
    /// Missing refs are omitted; order of the result is unspecified.
    async fn stat(&self, refs: &[BlobRef]) -> Result<Vec<SizedRef>>;
}

/// Capability to walk the store in blob ref order.
#[async_trait]
pub trait BlobEnumerator: Send + Sync {
    /// Returns up to `limit` blobs whose string form sorts after `after`.
    ///
    /// `after` is exclusive; pass the empty string to start from the
    /// beginning.  A `limit` of zero returns an empty batch.
    async fn enumerate(&self, after: &str, limit: usize) -> Result<Vec<SizedRef>>;
}

/// The full blob store capability set.
pub trait BlobStore: BlobReceiver + BlobFetcher + BlobStatter + BlobEnumerator {}

impl<T: BlobReceiver + BlobFetcher + BlobStatter + BlobEnumerator> BlobStore for T {}

/// Fetches a blob and buffers its whole contents.
pub async fn fetch_bytes(fetcher: &dyn BlobFetcher, br: &BlobRef) -> Result<Bytes> {
    let (mut rd, size) = fetcher.fetch(br).await?;
    let mut buf = Vec::with_capacity(size.min(1 << 20) as usize);
    rd.read_to_end(&mut buf).await?;
    if buf.len() as u64 != size {
        return Err(Error::corrupt(
            Some(br.to_string()),
            format!("fetch returned {} bytes, expected {size}", buf.len()),
        ));
    }
    Ok(Bytes::from(buf))
}

/// In-memory blob store backed by an ordered map.
///
/// Suitable for tests and as the reference for the store contracts; all
/// four capabilities are implemented.  Contents are shared cheaply via
/// [`Bytes`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored blobs.
    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Returns the total size in bytes across all stored blobs.
    pub async fn total_size(&self) -> u64 {
        self.blobs
            .read()
            .await
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }

    async fn read_all(source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; RECEIVE_BUF_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..n]);
        }
    }
}

#[async_trait]
impl BlobReceiver for MemoryStore {
    async fn receive(
        &self,
        br: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedRef> {
        let data = Self::read_all(source).await?;
        let mut hasher = br.algorithm().new_hasher();
        hasher.update(&data);
        if !br.hash_matches(hasher) {
            return Err(Error::corrupt(
                Some(br.to_string()),
                format!(
                    "computed {} over {} bytes",
                    BlobRef::for_bytes(br.algorithm(), &data),
                    data.len()
                ),
            ));
        }
        let size = data.len() as u64;
        self.blobs
            .write()
            .await
            .insert(br.to_string(), Bytes::from(data));
        Ok(SizedRef {
            blob_ref: br.clone(),
            size,
        })
    }

    async fn receive_no_hash(
        &self,
        br: &BlobRef,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<SizedRef> {
        let data = Self::read_all(source).await?;
        let size = data.len() as u64;
        self.blobs
            .write()
            .await
            .insert(br.to_string(), Bytes::from(data));
        Ok(SizedRef {
            blob_ref: br.clone(),
            size,
        })
    }
}

#[async_trait]
impl BlobFetcher for MemoryStore {
    async fn fetch(&self, br: &BlobRef) -> Result<(BlobReader, u64)> {
        let blobs = self.blobs.read().await;
        match blobs.get(&br.to_string()) {
            Some(data) => {
                let size = data.len() as u64;
                Ok((Box::new(Cursor::new(data.clone())) as BlobReader, size))
            }
            None => Err(Error::not_exist(br.to_string())),
        }
    }
}

#[async_trait]
impl BlobStatter for MemoryStore {
    async fn stat(&self, refs: &[BlobRef]) -> Result<Vec<SizedRef>> {
        let blobs = self.blobs.read().await;
        Ok(refs
            .iter()
            .filter_map(|br| {
                blobs.get(&br.to_string()).map(|data| SizedRef {
                    blob_ref: br.clone(),
                    size: data.len() as u64,
                })
            })
            .collect())
    }
}

#[async_trait]
impl BlobEnumerator for MemoryStore {
    async fn enumerate(&self, after: &str, limit: usize) -> Result<Vec<SizedRef>> {
        let blobs = self.blobs.read().await;
        let mut out = Vec::with_capacity(limit.min(blobs.len()));
        let range = blobs.range::<str, _>((Bound::Excluded(after), Bound::Unbounded));
        for (key, data) in range.take(limit) {
            let br = BlobRef::parse(key).ok_or_else(|| {
                Error::corrupt(Some(key.clone()), "stored under unparseable key")
            })?;
            out.push(SizedRef {
                blob_ref: br,
                size: data.len() as u64,
            });
        }
        Ok(out)
    }
}
