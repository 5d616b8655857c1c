//! Cutting a byte stream into content-defined chunks and writing the
//! resulting `file`/`bytes` schema tree.
//!
//! Bytes are rolled through a [`RollingSum`]; a chunk is cut when the sum
//! declares a split (weight = split strength), when the chunk reaches the
//! maximum blob size (weight 20), or when the first chunk reaches 256 KiB
//! (weight 18).  Cut chunks upload concurrently through a bounded
//! semaphore while chunking continues.  Each cut produces a span; spans
//! with weaker weights are adopted as children of the next stronger cut,
//! which yields a tree with bounded fan-out and good locality.  A schema
//! blob is only written after every chunk and sub-blob it references has
//! been received.

use crate::blobref::{Algorithm, BlobRef};
use crate::error::{Error, Result};
use crate::rolling::RollingSum;
use crate::schema::superset::Part;
use crate::schema::Builder;
use crate::store::BlobStore;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hard ceiling on chunk size.
pub const MAX_BLOB_SIZE: u64 = 1 << 20;

/// Size at which the first chunk is cut unconditionally.
pub const FIRST_CHUNK_SIZE: u64 = 256 << 10;

/// Rolling-hash splits are ignored while the chunk is this small.
pub const TOO_SMALL_THRESHOLD: u64 = 64 << 10;

/// Maximum number of concurrent chunk uploads.
pub const CHUNKS_IN_FLIGHT: usize = 32;

const MAX_BLOB_WEIGHT: u32 = 20;
const FIRST_CHUNK_WEIGHT: u32 = 18;
const READ_BUF_SIZE: usize = 32 << 10;

type ErrSlot = Arc<Mutex<Option<Error>>>;

fn record_err(slot: &ErrSlot, err: Error) {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn take_err(slot: &ErrSlot) -> Option<Error> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

/// Options for [`write_file`].
pub struct WriteFileOptions {
    /// Raw file name bytes to record, if any.
    pub file_name: Option<Vec<u8>>,
    /// Modification time to record, if any.
    pub mtime: Option<DateTime<Utc>>,
    /// Cancellation token checked between chunks and at upload enqueue.
    pub cancel: CancellationToken,
}

impl Default for WriteFileOptions {
    fn default() -> Self {
        Self {
            file_name: None,
            mtime: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// One cut chunk plus the weaker spans it adopted.
///
/// The span covers `[from, to)`: adopted children cover the prefix and
/// the span's own chunk (`br`) covers the tail.
struct Span {
    from: u64,
    to: u64,
    bits: u32,
    br: BlobRef,
    upload: JoinHandle<Result<()>>,
    children: Vec<Span>,
}

impl Span {
    fn size(&self) -> u64 {
        self.to - self.from
    }

    fn chunk_from(&self) -> u64 {
        self.children.last().map_or(self.from, |c| c.to)
    }

    fn is_single_blob(&self) -> bool {
        self.children.is_empty()
    }
}

/// Writes `source` as a `file` schema tree, returning the root ref.
///
/// Chunks upload with up to [`CHUNKS_IN_FLIGHT`] in flight; the first
/// upload error cancels the stream and is returned.  On error a partial
/// tree may remain in the store; existing blobs are never corrupted.
pub async fn write_file<R>(
    store: Arc<dyn BlobStore>,
    opts: WriteFileOptions,
    source: R,
) -> Result<BlobRef>
where
    R: AsyncRead + Send + Unpin,
{
    let mut builder = Builder::new_file();
    if let Some(name) = &opts.file_name {
        builder.set_file_name(name)?;
    }
    if let Some(mtime) = opts.mtime {
        builder.set_unix_mtime(mtime);
    }
    write_blob_tree(store, builder, opts.cancel, source).await
}

/// Writes `source` as an anonymous `bytes` schema tree.
pub async fn write_bytes<R>(store: Arc<dyn BlobStore>, source: R) -> Result<BlobRef>
where
    R: AsyncRead + Send + Unpin,
{
    write_blob_tree(store, Builder::new_bytes(), CancellationToken::new(), source).await
}

async fn write_blob_tree<R>(
    store: Arc<dyn BlobStore>,
    mut root: Builder,
    cancel: CancellationToken,
    source: R,
) -> Result<BlobRef>
where
    R: AsyncRead + Send + Unpin,
{
    let sem = Arc::new(Semaphore::new(CHUNKS_IN_FLIGHT));
    let first_err: ErrSlot = Arc::default();
    let mut rd = BufReader::with_capacity(READ_BUF_SIZE, source);
    let mut rs = RollingSum::new();
    let mut spans: Vec<Span> = Vec::new();
    let mut chunk: Vec<u8> = Vec::new();
    // n counts bytes rolled so far; last is the offset where the current
    // chunk began.
    let mut n: u64 = 0;
    let mut last: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(take_err(&first_err).unwrap_or(Error::Canceled));
        }
        let mut cut_bits = None;
        let mut consumed = 0;
        {
            let buf = rd.fill_buf().await?;
            if buf.is_empty() {
                break;
            }
            for &b in buf {
                rs.roll(b);
                chunk.push(b);
                n += 1;
                consumed += 1;
                let chunk_size = n - last;
                let bits = if chunk_size == MAX_BLOB_SIZE {
                    Some(MAX_BLOB_WEIGHT)
                } else if last == 0 && chunk_size == FIRST_CHUNK_SIZE {
                    Some(FIRST_CHUNK_WEIGHT)
                } else if rs.on_split()
                    && n > FIRST_CHUNK_SIZE
                    && chunk_size > TOO_SMALL_THRESHOLD
                {
                    Some(rs.bits())
                } else {
                    None
                };
                if bits.is_some() {
                    cut_bits = bits;
                    break;
                }
            }
        }
        rd.consume(consumed);
        if let Some(bits) = cut_bits {
            // Don't cut when EOF is already visible; the remainder rolls
            // into the final chunk below.
            if rd.fill_buf().await?.is_empty() {
                break;
            }
            cut_chunk(
                &store, &sem, &cancel, &first_err, &mut spans, &mut chunk, last, n, bits,
            )
            .await?;
            last = n;
        }
    }

    if n > last {
        cut_chunk(
            &store, &sem, &cancel, &first_err, &mut spans, &mut chunk, last, n, 0,
        )
        .await?;
    }

    let result = finalize(&store, &mut root, spans).await;
    match result {
        Err(err) if err.is_canceled() => Err(take_err(&first_err).unwrap_or(err)),
        other => other,
    }
}

/// Uploads the accumulated chunk and pushes its span, adopting trailing
/// spans whose weight is weaker than `bits`.
#[allow(clippy::too_many_arguments)]
async fn cut_chunk(
    store: &Arc<dyn BlobStore>,
    sem: &Arc<Semaphore>,
    cancel: &CancellationToken,
    first_err: &ErrSlot,
    spans: &mut Vec<Span>,
    chunk: &mut Vec<u8>,
    last: u64,
    n: u64,
    bits: u32,
) -> Result<()> {
    let data = std::mem::take(chunk);
    let br = BlobRef::for_bytes(Algorithm::default(), &data);
    debug!(blob = %br, from = last, to = n, bits, "cut chunk");

    // Backpressure: block here until one of the in-flight permits frees.
    let permit = tokio::select! {
        permit = sem.clone().acquire_owned() => permit.map_err(|_| Error::Canceled)?,
        () = cancel.cancelled() => {
            return Err(take_err(first_err).unwrap_or(Error::Canceled));
        }
    };
    let upload = tokio::spawn({
        let store = store.clone();
        let br = br.clone();
        let cancel = cancel.clone();
        let first_err = first_err.clone();
        async move {
            let _permit = permit;
            let mut rd: &[u8] = &data;
            match store.receive(&br, &mut rd).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    record_err(&first_err, err.context(format!("uploading chunk {br}")));
                    cancel.cancel();
                    Err(Error::Canceled)
                }
            }
        }
    });

    let mut child_from = spans.len();
    while child_from > 0 && spans[child_from - 1].bits < bits {
        child_from -= 1;
    }
    let children = spans.split_off(child_from);
    let from = children.first().map_or(last, |c| c.from);
    spans.push(Span {
        from,
        to: n,
        bits,
        br,
        upload,
        children,
    });
    Ok(())
}

async fn finalize(
    store: &Arc<dyn BlobStore>,
    root: &mut Builder,
    spans: Vec<Span>,
) -> Result<BlobRef> {
    let mut parts = Vec::new();
    append_span_parts(store, &mut parts, spans).await?;
    root.set_parts(&parts)?;
    let blob = root.blob()?;
    let mut rd = blob.json().as_bytes();
    store.receive_no_hash(blob.blob_ref(), &mut rd).await?;
    debug!(blob = %blob.blob_ref(), parts = parts.len(), "wrote schema root");
    Ok(blob.blob_ref().clone())
}

/// Serializes spans into parts, uploading one `bytes` blob per span with
/// children.  A span contributes its children (as a `bytes` sub-blob, or
/// promoted directly when the only child is a single blob) followed by
/// its own chunk.
fn append_span_parts<'a>(
    store: &'a Arc<dyn BlobStore>,
    dst: &'a mut Vec<Part>,
    spans: Vec<Span>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        for mut span in spans {
            let chunk_size = span.to - span.chunk_from();
            if span.children.len() == 1 && span.children[0].is_single_blob() {
                // A bytes blob holding a single blobRef part is a useless
                // indirection; promote the child instead.
                let child = span.children.swap_remove(0);
                let size = child.size();
                await_upload(child.upload).await?;
                dst.push(Part {
                    blob_ref: Some(child.br),
                    bytes_ref: None,
                    size,
                    offset: 0,
                });
            } else if !span.children.is_empty() {
                let children = std::mem::take(&mut span.children);
                let children_size: u64 = children.iter().map(Span::size).sum();
                let mut child_parts = Vec::with_capacity(children.len() + 1);
                append_span_parts(store, &mut child_parts, children).await?;
                let mut bb = Builder::new_bytes();
                bb.set_parts(&child_parts)?;
                let blob = bb.blob()?;
                let mut rd = blob.json().as_bytes();
                store.receive_no_hash(blob.blob_ref(), &mut rd).await?;
                dst.push(Part {
                    blob_ref: None,
                    bytes_ref: Some(blob.blob_ref().clone()),
                    size: children_size,
                    offset: 0,
                });
            }
            await_upload(span.upload).await?;
            dst.push(Part {
                blob_ref: Some(span.br),
                bytes_ref: None,
                size: chunk_size,
                offset: 0,
            });
        }
        Ok(())
    }
    .boxed()
}

async fn await_upload(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(res) => res,
        Err(join_err) => Err(Error::Io(std::io::Error::other(join_err))),
    }
}

#[cfg(test)]
mod tests {
    use super::{write_file, WriteFileOptions, FIRST_CHUNK_SIZE, MAX_BLOB_SIZE};
    use crate::blobref::BlobRef;
    use crate::schema::Superset;
    use crate::store::{fetch_bytes, BlobEnumerator, MemoryStore};
    use std::sync::Arc;

    /// Deterministic byte source for chunking tests.
    fn lcg_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            out.push((state >> 33) as u8);
        }
        out
    }

    async fn write_all(store: &Arc<MemoryStore>, data: &[u8]) -> BlobRef {
        let dyn_store: Arc<dyn crate::store::BlobStore> = store.clone();
        write_file(dyn_store, WriteFileOptions::default(), data)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn small_file_is_one_part() {
        let store = Arc::new(MemoryStore::new());
        let root = write_all(&store, b"hello").await;

        let json = fetch_bytes(store.as_ref(), &root).await.unwrap();
        let ss = Superset::parse(Some(root), &json).unwrap();
        let parts = ss.file_parts().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 5);
        assert_eq!(
            parts[0].blob_ref.as_ref().unwrap().to_string(),
            "sha1-aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        // Chunk blob plus schema root.
        assert_eq!(store.blob_count().await, 2);
    }

    #[tokio::test]
    async fn empty_file_has_no_parts() {
        let store = Arc::new(MemoryStore::new());
        let root = write_all(&store, b"").await;
        let json = fetch_bytes(store.as_ref(), &root).await.unwrap();
        let ss = Superset::parse(Some(root), &json).unwrap();
        assert_eq!(ss.file_parts().unwrap().len(), 0);
        assert_eq!(ss.total_part_size(), 0);
    }

    #[tokio::test]
    async fn root_ref_is_deterministic() {
        let data = lcg_bytes(123, 2 << 20);
        let a = write_all(&Arc::new(MemoryStore::new()), &data).await;
        let b = write_all(&Arc::new(MemoryStore::new()), &data).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn chunk_sizes_respect_policy() {
        let store = Arc::new(MemoryStore::new());
        let data = lcg_bytes(42, 3 << 20);
        let root = write_all(&store, &data).await;

        let mut after = String::new();
        let mut raw_sizes = Vec::new();
        loop {
            let page = store.enumerate(&after, 100).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().unwrap().blob_ref.to_string();
            for sr in page {
                let bytes = fetch_bytes(store.as_ref(), &sr.blob_ref).await.unwrap();
                // Schema blobs are JSON; raw chunks are the rest.
                if !bytes.starts_with(b"{\"camliVersion\"") {
                    raw_sizes.push(sr.size);
                }
            }
        }
        let total: u64 = raw_sizes.iter().sum();
        assert_eq!(total, data.len() as u64);
        assert!(raw_sizes.iter().all(|s| *s <= MAX_BLOB_SIZE));
        assert!(raw_sizes.iter().any(|s| *s == FIRST_CHUNK_SIZE));
        assert!(raw_sizes.len() > 3, "expected several chunks");

        // Part sums at every level match declared sizes.
        let json = fetch_bytes(store.as_ref(), &root).await.unwrap();
        let ss = Superset::parse(Some(root), &json).unwrap();
        assert_eq!(ss.total_part_size(), data.len() as u64);
    }

    #[tokio::test]
    async fn mtime_and_name_are_recorded() {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn crate::store::BlobStore> = store.clone();
        let opts = WriteFileOptions {
            file_name: Some(b"example.txt".to_vec()),
            mtime: Some(
                chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2012, 5, 13, 15, 2, 47).unwrap(),
            ),
            ..Default::default()
        };
        let root = write_file(dyn_store, opts, &b"hello"[..]).await.unwrap();
        let json = fetch_bytes(store.as_ref(), &root).await.unwrap();
        let text = std::str::from_utf8(&json).unwrap();
        assert!(text.contains("\"fileName\": \"example.txt\""));
        assert!(text.contains("\"unixMtime\": \"2012-05-13T15:02:47Z\""));
    }

    #[tokio::test]
    async fn identical_content_chunks_dedup() {
        let store = Arc::new(MemoryStore::new());
        let data = lcg_bytes(7, 600 << 10);
        let first = write_all(&store, &data).await;
        let count = store.blob_count().await;
        let second = write_all(&store, &data).await;
        assert_eq!(first, second);
        assert_eq!(store.blob_count().await, count);
    }
}
