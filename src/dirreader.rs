//! Enumeration of `directory` schema blobs.
//!
//! A directory points at a `static-set` whose members are the child
//! schema blobs.  Large sets may instead carry `mergeSets`, refs to
//! further static-sets that are unioned in listed order, depth-first.
//! Content addressing makes the set graph a finite DAG, so expansion
//! needs no cycle bookkeeping.

use crate::blobref::BlobRef;
use crate::error::{Error, Result};
use crate::schema::superset::{CamliType, Superset};
use crate::store::{fetch_bytes, BlobFetcher};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;

/// Concurrency gate for child-entry construction during `readdir`.
pub const READDIR_CONCURRENCY: usize = 20;

/// One child of a directory.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    blob_ref: BlobRef,
    typ: CamliType,
    file_name: String,
    size: Option<u64>,
}

impl DirectoryEntry {
    async fn load(fetcher: Arc<dyn BlobFetcher>, br: BlobRef) -> Result<Self> {
        let bytes = fetch_bytes(fetcher.as_ref(), &br)
            .await
            .map_err(|err| err.context("loading directory entry"))?;
        let ss = Superset::parse(Some(br.clone()), &bytes)?;
        let typ = match ss.camli_type() {
            Some(t @ (CamliType::File | CamliType::Directory | CamliType::Symlink)) => t,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "directory member {br} has unsupported camliType {:?}",
                    ss.typ
                )))
            }
        };
        let size = match typ {
            CamliType::File => Some(ss.total_part_size()),
            _ => None,
        };
        Ok(Self {
            blob_ref: br,
            typ,
            file_name: ss.file_name(),
            size,
        })
    }

    /// Returns the entry's schema blob ref.
    pub fn blob_ref(&self) -> &BlobRef {
        &self.blob_ref
    }

    /// Returns the entry's camliType (`file`, `directory`, or `symlink`).
    pub fn camli_type(&self) -> CamliType {
        self.typ
    }

    /// Returns the entry's decoded file name (empty when invalid).
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Returns the declared size for file entries.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

/// Cursor-carrying reader over one directory's children.
pub struct DirReader {
    fetcher: Arc<dyn BlobFetcher>,
    dir_ref: BlobRef,
    members: Vec<BlobRef>,
    cursor: usize,
}

impl DirReader {
    /// Opens `dir`, which must be a `directory` blob, and expands its
    /// static-set (through any merge-sets) into the member list.
    pub async fn new(fetcher: Arc<dyn BlobFetcher>, dir: &BlobRef) -> Result<Self> {
        let bytes = fetch_bytes(fetcher.as_ref(), dir).await?;
        let ss = Superset::parse(Some(dir.clone()), &bytes)?;
        ss.require_type(CamliType::Directory)?;
        let entries = ss.entries.clone().ok_or(Error::MissingField("entries"))?;
        let mut members = Vec::new();
        expand_static_set(&fetcher, entries, &mut members).await?;
        Ok(Self {
            fetcher,
            dir_ref: dir.clone(),
            members,
            cursor: 0,
        })
    }

    /// Returns the directory blob ref.
    pub fn blob_ref(&self) -> &BlobRef {
        &self.dir_ref
    }

    /// Returns the expanded member refs in static-set order.
    pub fn member_refs(&self) -> &[BlobRef] {
        &self.members
    }

    /// Returns up to `n` child entries, advancing the cursor; `n <= 0`
    /// returns all remaining.  Past the end an empty batch is returned.
    ///
    /// Entry construction fetches child blobs with up to
    /// [`READDIR_CONCURRENCY`] in flight; results keep member order.
    pub async fn readdir(&mut self, n: isize) -> Result<Vec<DirectoryEntry>> {
        let remaining = self.members.len() - self.cursor;
        let take = if n <= 0 {
            remaining
        } else {
            remaining.min(n as usize)
        };
        let batch: Vec<BlobRef> = self.members[self.cursor..self.cursor + take].to_vec();
        self.cursor += take;
        stream::iter(batch.into_iter().map(|br| {
            let fetcher = self.fetcher.clone();
            DirectoryEntry::load(fetcher, br)
        }))
        .buffered(READDIR_CONCURRENCY)
        .try_collect()
        .await
        .map_err(|err| err.context(format!("readdir {}", self.dir_ref)))
    }
}

/// Expands a static-set ref into leaf members, preserving order.
fn expand_static_set<'a>(
    fetcher: &'a Arc<dyn BlobFetcher>,
    set_ref: BlobRef,
    out: &'a mut Vec<BlobRef>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let bytes = fetch_bytes(fetcher.as_ref(), &set_ref).await?;
        let ss = Superset::parse(Some(set_ref.clone()), &bytes)?;
        ss.require_type(CamliType::StaticSet)?;
        if !ss.members.is_empty() {
            out.extend(ss.members.iter().cloned());
            return Ok(());
        }
        for subset in &ss.merge_sets {
            expand_static_set(fetcher, subset.clone(), out).await?;
        }
        Ok(())
    }
    .boxed()
}
