#![deny(missing_docs)]

//! # keep_house
//!
//! **keep_house** is the storage core of a personal content-addressed
//! archive.  Every stored object is an immutable blob named by the hash
//! of its bytes.  Everything else (files, directories, mutable objects,
//! and their history) is layered on top as *schema blobs*: JSON
//! documents in a canonical byte layout, stored as ordinary blobs and
//! referencing other blobs by content address.
//!
//! ## Layers
//!
//! * **[`blobref`]**: the `<algo>-<hex>` content-address value type and
//!   the closed hash-algorithm registry.
//! * **[`store`]**: the raw blob store capability traits
//!   (receive/fetch/stat/enumerate) and an in-memory reference store.
//! * **[`rolling`]**: the windowed rolling checksum that drives
//!   content-defined chunking.
//! * **[`schema`]**: parsing and building of `file`, `bytes`,
//!   `directory`, `static-set`, `permanode`, and `claim` blobs, including
//!   the canonical JSON layout that defines their identity.
//! * **[`filewriter`]**: cuts a byte stream into chunks with the rolling
//!   checksum and writes the `bytes`/`file` tree, with bounded concurrent
//!   uploads.
//! * **[`filereader`]**: random-access reconstruction of a stream from
//!   its schema tree, with a single-flight sub-tree cache.
//! * **[`dirreader`]**: enumeration of directory children through
//!   static-sets and merge-sets.
//! * **[`jsonsign`]**: detached signing and verification of permanodes
//!   and claims, spliced into the canonical JSON itself.
//! * **[`describe`]**: folding signed claims into a permanode's current
//!   state, behind the [`describe::Describer`] trait.
//! * **[`fsview`]**: a read-only filesystem view with TTL-based
//!   re-resolution of permanode-backed nodes.
//!
//! ## Example
//!
//! Writing a stream and reading it back:
//!
//! ```rust
//! use keep_house::{
//!     write_file, BlobFetcher, BlobStore, FileReader, MemoryStore, WriteFileOptions,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> keep_house::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let writer_store: Arc<dyn BlobStore> = store.clone();
//! let root = write_file(writer_store, WriteFileOptions::default(), &b"hello"[..]).await?;
//!
//! let fetcher: Arc<dyn BlobFetcher> = store;
//! let reader = FileReader::new(fetcher, &root).await?;
//! assert_eq!(reader.read_all().await?, b"hello");
//! # Ok(())
//! # }
//! ```

/// Content-address identity for blobs.
pub mod blobref;
/// Resolving permanodes by walking signed claims.
pub mod describe;
/// Enumeration of directory schema blobs.
pub mod dirreader;
/// Error taxonomy shared by every component.
pub mod error;
/// Random-access reconstruction of file trees.
pub mod filereader;
/// Content-defined chunking and schema tree writing.
pub mod filewriter;
/// Read-only filesystem view with TTL refresh.
pub mod fsview;
/// Detached signing of schema blobs.
pub mod jsonsign;
/// Rolling checksum for content-defined chunking.
pub mod rolling;
/// The schema-blob model.
pub mod schema;
/// Raw blob store capability traits and the memory store.
pub mod store;

pub use blobref::{Algorithm, BlobRef, Hasher, SizedRef};
pub use describe::{Claim, DescribeResponse, DescribedBlob, Describer, FileInfo, StoreDescriber};
pub use dirreader::{DirReader, DirectoryEntry};
pub use error::{Error, ErrorKind, Result};
pub use filereader::{FileCursor, FileReader};
pub use filewriter::{write_bytes, write_file, WriteFileOptions, CHUNKS_IN_FLIGHT};
pub use fsview::{FsView, NodeInfo, ViewConfig, ViewNode};
pub use jsonsign::{verify_json, KeySigner, VerifiedSignature};
pub use rolling::RollingSum;
pub use schema::{Builder, CamliType, ClaimType, Part, SchemaBlob, Superset, Time3339};
pub use store::{
    fetch_bytes, BlobEnumerator, BlobFetcher, BlobReceiver, BlobStatter, BlobStore, MemoryStore,
};
