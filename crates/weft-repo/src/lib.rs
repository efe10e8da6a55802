//! Repository engine for the weft personal data server.
//!
//! The pieces that make a repository a repository:
//!
//! - **MST**: a persistent Merkle search tree indexing record keys. Pure CPU,
//!   structural sharing, deterministic shape.
//! - **Commits**: the signed chain anchoring each MST root.
//! - **CAR**: content-addressable archive framing for whole-repo sync.
//! - **Repository**: the write facade tying those together — swap-checked
//!   mutations that advance `(rev, root, commit)` atomically.
//! - **BlobStore**: CID-keyed byte storage with MIME/size metadata.
//! - **StateStore**: the persistence seam; memory and filesystem backends.
//!
//! The MST and commit layers never suspend; all awaits happen against the
//! state store.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod blob;
pub mod car;
pub mod commit;
pub mod error;
pub mod mst;
pub mod repository;
pub mod store;

pub use blob::{BlobInfo, BlobStore};
pub use commit::Commit;
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{Mst, MstDiff};
pub use repository::{CommitResult, OpAction, RecordEntry, RepoOp, Repository};
pub use store::{FsStateStore, MemoryStateStore, StateStore};
