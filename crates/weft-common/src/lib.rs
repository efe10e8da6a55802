//! Shared data model for the weft personal data server.
//!
//! This crate holds the CPU-only primitives everything else is built on:
//!
//! - **Codec**: the canonical binary encoding used for records, commits and
//!   MST nodes. Deterministic by construction; decoding is strict.
//! - **CID**: content identifiers over the canonical encoding (or raw bytes,
//!   for blobs).
//! - **TID**: 13-character sortable timestamp identifiers and the monotonic
//!   generator that issues them.
//! - **Identifiers**: validated DID / handle / NSID / record-key / at-uri
//!   newtypes.
//! - **Keys**: the P-256 repository signing key, raw-signature operations and
//!   multikey export.
//!
//! Nothing in here suspends. I/O lives in `weft-repo` and `weft-pds`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cid;
pub mod codec;
pub mod keys;
pub mod tid;
pub mod types;

pub use cid::Cid;
pub use codec::{CodecError, Map, Value};
pub use keys::{PublicKey, RepoSigningKey};
pub use tid::{Ticker, Tid};
pub use types::{AtUri, Did, Handle, Nsid, RecordKey, RepoPath};
