//! Validated identifier newtypes.
//!
//! Each type validates on construction and is transparent to serde, so a bad
//! identifier never makes it past a deserialization boundary.

mod aturi;
mod did;
mod handle;
mod nsid;
mod path;
mod rkey;

pub use aturi::AtUri;
pub use did::Did;
pub use handle::Handle;
pub use nsid::Nsid;
pub use path::RepoPath;
pub use rkey::RecordKey;

use smol_str::SmolStr;

/// Identifier validation failure.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
#[error("invalid {kind}: {input:?} ({reason})")]
pub struct IdentError {
    /// Which identifier type rejected the input.
    pub kind: &'static str,
    /// The offending input (possibly truncated).
    pub input: SmolStr,
    /// Short reason.
    pub reason: &'static str,
}

impl IdentError {
    pub(crate) fn new(kind: &'static str, input: &str, reason: &'static str) -> Self {
        let mut end = input.len().min(64);
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        IdentError {
            kind,
            input: SmolStr::new(&input[..end]),
            reason,
        }
    }
}
