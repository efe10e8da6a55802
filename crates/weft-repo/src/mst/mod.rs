//! Merkle search tree.
//!
//! The authoritative key → CID index for the repository. The tree's shape is
//! a pure function of its key set: each key's layer is the number of leading
//! zero bits in `sha256(key)`, and a key at layer L sits L levels above the
//! leaves. Same keys, same values — same root CID, regardless of insertion
//! order.
//!
//! Operations are synchronous and persistent: a mutation clones the O(depth)
//! nodes along the touched path and shares the rest.

mod diff;
mod node;
mod tree;

pub use diff::MstDiff;
pub use node::{NodeData, WireEntry};
pub use tree::Mst;

use sha2::{Digest, Sha256};

use crate::error::{RepoError, Result};

/// Maximum MST key length in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Layer for a key: leading zero bits of its SHA-256 digest.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash)
}

fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validates an MST key: non-empty, bounded, `collection/rkey` charset.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(RepoError::invalid_key("(empty)"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(RepoError::invalid_key(format!(
            "{} bytes, max {MAX_KEY_LEN}",
            key.len()
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '~' | '-' | '/'))
    {
        return Err(RepoError::invalid_key(key));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_is_deterministic() {
        let a = layer_for_key("app.bsky.feed.post/3l4qpz7ajrc2a");
        let b = layer_for_key("app.bsky.feed.post/3l4qpz7ajrc2a");
        assert_eq!(a, b);
        assert!(a < 256);
    }

    #[test]
    fn leading_zero_count() {
        assert_eq!(leading_zeros(&[0xff, 0, 0]), 0);
        assert_eq!(leading_zeros(&[0x80, 0]), 0);
        assert_eq!(leading_zeros(&[0x40, 0]), 1);
        assert_eq!(leading_zeros(&[0, 0x80]), 8);
        assert_eq!(leading_zeros(&[0, 0x01]), 15);
        assert_eq!(leading_zeros(&[0, 0, 0, 1]), 31);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("app.bsky.feed.post/abc123").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("emoji🧵").is_err());
        assert!(validate_key(&"x".repeat(257)).is_err());
    }
}
