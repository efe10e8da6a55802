//! Repository paths: the MST key space.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::SmolStr;

use super::{IdentError, Nsid, RecordKey};

/// A record's position in the repository: `<collection>/<rkey>`.
///
/// Paths order byte-lexicographically on the joined string, which is the
/// order the MST and `listRecords` expose.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RepoPath {
    joined: SmolStr,
    collection_len: usize,
}

impl RepoPath {
    /// Builds a path from validated parts.
    pub fn new(collection: &Nsid, rkey: &RecordKey) -> Self {
        let joined = SmolStr::new(format!("{}/{}", collection, rkey));
        RepoPath {
            collection_len: collection.as_str().len(),
            joined,
        }
    }

    /// Parses and validates `<collection>/<rkey>`.
    pub fn parse(path: &str) -> Result<Self, IdentError> {
        let (collection, rkey) = path
            .split_once('/')
            .ok_or_else(|| IdentError::new("repo path", path, "missing '/'"))?;
        if rkey.contains('/') {
            return Err(IdentError::new("repo path", path, "extra '/'"));
        }
        let collection = Nsid::new(collection)?;
        let rkey = RecordKey::new(rkey)?;
        Ok(Self::new(&collection, &rkey))
    }

    /// The collection segment.
    pub fn collection(&self) -> &str {
        &self.joined[..self.collection_len]
    }

    /// The record-key segment.
    pub fn rkey(&self) -> &str {
        &self.joined[self.collection_len + 1..]
    }

    /// The joined form used as the MST key.
    pub fn as_str(&self) -> &str {
        &self.joined
    }
}

impl PartialOrd for RepoPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RepoPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.joined.as_bytes().cmp(other.joined.as_bytes())
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined)
    }
}

impl fmt::Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPath({})", self.joined)
    }
}

impl FromStr for RepoPath {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        RepoPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
