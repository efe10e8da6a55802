//! `at://` record URIs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Did, IdentError, Nsid, RecordKey};

/// A fully-qualified record URI: `at://<did>/<collection>/<rkey>`.
///
/// Parsing is strict: exactly those three segments, each validated. This is
/// the form interaction subjects and reply references use, so anything looser
/// would let malformed targets deep into the dispatcher.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AtUri {
    /// Repository authority.
    pub did: Did,
    /// Collection NSID.
    pub collection: Nsid,
    /// Record key within the collection.
    pub rkey: RecordKey,
}

impl AtUri {
    /// Builds a URI from parts.
    pub fn new(did: Did, collection: Nsid, rkey: RecordKey) -> Self {
        AtUri { did, collection, rkey }
    }

    /// Parses `at://<did>/<collection>/<rkey>`.
    pub fn parse(uri: &str) -> Result<Self, IdentError> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| IdentError::new("at-uri", uri, "missing at:// scheme"))?;
        let mut segments = rest.split('/');
        let did = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IdentError::new("at-uri", uri, "missing authority"))?;
        let collection = segments
            .next()
            .ok_or_else(|| IdentError::new("at-uri", uri, "missing collection"))?;
        let rkey = segments
            .next()
            .ok_or_else(|| IdentError::new("at-uri", uri, "missing record key"))?;
        if segments.next().is_some() {
            return Err(IdentError::new("at-uri", uri, "trailing segments"));
        }
        Ok(AtUri {
            did: Did::new(did)?,
            collection: Nsid::new(collection)?,
            rkey: RecordKey::new(rkey)?,
        })
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for AtUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        AtUri::parse(&s).map_err(serde::de::Error::custom)
    }
}
