//! Record keys.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

use super::IdentError;
use crate::tid::Tid;

static RKEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._:~-]{1,512}$").unwrap());

/// A record key: in practice a TID, or the literal `self` for singletons.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordKey(SmolStr);

impl RecordKey {
    /// Validating constructor.
    pub fn new(rkey: impl AsRef<str>) -> Result<Self, IdentError> {
        let rkey = rkey.as_ref();
        if rkey == "." || rkey == ".." {
            return Err(IdentError::new("record key", rkey, "reserved"));
        }
        if !RKEY_REGEX.is_match(rkey) {
            return Err(IdentError::new("record key", rkey, "invalid characters"));
        }
        Ok(RecordKey(SmolStr::new(rkey)))
    }

    /// The `self` key used by singleton records (profile).
    pub fn self_key() -> Self {
        RecordKey(SmolStr::new_static("self"))
    }

    /// Parses this key as a TID, when it is one.
    pub fn as_tid(&self) -> Option<Tid> {
        Tid::parse(&self.0).ok()
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Tid> for RecordKey {
    fn from(tid: Tid) -> Self {
        RecordKey(SmolStr::new(tid.to_string()))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", self.0)
    }
}

impl FromStr for RecordKey {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        RecordKey::new(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for RecordKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for RecordKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}
