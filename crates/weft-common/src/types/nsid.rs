//! Namespaced identifiers (reverse-DNS collection names).

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

use super::IdentError;

static NSID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+(\.[a-zA-Z][a-zA-Z0-9]{0,62})$",
    )
    .unwrap()
});

/// A namespaced identifier like `app.bsky.feed.post`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Nsid(SmolStr);

impl Nsid {
    /// Validating constructor.
    pub fn new(nsid: impl AsRef<str>) -> Result<Self, IdentError> {
        let nsid = nsid.as_ref();
        if nsid.len() > 317 {
            return Err(IdentError::new("nsid", nsid, "too long"));
        }
        if !NSID_REGEX.is_match(nsid) {
            return Err(IdentError::new("nsid", nsid, "not a valid nsid"));
        }
        Ok(Nsid(SmolStr::new(nsid)))
    }

    /// The reversed-domain authority (everything before the final segment).
    pub fn domain_authority(&self) -> &str {
        let split = self.0.rfind('.').expect("validated on construction");
        &self.0[..split]
    }

    /// The final name segment.
    pub fn name(&self) -> &str {
        let split = self.0.rfind('.').expect("validated on construction");
        &self.0[split + 1..]
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nsid({})", self.0)
    }
}

impl FromStr for Nsid {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Nsid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        Nsid::new(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for Nsid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Nsid {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_collections() {
        for nsid in [
            "app.bsky.feed.post",
            "app.bsky.feed.like",
            "app.bsky.graph.follow",
            "app.bsky.actor.profile",
            "com.atproto.repo.getRecord",
        ] {
            assert!(Nsid::new(nsid).is_ok(), "{nsid}");
        }
    }

    #[test]
    fn segments() {
        let nsid = Nsid::new("app.bsky.feed.post").unwrap();
        assert_eq!(nsid.domain_authority(), "app.bsky.feed");
        assert_eq!(nsid.name(), "post");
    }

    #[test]
    fn rejects_junk() {
        assert!(Nsid::new("").is_err());
        assert!(Nsid::new("nodots").is_err());
        assert!(Nsid::new("two.segments").is_err());
        assert!(Nsid::new("bad..dots.name").is_err());
        assert!(Nsid::new("app.bsky.feed.9name").is_err());
        assert!(Nsid::new("app.bsky.feed.po st").is_err());
    }
}
