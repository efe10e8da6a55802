//! Decentralized identifiers.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

use super::IdentError;

static DID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap());

/// A DID. This node mints `did:web` identities; remote authors may use any
/// method, so the syntax check is method-generic.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Did(SmolStr);

impl Did {
    /// Validating constructor.
    pub fn new(did: impl AsRef<str>) -> Result<Self, IdentError> {
        let did = did.as_ref();
        if did.len() > 2048 {
            return Err(IdentError::new("did", did, "too long"));
        }
        if !DID_REGEX.is_match(did) {
            return Err(IdentError::new("did", did, "does not match did syntax"));
        }
        Ok(Did(SmolStr::new(did)))
    }

    /// Builds the `did:web` identity for a host (port percent-encoded, path
    /// segments colon-separated per the did:web method).
    pub fn for_web_host(host: &str, port: Option<u16>, path_segments: &[&str]) -> Result<Self, IdentError> {
        let mut s = String::with_capacity(host.len() + 16);
        s.push_str("did:web:");
        s.push_str(host);
        if let Some(port) = port {
            s.push_str("%3A");
            s.push_str(&port.to_string());
        }
        for seg in path_segments {
            s.push(':');
            s.push_str(seg);
        }
        Did::new(s)
    }

    /// The method segment (`web`, `plc`, …).
    pub fn method(&self) -> &str {
        self.0
            .strip_prefix("did:")
            .and_then(|rest| rest.split(':').next())
            .expect("validated on construction")
    }

    /// For a `did:web`, the HTTPS host (with percent-decoded port) the
    /// identity resolves through. `None` for other methods.
    pub fn web_host(&self) -> Option<String> {
        let rest = self.0.strip_prefix("did:web:")?;
        let host_part = rest.split(':').next()?;
        Some(host_part.replace("%3A", ":").replace("%3a", ":"))
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl FromStr for Did {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        Did::new(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_forms() {
        assert!(Did::new("did:web:example.com").is_ok());
        assert!(Did::new("did:web:pds.example.com%3A8443").is_ok());
        assert!(Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").is_ok());
    }

    #[test]
    fn rejects_junk() {
        assert!(Did::new("").is_err());
        assert!(Did::new("did:").is_err());
        assert!(Did::new("did:WEB:example.com").is_err());
        assert!(Did::new("not-a-did").is_err());
        assert!(Did::new("did:web:").is_err());
    }

    #[test]
    fn web_host_decodes_port() {
        let did = Did::for_web_host("blog.example", Some(8443), &[]).unwrap();
        assert_eq!(did.as_str(), "did:web:blog.example%3A8443");
        assert_eq!(did.web_host().unwrap(), "blog.example:8443");
        assert_eq!(did.method(), "web");
    }

    #[test]
    fn web_host_with_path_segments() {
        let did = Did::for_web_host("example.com", None, &["users", "alice"]).unwrap();
        assert_eq!(did.as_str(), "did:web:example.com:users:alice");
        assert_eq!(did.web_host().unwrap(), "example.com");
    }

    #[test]
    fn non_web_has_no_host() {
        let did = Did::new("did:plc:abc234").unwrap();
        assert_eq!(did.web_host(), None);
        assert_eq!(did.method(), "plc");
    }
}
