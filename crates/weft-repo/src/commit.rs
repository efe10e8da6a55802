//! Signed repository commits.
//!
//! A commit anchors one MST root: `{did, version: 3, data, rev, prev, sig}`.
//! The signature covers the canonical encoding of the commit with `sig` set
//! to null; verification reconstructs exactly that form. The chain is
//! linear — `prev` names the commit that was current immediately before this
//! one, and the genesis commit carries `prev: null`.

use bytes::Bytes;
use weft_common::codec::{self, Map, Value};
use weft_common::{Cid, Did, PublicKey, RepoSigningKey, Tid};

use crate::error::{RepoError, Result};

/// The only commit version this node writes.
pub const COMMIT_VERSION: i64 = 3;

/// A repository commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Repository DID.
    pub did: Did,
    /// Object version; always 3.
    pub version: i64,
    /// MST root this commit anchors.
    pub data: Cid,
    /// Revision TID; strictly increasing along the chain.
    pub rev: Tid,
    /// Previous commit CID; `None` only for genesis.
    pub prev: Option<Cid>,
    /// Raw `r || s` P-256 signature over the unsigned form.
    pub sig: Bytes,
}

/// A commit together with its canonical bytes and CID.
#[derive(Debug, Clone)]
pub struct SignedCommit {
    /// The commit object.
    pub commit: Commit,
    /// Canonical encoding of the signed commit.
    pub bytes: Bytes,
    /// CID of `bytes`.
    pub cid: Cid,
}

impl Commit {
    /// Builds and signs a commit for the given MST root.
    ///
    /// Fails (rather than ever writing an unsigned commit) if the resulting
    /// signature does not verify against the signer's own public key.
    pub fn build(
        did: Did,
        data: Cid,
        rev: Tid,
        prev: Option<Cid>,
        key: &RepoSigningKey,
    ) -> Result<SignedCommit> {
        let mut commit = Commit {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig: Bytes::new(),
        };
        let unsigned = commit.unsigned_bytes();
        let sig = key.sign(&unsigned);
        if !key.verify(&unsigned, &sig) {
            return Err(RepoError::crypto("commit signature failed self-check"));
        }
        commit.sig = Bytes::copy_from_slice(&sig);
        let bytes = Bytes::from(codec::encode(&commit.to_value()));
        let cid = Cid::for_struct(&bytes);
        Ok(SignedCommit { commit, bytes, cid })
    }

    /// Canonical encoding of the commit with `sig` nulled; the signing input.
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut value = self.to_value();
        if let Value::Map(map) = &mut value {
            map.insert("sig", Value::Null);
        }
        codec::encode(&value)
    }

    /// Verifies the signature against a public key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&self.unsigned_bytes(), &self.sig)
    }

    /// The commit's canonical value form.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("did", Value::string(self.did.as_str()));
        map.insert("version", Value::Integer(self.version));
        map.insert("data", Value::CidLink(self.data));
        map.insert("rev", Value::string(self.rev.to_string()));
        map.insert(
            "prev",
            match self.prev {
                Some(cid) => Value::CidLink(cid),
                None => Value::Null,
            },
        );
        map.insert(
            "sig",
            if self.sig.is_empty() {
                Value::Null
            } else {
                Value::Bytes(self.sig.clone())
            },
        );
        Value::Map(map)
    }

    /// Parses a decoded value as a commit.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| RepoError::invalid_state("commit is not a map"))?;
        let did = map
            .get_str("did")
            .ok_or_else(|| RepoError::invalid_state("commit missing did"))
            .and_then(|s| {
                Did::new(s).map_err(|e| RepoError::new(crate::RepoErrorKind::InvalidState, Some(Box::new(e))))
            })?;
        let version = map
            .get("version")
            .and_then(Value::as_integer)
            .ok_or_else(|| RepoError::invalid_state("commit missing version"))?;
        if version != COMMIT_VERSION {
            return Err(RepoError::invalid_state(format!(
                "unsupported commit version {version}"
            )));
        }
        let Some(Value::CidLink(data)) = map.get("data") else {
            return Err(RepoError::invalid_state("commit missing data link"));
        };
        let rev = map
            .get_str("rev")
            .ok_or_else(|| RepoError::invalid_state("commit missing rev"))
            .and_then(|s| {
                Tid::parse(s).map_err(|e| RepoError::new(crate::RepoErrorKind::InvalidState, Some(Box::new(e))))
            })?;
        let prev = match map.get("prev") {
            Some(Value::CidLink(cid)) => Some(*cid),
            Some(Value::Null) | None => None,
            Some(_) => return Err(RepoError::invalid_state("commit prev is not a link")),
        };
        let sig = match map.get("sig") {
            Some(Value::Bytes(sig)) => sig.clone(),
            Some(Value::Null) => Bytes::new(),
            _ => return Err(RepoError::invalid_state("commit missing sig")),
        };
        Ok(Commit {
            did,
            version,
            data: *data,
            rev,
            prev,
            sig,
        })
    }

    /// Parses canonical bytes as a commit.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_value(&codec::decode(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::Ticker;

    fn build_one() -> (SignedCommit, RepoSigningKey) {
        let key = RepoSigningKey::generate();
        let did = Did::new("did:web:blog.example").unwrap();
        let rev = Ticker::with_clock_id(1).next();
        let data = Cid::for_struct(b"mst root");
        let signed = Commit::build(did, data, rev, None, &key).unwrap();
        (signed, key)
    }

    #[test]
    fn build_signs_and_verifies() {
        let (signed, key) = build_one();
        assert_eq!(signed.commit.version, 3);
        assert_eq!(signed.commit.sig.len(), 64);
        assert!(signed.commit.verify(&key.public_key()));
        assert_eq!(Cid::for_struct(&signed.bytes), signed.cid);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (signed, _) = build_one();
        let other = RepoSigningKey::generate();
        assert!(!signed.commit.verify(&other.public_key()));
    }

    #[test]
    fn tampered_commit_fails_verification() {
        let (signed, key) = build_one();
        let mut tampered = signed.commit.clone();
        tampered.data = Cid::for_struct(b"different root");
        assert!(!tampered.verify(&key.public_key()));
    }

    #[test]
    fn bytes_roundtrip() {
        let (signed, key) = build_one();
        let parsed = Commit::from_bytes(&signed.bytes).unwrap();
        assert_eq!(parsed, signed.commit);
        assert!(parsed.verify(&key.public_key()));
    }

    #[test]
    fn chain_links_previous() {
        let key = RepoSigningKey::generate();
        let did = Did::new("did:web:blog.example").unwrap();
        let ticker = Ticker::with_clock_id(2);
        let genesis = Commit::build(
            did.clone(),
            Cid::for_struct(b"root0"),
            ticker.next(),
            None,
            &key,
        )
        .unwrap();
        assert_eq!(genesis.commit.prev, None);

        let second = Commit::build(
            did,
            Cid::for_struct(b"root1"),
            ticker.next(),
            Some(genesis.cid),
            &key,
        )
        .unwrap();
        assert_eq!(second.commit.prev, Some(genesis.cid));
        assert!(second.commit.rev > genesis.commit.rev);
    }

    #[test]
    fn unsigned_form_has_null_sig() {
        let (signed, _) = build_one();
        let unsigned = signed.commit.unsigned_bytes();
        let value = weft_common::codec::decode(&unsigned).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("sig"), Some(&Value::Null));
        // same fields otherwise
        assert_eq!(map.get_str("did"), Some("did:web:blog.example"));
    }
}
