//! Content identifiers.
//!
//! CIDv1 with a SHA-256 multihash, restricted to the two codecs the engine
//! actually produces: `0x71` for canonically-encoded structures and `0x55`
//! for raw blob bytes. Rendered as `b` + lowercase base32 (no padding).

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Multicodec for canonically-encoded structure blocks.
pub const CODEC_STRUCT: u64 = 0x71;

/// Multicodec for raw byte blocks (blobs).
pub const CODEC_RAW: u64 = 0x55;

/// Multihash code for SHA-256.
const HASH_SHA2_256: u64 = 0x12;

/// SHA-256 digest length.
const DIGEST_LEN: usize = 32;

/// CID parse/construction failures.
#[derive(Debug, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CidError {
    /// String did not begin with the base32 multibase prefix `b`.
    #[error("cid must begin with 'b'")]
    BadPrefix,

    /// Body was not lowercase base32 in the expected alphabet.
    #[error("cid body is not base32-lower")]
    BadBase32,

    /// Only CIDv1 is representable.
    #[error("unsupported cid version {0}")]
    BadVersion(u64),

    /// Codec other than 0x71 / 0x55.
    #[error("unsupported cid codec 0x{0:x}")]
    BadCodec(u64),

    /// Hash algorithm other than SHA-256.
    #[error("unsupported multihash 0x{0:x}")]
    BadHashAlgo(u64),

    /// Digest length other than 32.
    #[error("bad digest length {0}")]
    BadDigestLen(u64),

    /// Byte form truncated or carrying trailing bytes.
    #[error("malformed cid bytes")]
    BadBytes,

    /// Tag-42 payload missing the identity prefix or carrying junk.
    #[error("malformed cid link payload")]
    BadLinkPayload,
}

/// A version-1 content identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    /// Hashes `data` under the given codec.
    pub fn for_bytes(codec: u64, data: &[u8]) -> Self {
        let digest: [u8; DIGEST_LEN] = Sha256::digest(data).into();
        Cid { codec, digest }
    }

    /// CID of a canonically-encoded structure block.
    pub fn for_struct(data: &[u8]) -> Self {
        Self::for_bytes(CODEC_STRUCT, data)
    }

    /// CID of a raw byte block.
    pub fn for_raw(data: &[u8]) -> Self {
        Self::for_bytes(CODEC_RAW, data)
    }

    /// The codec field.
    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// The SHA-256 digest.
    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// True when `data` hashes to this CID's digest.
    pub fn verify(&self, data: &[u8]) -> bool {
        let digest: [u8; DIGEST_LEN] = Sha256::digest(data).into();
        digest == self.digest
    }

    /// Binary form: `0x01 || varint(codec) || 0x12 || 0x20 || digest`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + DIGEST_LEN);
        write_uvarint(1, &mut out);
        write_uvarint(self.codec, &mut out);
        write_uvarint(HASH_SHA2_256, &mut out);
        write_uvarint(DIGEST_LEN as u64, &mut out);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parses the binary form, consuming the whole slice.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CidError> {
        fn field(data: &[u8], pos: &mut usize) -> Result<u64, CidError> {
            let (v, used) = read_uvarint(&data[*pos..]).ok_or(CidError::BadBytes)?;
            *pos += used;
            Ok(v)
        }
        let mut pos = 0;
        let version = field(data, &mut pos)?;
        if version != 1 {
            return Err(CidError::BadVersion(version));
        }
        let codec = field(data, &mut pos)?;
        if codec != CODEC_STRUCT && codec != CODEC_RAW {
            return Err(CidError::BadCodec(codec));
        }
        let hash_algo = field(data, &mut pos)?;
        if hash_algo != HASH_SHA2_256 {
            return Err(CidError::BadHashAlgo(hash_algo));
        }
        let digest_len = field(data, &mut pos)?;
        if digest_len != DIGEST_LEN as u64 {
            return Err(CidError::BadDigestLen(digest_len));
        }
        let rest = &data[pos..];
        if rest.len() != DIGEST_LEN {
            return Err(CidError::BadBytes);
        }
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(rest);
        Ok(Cid { codec, digest })
    }

    /// Parses the string form (`b` + base32-lower, no padding).
    pub fn parse(s: &str) -> Result<Self, CidError> {
        let Some(body) = s.strip_prefix('b') else {
            return Err(CidError::BadPrefix);
        };
        if body
            .bytes()
            .any(|b| !matches!(b, b'a'..=b'z' | b'2'..=b'7'))
        {
            return Err(CidError::BadBase32);
        }
        let (base, bytes) = multibase::decode(s).map_err(|_| CidError::BadBase32)?;
        if base != multibase::Base::Base32Lower {
            return Err(CidError::BadPrefix);
        }
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&multibase::encode(
            multibase::Base::Base32Lower,
            self.to_bytes(),
        ))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Cid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Cid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = serde::Deserialize::deserialize(deserializer)?;
        Cid::parse(&s).map_err(serde::de::Error::custom)
    }
}

// Local varint helpers; `codec` depends on this module, not the other way
// around, so the byte-level routines live here too.

fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return None;
            }
            return Some((value | ((b as u64) << shift), i + 1));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
