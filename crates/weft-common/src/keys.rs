//! Repository signing keys.
//!
//! One P-256 keypair per node, created at first boot and stable thereafter.
//! Signatures are raw `r || s` (64 bytes); the DER forms some stacks produce
//! never appear on the wire here. The public key exports as a Multikey
//! string: `z` + base58btc(varint(0x1200) || SEC1 compressed point).

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};

/// Multicodec for P-256 public keys.
const P256_MULTICODEC: u64 = 0x1200;

/// Key handling failures.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum KeyError {
    /// PEM parse/serialize failure.
    #[error("bad pem: {0}")]
    Pem(String),

    /// Multibase string did not decode.
    #[error("bad multibase key encoding")]
    Multibase,

    /// Multicodec prefix missing or truncated.
    #[error("bad multicodec prefix")]
    Multicodec,

    /// Key codec other than P-256.
    #[error("unsupported key codec 0x{0:x}")]
    UnsupportedCodec(u64),

    /// Point bytes did not describe a curve point.
    #[error("invalid curve point")]
    InvalidPoint,
}

/// The node's P-256 signing keypair.
#[derive(Clone)]
pub struct RepoSigningKey {
    inner: SigningKey,
}

impl RepoSigningKey {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        RepoSigningKey {
            inner: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Loads the private key from PKCS#8 PEM.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let inner = SigningKey::from_pkcs8_pem(pem).map_err(|e| KeyError::Pem(e.to_string()))?;
        Ok(RepoSigningKey { inner })
    }

    /// Serializes the private key as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String, KeyError> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(|e| KeyError::Pem(e.to_string()))
    }

    /// Serializes the public half as SPKI PEM.
    pub fn public_pem(&self) -> Result<String, KeyError> {
        self.inner
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Pem(e.to_string()))
    }

    /// Signs a message, returning the raw 64-byte `r || s` signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig: Signature = self.inner.sign(msg);
        sig.to_bytes().into()
    }

    /// Verifies a raw signature against this key's public half.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        self.public_key().verify(msg, sig)
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// Multikey export of the public half.
    pub fn public_multibase(&self) -> String {
        self.public_key().to_multibase()
    }
}

impl std::fmt::Debug for RepoSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never prints key material
        write!(f, "RepoSigningKey({})", self.public_multibase())
    }
}

/// A P-256 public key, decodable from Multikey strings.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Decodes a Multikey (`z…`) string.
    pub fn from_multibase(s: &str) -> Result<Self, KeyError> {
        let (base, data) = multibase::decode(s).map_err(|_| KeyError::Multibase)?;
        if base != multibase::Base::Base58Btc {
            return Err(KeyError::Multibase);
        }
        let (code, offset) = decode_uvarint(&data).ok_or(KeyError::Multicodec)?;
        if code != P256_MULTICODEC {
            return Err(KeyError::UnsupportedCodec(code));
        }
        let inner = VerifyingKey::from_sec1_bytes(&data[offset..])
            .map_err(|_| KeyError::InvalidPoint)?;
        Ok(PublicKey { inner })
    }

    /// Loads the public key from SPKI PEM.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let inner =
            VerifyingKey::from_public_key_pem(pem).map_err(|e| KeyError::Pem(e.to_string()))?;
        Ok(PublicKey { inner })
    }

    /// Multikey string: `z` + base58btc(varint(0x1200) || compressed point).
    pub fn to_multibase(&self) -> String {
        let mut buf = Vec::with_capacity(35);
        encode_uvarint(P256_MULTICODEC, &mut buf);
        buf.extend_from_slice(self.inner.to_encoded_point(true).as_bytes());
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// Verifies a raw 64-byte `r || s` signature.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        self.inner.verify(msg, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_multibase())
    }
}

fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
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
