//! Canonical binary codec.
//!
//! A deterministic subset of CBOR used for everything content-addressed:
//! records, commits, MST nodes, CAR headers and firehose frames. The rules
//! that make it canonical:
//!
//! - integers use the minimal-length head form (no floats at all);
//! - map keys are UTF-8 strings, emitted sorted by byte length ascending and
//!   then byte-lexicographically;
//! - all lengths are definite;
//! - CID links are tag 42 wrapping a byte string `0x00 || cid_bytes`.
//!
//! `decode` is the left inverse of `encode` on the encoded subset and rejects
//! anything outside it. A non-canonical input is always reported, never
//! silently normalized — two byte strings that decode to the same [`Value`]
//! are the same byte string.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::cid::{Cid, CidError};

/// Nesting limit for decode; keeps hostile input from exhausting the stack.
const MAX_DEPTH: usize = 128;

/// A value in the canonical data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Boolean(bool),
    /// Signed 64-bit integer. The only numeric type in the model.
    Integer(i64),
    /// UTF-8 text.
    String(SmolStr),
    /// Raw bytes, distinct from text.
    Bytes(Bytes),
    /// Link to another content-addressed block.
    CidLink(Cid),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// String-keyed map with canonical key order.
    Map(Map),
}

impl Value {
    /// Shorthand for a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(SmolStr::new(s))
    }

    /// Returns the map if this value is one.
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the string payload if this value is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the integer payload if this value is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Converts a JSON value into the data model.
    ///
    /// `{"$link": "b…"}` becomes a [`Value::CidLink`], `{"$bytes": "…"}`
    /// (base64, no padding) becomes [`Value::Bytes`]. Floats are rejected:
    /// there is no representation for them on the wire.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CodecError> {
        use serde_json::Value as Json;
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => {
                let i = n.as_i64().ok_or(CodecError::FloatNotAllowed)?;
                Value::Integer(i)
            }
            Json::String(s) => Value::string(s),
            Json::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Value::from_json(item)?);
                }
                Value::Array(out)
            }
            Json::Object(fields) => {
                if fields.len() == 1 {
                    if let Some(Json::String(link)) = fields.get("$link") {
                        let cid = Cid::parse(link).map_err(CodecError::InvalidLink)?;
                        return Ok(Value::CidLink(cid));
                    }
                    if let Some(Json::String(b64)) = fields.get("$bytes") {
                        use base64::Engine as _;
                        let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
                            .decode(b64.as_bytes())
                            .map_err(|_| CodecError::InvalidByteSurface)?;
                        return Ok(Value::Bytes(Bytes::from(bytes)));
                    }
                }
                let mut map = Map::new();
                for (k, v) in fields {
                    map.insert(SmolStr::new(k), Value::from_json(v)?);
                }
                Value::Map(map)
            }
        })
    }

    /// Converts the value to its JSON surface form.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value as Json};
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(i) => json!(i),
            Value::String(s) => Json::String(s.to_string()),
            Value::Bytes(b) => {
                use base64::Engine as _;
                json!({ "$bytes": base64::engine::general_purpose::STANDARD_NO_PAD.encode(b) })
            }
            Value::CidLink(cid) => json!({ "$link": cid.to_string() }),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map.iter() {
                    out.insert(k.to_string(), v.to_json());
                }
                Json::Object(out)
            }
        }
    }
}

/// Canonical key comparison: byte length first, then byte order.
fn canonical_cmp(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

/// A string-keyed map held in canonical key order.
///
/// Keys are unique; inserting an existing key replaces its value. Iteration
/// order is the encoding order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Map {
    entries: Vec<(SmolStr, Value)>,
}

impl Map {
    /// Creates an empty map.
    pub fn new() -> Self {
        Map { entries: Vec::new() }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a key, replacing any existing value for it.
    pub fn insert(&mut self, key: impl Into<SmolStr>, value: Value) {
        let key = key.into();
        match self
            .entries
            .binary_search_by(|(k, _)| canonical_cmp(k, &key))
        {
            Ok(i) => self.entries[i].1 = value,
            Err(i) => self.entries.insert(i, (key, value)),
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .binary_search_by(|(k, _)| canonical_cmp(k, key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Removes a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries
            .binary_search_by(|(k, _)| canonical_cmp(k, key))
            .ok()
            .map(|i| self.entries.remove(i).1)
    }

    /// Iterates entries in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Convenience accessor for a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl<K: Into<SmolStr>> FromIterator<(K, Value)> for Map {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut map = Map::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Decode (and a few encode-side) failures.
///
/// Everything here surfaces over the wire as `MalformedEncoding`.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CodecError {
    /// Input ended inside an item.
    #[error("truncated input at byte {0}")]
    Truncated(usize),

    /// Bytes remained after the top-level item.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Indefinite-length item (additional info 31).
    #[error("indefinite-length items are not canonical")]
    IndefiniteLength,

    /// Floating point has no representation in the model.
    #[error("floating point is not representable")]
    FloatNotAllowed,

    /// An integer head used more bytes than its value requires.
    #[error("non-minimal integer head at byte {0}")]
    NonMinimalHead(usize),

    /// Unsigned value outside the i64 range.
    #[error("integer out of range at byte {0}")]
    IntegerOutOfRange(usize),

    /// Map key was not a text string.
    #[error("non-string map key at byte {0}")]
    NonStringKey(usize),

    /// Duplicate map key.
    #[error("duplicate map key {0:?}")]
    DuplicateKey(SmolStr),

    /// Map keys out of canonical order.
    #[error("map key {0:?} out of canonical order")]
    KeyOrder(SmolStr),

    /// Tag other than 42.
    #[error("unknown tag {0}")]
    UnknownTag(u64),

    /// Simple value other than false/true/null.
    #[error("unknown simple value {0}")]
    UnknownSimple(u8),

    /// Tag 42 content that is not a valid identity-prefixed CID.
    #[error("malformed cid link")]
    InvalidLink(#[source] CidError),

    /// Text was not valid UTF-8.
    #[error("invalid utf-8 in text string at byte {0}")]
    InvalidUtf8(usize),

    /// `{"$bytes": …}` surface form with bad base64.
    #[error("invalid base64 in $bytes value")]
    InvalidByteSurface,

    /// Additional-info values 28–30 are reserved.
    #[error("reserved head byte at {0}")]
    ReservedHead(usize),

    /// Nesting beyond [`MAX_DEPTH`].
    #[error("nesting deeper than {MAX_DEPTH}")]
    NestingTooDeep,
}

// major types
const MAJOR_UINT: u8 = 0;
const MAJOR_NEGINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u8 = 20;
const SIMPLE_TRUE: u8 = 21;
const SIMPLE_NULL: u8 = 22;

/// The only tag in the subset: a CID link.
const TAG_CID: u64 = 42;

/// Encodes a value to canonical bytes. Total and deterministic.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(0xf6),
        Value::Boolean(false) => out.push(0xf4),
        Value::Boolean(true) => out.push(0xf5),
        Value::Integer(i) => {
            if *i >= 0 {
                write_head(MAJOR_UINT, *i as u64, out);
            } else {
                // -1 - n; n fits u64 since i > i64::MIN - 1
                write_head(MAJOR_NEGINT, !(*i) as u64, out);
            }
        }
        Value::Bytes(b) => {
            write_head(MAJOR_BYTES, b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Value::String(s) => {
            write_head(MAJOR_TEXT, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::CidLink(cid) => {
            write_head(MAJOR_TAG, TAG_CID, out);
            let cid_bytes = cid.to_bytes();
            write_head(MAJOR_BYTES, (cid_bytes.len() + 1) as u64, out);
            out.push(0x00); // identity multibase prefix
            out.extend_from_slice(&cid_bytes);
        }
        Value::Array(items) => {
            write_head(MAJOR_ARRAY, items.len() as u64, out);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(map) => {
            // Map keeps entries sorted; re-sort defensively so the encoding
            // stays canonical even if the invariant is ever broken upstream.
            let mut entries: Vec<&(SmolStr, Value)> = map.entries.iter().collect();
            entries.sort_by(|(a, _), (b, _)| canonical_cmp(a, b));
            write_head(MAJOR_MAP, entries.len() as u64, out);
            for (k, v) in entries {
                write_head(MAJOR_TEXT, k.len() as u64, out);
                out.extend_from_slice(k.as_bytes());
                encode_into(v, out);
            }
        }
    }
}

fn write_head(major: u8, arg: u64, out: &mut Vec<u8>) {
    let m = major << 5;
    if arg < 24 {
        out.push(m | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(m | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(m | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(m | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(m | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

/// Decodes canonical bytes, rejecting anything outside the encoded subset.
///
/// The whole input must be one value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let mut d = Decoder { data, pos: 0 };
    let value = d.value(0)?;
    if d.pos != data.len() {
        return Err(CodecError::TrailingBytes(data.len() - d.pos));
    }
    Ok(value)
}

/// Computes the CID of a value's canonical encoding.
pub fn cid_for_value(value: &Value) -> Cid {
    Cid::for_struct(&encode(value))
}

struct Decoder<'d> {
    data: &'d [u8],
    pos: usize,
}

impl<'d> Decoder<'d> {
    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(CodecError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'d [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads a head, enforcing minimal-length encoding.
    fn head(&mut self) -> Result<(u8, u64), CodecError> {
        let start = self.pos;
        let initial = self.byte()?;
        let major = initial >> 5;
        let ai = initial & 0x1f;
        let arg = match ai {
            0..=23 => ai as u64,
            24 => {
                let v = self.byte()? as u64;
                if v < 24 {
                    return Err(CodecError::NonMinimalHead(start));
                }
                v
            }
            25 => {
                let v = u16::from_be_bytes(self.take(2)?.try_into().expect("len 2")) as u64;
                if v <= u8::MAX as u64 {
                    return Err(CodecError::NonMinimalHead(start));
                }
                v
            }
            26 => {
                let v = u32::from_be_bytes(self.take(4)?.try_into().expect("len 4")) as u64;
                if v <= u16::MAX as u64 {
                    return Err(CodecError::NonMinimalHead(start));
                }
                v
            }
            27 => {
                let v = u64::from_be_bytes(self.take(8)?.try_into().expect("len 8"));
                if v <= u32::MAX as u64 {
                    return Err(CodecError::NonMinimalHead(start));
                }
                v
            }
            31 => return Err(CodecError::IndefiniteLength),
            _ => return Err(CodecError::ReservedHead(start)),
        };
        Ok((major, arg))
    }

    fn text(&mut self, len: u64) -> Result<SmolStr, CodecError> {
        let start = self.pos;
        let raw = self.take(len as usize)?;
        std::str::from_utf8(raw)
            .map(SmolStr::new)
            .map_err(|_| CodecError::InvalidUtf8(start))
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::NestingTooDeep);
        }
        let start = self.pos;
        // Major 7 carries simple values and floats; its argument is not an
        // integer/length, so the minimal-head rules of `head()` don't apply.
        if let Some(initial) = self.data.get(self.pos).copied() {
            if initial >> 5 == MAJOR_SIMPLE {
                self.pos += 1;
                return match initial & 0x1f {
                    SIMPLE_FALSE => Ok(Value::Boolean(false)),
                    SIMPLE_TRUE => Ok(Value::Boolean(true)),
                    SIMPLE_NULL => Ok(Value::Null),
                    25 | 26 | 27 => Err(CodecError::FloatNotAllowed),
                    31 => Err(CodecError::IndefiniteLength),
                    other => Err(CodecError::UnknownSimple(other)),
                };
            }
        }
        let (major, arg) = self.head()?;
        match major {
            MAJOR_UINT => {
                if arg > i64::MAX as u64 {
                    return Err(CodecError::IntegerOutOfRange(start));
                }
                Ok(Value::Integer(arg as i64))
            }
            MAJOR_NEGINT => {
                if arg > i64::MAX as u64 {
                    return Err(CodecError::IntegerOutOfRange(start));
                }
                Ok(Value::Integer(-1 - arg as i64))
            }
            MAJOR_BYTES => Ok(Value::Bytes(Bytes::copy_from_slice(
                self.take(arg as usize)?,
            ))),
            MAJOR_TEXT => Ok(Value::String(self.text(arg)?)),
            MAJOR_ARRAY => {
                let mut items = Vec::with_capacity(arg.min(1024) as usize);
                for _ in 0..arg {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            MAJOR_MAP => {
                let mut entries = Vec::with_capacity(arg.min(1024) as usize);
                let mut prev: Option<SmolStr> = None;
                for _ in 0..arg {
                    let key_start = self.pos;
                    let (kmajor, klen) = self.head()?;
                    if kmajor != MAJOR_TEXT {
                        return Err(CodecError::NonStringKey(key_start));
                    }
                    let key = self.text(klen)?;
                    if let Some(prev) = &prev {
                        match canonical_cmp(prev, &key) {
                            Ordering::Less => {}
                            Ordering::Equal => return Err(CodecError::DuplicateKey(key)),
                            Ordering::Greater => return Err(CodecError::KeyOrder(key)),
                        }
                    }
                    prev = Some(key.clone());
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                Ok(Value::Map(Map { entries }))
            }
            MAJOR_TAG => {
                if arg != TAG_CID {
                    return Err(CodecError::UnknownTag(arg));
                }
                let (cmajor, clen) = self.head()?;
                if cmajor != MAJOR_BYTES {
                    return Err(CodecError::InvalidLink(CidError::BadLinkPayload));
                }
                let raw = self.take(clen as usize)?;
                if raw.first() != Some(&0x00) {
                    return Err(CodecError::InvalidLink(CidError::BadLinkPayload));
                }
                let cid = Cid::from_bytes(&raw[1..]).map_err(CodecError::InvalidLink)?;
                Ok(Value::CidLink(cid))
            }
            // handled above, before the general head read
            MAJOR_SIMPLE => unreachable!("simple values short-circuit"),
            _ => unreachable!("major is 3 bits"),
        }
    }
}

/// Writes an unsigned LEB128 varint. Shared by the CAR framing and the
/// firehose frame headers.
pub fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads an unsigned LEB128 varint, returning the value and bytes consumed.
pub fn read_uvarint(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return Err(CodecError::IntegerOutOfRange(i));
            }
            return Ok((value | ((b as u64) << shift), i + 1));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(CodecError::Truncated(data.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let bytes = encode(&value);
        let back = decode(&bytes).unwrap();
        assert_eq!(back, value);
        // encode . decode . encode is the identity on bytes
        assert_eq!(encode(&back), bytes);
    }

    #[test]
    fn roundtrip_scalars() {
        roundtrip(Value::Null);
        roundtrip(Value::Boolean(true));
        roundtrip(Value::Boolean(false));
        for i in [
            0i64,
            1,
            23,
            24,
            255,
            256,
            65535,
            65536,
            i64::MAX,
            -1,
            -24,
            -25,
            -256,
            -257,
            i64::MIN,
        ] {
            roundtrip(Value::Integer(i));
        }
        roundtrip(Value::string("hello"));
        roundtrip(Value::string(""));
        roundtrip(Value::Bytes(Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn roundtrip_containers() {
        roundtrip(Value::Array(vec![
            Value::Integer(1),
            Value::string("two"),
            Value::Null,
        ]));
        let map: Map = [
            ("text", Value::string("hi")),
            ("$type", Value::string("app.bsky.feed.post")),
            ("createdAt", Value::string("2024-01-01T00:00:00.000Z")),
        ]
        .into_iter()
        .collect();
        roundtrip(Value::Map(map));
    }

    #[test]
    fn roundtrip_cid_link() {
        let cid = Cid::for_struct(b"some block");
        roundtrip(Value::CidLink(cid));
    }

    #[test]
    fn integer_heads_are_minimal() {
        assert_eq!(encode(&Value::Integer(0)), vec![0x00]);
        assert_eq!(encode(&Value::Integer(23)), vec![0x17]);
        assert_eq!(encode(&Value::Integer(24)), vec![0x18, 24]);
        assert_eq!(encode(&Value::Integer(255)), vec![0x18, 255]);
        assert_eq!(encode(&Value::Integer(256)), vec![0x19, 0x01, 0x00]);
        assert_eq!(encode(&Value::Integer(-1)), vec![0x20]);
        assert_eq!(encode(&Value::Integer(-25)), vec![0x38, 24]);
    }

    #[test]
    fn map_keys_sorted_length_first() {
        let map: Map = [
            ("version", Value::Integer(1)),
            ("roots", Value::Array(vec![])),
            ("a", Value::Null),
        ]
        .into_iter()
        .collect();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "roots", "version"]);

        // "did" (3) sorts before "data" (4) despite 'i' > 'a'
        let map: Map = [("data", Value::Null), ("did", Value::Null)]
            .into_iter()
            .collect();
        let keys: Vec<&str> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["did", "data"]);
    }

    #[test]
    fn map_insert_replaces() {
        let mut map = Map::new();
        map.insert("k", Value::Integer(1));
        map.insert("k", Value::Integer(2));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("k"), Some(&Value::Integer(2)));
    }

    #[test]
    fn decode_rejects_truncated() {
        let bytes = encode(&Value::string("hello"));
        for cut in 1..bytes.len() {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(CodecError::Truncated(_))
            ));
        }
    }

    #[test]
    fn decode_rejects_trailing() {
        let mut bytes = encode(&Value::Integer(1));
        bytes.push(0x00);
        assert!(matches!(decode(&bytes), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn decode_rejects_floats() {
        // 1.5 as a half-float
        assert!(matches!(
            decode(&[0xf9, 0x3e, 0x00]),
            Err(CodecError::FloatNotAllowed)
        ));
        // 1.5 as a double
        assert!(matches!(
            decode(&[0xfb, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0]),
            Err(CodecError::FloatNotAllowed)
        ));
    }

    #[test]
    fn decode_rejects_indefinite() {
        assert!(matches!(
            decode(&[0x9f, 0x01, 0xff]),
            Err(CodecError::IndefiniteLength)
        ));
    }

    #[test]
    fn decode_rejects_non_minimal_head() {
        // 1 encoded with a one-byte argument
        assert!(matches!(
            decode(&[0x18, 0x01]),
            Err(CodecError::NonMinimalHead(0))
        ));
        // 100 encoded with a two-byte argument
        assert!(matches!(
            decode(&[0x19, 0x00, 0x64]),
            Err(CodecError::NonMinimalHead(0))
        ));
    }

    #[test]
    fn decode_rejects_non_string_key() {
        // {1: 2}
        assert!(matches!(
            decode(&[0xa1, 0x01, 0x02]),
            Err(CodecError::NonStringKey(1))
        ));
    }

    #[test]
    fn decode_rejects_duplicate_key() {
        // {"a": 1, "a": 2}
        assert!(matches!(
            decode(&[0xa2, 0x61, b'a', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::DuplicateKey(_))
        ));
    }

    #[test]
    fn decode_rejects_misordered_keys() {
        // {"b": 1, "a": 2} — lexicographically reversed
        assert!(matches!(
            decode(&[0xa2, 0x61, b'b', 0x01, 0x61, b'a', 0x02]),
            Err(CodecError::KeyOrder(_))
        ));
        // {"aa": 1, "b": 2} — length order violated
        assert!(matches!(
            decode(&[0xa2, 0x62, b'a', b'a', 0x01, 0x61, b'b', 0x02]),
            Err(CodecError::KeyOrder(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        // tag 0 around an int
        assert!(matches!(decode(&[0xc0, 0x01]), Err(CodecError::UnknownTag(0))));
    }

    #[test]
    fn decode_rejects_overflow_uint() {
        let mut bytes = vec![0x1b];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::IntegerOutOfRange(0))
        ));
    }

    #[test]
    fn cid_link_wire_form() {
        let cid = Cid::for_struct(b"x");
        let bytes = encode(&Value::CidLink(cid));
        // tag 42, bytes(37), 0x00, cid v1 dag codec
        assert_eq!(&bytes[..2], &[0xd8, 0x2a]);
        assert_eq!(bytes[2], 0x58); // bytes, one-byte length
        assert_eq!(bytes[3], 37);
        assert_eq!(bytes[4], 0x00);
        assert_eq!(bytes[5], 0x01); // cid version
        assert_eq!(bytes[6], 0x71); // struct codec
    }

    #[test]
    fn json_bridge_roundtrip() {
        let cid = Cid::for_raw(b"blob");
        let mut map = Map::new();
        map.insert("$type", Value::string("app.bsky.feed.like"));
        map.insert("ref", Value::CidLink(cid));
        map.insert("raw", Value::Bytes(Bytes::from_static(b"\x01\x02")));
        map.insert("count", Value::Integer(3));
        let value = Value::Map(map);

        let json = value.to_json();
        assert_eq!(json["ref"]["$link"], cid.to_string());
        let back = Value::from_json(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn json_bridge_rejects_floats() {
        let json: serde_json::Value = serde_json::from_str(r#"{"n": 1.5}"#).unwrap();
        assert!(matches!(
            Value::from_json(&json),
            Err(CodecError::FloatNotAllowed)
        ));
    }

    #[test]
    fn uvarint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(v, &mut buf);
            let (back, used) = read_uvarint(&buf).unwrap();
            assert_eq!(back, v);
            assert_eq!(used, buf.len());
        }
    }
}
