//! CAR (content-addressable archive) framing.
//!
//! Layout: `varint(len(header)) || header` where the header is the canonical
//! encoding of `{version: 1, roots: [link…]}`, followed by one section per
//! block: `varint(len(cid_bytes) + len(data)) || cid_bytes || data`.
//!
//! The writer emits blocks in the order given; repository export orders them
//! commit first, then MST nodes, then record blocks. The reader verifies
//! every block's bytes against its declared CID.

use bytes::Bytes;
use weft_common::codec::{self, read_uvarint, write_uvarint, Map, Value};
use weft_common::Cid;

use crate::error::{RepoError, Result};

/// A parsed archive.
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// Root CIDs from the header, in order.
    pub roots: Vec<Cid>,
    /// Blocks in archive order.
    pub blocks: Vec<(Cid, Bytes)>,
}

impl ParsedCar {
    /// Looks up a block by CID.
    pub fn get(&self, cid: &Cid) -> Option<&Bytes> {
        self.blocks
            .iter()
            .find(|(c, _)| c == cid)
            .map(|(_, data)| data)
    }
}

/// Writes an archive with a single root.
pub fn write_car<I>(root: Cid, blocks: I) -> Vec<u8>
where
    I: IntoIterator<Item = (Cid, Bytes)>,
{
    let mut header_map = Map::new();
    header_map.insert("roots", Value::Array(vec![Value::CidLink(root)]));
    header_map.insert("version", Value::Integer(1));
    let header = codec::encode(&Value::Map(header_map));

    let mut out = Vec::with_capacity(header.len() + 64);
    write_uvarint(header.len() as u64, &mut out);
    out.extend_from_slice(&header);

    for (cid, data) in blocks {
        let cid_bytes = cid.to_bytes();
        write_uvarint((cid_bytes.len() + data.len()) as u64, &mut out);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(&data);
    }
    out
}

/// Parses an archive, verifying each block's CID against its bytes.
pub fn parse_car(data: &[u8]) -> Result<ParsedCar> {
    let (header_len, used) = read_uvarint(data).map_err(|_| RepoError::car("bad header length"))?;
    let mut pos = used;
    let header_end = pos
        .checked_add(header_len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| RepoError::car("truncated header"))?;
    let header = codec::decode(&data[pos..header_end])
        .map_err(|e| RepoError::car(format!("header: {e}")))?;
    pos = header_end;

    let header_map = header
        .as_map()
        .ok_or_else(|| RepoError::car("header is not a map"))?;
    match header_map.get("version").and_then(Value::as_integer) {
        Some(1) => {}
        other => return Err(RepoError::car(format!("unsupported version {other:?}"))),
    }
    let Some(Value::Array(raw_roots)) = header_map.get("roots") else {
        return Err(RepoError::car("header missing roots"));
    };
    let mut roots = Vec::with_capacity(raw_roots.len());
    for raw in raw_roots {
        match raw {
            Value::CidLink(cid) => roots.push(*cid),
            _ => return Err(RepoError::car("root is not a link")),
        }
    }

    let mut blocks = Vec::new();
    while pos < data.len() {
        let (section_len, used) =
            read_uvarint(&data[pos..]).map_err(|_| RepoError::car("bad section length"))?;
        pos += used;
        let section_end = pos
            .checked_add(section_len as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| RepoError::car("truncated section"))?;
        let section = &data[pos..section_end];
        pos = section_end;

        // cid bytes are self-delimiting: version, codec, hash algo, digest len
        let cid_len = cid_byte_len(section)?;
        let cid = Cid::from_bytes(&section[..cid_len])
            .map_err(|e| RepoError::car(format!("section cid: {e}")))?;
        let payload = &section[cid_len..];
        if !cid.verify(payload) {
            return Err(RepoError::car(format!("block does not hash to {cid}")));
        }
        blocks.push((cid, Bytes::copy_from_slice(payload)));
    }

    Ok(ParsedCar { roots, blocks })
}

/// Length of the leading CID within a section (v1, sha-256: four varints +
/// 32 digest bytes).
fn cid_byte_len(section: &[u8]) -> Result<usize> {
    let mut pos = 0;
    for _ in 0..4 {
        let (_, used) =
            read_uvarint(&section[pos..]).map_err(|_| RepoError::car("truncated section cid"))?;
        pos += used;
    }
    let end = pos + 32;
    if end > section.len() {
        return Err(RepoError::car("truncated section cid digest"));
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(data: &[u8]) -> (Cid, Bytes) {
        (Cid::for_struct(data), Bytes::copy_from_slice(data))
    }

    #[test]
    fn roundtrip() {
        let (cid1, data1) = block(b"first block");
        let (cid2, data2) = block(b"second block");
        let car = write_car(cid1, vec![(cid1, data1.clone()), (cid2, data2.clone())]);

        let parsed = parse_car(&car).unwrap();
        assert_eq!(parsed.roots, vec![cid1]);
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.get(&cid1), Some(&data1));
        assert_eq!(parsed.get(&cid2), Some(&data2));
    }

    #[test]
    fn header_shape() {
        let (cid, data) = block(b"only");
        let car = write_car(cid, vec![(cid, data)]);
        let (header_len, used) = read_uvarint(&car).unwrap();
        let header = codec::decode(&car[used..used + header_len as usize]).unwrap();
        let map = header.as_map().unwrap();
        assert_eq!(map.get("version"), Some(&Value::Integer(1)));
        assert!(matches!(map.get("roots"), Some(Value::Array(r)) if r.len() == 1));
    }

    #[test]
    fn rejects_corrupted_block() {
        let (cid, data) = block(b"payload");
        let mut car = write_car(cid, vec![(cid, data)]);
        let last = car.len() - 1;
        car[last] ^= 0xff;
        assert!(parse_car(&car).is_err());
    }

    #[test]
    fn rejects_truncation() {
        let (cid, data) = block(b"payload");
        let car = write_car(cid, vec![(cid, data)]);
        // a cut exactly at the header boundary is a valid zero-block archive;
        // everything after that must fail
        let (header_len, used) = read_uvarint(&car).unwrap();
        let boundary = used + header_len as usize;
        assert!(parse_car(&car[..boundary]).is_ok());
        for cut in boundary + 1..car.len() {
            assert!(parse_car(&car[..cut]).is_err(), "cut at {cut} parsed");
        }
        for cut in 1..boundary {
            assert!(parse_car(&car[..cut]).is_err(), "header cut at {cut} parsed");
        }
    }

    #[test]
    fn empty_block_list_is_valid() {
        let root = Cid::for_struct(b"root");
        let car = write_car(root, vec![]);
        let parsed = parse_car(&car).unwrap();
        assert_eq!(parsed.roots, vec![root]);
        assert!(parsed.blocks.is_empty());
    }
}
