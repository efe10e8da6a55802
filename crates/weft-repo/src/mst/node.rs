//! MST node representation and wire format.
//!
//! In memory a node is an interleaved entry list — subtree pointers between
//! the leaves they separate, never two subtrees adjacent. On the wire a node
//! is the map `{e, l}`: `l` is the leftmost subtree link (or null), and each
//! element of `e` is either a leaf `{k, v}` or a branch
//! `{k: splitter, p: layer, t: link}` where the splitter is the smallest key
//! in the subtree.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use smol_str::SmolStr;
use weft_common::codec::{self, Map, Value};
use weft_common::Cid;

use crate::error::{RepoError, Result};

/// One slot in a node's interleaved entry list.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    /// Subtree one layer down.
    Tree(Arc<Node>),
    /// Key → record CID.
    Leaf { key: SmolStr, value: Cid },
}

impl Entry {
    pub(crate) fn is_tree(&self) -> bool {
        matches!(self, Entry::Tree(_))
    }
}

/// An immutable MST node. Shared between tree versions via `Arc`; the
/// encoded form and CID are computed once on demand.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) layer: usize,
    pub(crate) entries: Vec<Entry>,
    cache: OnceLock<(Cid, Bytes)>,
}

impl Node {
    pub(crate) fn new(layer: usize, entries: Vec<Entry>) -> Arc<Node> {
        debug_assert!(
            !entries.windows(2).any(|w| w[0].is_tree() && w[1].is_tree()),
            "adjacent subtrees in node"
        );
        Arc::new(Node {
            layer,
            entries,
            cache: OnceLock::new(),
        })
    }

    /// Wraps an existing node in a single-entry parent one layer up.
    pub(crate) fn parent_of(child: Arc<Node>) -> Arc<Node> {
        let layer = child.layer + 1;
        Node::new(layer, vec![Entry::Tree(child)])
    }

    fn encoded(&self) -> &(Cid, Bytes) {
        self.cache.get_or_init(|| {
            let bytes = codec::encode(&self.to_wire_value());
            (Cid::for_struct(&bytes), Bytes::from(bytes))
        })
    }

    /// This node's CID.
    pub(crate) fn cid(&self) -> Cid {
        self.encoded().0
    }

    /// This node's canonical bytes.
    pub(crate) fn bytes(&self) -> Bytes {
        self.encoded().1.clone()
    }

    /// Smallest key anywhere under this node.
    pub(crate) fn first_key(&self) -> Option<SmolStr> {
        for entry in &self.entries {
            match entry {
                Entry::Leaf { key, .. } => return Some(key.clone()),
                Entry::Tree(subtree) => {
                    if let Some(key) = subtree.first_key() {
                        return Some(key);
                    }
                }
            }
        }
        None
    }

    /// Index of the first leaf with key >= `key`; `entries.len()` if none.
    pub(crate) fn find_ge_leaf(&self, key: &str) -> usize {
        for (i, entry) in self.entries.iter().enumerate() {
            if let Entry::Leaf { key: leaf_key, .. } = entry {
                if leaf_key.as_str() >= key {
                    return i;
                }
            }
        }
        self.entries.len()
    }

    /// Builds the wire-format value for this node.
    pub(crate) fn to_wire_value(&self) -> Value {
        let mut left = Value::Null;
        let mut wire_entries = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                Entry::Tree(subtree) if i == 0 => {
                    left = Value::CidLink(subtree.cid());
                }
                Entry::Tree(subtree) => {
                    let mut branch = Map::new();
                    branch.insert(
                        "k",
                        Value::String(subtree.first_key().unwrap_or_default()),
                    );
                    branch.insert("p", Value::Integer(subtree.layer as i64));
                    branch.insert("t", Value::CidLink(subtree.cid()));
                    wire_entries.push(Value::Map(branch));
                }
                Entry::Leaf { key, value } => {
                    let mut leaf = Map::new();
                    leaf.insert("k", Value::String(key.clone()));
                    leaf.insert("v", Value::CidLink(*value));
                    wire_entries.push(Value::Map(leaf));
                }
            }
        }
        let mut node = Map::new();
        node.insert("e", Value::Array(wire_entries));
        node.insert("l", left);
        Value::Map(node)
    }
}

/// Decoded wire form of a node; what a sync consumer reconstructs from CAR
/// blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Leftmost subtree link.
    pub left: Option<Cid>,
    /// Entries in key order.
    pub entries: Vec<WireEntry>,
}

/// A decoded node entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEntry {
    /// Leaf: key → record CID.
    Leaf {
        /// Full record key.
        key: SmolStr,
        /// Record CID.
        value: Cid,
    },
    /// Branch: pointer to a subtree.
    Branch {
        /// Smallest key in the subtree.
        splitter: SmolStr,
        /// Subtree layer.
        layer: i64,
        /// Subtree node CID.
        link: Cid,
    },
}

impl NodeData {
    /// Parses a decoded value as an MST node.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| RepoError::invalid_state("mst node is not a map"))?;
        let left = match map.get("l") {
            Some(Value::CidLink(cid)) => Some(*cid),
            Some(Value::Null) | None => None,
            Some(_) => return Err(RepoError::invalid_state("mst node 'l' is not a link")),
        };
        let Some(Value::Array(raw_entries)) = map.get("e") else {
            return Err(RepoError::invalid_state("mst node 'e' is not an array"));
        };
        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let entry = raw
                .as_map()
                .ok_or_else(|| RepoError::invalid_state("mst entry is not a map"))?;
            let key = entry
                .get_str("k")
                .ok_or_else(|| RepoError::invalid_state("mst entry missing 'k'"))?;
            match (entry.get("t"), entry.get("v")) {
                (Some(Value::CidLink(link)), None) => {
                    let layer = entry
                        .get("p")
                        .and_then(Value::as_integer)
                        .ok_or_else(|| RepoError::invalid_state("mst branch missing 'p'"))?;
                    entries.push(WireEntry::Branch {
                        splitter: SmolStr::new(key),
                        layer,
                        link: *link,
                    });
                }
                (None, Some(Value::CidLink(value))) => {
                    entries.push(WireEntry::Leaf {
                        key: SmolStr::new(key),
                        value: *value,
                    });
                }
                _ => return Err(RepoError::invalid_state("mst entry is neither leaf nor branch")),
            }
        }
        Ok(NodeData { left, entries })
    }

    /// Parses canonical bytes as an MST node.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_value(&codec::decode(data)?)
    }

    /// Every subtree link in this node, left first.
    pub fn links(&self) -> Vec<Cid> {
        let mut out = Vec::new();
        if let Some(left) = self.left {
            out.push(left);
        }
        for entry in &self.entries {
            if let WireEntry::Branch { link, .. } = entry {
                out.push(*link);
            }
        }
        out
    }
}
