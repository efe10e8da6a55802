//! Tree operations.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use smol_str::SmolStr;
use weft_common::Cid;

use super::node::{Entry, Node};
use super::{layer_for_key, validate_key};
use crate::error::{RepoError, Result};

/// A persistent Merkle search tree.
///
/// Mutations return a new `Mst`; the original stays valid, sharing every
/// untouched node with its successor.
#[derive(Debug, Clone)]
pub struct Mst {
    root: Arc<Node>,
}

impl Mst {
    /// The empty tree.
    pub fn new() -> Self {
        Mst {
            root: Node::new(0, Vec::new()),
        }
    }

    /// The root node's CID.
    pub fn root_cid(&self) -> Cid {
        self.root.cid()
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.entries.is_empty()
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Result<Option<Cid>> {
        validate_key(key)?;
        Ok(get_in(&self.root, key))
    }

    /// Inserts or replaces a key, returning the new tree.
    pub fn insert(&self, key: &str, value: Cid) -> Result<Mst> {
        validate_key(key)?;
        let key_layer = layer_for_key(key);
        let root = if self.is_empty() {
            // first key decides the root layer
            Node::new(key_layer, vec![leaf(key, value)])
        } else if key_layer > self.root.layer {
            // grow upward: split what we have around the new key, then lift
            // both sides to just below the key's layer
            let (mut left, mut right) = split_around(&self.root, key)?;
            let extra = key_layer - self.root.layer;
            for _ in 1..extra {
                left = left.map(Node::parent_of);
                right = right.map(Node::parent_of);
            }
            let mut entries = Vec::with_capacity(3);
            if let Some(l) = left {
                entries.push(Entry::Tree(l));
            }
            entries.push(leaf(key, value));
            if let Some(r) = right {
                entries.push(Entry::Tree(r));
            }
            Node::new(key_layer, entries)
        } else {
            insert_in(&self.root, key, key_layer, value)?
        };
        Ok(Mst { root })
    }

    /// Removes a key, returning the new tree. Errors if the key is absent.
    pub fn delete(&self, key: &str) -> Result<Mst> {
        validate_key(key)?;
        let root = delete_in(&self.root, key)?;
        Ok(Mst {
            root: trim_top(root),
        })
    }

    /// All entries, in byte-lexicographic key order.
    pub fn leaves(&self) -> Vec<(SmolStr, Cid)> {
        let mut out = Vec::new();
        let _ = for_each_leaf(&self.root, false, &mut |key, value| {
            out.push((key.clone(), value));
            ControlFlow::Continue(())
        });
        out
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let _ = for_each_leaf(&self.root, false, &mut |_, _| {
            count += 1;
            ControlFlow::Continue(())
        });
        count
    }

    /// Entries matching `prefix`, after `cursor` (exclusive), up to `limit`,
    /// optionally in reverse order.
    pub fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
        reverse: bool,
    ) -> Vec<(SmolStr, Cid)> {
        let mut out = Vec::new();
        if limit == 0 {
            return out;
        }
        let _ = for_each_leaf(&self.root, reverse, &mut |key, value| {
            let past_cursor = match cursor {
                None => true,
                Some(cursor) if reverse => key.as_str() < cursor,
                Some(cursor) => key.as_str() > cursor,
            };
            if past_cursor && key.starts_with(prefix) {
                out.push((key.clone(), value));
                if out.len() >= limit {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        out
    }

    /// Every node block reachable from the root, pre-order.
    pub fn blocks(&self) -> Vec<(Cid, Bytes)> {
        let mut out = Vec::new();
        collect_blocks(&self.root, &mut out);
        out
    }

    pub(crate) fn root_node(&self) -> &Arc<Node> {
        &self.root
    }
}

impl Default for Mst {
    fn default() -> Self {
        Self::new()
    }
}

fn leaf(key: &str, value: Cid) -> Entry {
    Entry::Leaf {
        key: SmolStr::new(key),
        value,
    }
}

fn get_in(node: &Node, key: &str) -> Option<Cid> {
    let index = node.find_ge_leaf(key);
    if let Some(Entry::Leaf {
        key: leaf_key,
        value,
    }) = node.entries.get(index)
    {
        if leaf_key.as_str() == key {
            return Some(*value);
        }
    }
    if index > 0 {
        if let Some(Entry::Tree(subtree)) = node.entries.get(index - 1) {
            return get_in(subtree, key);
        }
    }
    None
}

fn insert_in(node: &Arc<Node>, key: &str, key_layer: usize, value: Cid) -> Result<Arc<Node>> {
    let index = node.find_ge_leaf(key);

    if key_layer == node.layer {
        // belongs at this node
        if let Some(Entry::Leaf { key: leaf_key, .. }) = node.entries.get(index) {
            if leaf_key.as_str() == key {
                let mut entries = node.entries.clone();
                entries[index] = leaf(key, value);
                return Ok(Node::new(node.layer, entries));
            }
        }
        match (index > 0).then(|| &node.entries[index - 1]) {
            Some(Entry::Tree(subtree)) => {
                // the subtree spans the key; split it around the new leaf
                let (left, right) = split_around(subtree, key)?;
                let mut entries = node.entries[..index - 1].to_vec();
                if let Some(l) = left {
                    entries.push(Entry::Tree(l));
                }
                entries.push(leaf(key, value));
                if let Some(r) = right {
                    entries.push(Entry::Tree(r));
                }
                entries.extend_from_slice(&node.entries[index..]);
                Ok(Node::new(node.layer, entries))
            }
            _ => {
                let mut entries = node.entries.clone();
                entries.insert(index, leaf(key, value));
                Ok(Node::new(node.layer, entries))
            }
        }
    } else {
        // belongs below; descend into (or create) the subtree before index
        debug_assert!(key_layer < node.layer);
        if index > 0 {
            if let Entry::Tree(subtree) = &node.entries[index - 1] {
                let new_subtree = insert_in(subtree, key, key_layer, value)?;
                let mut entries = node.entries.clone();
                entries[index - 1] = Entry::Tree(new_subtree);
                return Ok(Node::new(node.layer, entries));
            }
        }
        let child = Node::new(node.layer - 1, Vec::new());
        let new_subtree = insert_in(&child, key, key_layer, value)?;
        let mut entries = node.entries.clone();
        entries.insert(index, Entry::Tree(new_subtree));
        Ok(Node::new(node.layer, entries))
    }
}

/// Splits a node into entries < `key` and entries >= `key`, recursing into
/// the subtree that straddles the boundary.
fn split_around(node: &Arc<Node>, key: &str) -> Result<(Option<Arc<Node>>, Option<Arc<Node>>)> {
    let index = node.find_ge_leaf(key);
    let mut left_entries = node.entries[..index].to_vec();
    let mut right_entries = node.entries[index..].to_vec();

    if let Some(Entry::Tree(last)) = left_entries.last().cloned() {
        // the last left subtree may hold keys on both sides of the boundary
        left_entries.pop();
        let (sub_left, sub_right) = split_around(&last, key)?;
        if let Some(l) = sub_left {
            left_entries.push(Entry::Tree(l));
        }
        if let Some(r) = sub_right {
            right_entries.insert(0, Entry::Tree(r));
        }
    }

    let left = (!left_entries.is_empty()).then(|| Node::new(node.layer, left_entries));
    let right = (!right_entries.is_empty()).then(|| Node::new(node.layer, right_entries));
    Ok((left, right))
}

fn delete_in(node: &Arc<Node>, key: &str) -> Result<Arc<Node>> {
    let index = node.find_ge_leaf(key);

    if let Some(Entry::Leaf { key: leaf_key, .. }) = node.entries.get(index) {
        if leaf_key.as_str() == key {
            let prev = (index > 0).then(|| &node.entries[index - 1]);
            let next = node.entries.get(index + 1);
            if let (Some(Entry::Tree(left)), Some(Entry::Tree(right))) = (prev, next) {
                // removing the separating leaf leaves two adjacent subtrees
                let merged = merge_adjacent(left, right)?;
                let mut entries = node.entries[..index - 1].to_vec();
                entries.push(Entry::Tree(merged));
                entries.extend_from_slice(&node.entries[index + 2..]);
                return Ok(Node::new(node.layer, entries));
            }
            let mut entries = node.entries.clone();
            entries.remove(index);
            return Ok(Node::new(node.layer, entries));
        }
    }

    if index > 0 {
        if let Entry::Tree(subtree) = &node.entries[index - 1] {
            let new_subtree = delete_in(subtree, key)?;
            let mut entries = node.entries.clone();
            if new_subtree.entries.is_empty() {
                entries.remove(index - 1);
            } else {
                entries[index - 1] = Entry::Tree(new_subtree);
            }
            return Ok(Node::new(node.layer, entries));
        }
    }

    Err(RepoError::not_found("key", key))
}

/// Merges two same-layer siblings where every key in `right` is greater than
/// every key in `left`.
fn merge_adjacent(left: &Arc<Node>, right: &Arc<Node>) -> Result<Arc<Node>> {
    if left.layer != right.layer {
        return Err(RepoError::invalid_state(
            "cannot merge mst nodes from different layers",
        ));
    }
    if let (Some(Entry::Tree(a)), Some(Entry::Tree(b))) =
        (left.entries.last(), right.entries.first())
    {
        let merged = merge_adjacent(a, b)?;
        let mut entries = left.entries[..left.entries.len() - 1].to_vec();
        entries.push(Entry::Tree(merged));
        entries.extend_from_slice(&right.entries[1..]);
        return Ok(Node::new(left.layer, entries));
    }
    let mut entries = left.entries.clone();
    entries.extend_from_slice(&right.entries);
    Ok(Node::new(left.layer, entries))
}

/// Drops root layers that hold nothing but a single subtree.
fn trim_top(mut node: Arc<Node>) -> Arc<Node> {
    loop {
        if node.entries.len() == 1 {
            if let Entry::Tree(only) = &node.entries[0] {
                node = only.clone();
                continue;
            }
        }
        if node.entries.is_empty() && node.layer > 0 {
            return Node::new(0, Vec::new());
        }
        return node;
    }
}

/// Visits leaves in order (or reverse order); the callback can stop early.
fn for_each_leaf(
    node: &Node,
    reverse: bool,
    f: &mut impl FnMut(&SmolStr, Cid) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let entries: Box<dyn Iterator<Item = &Entry>> = if reverse {
        Box::new(node.entries.iter().rev())
    } else {
        Box::new(node.entries.iter())
    };
    for entry in entries {
        match entry {
            Entry::Leaf { key, value } => f(key, *value)?,
            Entry::Tree(subtree) => for_each_leaf(subtree, reverse, f)?,
        }
    }
    ControlFlow::Continue(())
}

fn collect_blocks(node: &Node, out: &mut Vec<(Cid, Bytes)>) {
    out.push((node.cid(), node.bytes()));
    for entry in &node.entries {
        if let Entry::Tree(subtree) = entry {
            collect_blocks(subtree, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Cid {
        Cid::for_struct(&[n])
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("app.bsky.feed.post/3l4qpz{i:07}"))
            .collect()
    }

    #[test]
    fn empty_tree() {
        let mst = Mst::new();
        assert!(mst.is_empty());
        assert_eq!(mst.get("some/key").unwrap(), None);
        assert_eq!(mst.len(), 0);
    }

    #[test]
    fn insert_and_get() {
        let mst = Mst::new().insert("coll.example/a", cid(1)).unwrap();
        assert_eq!(mst.get("coll.example/a").unwrap(), Some(cid(1)));
        assert_eq!(mst.get("coll.example/b").unwrap(), None);
    }

    #[test]
    fn insert_replaces() {
        let mst = Mst::new()
            .insert("coll.example/a", cid(1))
            .unwrap()
            .insert("coll.example/a", cid(2))
            .unwrap();
        assert_eq!(mst.get("coll.example/a").unwrap(), Some(cid(2)));
        assert_eq!(mst.len(), 1);
    }

    #[test]
    fn persistence_keeps_old_version() {
        let v1 = Mst::new().insert("coll.example/a", cid(1)).unwrap();
        let v2 = v1.insert("coll.example/b", cid(2)).unwrap();
        assert_eq!(v1.get("coll.example/b").unwrap(), None);
        assert_eq!(v2.get("coll.example/a").unwrap(), Some(cid(1)));
        assert_eq!(v2.get("coll.example/b").unwrap(), Some(cid(2)));
    }

    #[test]
    fn many_keys_listed_in_order() {
        let mut mst = Mst::new();
        let all = keys(200);
        // insert shuffled (fixed permutation)
        let mut shuffled = all.clone();
        shuffled.reverse();
        shuffled.swap(3, 100);
        shuffled.swap(50, 150);
        for (i, key) in shuffled.iter().enumerate() {
            mst = mst.insert(key, cid(i as u8)).unwrap();
        }
        let leaves = mst.leaves();
        assert_eq!(leaves.len(), all.len());
        let listed: Vec<String> = leaves.iter().map(|(k, _)| k.to_string()).collect();
        let mut expected = all.clone();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn shape_is_insertion_order_independent() {
        let all = keys(64);
        let mut forward = Mst::new();
        for key in &all {
            forward = forward.insert(key, cid(7)).unwrap();
        }
        let mut backward = Mst::new();
        for key in all.iter().rev() {
            backward = backward.insert(key, cid(7)).unwrap();
        }
        // a third order: evens then odds
        let mut interleaved = Mst::new();
        for key in all.iter().step_by(2).chain(all.iter().skip(1).step_by(2)) {
            interleaved = interleaved.insert(key, cid(7)).unwrap();
        }
        assert_eq!(forward.root_cid(), backward.root_cid());
        assert_eq!(forward.root_cid(), interleaved.root_cid());
    }

    #[test]
    fn delete_restores_prior_root() {
        let all = keys(32);
        let mut mst = Mst::new();
        for key in &all {
            mst = mst.insert(key, cid(1)).unwrap();
        }
        let before = mst.root_cid();
        let with_extra = mst.insert("zzz.example.coll/extra", cid(9)).unwrap();
        assert_ne!(with_extra.root_cid(), before);
        let after = with_extra.delete("zzz.example.coll/extra").unwrap();
        assert_eq!(after.root_cid(), before);
    }

    #[test]
    fn delete_every_key_in_random_order() {
        let all = keys(48);
        let mut mst = Mst::new();
        for key in &all {
            mst = mst.insert(key, cid(1)).unwrap();
        }
        let mut order = all.clone();
        order.swap(0, 40);
        order.swap(5, 20);
        order.reverse();
        for (i, key) in order.iter().enumerate() {
            mst = mst.delete(key).unwrap();
            assert_eq!(mst.get(key).unwrap(), None, "{key} still present");
            assert_eq!(mst.len(), all.len() - i - 1);
        }
        assert!(mst.is_empty());
        assert_eq!(mst.root_cid(), Mst::new().root_cid());
    }

    #[test]
    fn delete_missing_errors() {
        let mst = Mst::new().insert("coll.example/a", cid(1)).unwrap();
        assert!(mst.delete("coll.example/b").is_err());
        // tree unchanged
        assert_eq!(mst.get("coll.example/a").unwrap(), Some(cid(1)));
    }

    #[test]
    fn list_prefix_cursor_reverse() {
        let mut mst = Mst::new();
        for (key, n) in [
            ("app.bsky.feed.like/a", 1u8),
            ("app.bsky.feed.post/a", 2),
            ("app.bsky.feed.post/b", 3),
            ("app.bsky.feed.post/c", 4),
            ("app.bsky.graph.follow/a", 5),
        ] {
            mst = mst.insert(key, cid(n)).unwrap();
        }

        let posts = mst.list("app.bsky.feed.post/", 10, None, false);
        let keys: Vec<&str> = posts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "app.bsky.feed.post/a",
                "app.bsky.feed.post/b",
                "app.bsky.feed.post/c"
            ]
        );

        let limited = mst.list("app.bsky.feed.post/", 2, None, false);
        assert_eq!(limited.len(), 2);

        let after = mst.list("app.bsky.feed.post/", 10, Some("app.bsky.feed.post/a"), false);
        let keys: Vec<&str> = after.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["app.bsky.feed.post/b", "app.bsky.feed.post/c"]);

        let rev = mst.list("app.bsky.feed.post/", 10, None, true);
        let keys: Vec<&str> = rev.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "app.bsky.feed.post/c",
                "app.bsky.feed.post/b",
                "app.bsky.feed.post/a"
            ]
        );

        let rev_after = mst.list("app.bsky.feed.post/", 10, Some("app.bsky.feed.post/c"), true);
        let keys: Vec<&str> = rev_after.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["app.bsky.feed.post/b", "app.bsky.feed.post/a"]);
    }

    #[test]
    fn blocks_cover_all_nodes() {
        let mut mst = Mst::new();
        for key in keys(64) {
            mst = mst.insert(&key, cid(3)).unwrap();
        }
        let blocks = mst.blocks();
        assert_eq!(blocks[0].0, mst.root_cid());
        // every block re-hashes to its CID
        for (cid, bytes) in &blocks {
            assert!(cid.verify(bytes));
        }
        // and decodes as a node whose links appear in the block set
        let cids: std::collections::BTreeSet<Cid> = blocks.iter().map(|(c, _)| *c).collect();
        for (_, bytes) in &blocks {
            let node = super::super::NodeData::from_bytes(bytes).unwrap();
            for link in node.links() {
                assert!(cids.contains(&link), "dangling link {link}");
            }
        }
    }

    #[test]
    fn rejects_invalid_keys() {
        let mst = Mst::new();
        assert!(mst.insert("", cid(1)).is_err());
        assert!(mst.insert("bad key", cid(1)).is_err());
        assert!(mst.get("bad key").is_err());
    }
}
