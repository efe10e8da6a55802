//! Diffing two tree versions.
//!
//! A merge-walk over both trees' leaves in key order. When both walks stand
//! at a subtree boundary with the same CID the whole subtree is skipped, so
//! the walk only descends into regions that actually changed.

use std::sync::Arc;

use smol_str::SmolStr;
use weft_common::Cid;

use super::node::{Entry, Node};
use super::tree::Mst;

/// The difference between two tree versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MstDiff {
    /// Keys present only in the new tree.
    pub creates: Vec<(SmolStr, Cid)>,
    /// Keys present in both with different CIDs: (key, new, old).
    pub updates: Vec<(SmolStr, Cid, Cid)>,
    /// Keys present only in the old tree.
    pub deletes: Vec<(SmolStr, Cid)>,
}

impl MstDiff {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total operation count.
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

impl Mst {
    /// Computes the operations that turn `self` into `other`.
    pub fn diff(&self, other: &Mst) -> MstDiff {
        let mut diff = MstDiff::default();
        if self.root_cid() == other.root_cid() {
            return diff;
        }
        let mut old = Walk::new(self.root_node().clone());
        let mut new = Walk::new(other.root_node().clone());
        loop {
            match (old.current(), new.current()) {
                (Pos::End, Pos::End) => break,
                (Pos::End, Pos::Leaf(key, cid)) => {
                    diff.creates.push((key, cid));
                    new.advance();
                }
                (Pos::Leaf(key, cid), Pos::End) => {
                    diff.deletes.push((key, cid));
                    old.advance();
                }
                (Pos::End, Pos::Tree(_)) => new.advance(),
                (Pos::Tree(_), Pos::End) => old.advance(),
                (Pos::Tree(a), Pos::Tree(b)) => {
                    if a.cid() == b.cid() {
                        old.skip_subtree();
                        new.skip_subtree();
                    } else if a.layer > b.layer {
                        old.advance();
                    } else if b.layer > a.layer {
                        new.advance();
                    } else {
                        old.advance();
                        new.advance();
                    }
                }
                (Pos::Tree(_), Pos::Leaf(..)) => old.advance(),
                (Pos::Leaf(..), Pos::Tree(_)) => new.advance(),
                (Pos::Leaf(old_key, old_cid), Pos::Leaf(new_key, new_cid)) => {
                    match old_key.cmp(&new_key) {
                        std::cmp::Ordering::Equal => {
                            if old_cid != new_cid {
                                diff.updates.push((old_key, new_cid, old_cid));
                            }
                            old.advance();
                            new.advance();
                        }
                        std::cmp::Ordering::Less => {
                            diff.deletes.push((old_key, old_cid));
                            old.advance();
                        }
                        std::cmp::Ordering::Greater => {
                            diff.creates.push((new_key, new_cid));
                            new.advance();
                        }
                    }
                }
            }
        }
        diff
    }
}

/// Where a walk currently stands.
enum Pos {
    /// Past the last entry.
    End,
    /// At a leaf.
    Leaf(SmolStr, Cid),
    /// At a subtree boundary (not yet descended).
    Tree(Arc<Node>),
}

/// An in-order walk with explicit subtree boundaries.
struct Walk {
    // (node, index of next entry)
    stack: Vec<(Arc<Node>, usize)>,
}

impl Walk {
    fn new(root: Arc<Node>) -> Self {
        let mut walk = Walk {
            stack: vec![(root, 0)],
        };
        walk.settle();
        walk
    }

    /// Pops exhausted frames.
    fn settle(&mut self) {
        while let Some((node, index)) = self.stack.last() {
            if *index >= node.entries.len() {
                self.stack.pop();
            } else {
                break;
            }
        }
    }

    fn current(&self) -> Pos {
        match self.stack.last() {
            None => Pos::End,
            Some((node, index)) => match &node.entries[*index] {
                Entry::Leaf { key, value } => Pos::Leaf(key.clone(), *value),
                Entry::Tree(subtree) => Pos::Tree(subtree.clone()),
            },
        }
    }

    /// Steps past a leaf, or descends into the subtree at the cursor.
    fn advance(&mut self) {
        let Some((node, index)) = self.stack.last_mut() else {
            return;
        };
        match &node.entries[*index] {
            Entry::Leaf { .. } => *index += 1,
            Entry::Tree(subtree) => {
                let subtree = subtree.clone();
                *index += 1;
                self.stack.push((subtree, 0));
            }
        }
        self.settle();
    }

    /// Steps past the current entry without descending.
    fn skip_subtree(&mut self) {
        if let Some((_, index)) = self.stack.last_mut() {
            *index += 1;
        }
        self.settle();
    }
}
