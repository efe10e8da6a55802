//! The content-source seam.
//!
//! The host application's posts, comments and counters live outside this
//! crate; the engine only needs a narrow surface: key lookups for resolving
//! interaction targets, and sinks for likes, reposts, followers and replies.
//! Sinks are idempotent — redelivery of the same interaction must be a
//! no-op, and each method reports whether it changed anything.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use weft_common::{Did, Handle, RecordKey};

/// A remote actor attributed to an interaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Author {
    /// The actor's DID.
    pub did: Did,
    /// The actor's handle.
    pub handle: Handle,
}

/// A reply pulled off the network, destined for the host's comment model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Local record key of the thread root.
    pub root: RecordKey,
    /// Local record key of the direct parent, when the parent is local.
    pub parent: Option<RecordKey>,
    /// Who wrote it.
    pub author: Author,
    /// Reply text.
    pub text: String,
    /// Author-asserted creation time (RFC 3339).
    pub created_at: String,
}

/// What the host application exposes to the engine.
pub trait ContentSource: Send + Sync {
    /// True when a local item exists under this record key.
    fn contains(&self, rkey: &RecordKey) -> bool;

    /// A like landed on a local item. Returns false on redelivery.
    fn like(&self, rkey: &RecordKey, author: &Author) -> bool;

    /// A like was undone.
    fn unlike(&self, rkey: &RecordKey, author: &Author) -> bool;

    /// A repost landed on a local item.
    fn repost(&self, rkey: &RecordKey, author: &Author) -> bool;

    /// A repost was undone.
    fn unrepost(&self, rkey: &RecordKey, author: &Author) -> bool;

    /// The local actor gained a follower.
    fn follower_added(&self, author: &Author) -> bool;

    /// A follower went away.
    fn follower_removed(&self, author: &Author) -> bool;

    /// A reply arrived for a local thread.
    fn store_reply(&self, reply: Reply) -> bool;
}

/// In-memory content source for tests and embedding examples.
#[derive(Debug, Default)]
pub struct MemoryContentSource {
    inner: Mutex<MemoryContentInner>,
}

#[derive(Debug, Default)]
struct MemoryContentInner {
    items: BTreeSet<RecordKey>,
    likes: BTreeSet<(RecordKey, Did)>,
    reposts: BTreeSet<(RecordKey, Did)>,
    followers: BTreeMap<Did, Handle>,
    replies: Vec<Reply>,
}

impl MemoryContentSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local item so interactions against it resolve.
    pub fn add_item(&self, rkey: RecordKey) {
        self.inner.lock().expect("content lock").items.insert(rkey);
    }

    /// Like count for an item.
    pub fn like_count(&self, rkey: &RecordKey) -> usize {
        self.inner
            .lock()
            .expect("content lock")
            .likes
            .iter()
            .filter(|(k, _)| k == rkey)
            .count()
    }

    /// Repost count for an item.
    pub fn repost_count(&self, rkey: &RecordKey) -> usize {
        self.inner
            .lock()
            .expect("content lock")
            .reposts
            .iter()
            .filter(|(k, _)| k == rkey)
            .count()
    }

    /// Current follower DIDs.
    pub fn followers(&self) -> Vec<Did> {
        self.inner
            .lock()
            .expect("content lock")
            .followers
            .keys()
            .cloned()
            .collect()
    }

    /// Stored replies, in arrival order.
    pub fn replies(&self) -> Vec<Reply> {
        self.inner.lock().expect("content lock").replies.clone()
    }
}

impl ContentSource for MemoryContentSource {
    fn contains(&self, rkey: &RecordKey) -> bool {
        self.inner.lock().expect("content lock").items.contains(rkey)
    }

    fn like(&self, rkey: &RecordKey, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .likes
            .insert((rkey.clone(), author.did.clone()))
    }

    fn unlike(&self, rkey: &RecordKey, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .likes
            .remove(&(rkey.clone(), author.did.clone()))
    }

    fn repost(&self, rkey: &RecordKey, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .reposts
            .insert((rkey.clone(), author.did.clone()))
    }

    fn unrepost(&self, rkey: &RecordKey, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .reposts
            .remove(&(rkey.clone(), author.did.clone()))
    }

    fn follower_added(&self, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .followers
            .insert(author.did.clone(), author.handle.clone())
            .is_none()
    }

    fn follower_removed(&self, author: &Author) -> bool {
        self.inner
            .lock()
            .expect("content lock")
            .followers
            .remove(&author.did)
            .is_some()
    }

    fn store_reply(&self, reply: Reply) -> bool {
        let mut inner = self.inner.lock().expect("content lock");
        let duplicate = inner
            .replies
            .iter()
            .any(|r| r.author == reply.author && r.root == reply.root && r.text == reply.text);
        if duplicate {
            return false;
        }
        inner.replies.push(reply);
        true
    }
}
