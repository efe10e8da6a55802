//! Incoming-record dispatch.
//!
//! Remote repositories talk about us in their own records: likes and reposts
//! of our posts, follows of our actor, replies into our threads. The
//! dispatcher classifies an incoming record by `$type`, resolves its target
//! against the local DID, and forwards it to the content-source sinks.
//! Records that don't concern us are ignored, never errors.

use std::sync::Arc;

use weft_common::codec::Value;
use weft_common::{AtUri, Did, Handle, RecordKey};

use crate::content::{Author, ContentSource, Reply};

/// An incoming record, classified by `$type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingRecord {
    /// `app.bsky.feed.like`
    Like {
        /// The liked record.
        subject: AtUri,
    },
    /// `app.bsky.feed.repost`
    Repost {
        /// The reposted record.
        subject: AtUri,
    },
    /// `app.bsky.graph.follow`
    Follow {
        /// The followed actor.
        subject: Did,
    },
    /// `app.bsky.feed.post` (interesting only when it replies to us)
    Post {
        /// Thread root reference.
        reply_root: Option<AtUri>,
        /// Direct parent reference.
        reply_parent: Option<AtUri>,
        /// Post text.
        text: String,
        /// Author-asserted creation time.
        created_at: String,
    },
    /// Everything else.
    Other,
}

impl IncomingRecord {
    /// Classifies a record value. Unknown or malformed records classify as
    /// [`IncomingRecord::Other`].
    pub fn classify(record: &Value) -> Self {
        let Some(map) = record.as_map() else {
            return IncomingRecord::Other;
        };
        match map.get_str("$type") {
            Some("app.bsky.feed.like") => match subject_uri(record) {
                Some(subject) => IncomingRecord::Like { subject },
                None => IncomingRecord::Other,
            },
            Some("app.bsky.feed.repost") => match subject_uri(record) {
                Some(subject) => IncomingRecord::Repost { subject },
                None => IncomingRecord::Other,
            },
            Some("app.bsky.graph.follow") => {
                match map.get_str("subject").and_then(|s| Did::new(s).ok()) {
                    Some(subject) => IncomingRecord::Follow { subject },
                    None => IncomingRecord::Other,
                }
            }
            Some("app.bsky.feed.post") => {
                let reply = map.get("reply").and_then(Value::as_map);
                let reply_ref = |name: &str| -> Option<AtUri> {
                    reply
                        .and_then(|r| r.get(name))
                        .and_then(Value::as_map)
                        .and_then(|r| r.get_str("uri"))
                        .and_then(|uri| AtUri::parse(uri).ok())
                };
                IncomingRecord::Post {
                    reply_root: reply_ref("root"),
                    reply_parent: reply_ref("parent"),
                    text: map.get_str("text").unwrap_or_default().to_owned(),
                    created_at: map.get_str("createdAt").unwrap_or_default().to_owned(),
                }
            }
            _ => IncomingRecord::Other,
        }
    }
}

/// Like/repost subjects are strong refs: `{uri, cid}`.
fn subject_uri(record: &Value) -> Option<AtUri> {
    record
        .as_map()?
        .get("subject")
        .and_then(Value::as_map)?
        .get_str("uri")
        .and_then(|uri| AtUri::parse(uri).ok())
}

/// What the dispatcher did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Forwarded to a sink, which changed state.
    Applied,
    /// Forwarded to a sink that had already seen it.
    Duplicate,
    /// Not about us, or a type we don't handle.
    Ignored,
}

/// Routes incoming records to the content-source sinks.
pub struct Dispatcher {
    local_did: Did,
    content: Arc<dyn ContentSource>,
}

impl Dispatcher {
    /// Creates a dispatcher for the local identity.
    pub fn new(local_did: Did, content: Arc<dyn ContentSource>) -> Self {
        Dispatcher { local_did, content }
    }

    /// Handles a newly-seen record from `author`.
    pub fn dispatch(&self, record: &Value, author_did: &Did, author_handle: &Handle) -> Dispatch {
        let author = Author {
            did: author_did.clone(),
            handle: author_handle.clone(),
        };
        match IncomingRecord::classify(record) {
            IncomingRecord::Like { subject } => match self.local_target(&subject) {
                Some(rkey) => applied(self.content.like(&rkey, &author)),
                None => Dispatch::Ignored,
            },
            IncomingRecord::Repost { subject } => match self.local_target(&subject) {
                Some(rkey) => applied(self.content.repost(&rkey, &author)),
                None => Dispatch::Ignored,
            },
            IncomingRecord::Follow { subject } => {
                if subject == self.local_did {
                    applied(self.content.follower_added(&author))
                } else {
                    Dispatch::Ignored
                }
            }
            IncomingRecord::Post {
                reply_root,
                reply_parent,
                text,
                created_at,
            } => {
                let Some(root) = reply_root.as_ref().and_then(|r| self.local_target(r)) else {
                    return Dispatch::Ignored;
                };
                let parent = reply_parent.as_ref().and_then(|r| self.local_target(r));
                applied(self.content.store_reply(Reply {
                    root,
                    parent,
                    author,
                    text,
                    created_at,
                }))
            }
            IncomingRecord::Other => Dispatch::Ignored,
        }
    }

    /// Handles the removal of a previously-dispatched record: like and
    /// repost undo, unfollow.
    pub fn dispatch_removal(
        &self,
        record: &Value,
        author_did: &Did,
        author_handle: &Handle,
    ) -> Dispatch {
        let author = Author {
            did: author_did.clone(),
            handle: author_handle.clone(),
        };
        match IncomingRecord::classify(record) {
            IncomingRecord::Like { subject } => match self.local_target(&subject) {
                Some(rkey) => applied(self.content.unlike(&rkey, &author)),
                None => Dispatch::Ignored,
            },
            IncomingRecord::Repost { subject } => match self.local_target(&subject) {
                Some(rkey) => applied(self.content.unrepost(&rkey, &author)),
                None => Dispatch::Ignored,
            },
            IncomingRecord::Follow { subject } => {
                if subject == self.local_did {
                    applied(self.content.follower_removed(&author))
                } else {
                    Dispatch::Ignored
                }
            }
            _ => Dispatch::Ignored,
        }
    }

    /// Resolves a target URI to a local record key; rejects foreign DIDs and
    /// targets the content source doesn't know.
    fn local_target(&self, uri: &AtUri) -> Option<RecordKey> {
        if uri.did != self.local_did {
            return None;
        }
        self.content.contains(&uri.rkey).then(|| uri.rkey.clone())
    }
}

fn applied(changed: bool) -> Dispatch {
    if changed {
        Dispatch::Applied
    } else {
        Dispatch::Duplicate
    }
}
