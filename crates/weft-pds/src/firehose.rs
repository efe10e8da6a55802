//! The firehose: a monotonically sequenced, framed commit log pushed to
//! subscribers.
//!
//! Every repository mutation appends a `#commit` frame; handle and account
//! changes append `#identity` / `#account`. Frames go into a bounded replay
//! ring (evicting from the front) and out to every live subscriber. A
//! subscriber session backfills `seq > cursor` from the ring, then receives
//! live frames; one that can't keep up is dropped rather than allowed to
//! stall the writer or its peers.
//!
//! Frame layout: `varint(len(header)) || header || body`, both canonically
//! encoded maps. The header is `{op: 1, t: "#commit" | "#identity" |
//! "#account"}`.

use std::collections::VecDeque;

use bytes::Bytes;
use chrono::SecondsFormat;
use tokio::sync::{mpsc, Mutex};
use weft_common::codec::{self, read_uvarint, write_uvarint, Map, Value};
use weft_common::{Did, Handle};
use weft_repo::repository::CommitResult;
use weft_repo::store::{ns, StateStore};
use weft_repo::{RepoError, Result};

/// Per-subscriber buffered frames before the subscriber is considered slow.
const SUBSCRIBER_BUFFER: usize = 256;

/// A sequenced, encoded frame.
pub type SeqFrame = (i64, Bytes);

/// The node's event log and push hub.
pub struct Firehose<S> {
    store: S,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    next_seq: i64,
    ring: VecDeque<SeqFrame>,
    subscribers: Vec<mpsc::Sender<SeqFrame>>,
}

impl<S: StateStore> Firehose<S> {
    /// Opens the firehose, restoring the sequence counter and replay ring.
    pub async fn open(store: S, capacity: usize) -> Result<Self> {
        let next_seq = match store.get(ns::META, "firehose_seq").await? {
            Some(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| RepoError::invalid_state("firehose_seq is not an integer"))?,
            None => 1,
        };
        let mut ring = VecDeque::new();
        for (key, frame) in store.list(ns::FIREHOSE).await? {
            let Ok(seq) = key.parse::<i64>() else {
                continue;
            };
            ring.push_back((seq, frame));
        }
        while ring.len() > capacity {
            ring.pop_front();
        }
        Ok(Firehose {
            store,
            capacity,
            inner: Mutex::new(Inner {
                next_seq,
                ring,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Appends a `#commit` frame for a finished mutation.
    pub async fn emit_commit(&self, repo: &Did, result: &CommitResult) -> Result<i64> {
        let mut ops = Vec::with_capacity(result.ops.len());
        for op in &result.ops {
            let mut entry = Map::new();
            entry.insert("action", Value::string(op.action.as_str()));
            entry.insert("path", Value::String(op.path.clone()));
            entry.insert(
                "cid",
                match op.cid {
                    Some(cid) => Value::CidLink(cid),
                    None => Value::Null,
                },
            );
            ops.push(Value::Map(entry));
        }
        let mut body = Map::new();
        body.insert("rev", Value::string(result.rev.to_string()));
        body.insert("repo", Value::string(repo.as_str()));
        body.insert(
            "since",
            match result.since {
                Some(rev) => Value::string(rev.to_string()),
                None => Value::Null,
            },
        );
        body.insert("blocks", Value::Bytes(result.blocks_car.clone()));
        body.insert("ops", Value::Array(ops));
        body.insert(
            "blobs",
            Value::Array(result.blobs.iter().map(|cid| Value::CidLink(*cid)).collect()),
        );
        body.insert("commit", Value::CidLink(result.commit_cid));
        self.emit("#commit", body).await
    }

    /// Appends an `#identity` frame after a handle change.
    pub async fn emit_identity(&self, did: &Did, handle: &Handle) -> Result<i64> {
        let mut body = Map::new();
        body.insert("did", Value::string(did.as_str()));
        body.insert("handle", Value::string(handle.as_str()));
        self.emit("#identity", body).await
    }

    /// Appends an `#account` frame after a status change.
    pub async fn emit_account(&self, did: &Did, active: bool, status: Option<&str>) -> Result<i64> {
        let mut body = Map::new();
        body.insert("did", Value::string(did.as_str()));
        body.insert("active", Value::Boolean(active));
        if let Some(status) = status {
            body.insert("status", Value::string(status));
        }
        self.emit("#account", body).await
    }

    async fn emit(&self, kind: &str, mut body: Map) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        body.insert("seq", Value::Integer(seq));
        body.insert(
            "time",
            Value::string(chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        let frame = encode_frame(kind, &Value::Map(body));

        // persist counter and frame before anyone can observe the seq
        self.store
            .put(
                ns::META,
                "firehose_seq",
                Bytes::from(inner.next_seq.to_string()),
            )
            .await?;
        self.store
            .put(ns::FIREHOSE, &format!("{seq:020}"), frame.clone())
            .await?;

        inner.ring.push_back((seq, frame.clone()));
        while inner.ring.len() > self.capacity {
            if let Some((evicted, _)) = inner.ring.pop_front() {
                self.store
                    .delete(ns::FIREHOSE, &format!("{evicted:020}"))
                    .await?;
            }
        }

        // fan out; a full buffer means the subscriber fell behind
        inner.subscribers.retain(|tx| {
            match tx.try_send((seq, frame.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(seq, "dropping slow firehose subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        tracing::debug!(seq, kind, "event emitted");
        Ok(seq)
    }

    /// Registers a subscriber. Returns the backfill frames (`seq > cursor`,
    /// in order) and the live channel; both together observe every sequence
    /// number exactly once.
    pub async fn subscribe(&self, cursor: Option<i64>) -> (Vec<SeqFrame>, mpsc::Receiver<SeqFrame>) {
        let mut inner = self.inner.lock().await;
        let backfill = match cursor {
            Some(cursor) => inner
                .ring
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        inner.subscribers.push(tx);
        (backfill, rx)
    }

    /// Subscribers currently registered.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// The next sequence number to be issued.
    pub async fn next_seq(&self) -> i64 {
        self.inner.lock().await.next_seq
    }
}

/// Encodes one frame.
pub fn encode_frame(kind: &str, body: &Value) -> Bytes {
    let mut header = Map::new();
    header.insert("op", Value::Integer(1));
    header.insert("t", Value::string(kind));
    let header = codec::encode(&Value::Map(header));

    let mut out = Vec::with_capacity(header.len() + 64);
    write_uvarint(header.len() as u64, &mut out);
    out.extend_from_slice(&header);
    out.extend_from_slice(&codec::encode(body));
    Bytes::from(out)
}

/// Splits a frame back into its header and body values.
pub fn parse_frame(data: &[u8]) -> Result<(Value, Value)> {
    let (header_len, used) = read_uvarint(data)?;
    let header_end = used
        .checked_add(header_len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| RepoError::invalid_state("frame header overruns frame"))?;
    let header = codec::decode(&data[used..header_end])?;
    let body = codec::decode(&data[header_end..])?;
    Ok((header, body))
}
