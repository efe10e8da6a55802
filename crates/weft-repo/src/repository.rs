//! The repository write facade.
//!
//! One repository per node. Mutations validate swap preconditions, advance
//! the MST, sign a commit, persist, and only then expose the new
//! `(rev, root, commit)` triple — a failure anywhere before persistence
//! leaves no observable change. Callers serialize writes externally (the
//! service layer holds a write lock); this type assumes `&mut self` is that
//! serialization.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use weft_common::cid::CODEC_RAW;
use weft_common::codec::{self, Value};
use weft_common::{AtUri, Cid, Did, Nsid, RecordKey, RepoPath, RepoSigningKey, Ticker, Tid};

use crate::car;
use crate::commit::Commit;
use crate::error::{RepoError, Result};
use crate::mst::Mst;
use crate::store::{ns, StateStore};

/// Commits retained in the ring before eviction.
const COMMIT_RING: usize = 100;

/// The current `(rev, root, commit)` pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    /// Revision of the current commit.
    pub rev: Tid,
    /// Current MST root CID.
    pub root: Cid,
    /// Current commit CID.
    pub commit: Cid,
}

/// What a mutation did to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    /// New record.
    Create,
    /// Replaced record.
    Update,
    /// Removed record.
    Delete,
}

impl OpAction {
    /// Wire string for firehose frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

/// One entry of a commit's op list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// What happened.
    pub action: OpAction,
    /// `collection/rkey` the op touched.
    pub path: SmolStr,
    /// New record CID; `None` for deletes.
    pub cid: Option<Cid>,
}

/// Everything the event layer needs about a finished mutation.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// CID of the new commit.
    pub commit_cid: Cid,
    /// Revision of the new commit.
    pub rev: Tid,
    /// Revision of the previous commit.
    pub since: Option<Tid>,
    /// Ops applied by this commit.
    pub ops: Vec<RepoOp>,
    /// Blob CIDs referenced by the written record.
    pub blobs: Vec<Cid>,
    /// CAR slice carrying the commit block and new record block.
    pub blocks_car: Bytes,
}

/// A record as read back out of the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    /// Fully-qualified record URI.
    pub uri: AtUri,
    /// Record CID.
    pub cid: Cid,
    /// Decoded record value.
    pub value: Value,
}

/// The single-actor repository.
pub struct Repository<S> {
    store: S,
    did: Did,
    key: RepoSigningKey,
    ticker: Ticker,
    mst: Mst,
    state: RepoState,
    commit_bytes: Bytes,
    records: BTreeMap<SmolStr, (Cid, Bytes)>,
    commit_log: Vec<String>,
}

impl<S: StateStore> Repository<S> {
    /// Opens the repository, creating the genesis commit on first boot.
    pub async fn open(store: S, did: Did, key: RepoSigningKey) -> Result<Self> {
        let ticker = Ticker::new();
        match store.get(ns::META, "repo_state").await? {
            Some(raw) => {
                let state: RepoState =
                    serde_json::from_slice(&raw).map_err(RepoError::encoding)?;
                ticker.observe_floor(state.rev);

                let mut records = BTreeMap::new();
                let mut mst = Mst::new();
                for (path, bytes) in store.list(ns::RECORDS).await? {
                    let cid = Cid::for_struct(&bytes);
                    mst = mst.insert(&path, cid)?;
                    records.insert(SmolStr::new(path), (cid, bytes));
                }
                if mst.root_cid() != state.root {
                    return Err(RepoError::invalid_state(format!(
                        "record index rebuilds to {}, state says {}",
                        mst.root_cid(),
                        state.root
                    )));
                }
                let commit_bytes = store
                    .get(ns::BLOCKS, &state.commit.to_string())
                    .await?
                    .ok_or_else(|| {
                        RepoError::invalid_state(format!("commit block {} missing", state.commit))
                    })?;
                let commit_log = match store.get(ns::META, "commit_log").await? {
                    Some(raw) => serde_json::from_slice(&raw).map_err(RepoError::encoding)?,
                    None => vec![state.commit.to_string()],
                };
                tracing::info!(
                    did = %did,
                    rev = %state.rev,
                    records = records.len(),
                    "repository loaded"
                );
                Ok(Repository {
                    store,
                    did,
                    key,
                    ticker,
                    mst,
                    state,
                    commit_bytes,
                    records,
                    commit_log,
                })
            }
            None => {
                let mst = Mst::new();
                let rev = ticker.next();
                let signed = Commit::build(did.clone(), mst.root_cid(), rev, None, &key)?;
                let state = RepoState {
                    rev: signed.commit.rev,
                    root: signed.commit.data,
                    commit: signed.cid,
                };

                for (cid, bytes) in mst.blocks() {
                    store.put(ns::BLOCKS, &cid.to_string(), bytes).await?;
                }
                store
                    .put(ns::BLOCKS, &signed.cid.to_string(), signed.bytes.clone())
                    .await?;
                let commit_log = vec![signed.cid.to_string()];
                store
                    .put(
                        ns::META,
                        "commit_log",
                        Bytes::from(serde_json::to_vec(&commit_log).map_err(RepoError::encoding)?),
                    )
                    .await?;
                store
                    .put(
                        ns::META,
                        "repo_state",
                        Bytes::from(serde_json::to_vec(&state).map_err(RepoError::encoding)?),
                    )
                    .await?;
                tracing::info!(did = %did, rev = %state.rev, "repository initialized");
                Ok(Repository {
                    store,
                    did,
                    key,
                    ticker,
                    mst,
                    state,
                    commit_bytes: signed.bytes,
                    records: BTreeMap::new(),
                    commit_log,
                })
            }
        }
    }

    /// The repository DID.
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// The current `(rev, root, commit)` pointer.
    pub fn state(&self) -> &RepoState {
        &self.state
    }

    /// The signing key's public multibase form.
    pub fn public_multibase(&self) -> String {
        self.key.public_multibase()
    }

    /// Distinct collections currently holding records.
    pub fn collections(&self) -> Vec<Nsid> {
        let mut out: Vec<Nsid> = Vec::new();
        for path in self.records.keys() {
            if let Some((collection, _)) = path.split_once('/') {
                if out.last().map(|n| n.as_str()) != Some(collection) {
                    if let Ok(nsid) = Nsid::new(collection) {
                        out.push(nsid);
                    }
                }
            }
        }
        out
    }

    /// Number of live records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Creates a record. Without an explicit `rkey` a fresh TID is minted;
    /// with one, an existing record under that key is a conflict.
    pub async fn create_record(
        &mut self,
        collection: &Nsid,
        record: Value,
        rkey: Option<RecordKey>,
        swap_commit: Option<Cid>,
    ) -> Result<(RecordEntry, CommitResult)> {
        self.check_swap_commit(swap_commit)?;
        let record = validate_record(collection, record)?;
        let rkey = match rkey {
            Some(rkey) => {
                let path = RepoPath::new(collection, &rkey);
                if self.records.contains_key(path.as_str()) {
                    return Err(RepoError::already_exists("record", path));
                }
                rkey
            }
            None => RecordKey::from(self.ticker.next()),
        };
        let path = RepoPath::new(collection, &rkey);
        let (entry, result) = self
            .commit_write(path, OpAction::Create, Some(record))
            .await?;
        Ok((entry.expect("create returns a record"), result))
    }

    /// Writes a record under a known key, creating or replacing it.
    pub async fn put_record(
        &mut self,
        collection: &Nsid,
        rkey: &RecordKey,
        record: Value,
        swap_record: Option<Cid>,
        swap_commit: Option<Cid>,
    ) -> Result<(RecordEntry, CommitResult)> {
        self.check_swap_commit(swap_commit)?;
        let record = validate_record(collection, record)?;
        let path = RepoPath::new(collection, rkey);
        let existing = self.records.get(path.as_str()).map(|(cid, _)| *cid);
        if let Some(expected) = swap_record {
            match existing {
                Some(current) if current == expected => {}
                Some(current) => {
                    return Err(RepoError::swap_mismatch(format!(
                        "record {path} is {current}, expected {expected}"
                    )));
                }
                None => {
                    return Err(RepoError::swap_mismatch(format!(
                        "record {path} does not exist, expected {expected}"
                    )));
                }
            }
        }
        let action = if existing.is_some() {
            OpAction::Update
        } else {
            OpAction::Create
        };
        let (entry, result) = self.commit_write(path, action, Some(record)).await?;
        Ok((entry.expect("put returns a record"), result))
    }

    /// Deletes a record.
    pub async fn delete_record(
        &mut self,
        collection: &Nsid,
        rkey: &RecordKey,
        swap_record: Option<Cid>,
        swap_commit: Option<Cid>,
    ) -> Result<CommitResult> {
        self.check_swap_commit(swap_commit)?;
        let path = RepoPath::new(collection, rkey);
        let current = self
            .records
            .get(path.as_str())
            .map(|(cid, _)| *cid)
            .ok_or_else(|| RepoError::not_found("record", &path))?;
        if let Some(expected) = swap_record {
            if current != expected {
                return Err(RepoError::swap_mismatch(format!(
                    "record {path} is {current}, expected {expected}"
                )));
            }
        }
        let (_, result) = self.commit_write(path, OpAction::Delete, None).await?;
        Ok(result)
    }

    /// Reads a record. With `expected_cid`, a mismatch reads as not-found
    /// rather than leaking the current CID.
    pub fn get_record(
        &self,
        collection: &Nsid,
        rkey: &RecordKey,
        expected_cid: Option<Cid>,
    ) -> Result<RecordEntry> {
        let path = RepoPath::new(collection, rkey);
        let (cid, bytes) = self
            .records
            .get(path.as_str())
            .ok_or_else(|| RepoError::not_found("record", &path))?;
        if let Some(expected) = expected_cid {
            if *cid != expected {
                return Err(RepoError::not_found("record", &path));
            }
        }
        Ok(RecordEntry {
            uri: AtUri::new(self.did.clone(), collection.clone(), rkey.clone()),
            cid: *cid,
            value: codec::decode(bytes)?,
        })
    }

    /// Lists a collection's records in rkey order.
    pub fn list_records(
        &self,
        collection: &Nsid,
        limit: usize,
        cursor: Option<&str>,
        reverse: bool,
    ) -> Result<(Vec<RecordEntry>, Option<String>)> {
        let prefix = format!("{collection}/");
        let full_cursor = cursor.map(|c| format!("{collection}/{c}"));
        let hits = self
            .mst
            .list(&prefix, limit, full_cursor.as_deref(), reverse);
        let mut out = Vec::with_capacity(hits.len());
        for (path, cid) in hits {
            let (_, bytes) = self
                .records
                .get(&path)
                .ok_or_else(|| RepoError::invalid_state(format!("{path} in mst but not stored")))?;
            let rkey = RecordKey::new(&path[prefix.len()..])
                .map_err(|e| RepoError::new(crate::RepoErrorKind::InvalidState, Some(Box::new(e))))?;
            out.push(RecordEntry {
                uri: AtUri::new(self.did.clone(), collection.clone(), rkey),
                cid,
                value: codec::decode(bytes)?,
            });
        }
        let next = (out.len() >= limit && limit > 0)
            .then(|| out.last().map(|e| e.uri.rkey.to_string()))
            .flatten();
        Ok((out, next))
    }

    /// Exports the whole repository as a CAR: commit block first, then MST
    /// nodes, then record blocks.
    pub fn export_car(&self) -> Result<Vec<u8>> {
        let mut blocks: Vec<(Cid, Bytes)> = Vec::with_capacity(2 + self.records.len());
        blocks.push((self.state.commit, self.commit_bytes.clone()));
        blocks.extend(self.mst.blocks());
        let mut seen: std::collections::BTreeSet<Cid> =
            blocks.iter().map(|(cid, _)| *cid).collect();
        for (cid, bytes) in self.records.values() {
            if seen.insert(*cid) {
                blocks.push((*cid, bytes.clone()));
            }
        }
        Ok(car::write_car(self.state.commit, blocks))
    }

    /// The current commit's canonical bytes.
    pub fn current_commit_bytes(&self) -> &Bytes {
        &self.commit_bytes
    }

    fn check_swap_commit(&self, swap_commit: Option<Cid>) -> Result<()> {
        if let Some(expected) = swap_commit {
            if expected != self.state.commit {
                return Err(RepoError::swap_mismatch(format!(
                    "commit is {}, expected {}",
                    self.state.commit, expected
                )));
            }
        }
        Ok(())
    }

    /// Applies one validated write: MST advance, commit signing, persistence,
    /// in-memory state swap. Returns the stored entry (for non-deletes) and
    /// the commit result for event emission.
    async fn commit_write(
        &mut self,
        path: RepoPath,
        action: OpAction,
        record: Option<Value>,
    ) -> Result<(Option<RecordEntry>, CommitResult)> {
        let (new_mst, record_block, blobs) = match &record {
            Some(value) => {
                let bytes = Bytes::from(codec::encode(value));
                let cid = Cid::for_struct(&bytes);
                let mst = self.mst.insert(path.as_str(), cid)?;
                (mst, Some((cid, bytes)), collect_blob_refs(value))
            }
            None => (self.mst.delete(path.as_str())?, None, Vec::new()),
        };

        let rev = self.ticker.next();
        let signed = Commit::build(
            self.did.clone(),
            new_mst.root_cid(),
            rev,
            Some(self.state.commit),
            &self.key,
        )?;

        let new_state = RepoState {
            rev: signed.commit.rev,
            root: signed.commit.data,
            commit: signed.cid,
        };

        // persist: record bytes, new mst nodes, commit block, ring, state
        match &record_block {
            Some((_, bytes)) => {
                self.store
                    .put(ns::RECORDS, path.as_str(), bytes.clone())
                    .await?;
            }
            None => {
                self.store.delete(ns::RECORDS, path.as_str()).await?;
            }
        }
        for (cid, bytes) in new_mst.blocks() {
            let key = cid.to_string();
            if self.store.get(ns::BLOCKS, &key).await?.is_none() {
                self.store.put(ns::BLOCKS, &key, bytes).await?;
            }
        }
        self.store
            .put(ns::BLOCKS, &signed.cid.to_string(), signed.bytes.clone())
            .await?;

        let mut commit_log = self.commit_log.clone();
        commit_log.push(signed.cid.to_string());
        while commit_log.len() > COMMIT_RING {
            let evicted = commit_log.remove(0);
            self.store.delete(ns::BLOCKS, &evicted).await?;
        }
        self.store
            .put(
                ns::META,
                "commit_log",
                Bytes::from(serde_json::to_vec(&commit_log).map_err(RepoError::encoding)?),
            )
            .await?;
        self.store
            .put(
                ns::META,
                "repo_state",
                Bytes::from(serde_json::to_vec(&new_state).map_err(RepoError::encoding)?),
            )
            .await?;

        // publish the new state in memory
        let since = Some(self.state.rev);
        self.mst = new_mst;
        self.state = new_state;
        self.commit_bytes = signed.bytes.clone();
        self.commit_log = commit_log;
        let entry = match (&record_block, record) {
            (Some((cid, bytes)), Some(_)) => {
                self.records
                    .insert(SmolStr::new(path.as_str()), (*cid, bytes.clone()));
                let collection = Nsid::new(path.collection()).expect("path was validated");
                let rkey = RecordKey::new(path.rkey()).expect("path was validated");
                Some(RecordEntry {
                    uri: AtUri::new(self.did.clone(), collection, rkey),
                    cid: *cid,
                    value: codec::decode(bytes)?,
                })
            }
            _ => {
                self.records.remove(path.as_str());
                None
            }
        };

        let op = RepoOp {
            action,
            path: SmolStr::new(path.as_str()),
            cid: record_block.as_ref().map(|(cid, _)| *cid),
        };
        let mut car_blocks = vec![(signed.cid, signed.bytes.clone())];
        if let Some((cid, bytes)) = &record_block {
            car_blocks.push((*cid, bytes.clone()));
        }
        let blocks_car = Bytes::from(car::write_car(signed.cid, car_blocks));

        tracing::debug!(
            path = %path,
            action = op.action.as_str(),
            rev = %self.state.rev,
            commit = %self.state.commit,
            "commit applied"
        );

        Ok((
            entry,
            CommitResult {
                commit_cid: signed.cid,
                rev: self.state.rev,
                since,
                ops: vec![op],
                blobs,
                blocks_car,
            },
        ))
    }
}

/// Records must be maps; a `$type` field, when present, must name the
/// collection it is stored under.
fn validate_record(collection: &Nsid, record: Value) -> Result<Value> {
    let map = record
        .as_map()
        .ok_or_else(|| RepoError::invalid_record("record must be a map"))?;
    if let Some(type_field) = map.get("$type") {
        match type_field.as_str() {
            Some(t) if t == collection.as_str() => {}
            Some(t) => {
                return Err(RepoError::invalid_record(format!(
                    "record $type {t} does not match collection {collection}"
                )));
            }
            None => return Err(RepoError::invalid_record("record $type must be a string")),
        }
    }
    Ok(record)
}

/// Raw-codec links inside a record are blob references.
pub(crate) fn collect_blob_refs(value: &Value) -> Vec<Cid> {
    fn walk(value: &Value, out: &mut Vec<Cid>) {
        match value {
            Value::CidLink(cid) if cid.codec() == CODEC_RAW => out.push(*cid),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Map(map) => map.iter().for_each(|(_, v)| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(value, &mut out);
    out.dedup();
    out
}
