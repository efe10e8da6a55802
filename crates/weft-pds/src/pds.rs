//! Node assembly.
//!
//! `Pds` owns the repository behind a read/write lock, the firehose, the
//! blob store and the content-source sinks. Exactly one writer advances
//! repository state: the write lock is held from swap check through event
//! emission, and the whole critical section runs on a spawned task so a
//! caller disconnecting mid-request can never split a commit from its event.
//! Event emission failure is logged, never surfaced — the commit already
//! happened.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use weft_common::codec::Value;
use weft_common::{Cid, Did, Handle, Nsid, RecordKey, RepoSigningKey};
use weft_repo::blob::BlobInfo;
use weft_repo::repository::{CommitResult, RecordEntry, RepoState};
use weft_repo::store::{ns, StateStore};
use weft_repo::{BlobStore, RepoError, Repository, Result};

use crate::config::PdsConfig;
use crate::content::ContentSource;
use crate::dispatcher::Dispatcher;
use crate::firehose::Firehose;

/// Verifies bearer credentials on write procedures.
///
/// Verification policy belongs to the embedder; the default accepts
/// everything, which suits a single-operator node behind its own admin
/// surface.
pub trait Authenticator: Send + Sync {
    /// Checks a bearer token (`None` when no Authorization header came in).
    fn verify_bearer(&self, token: Option<&str>) -> std::result::Result<(), AuthRejection>;
}

/// Why a credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No credential presented.
    Missing,
    /// Credential presented but invalid.
    Invalid,
}

/// The default embedder hook: everything passes.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn verify_bearer(&self, _token: Option<&str>) -> std::result::Result<(), AuthRejection> {
        Ok(())
    }
}

/// One running node.
pub struct Pds<S> {
    /// Node configuration.
    pub config: PdsConfig,
    /// The node's DID.
    pub did: Did,
    /// The firehose hub.
    pub firehose: Firehose<S>,
    /// Blob storage.
    pub blobs: BlobStore<S>,
    /// Incoming-record dispatcher, shared with the relay poller.
    pub dispatcher: Arc<Dispatcher>,
    /// Write-credential hook.
    pub auth: Arc<dyn Authenticator>,
    repo: RwLock<Repository<S>>,
    handle: RwLock<Handle>,
}

impl<S: StateStore + Send + Sync + 'static> Pds<S> {
    /// Opens (or initializes) a node over the given store.
    pub async fn open(
        config: PdsConfig,
        store: S,
        content: Arc<dyn ContentSource>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>> {
        let did = config
            .did()
            .map_err(|e| RepoError::invalid_state(e.to_string()))?;
        let key = load_or_generate_key(&store).await?;
        let repo = Repository::open(store.clone(), did.clone(), key).await?;
        let firehose = Firehose::open(store.clone(), config.firehose_capacity).await?;
        let blobs = BlobStore::new(store.clone(), config.max_blob_size);
        let dispatcher = Arc::new(Dispatcher::new(did.clone(), content));
        let handle = config.handle.clone();
        Ok(Arc::new(Pds {
            config,
            did,
            firehose,
            blobs,
            dispatcher,
            auth,
            repo: RwLock::new(repo),
            handle: RwLock::new(handle),
        }))
    }

    /// The handle currently served.
    pub async fn handle(&self) -> Handle {
        self.handle.read().await.clone()
    }

    /// Changes the served handle, emitting an `#identity` event.
    pub async fn set_handle(&self, handle: Handle) {
        {
            let mut current = self.handle.write().await;
            if *current == handle {
                return;
            }
            *current = handle.clone();
        }
        if let Err(e) = self.firehose.emit_identity(&self.did, &handle).await {
            tracing::error!(error = %e, "identity event emission failed");
        }
    }

    /// Changes account status, emitting an `#account` event.
    pub async fn set_account_status(&self, active: bool, status: Option<&str>) {
        if let Err(e) = self.firehose.emit_account(&self.did, active, status).await {
            tracing::error!(error = %e, "account event emission failed");
        }
    }

    /// Snapshot reads. Readers share the lock; they run in parallel with
    /// each other and observe either all of a mutation or none of it.
    pub async fn with_repo<T>(&self, f: impl FnOnce(&Repository<S>) -> T) -> T {
        let repo = self.repo.read().await;
        f(&repo)
    }

    /// Creates a record and emits its commit event.
    pub async fn create_record(
        self: &Arc<Self>,
        collection: Nsid,
        record: Value,
        rkey: Option<RecordKey>,
        swap_commit: Option<Cid>,
    ) -> Result<(RecordEntry, CommitResult)> {
        let pds = self.clone();
        run_to_completion(async move {
            let mut repo = pds.repo.write().await;
            let (entry, result) = repo
                .create_record(&collection, record, rkey, swap_commit)
                .await?;
            pds.emit_commit(&result).await;
            Ok((entry, result))
        })
        .await
    }

    /// Puts a record and emits its commit event.
    pub async fn put_record(
        self: &Arc<Self>,
        collection: Nsid,
        rkey: RecordKey,
        record: Value,
        swap_record: Option<Cid>,
        swap_commit: Option<Cid>,
    ) -> Result<(RecordEntry, CommitResult)> {
        let pds = self.clone();
        run_to_completion(async move {
            let mut repo = pds.repo.write().await;
            let (entry, result) = repo
                .put_record(&collection, &rkey, record, swap_record, swap_commit)
                .await?;
            pds.emit_commit(&result).await;
            Ok((entry, result))
        })
        .await
    }

    /// Deletes a record and emits its commit event.
    pub async fn delete_record(
        self: &Arc<Self>,
        collection: Nsid,
        rkey: RecordKey,
        swap_record: Option<Cid>,
        swap_commit: Option<Cid>,
    ) -> Result<CommitResult> {
        let pds = self.clone();
        run_to_completion(async move {
            let mut repo = pds.repo.write().await;
            let result = repo
                .delete_record(&collection, &rkey, swap_record, swap_commit)
                .await?;
            pds.emit_commit(&result).await;
            Ok(result)
        })
        .await
    }

    /// Stores an uploaded blob.
    pub async fn upload_blob(&self, data: Bytes, mime: &str) -> Result<BlobInfo> {
        self.blobs.put(data, mime).await
    }

    /// The current repository state pointer.
    pub async fn repo_state(&self) -> RepoState {
        self.repo.read().await.state().clone()
    }

    async fn emit_commit(&self, result: &CommitResult) {
        if let Err(e) = self.firehose.emit_commit(&self.did, result).await {
            tracing::error!(error = %e, rev = %result.rev, "commit event emission failed");
        }
    }
}

/// Runs a mutation's critical section on its own task so it finishes even if
/// the calling request is dropped mid-flight.
async fn run_to_completion<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(f).await {
        Ok(result) => result,
        Err(e) => Err(RepoError::invalid_state(format!("write task failed: {e}"))),
    }
}

/// Loads the node keypair, generating and persisting it on first boot.
async fn load_or_generate_key<S: StateStore>(store: &S) -> Result<RepoSigningKey> {
    match store.get(ns::META, "keypair").await? {
        Some(pem) => {
            let pem = std::str::from_utf8(&pem)
                .map_err(|_| RepoError::invalid_state("keypair pem is not utf-8"))?;
            RepoSigningKey::from_pem(pem)
                .map_err(|e| RepoError::crypto(format!("stored keypair unusable: {e}")))
        }
        None => {
            let key = RepoSigningKey::generate();
            let pem = key
                .to_pem()
                .map_err(|e| RepoError::crypto(format!("keypair serialization failed: {e}")))?;
            store
                .put(ns::META, "keypair", Bytes::from(pem.into_bytes()))
                .await?;
            let public = key
                .public_pem()
                .map_err(|e| RepoError::crypto(format!("public key serialization failed: {e}")))?;
            store
                .put(ns::META, "keypair_public", Bytes::from(public.into_bytes()))
                .await?;
            tracing::info!("generated node keypair");
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentSource;
    use url::Url;
    use weft_common::codec::Map;
    use weft_repo::MemoryStateStore;

    pub(crate) async fn test_pds() -> Arc<Pds<MemoryStateStore>> {
        let config = PdsConfig::for_origin(Url::parse("https://blog.example").unwrap()).unwrap();
        Pds::open(
            config,
            MemoryStateStore::new(),
            Arc::new(MemoryContentSource::new()),
            Arc::new(AllowAll),
        )
        .await
        .unwrap()
    }

    fn post(text: &str) -> Value {
        let mut map = Map::new();
        map.insert("$type", Value::string("app.bsky.feed.post"));
        map.insert("text", Value::string(text));
        map.insert("createdAt", Value::string("2024-01-01T00:00:00.000Z"));
        Value::Map(map)
    }

    #[tokio::test]
    async fn genesis_write_emits_seq_one() {
        let pds = test_pds().await;
        let (_, mut rx) = pds.firehose.subscribe(None).await;

        let (entry, result) = pds
            .create_record(Nsid::new("app.bsky.feed.post").unwrap(), post("hi"), None, None)
            .await
            .unwrap();

        assert_eq!(
            entry.uri.to_string(),
            format!("at://did:web:blog.example/app.bsky.feed.post/{}", entry.uri.rkey)
        );
        assert_eq!(result.ops[0].path.as_str(), format!("app.bsky.feed.post/{}", entry.uri.rkey));

        let (seq, frame) = rx.recv().await.unwrap();
        assert_eq!(seq, 1);
        let (_, body) = crate::firehose::parse_frame(&frame).unwrap();
        let body = body.as_map().unwrap();
        assert_eq!(body.get("seq"), Some(&Value::Integer(1)));
        let Some(Value::Array(ops)) = body.get("ops") else {
            panic!("no ops");
        };
        assert_eq!(ops[0].as_map().unwrap().get_str("action"), Some("create"));
    }

    #[tokio::test]
    async fn failed_swap_emits_nothing() {
        let pds = test_pds().await;
        let (_, mut rx) = pds.firehose.subscribe(None).await;
        let stale = Cid::for_struct(b"stale");

        let err = pds
            .create_record(
                Nsid::new("app.bsky.feed.post").unwrap(),
                post("x"),
                None,
                Some(stale),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), weft_repo::RepoErrorKind::SwapMismatch);
        assert!(rx.try_recv().is_err());
        assert_eq!(pds.firehose.next_seq().await, 1);
    }

    #[tokio::test]
    async fn concurrent_writes_linearize() {
        let pds = test_pds().await;
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let pds = pds.clone();
            tasks.spawn(async move {
                pds.create_record(
                    Nsid::new("app.bsky.feed.post").unwrap(),
                    post(&format!("post {i}")),
                    None,
                    None,
                )
                .await
                .unwrap()
            });
        }
        let mut revs = Vec::new();
        while let Some(result) = tasks.join_next().await {
            revs.push(result.unwrap().1.rev);
        }
        // every rev distinct, and the firehose issued exactly one seq apiece
        revs.sort();
        revs.dedup();
        assert_eq!(revs.len(), 16);
        assert_eq!(pds.firehose.next_seq().await, 17);

        // the final state is one of the commits, and records all landed
        let state = pds.repo_state().await;
        assert!(revs.contains(&state.rev));
        assert_eq!(pds.with_repo(|r| r.record_count()).await, 16);
    }

    #[tokio::test]
    async fn handle_change_emits_identity() {
        let pds = test_pds().await;
        let (_, mut rx) = pds.firehose.subscribe(None).await;
        pds.set_handle(Handle::new("renamed.example").unwrap()).await;
        let (_, frame) = rx.recv().await.unwrap();
        let (header, body) = crate::firehose::parse_frame(&frame).unwrap();
        assert_eq!(header.as_map().unwrap().get_str("t"), Some("#identity"));
        assert_eq!(body.as_map().unwrap().get_str("handle"), Some("renamed.example"));

        // setting the same handle again emits nothing
        pds.set_handle(Handle::new("renamed.example").unwrap()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn key_is_stable_across_reopen() {
        let store = MemoryStateStore::new();
        let config = PdsConfig::for_origin(Url::parse("https://blog.example").unwrap()).unwrap();
        let multibase1 = {
            let pds = Pds::open(
                config.clone(),
                store.clone(),
                Arc::new(MemoryContentSource::new()),
                Arc::new(AllowAll),
            )
            .await
            .unwrap();
            pds.with_repo(|r| r.public_multibase()).await
        };
        let pds = Pds::open(
            config,
            store,
            Arc::new(MemoryContentSource::new()),
            Arc::new(AllowAll),
        )
        .await
        .unwrap();
        assert_eq!(pds.with_repo(|r| r.public_multibase()).await, multibase1);
    }
}
