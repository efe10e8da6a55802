//! Persisted state.
//!
//! Everything durable goes through [`StateStore`], a namespaced key/value
//! trait. Any store works; the two shipped here are an in-memory map (tests,
//! ephemeral nodes) and a directory-per-namespace filesystem layout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::error::{RepoError, Result};

/// Well-known namespaces.
pub mod ns {
    /// Repo state, firehose sequence, keypair PEM.
    pub const META: &str = "meta";
    /// Record path → canonical record bytes.
    pub const RECORDS: &str = "records";
    /// CID → block bytes (commits + MST nodes).
    pub const BLOCKS: &str = "blocks";
    /// Blob CID → raw bytes.
    pub const BLOB_DATA: &str = "blob_data";
    /// Blob CID → `{mime, size}` metadata.
    pub const BLOB_INDEX: &str = "blob_index";
    /// Subscribed DID → `{subscribed_at, last_sync}`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    /// Follower DID → `{handle, created_at, uri}`.
    pub const FOLLOWERS: &str = "followers";
    /// Zero-padded seq → encoded firehose frame.
    pub const FIREHOSE: &str = "firehose_queue";
}

/// Namespaced async key/value storage.
///
/// Keys are UTF-8 strings (record paths, CID strings, DIDs). Implementations
/// must return [`list`](StateStore::list) results sorted by key.
#[trait_variant::make(Send)]
pub trait StateStore: Clone {
    /// Reads a key.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>>;

    /// Writes a key.
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()>;

    /// Deletes a key; missing keys are not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// All entries in a namespace, sorted by key.
    async fn list(&self, namespace: &str) -> Result<Vec<(String, Bytes)>>;
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<RwLock<BTreeMap<(String, String), Bytes>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .entries
            .read()
            .expect("state lock")
            .get(&(namespace.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        self.entries
            .write()
            .expect("state lock")
            .insert((namespace.to_owned(), key.to_owned()), data);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries
            .write()
            .expect("state lock")
            .remove(&(namespace.to_owned(), key.to_owned()));
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Bytes)>> {
        Ok(self
            .entries
            .read()
            .expect("state lock")
            .range((namespace.to_owned(), String::new())..)
            .take_while(|((ns, _), _)| ns == namespace)
            .map(|((_, key), data)| (key.clone(), data.clone()))
            .collect())
    }
}

/// Filesystem store: one directory per namespace, one file per key.
///
/// Keys are escaped so record paths (which contain `/`) stay single files.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    root: PathBuf,
}

impl FsStateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(FsStateStore { root })
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(escape_key(key))
    }
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '/' => out.push_str("%2F"),
            '%' => out.push_str("%25"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_key(name: &str) -> String {
    name.replace("%2F", "/").replace("%25", "%")
}

impl StateStore for FsStateStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(namespace, key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(namespace, key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // write-then-rename so readers never observe a half-written value
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(namespace, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Bytes)>> {
        let dir = self.root.join(namespace);
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            let name = entry
                .file_name()
                .into_string()
                .map_err(|_| RepoError::invalid_state("non-utf8 state file name"))?;
            if name.ends_with(".tmp") {
                continue;
            }
            let data = tokio::fs::read(entry.path()).await?;
            entries.push((unescape_key(&name), Bytes::from(data)));
        }
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise<S: StateStore>(store: S) {
        assert_eq!(store.get(ns::META, "missing").await.unwrap(), None);

        store
            .put(ns::META, "repo_state", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(
            store.get(ns::META, "repo_state").await.unwrap(),
            Some(Bytes::from_static(b"{}"))
        );

        // record paths contain slashes
        store
            .put(
                ns::RECORDS,
                "app.bsky.feed.post/3l4qpz7ajrc2a",
                Bytes::from_static(b"cbor"),
            )
            .await
            .unwrap();
        assert_eq!(
            store
                .get(ns::RECORDS, "app.bsky.feed.post/3l4qpz7ajrc2a")
                .await
                .unwrap(),
            Some(Bytes::from_static(b"cbor"))
        );

        // namespaces are disjoint
        assert_eq!(store.get(ns::BLOCKS, "repo_state").await.unwrap(), None);

        // list is sorted and scoped
        store
            .put(ns::RECORDS, "app.bsky.feed.like/abc", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let listed = store.list(ns::RECORDS).await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "app.bsky.feed.like/abc",
                "app.bsky.feed.post/3l4qpz7ajrc2a"
            ]
        );

        store
            .delete(ns::RECORDS, "app.bsky.feed.like/abc")
            .await
            .unwrap();
        assert_eq!(store.get(ns::RECORDS, "app.bsky.feed.like/abc").await.unwrap(), None);
        // double delete is fine
        store
            .delete(ns::RECORDS, "app.bsky.feed.like/abc")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_store() {
        exercise(MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(FsStateStore::open(dir.path()).await.unwrap()).await;
    }

    #[tokio::test]
    async fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStateStore::open(dir.path()).await.unwrap();
            store
                .put(ns::META, "firehose_seq", Bytes::from_static(b"42"))
                .await
                .unwrap();
        }
        let store = FsStateStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get(ns::META, "firehose_seq").await.unwrap(),
            Some(Bytes::from_static(b"42"))
        );
    }

    #[test]
    fn key_escaping_roundtrip() {
        for key in ["plain", "a/b/c", "with%percent", "a%2Fb"] {
            assert_eq!(unescape_key(&escape_key(key)), key);
        }
    }
}
