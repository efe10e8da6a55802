//! Blob storage.
//!
//! Blobs are uploaded bytes (media, mostly) addressed by a raw-codec CID,
//! with MIME type and size kept alongside. Records reference blobs by CID;
//! garbage collection of unreferenced blobs is deliberately not done here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use weft_common::Cid;

use crate::error::{RepoError, Result};
use crate::store::{ns, StateStore};

/// Default upload cap, in bytes.
pub const DEFAULT_MAX_BLOB_SIZE: usize = 1_000_000;

/// Stored blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Raw-codec CID of the bytes.
    pub cid: Cid,
    /// MIME type as uploaded.
    pub mime: String,
    /// Byte length.
    pub size: usize,
}

/// CID-keyed blob storage over a state store.
#[derive(Debug, Clone)]
pub struct BlobStore<S> {
    store: S,
    max_size: usize,
}

impl<S: StateStore> BlobStore<S> {
    /// Creates a blob store with the given size cap.
    pub fn new(store: S, max_size: usize) -> Self {
        BlobStore { store, max_size }
    }

    /// Stores bytes, returning the blob's identity. Rejects payloads over
    /// the cap; storing the same bytes twice is idempotent.
    pub async fn put(&self, data: Bytes, mime: &str) -> Result<BlobInfo> {
        if data.len() > self.max_size {
            return Err(RepoError::too_large("blob", data.len(), self.max_size));
        }
        let cid = Cid::for_raw(&data);
        let info = BlobInfo {
            cid,
            mime: mime.to_owned(),
            size: data.len(),
        };
        let meta = serde_json::to_vec(&info).map_err(RepoError::encoding)?;
        self.store
            .put(ns::BLOB_DATA, &cid.to_string(), data)
            .await?;
        self.store
            .put(ns::BLOB_INDEX, &cid.to_string(), Bytes::from(meta))
            .await?;
        Ok(info)
    }

    /// Fetches a blob and its metadata.
    pub async fn get(&self, cid: &Cid) -> Result<Option<(BlobInfo, Bytes)>> {
        let key = cid.to_string();
        let Some(meta) = self.store.get(ns::BLOB_INDEX, &key).await? else {
            return Ok(None);
        };
        let info: BlobInfo = serde_json::from_slice(&meta).map_err(RepoError::encoding)?;
        let data = self
            .store
            .get(ns::BLOB_DATA, &key)
            .await?
            .ok_or_else(|| RepoError::invalid_state(format!("blob {key} indexed but missing")))?;
        Ok(Some((info, data)))
    }

    /// True when the blob exists.
    pub async fn exists(&self, cid: &Cid) -> Result<bool> {
        Ok(self
            .store
            .get(ns::BLOB_INDEX, &cid.to_string())
            .await?
            .is_some())
    }

    /// Deletes a blob; returns whether it existed.
    pub async fn delete(&self, cid: &Cid) -> Result<bool> {
        let key = cid.to_string();
        let existed = self.store.get(ns::BLOB_INDEX, &key).await?.is_some();
        self.store.delete(ns::BLOB_INDEX, &key).await?;
        self.store.delete(ns::BLOB_DATA, &key).await?;
        Ok(existed)
    }

    /// Lists blob metadata sorted by CID string, after `cursor`, up to
    /// `limit`. Returns the entries and the cursor for the next page.
    pub async fn list(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<BlobInfo>, Option<String>)> {
        let mut out = Vec::new();
        for (key, meta) in self.store.list(ns::BLOB_INDEX).await? {
            if let Some(cursor) = cursor {
                if key.as_str() <= cursor {
                    continue;
                }
            }
            out.push(serde_json::from_slice(&meta).map_err(RepoError::encoding)?);
            if out.len() >= limit {
                break;
            }
        }
        let next = (out.len() >= limit).then(|| out.last().map(|b: &BlobInfo| b.cid.to_string()));
        Ok((out, next.flatten()))
    }
}
