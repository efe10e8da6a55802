//! Outbound subscription polling.
//!
//! For every DID in the subscription set the poller resolves the DID to its
//! PDS endpoint, lists a fixed set of collections there, and feeds each
//! record through the dispatcher. One DID's failure never touches another;
//! outbound concurrency is bounded by a worker pool, and the whole task
//! checks for shutdown between ticks and between DIDs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use weft_common::codec::Value;
use weft_common::{Did, Handle};
use weft_repo::store::{ns, StateStore};
use weft_repo::{RepoError, Result};

use crate::dispatcher::{Dispatch, Dispatcher};
use crate::well_known::DidDocument;

/// Collections pulled from subscribed repositories.
pub const POLL_COLLECTIONS: [&str; 4] = [
    "app.bsky.feed.like",
    "app.bsky.feed.repost",
    "app.bsky.graph.follow",
    "app.bsky.feed.post",
];

/// Pages fetched per collection per tick; keeps one hostile repo from
/// monopolizing a worker.
const MAX_PAGES: usize = 10;

/// Stored per-subscription bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// When the subscription was added (RFC 3339).
    pub subscribed_at: String,
    /// Last successful sync (RFC 3339), if any.
    pub last_sync: Option<String>,
}

/// The periodic polling task.
pub struct RelayPoller<S> {
    store: S,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
    interval: Duration,
    workers: usize,
}

impl<S: StateStore + Send + Sync + 'static> RelayPoller<S> {
    /// Builds a poller.
    pub fn new(
        store: S,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        workers: usize,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent("weft-pds")
            .build()
            .map_err(|e| RepoError::invalid_state(format!("http client: {e}")))?;
        Ok(Arc::new(RelayPoller {
            store,
            dispatcher,
            http,
            interval,
            workers: workers.max(1),
        }))
    }

    /// Adds a DID to the subscription set.
    pub async fn add_subscription(&self, did: &Did) -> Result<()> {
        let info = SubscriptionInfo {
            subscribed_at: now(),
            last_sync: None,
        };
        self.store
            .put(
                ns::SUBSCRIPTIONS,
                did.as_str(),
                Bytes::from(serde_json::to_vec(&info).map_err(RepoError::encoding)?),
            )
            .await
    }

    /// Removes a DID from the subscription set.
    pub async fn remove_subscription(&self, did: &Did) -> Result<()> {
        self.store.delete(ns::SUBSCRIPTIONS, did.as_str()).await
    }

    /// The current subscription set.
    pub async fn subscriptions(&self) -> Result<Vec<(Did, SubscriptionInfo)>> {
        let mut out = Vec::new();
        for (key, raw) in self.store.list(ns::SUBSCRIPTIONS).await? {
            let Ok(did) = Did::new(&key) else {
                tracing::warn!(key, "skipping malformed subscription key");
                continue;
            };
            let info = serde_json::from_slice(&raw).map_err(RepoError::encoding)?;
            out.push((did, info));
        }
        Ok(out)
    }

    /// Runs until `shutdown` flips true. Polls immediately, then on every
    /// interval tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(&mut shutdown).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("relay poller shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Polls every subscription once. Returns (synced, failed) counts.
    pub async fn poll_once(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> (usize, usize) {
        let subscriptions = match self.subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(error = %e, "could not list subscriptions");
                return (0, 0);
            }
        };
        if subscriptions.is_empty() {
            return (0, 0);
        }
        tracing::debug!(count = subscriptions.len(), "polling subscriptions");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = tokio::task::JoinSet::new();
        for (did, _) in subscriptions {
            if *shutdown.borrow() {
                break;
            }
            let poller = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let outcome = poller.poll_did(&did).await;
                (did, outcome)
            });
        }

        let (mut synced, mut failed) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            let Ok((did, outcome)) = joined else {
                failed += 1;
                continue;
            };
            match outcome {
                Ok(applied) => {
                    synced += 1;
                    let info = SubscriptionInfo {
                        subscribed_at: now(),
                        last_sync: Some(now()),
                    };
                    // keep the original subscribed_at when we have it
                    let info = match self.store.get(ns::SUBSCRIPTIONS, did.as_str()).await {
                        Ok(Some(raw)) => serde_json::from_slice::<SubscriptionInfo>(&raw)
                            .map(|mut old| {
                                old.last_sync = Some(now());
                                old
                            })
                            .unwrap_or(info),
                        _ => info,
                    };
                    if let Ok(raw) = serde_json::to_vec(&info) {
                        let _ = self
                            .store
                            .put(ns::SUBSCRIPTIONS, did.as_str(), Bytes::from(raw))
                            .await;
                    }
                    tracing::debug!(did = %did, applied, "subscription synced");
                }
                Err(e) => {
                    failed += 1;
                    // transient network trouble: skip this DID, next tick retries
                    tracing::warn!(did = %did, error = %e, "subscription poll failed");
                }
            }
        }
        (synced, failed)
    }

    /// Polls one DID; returns how many records the dispatcher applied.
    async fn poll_did(&self, did: &Did) -> std::result::Result<usize, String> {
        let (endpoint, handle) = self.resolve_pds(did).await?;
        let mut applied = 0;
        for collection in POLL_COLLECTIONS {
            let mut cursor: Option<String> = None;
            for _ in 0..MAX_PAGES {
                let mut url = format!(
                    "{endpoint}/xrpc/com.atproto.repo.listRecords?repo={}&collection={collection}&limit=100",
                    did.as_str()
                );
                if let Some(cursor) = &cursor {
                    url.push_str("&cursor=");
                    url.push_str(cursor);
                }
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| format!("listRecords: {e}"))?;
                if !response.status().is_success() {
                    return Err(format!("listRecords: http {}", response.status()));
                }
                let page: ListRecordsPage = response
                    .json()
                    .await
                    .map_err(|e| format!("listRecords body: {e}"))?;
                for item in &page.records {
                    let Ok(record) = Value::from_json(&item.value) else {
                        tracing::debug!(uri = %item.uri, "skipping non-canonical record");
                        continue;
                    };
                    if self.dispatcher.dispatch(&record, did, &handle) == Dispatch::Applied {
                        applied += 1;
                    }
                }
                cursor = page.cursor;
                if cursor.is_none() {
                    break;
                }
            }
        }
        Ok(applied)
    }

    /// Resolves a DID to its PDS endpoint and handle via the did:web
    /// well-known document.
    async fn resolve_pds(&self, did: &Did) -> std::result::Result<(String, Handle), String> {
        let host = did
            .web_host()
            .ok_or_else(|| format!("cannot resolve {did}: not did:web"))?;
        let url = format!("{}/.well-known/did.json", base_url_for_host(&host));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("did doc: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("did doc: http {}", response.status()));
        }
        let doc: DidDocument = response
            .json()
            .await
            .map_err(|e| format!("did doc body: {e}"))?;
        if doc.id != did.as_str() {
            return Err(format!("did doc id mismatch: {}", doc.id));
        }
        let endpoint = doc
            .pds_endpoint()
            .ok_or_else(|| format!("{did} advertises no pds endpoint"))?
            .trim_end_matches('/')
            .to_owned();
        let handle = doc
            .handle()
            .and_then(|h| Handle::new(h).ok())
            .or_else(|| Handle::new(&host).ok())
            .ok_or_else(|| format!("{did} has no usable handle"))?;
        Ok((endpoint, handle))
    }
}

/// did:web resolves over HTTPS; loopback hosts get plain HTTP so local
/// nodes can talk to each other in development and tests.
fn base_url_for_host(host: &str) -> String {
    if host.starts_with("127.") || host.starts_with("localhost") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

#[derive(Debug, Deserialize)]
struct ListRecordsPage {
    records: Vec<ListedRecord>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedRecord {
    uri: String,
    value: serde_json::Value,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemoryContentSource;
    use weft_repo::MemoryStateStore;

    fn poller() -> Arc<RelayPoller<MemoryStateStore>> {
        let content = Arc::new(MemoryContentSource::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Did::new("did:web:blog.example").unwrap(),
            content,
        ));
        RelayPoller::new(
            MemoryStateStore::new(),
            dispatcher,
            Duration::from_secs(3600),
            4,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn subscription_bookkeeping() {
        let poller = poller();
        let alice = Did::new("did:web:alice.example").unwrap();
        let bob = Did::new("did:web:bob.example").unwrap();

        poller.add_subscription(&alice).await.unwrap();
        poller.add_subscription(&bob).await.unwrap();
        let subs = poller.subscriptions().await.unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].0, alice);
        assert_eq!(subs[0].1.last_sync, None);

        poller.remove_subscription(&alice).await.unwrap();
        let subs = poller.subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, bob);
    }

    #[tokio::test]
    async fn unreachable_did_counts_as_failure_not_panic() {
        let poller = poller();
        // loopback port that nothing listens on
        poller
            .add_subscription(&Did::new("did:web:127.0.0.1%3A1").unwrap())
            .await
            .unwrap();
        let (_, mut shutdown) = watch::channel(false);
        let (synced, failed) = poller.poll_once(&mut shutdown).await;
        assert_eq!(synced, 0);
        assert_eq!(failed, 1);
    }

    #[test]
    fn loopback_resolves_over_http() {
        assert_eq!(base_url_for_host("127.0.0.1:8080"), "http://127.0.0.1:8080");
        assert_eq!(base_url_for_host("alice.example"), "https://alice.example");
    }
}
