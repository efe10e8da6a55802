//! Node configuration.
//!
//! Everything environment-dependent lives here and is passed through
//! construction; nothing reads globals after startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use weft_common::types::IdentError;
use weft_common::{Did, Handle};

/// Configuration for one PDS node.
#[derive(Debug, Clone)]
pub struct PdsConfig {
    /// Public HTTPS origin this node is reachable at, e.g.
    /// `https://blog.example`.
    pub origin: Url,
    /// Handle served by this node; defaults to the origin host.
    pub handle: Handle,
    /// Socket to listen on.
    pub listen: SocketAddr,
    /// State directory for the filesystem store.
    pub data_dir: PathBuf,
    /// Upload cap for blobs, bytes.
    pub max_blob_size: usize,
    /// Relay poller period.
    pub poll_interval: Duration,
    /// Relay poller worker pool size.
    pub poll_workers: usize,
    /// Firehose replay ring capacity.
    pub firehose_capacity: usize,
    /// Deadline for one subscriber socket write.
    pub send_timeout: Duration,
    /// Deadline for one outbound HTTP request.
    pub request_timeout: Duration,
}

impl PdsConfig {
    /// Builds a config for an origin with everything else defaulted.
    pub fn for_origin(origin: Url) -> Result<Self, IdentError> {
        let handle = Handle::new(origin.host_str().unwrap_or_default())?;
        Ok(PdsConfig {
            origin,
            handle,
            listen: "127.0.0.1:3030".parse().expect("valid addr"),
            data_dir: PathBuf::from("./weft-data"),
            max_blob_size: weft_repo::blob::DEFAULT_MAX_BLOB_SIZE,
            poll_interval: Duration::from_secs(3600),
            poll_workers: 4,
            firehose_capacity: 1000,
            send_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Reads configuration from `WEFT_*` environment variables.
    ///
    /// `WEFT_ORIGIN` is required; the rest have defaults:
    /// `WEFT_HANDLE`, `WEFT_LISTEN`, `WEFT_DATA_DIR`, `WEFT_MAX_BLOB_SIZE`,
    /// `WEFT_POLL_INTERVAL_SECS`, `WEFT_POLL_WORKERS`,
    /// `WEFT_FIREHOSE_CAPACITY`.
    pub fn from_env() -> Result<Self, String> {
        let origin = std::env::var("WEFT_ORIGIN")
            .map_err(|_| "WEFT_ORIGIN is required (e.g. https://blog.example)".to_string())?;
        let origin = Url::parse(&origin).map_err(|e| format!("WEFT_ORIGIN: {e}"))?;
        let mut config = Self::for_origin(origin).map_err(|e| e.to_string())?;

        if let Ok(handle) = std::env::var("WEFT_HANDLE") {
            config.handle = Handle::new(&handle).map_err(|e| e.to_string())?;
        }
        if let Ok(listen) = std::env::var("WEFT_LISTEN") {
            config.listen = listen.parse().map_err(|e| format!("WEFT_LISTEN: {e}"))?;
        }
        if let Ok(dir) = std::env::var("WEFT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("WEFT_MAX_BLOB_SIZE") {
            config.max_blob_size = size
                .parse()
                .map_err(|e| format!("WEFT_MAX_BLOB_SIZE: {e}"))?;
        }
        if let Ok(secs) = std::env::var("WEFT_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(
                secs.parse().map_err(|e| format!("WEFT_POLL_INTERVAL_SECS: {e}"))?,
            );
        }
        if let Ok(workers) = std::env::var("WEFT_POLL_WORKERS") {
            config.poll_workers = workers
                .parse()
                .map_err(|e| format!("WEFT_POLL_WORKERS: {e}"))?;
        }
        if let Ok(cap) = std::env::var("WEFT_FIREHOSE_CAPACITY") {
            config.firehose_capacity = cap
                .parse()
                .map_err(|e| format!("WEFT_FIREHOSE_CAPACITY: {e}"))?;
        }
        Ok(config)
    }

    /// The `did:web` identity implied by the origin.
    pub fn did(&self) -> Result<Did, IdentError> {
        let host = self.origin.host_str().unwrap_or_default();
        let port = self.origin.port();
        Did::for_web_host(host, port, &[])
    }
}
