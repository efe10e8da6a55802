//! weft: a single-actor AT-Protocol personal data server.
//!
//! One node, one `did:web` identity, one repository. The crate wires the
//! engine from `weft-repo` to the network:
//!
//! - the XRPC router (`/xrpc/<nsid>`) and did:web well-known surface;
//! - the firehose: sequenced commit/identity/account events pushed over a
//!   WebSocket to any number of subscribers;
//! - the dispatcher, mapping incoming federated records (likes, reposts,
//!   follows, replies) onto the host application's content source;
//! - the relay poller, pulling records from subscribed DIDs' PDSes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod content;
pub mod dispatcher;
pub mod error;
pub mod firehose;
pub mod pds;
pub mod relay;
pub mod well_known;
pub mod xrpc;

pub use config::PdsConfig;
pub use content::{Author, ContentSource, MemoryContentSource, Reply};
pub use dispatcher::{Dispatch, Dispatcher, IncomingRecord};
pub use error::{ErrorCode, XrpcError};
pub use firehose::Firehose;
pub use pds::{AllowAll, Authenticator, Pds};
pub use relay::RelayPoller;
