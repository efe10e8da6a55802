//! The XRPC surface.
//!
//! Query methods are GET with URL parameters; procedures are POST with a
//! JSON body (`uploadBlob` takes the raw body with its Content-Type). Every
//! handler answers either its method's JSON output or the uniform error
//! envelope from [`crate::error`].

mod repo;
mod service;
mod sync;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use weft_repo::StateStore;

use crate::error::{ErrorCode, XrpcError};
use crate::pds::{AuthRejection, Pds};
use crate::well_known;

/// Builds the node's full HTTP surface.
pub fn router<S: StateStore + Send + Sync + 'static>(pds: Arc<Pds<S>>) -> Router {
    let body_limit = pds.config.max_blob_size.saturating_mul(2).max(64 * 1024);
    Router::new()
        .merge(well_known::router::<S>())
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(service::resolve_handle::<S>),
        )
        .route(
            "/xrpc/com.atproto.server.describeServer",
            get(service::describe_server::<S>),
        )
        .route(
            "/xrpc/com.atproto.repo.describeRepo",
            get(repo::describe_repo::<S>),
        )
        .route("/xrpc/com.atproto.repo.getRecord", get(repo::get_record::<S>))
        .route(
            "/xrpc/com.atproto.repo.listRecords",
            get(repo::list_records::<S>),
        )
        .route(
            "/xrpc/com.atproto.repo.createRecord",
            post(repo::create_record::<S>),
        )
        .route(
            "/xrpc/com.atproto.repo.putRecord",
            post(repo::put_record::<S>),
        )
        .route(
            "/xrpc/com.atproto.repo.deleteRecord",
            post(repo::delete_record::<S>),
        )
        .route(
            "/xrpc/com.atproto.repo.uploadBlob",
            post(repo::upload_blob::<S>),
        )
        .route("/xrpc/com.atproto.sync.getRepo", get(sync::get_repo::<S>))
        .route("/xrpc/com.atproto.sync.getBlob", get(sync::get_blob::<S>))
        .route(
            "/xrpc/com.atproto.sync.subscribeRepos",
            get(sync::subscribe_repos::<S>),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(pds)
}

/// Checks the bearer credential on a write procedure.
pub(crate) fn check_auth<S: StateStore + Send + Sync + 'static>(
    pds: &Pds<S>,
    headers: &HeaderMap,
) -> Result<(), XrpcError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    pds.auth.verify_bearer(token).map_err(|rejection| match rejection {
        AuthRejection::Missing => XrpcError::new(
            ErrorCode::AuthenticationRequired,
            "authentication required",
        ),
        AuthRejection::Invalid => XrpcError::new(ErrorCode::InvalidToken, "invalid token"),
    })
}

/// Does a `repo` parameter name the local repository (by DID or handle)?
pub(crate) async fn is_local_repo<S: StateStore + Send + Sync + 'static>(
    pds: &Pds<S>,
    repo: &str,
) -> bool {
    repo == pds.did.as_str() || repo == pds.handle().await.as_str()
}
