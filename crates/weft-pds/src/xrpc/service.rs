//! `com.atproto.identity` / `com.atproto.server` queries.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use weft_common::Handle;
use weft_repo::StateStore;

use crate::error::{ErrorCode, XrpcError};
use crate::pds::Pds;

#[derive(Debug, Deserialize)]
pub(crate) struct ResolveHandleParams {
    handle: String,
}

/// `com.atproto.identity.resolveHandle`
pub(crate) async fn resolve_handle<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<ResolveHandleParams>,
) -> Result<Json<JsonValue>, XrpcError> {
    let handle = Handle::new(&params.handle)
        .map_err(|e| XrpcError::new(ErrorCode::InvalidHandle, e.to_string()))?;
    if handle != pds.handle().await {
        return Err(XrpcError::new(
            ErrorCode::HandleNotFound,
            format!("unable to resolve {handle}"),
        ));
    }
    Ok(Json(json!({ "did": pds.did.as_str() })))
}

/// `com.atproto.server.describeServer`
pub(crate) async fn describe_server<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
) -> Json<JsonValue> {
    Json(json!({
        "did": pds.did.as_str(),
        "availableUserDomains": [],
        "inviteCodeRequired": false,
        "links": {},
    }))
}
