//! `com.atproto.sync`: whole-repo CAR export, blob fetch, and the firehose
//! subscription endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use weft_common::Cid;
use weft_repo::StateStore;

use super::is_local_repo;
use crate::error::{ErrorCode, XrpcError};
use crate::firehose::SeqFrame;
use crate::pds::Pds;

#[derive(Debug, Deserialize)]
pub(crate) struct GetRepoParams {
    did: String,
    // accepted for wire compatibility; a full snapshot is always returned
    #[allow(dead_code)]
    since: Option<String>,
}

/// `com.atproto.sync.getRepo`
pub(crate) async fn get_repo<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<GetRepoParams>,
) -> Result<Response, XrpcError> {
    if !is_local_repo(&pds, &params.did).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", params.did),
        ));
    }
    let car = pds
        .with_repo(|r| r.export_car())
        .await
        .map_err(|e| XrpcError::new(ErrorCode::InvalidRequest, e.to_string()))?;
    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.ipld.car"),
        )],
        car,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetBlobParams {
    did: String,
    cid: String,
}

/// `com.atproto.sync.getBlob`
pub(crate) async fn get_blob<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<GetBlobParams>,
) -> Result<Response, XrpcError> {
    if !is_local_repo(&pds, &params.did).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", params.did),
        ));
    }
    let cid = Cid::parse(&params.cid)
        .map_err(|e| XrpcError::invalid_request(format!("cid: {e}")))?;
    let found = pds
        .blobs
        .get(&cid)
        .await
        .map_err(|e| XrpcError::new(ErrorCode::InvalidRequest, e.to_string()))?;
    let Some((info, data)) = found else {
        return Err(XrpcError::new(
            ErrorCode::BlobNotFound,
            format!("blob not found: {cid}"),
        ));
    };
    let content_type = HeaderValue::from_str(&info.mime)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubscribeParams {
    cursor: Option<i64>,
}

/// `com.atproto.sync.subscribeRepos`
pub(crate) async fn subscribe_repos<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<SubscribeParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let send_timeout = pds.config.send_timeout;
    upgrade.on_upgrade(move |socket| async move {
        let (backfill, live) = pds.firehose.subscribe(params.cursor).await;
        serve_subscriber(socket, backfill, live, send_timeout).await;
    })
}

/// Drives one subscriber session: backfill, then live frames, until the
/// peer closes or falls behind. A write that misses the send deadline drops
/// this subscriber without touching any other.
async fn serve_subscriber(
    mut socket: WebSocket,
    backfill: Vec<SeqFrame>,
    mut live: tokio::sync::mpsc::Receiver<SeqFrame>,
    send_timeout: Duration,
) {
    for (seq, frame) in backfill {
        if !send_frame(&mut socket, frame.to_vec(), send_timeout).await {
            tracing::debug!(seq, "subscriber dropped during backfill");
            return;
        }
    }
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        tracing::debug!("subscriber closed");
                        return;
                    }
                    // subscribers have nothing to say; ignore chatter
                    Some(Ok(_)) => {}
                }
            }
            frame = live.recv() => {
                match frame {
                    // sender side evicted us for falling behind
                    None => {
                        tracing::debug!("subscriber channel closed");
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    Some((seq, frame)) => {
                        if !send_frame(&mut socket, frame.to_vec(), send_timeout).await {
                            tracing::debug!(seq, "subscriber write failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: Vec<u8>, deadline: Duration) -> bool {
    matches!(
        tokio::time::timeout(deadline, socket.send(Message::Binary(frame.into()))).await,
        Ok(Ok(()))
    )
}
