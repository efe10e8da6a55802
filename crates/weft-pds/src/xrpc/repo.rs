//! `com.atproto.repo` queries and procedures.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use weft_common::codec::{self, Value};
use weft_common::{Cid, Did, Handle, Nsid, RecordKey};
use weft_repo::repository::RecordEntry;
use weft_repo::StateStore;

use super::{check_auth, is_local_repo};
use crate::dispatcher::Dispatch;
use crate::error::{map_repo_error, ErrorCode, XrpcError};
use crate::pds::Pds;
use crate::well_known::build_did_document;

/// Hard cap on `listRecords` page size.
const LIST_LIMIT_MAX: usize = 100;

fn record_json(entry: &RecordEntry) -> JsonValue {
    json!({
        "uri": entry.uri.to_string(),
        "cid": entry.cid.to_string(),
        "value": entry.value.to_json(),
    })
}

fn parse_collection(collection: &str) -> Result<Nsid, XrpcError> {
    Nsid::new(collection)
        .map_err(|e| XrpcError::new(ErrorCode::UnsupportedCollection, e.to_string()))
}

fn parse_rkey(rkey: &str) -> Result<RecordKey, XrpcError> {
    RecordKey::new(rkey).map_err(|e| XrpcError::invalid_request(e.to_string()))
}

fn parse_cid_param(cid: &Option<String>) -> Result<Option<Cid>, XrpcError> {
    cid.as_deref()
        .map(|s| Cid::parse(s).map_err(|e| XrpcError::invalid_request(format!("cid: {e}"))))
        .transpose()
}

fn parse_record(record: &JsonValue) -> Result<Value, XrpcError> {
    Value::from_json(record)
        .map_err(|e| XrpcError::new(ErrorCode::MalformedEncoding, e.to_string()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DescribeRepoParams {
    repo: String,
}

/// `com.atproto.repo.describeRepo`
pub(crate) async fn describe_repo<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<DescribeRepoParams>,
) -> Result<Json<JsonValue>, XrpcError> {
    if !is_local_repo(&pds, &params.repo).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", params.repo),
        ));
    }
    let collections: Vec<String> = pds
        .with_repo(|r| r.collections())
        .await
        .iter()
        .map(|c| c.to_string())
        .collect();
    let did_doc = build_did_document(&pds).await;
    Ok(Json(json!({
        "handle": pds.handle().await.as_str(),
        "did": pds.did.as_str(),
        "didDoc": did_doc,
        "collections": collections,
        "handleIsCorrect": true,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetRecordParams {
    repo: String,
    collection: String,
    rkey: String,
    cid: Option<String>,
}

/// `com.atproto.repo.getRecord`
pub(crate) async fn get_record<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<GetRecordParams>,
) -> Result<Json<JsonValue>, XrpcError> {
    if !is_local_repo(&pds, &params.repo).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", params.repo),
        ));
    }
    let collection = parse_collection(&params.collection)?;
    let rkey = parse_rkey(&params.rkey)?;
    let expected = parse_cid_param(&params.cid)?;
    let entry = pds
        .with_repo(|r| r.get_record(&collection, &rkey, expected))
        .await
        .map_err(|e| map_repo_error(e, false))?;
    Ok(Json(record_json(&entry)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListRecordsParams {
    repo: String,
    collection: String,
    limit: Option<usize>,
    cursor: Option<String>,
    reverse: Option<bool>,
}

/// `com.atproto.repo.listRecords`
pub(crate) async fn list_records<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    Query(params): Query<ListRecordsParams>,
) -> Result<Json<JsonValue>, XrpcError> {
    if !is_local_repo(&pds, &params.repo).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", params.repo),
        ));
    }
    let collection = parse_collection(&params.collection)?;
    let limit = params.limit.unwrap_or(50);
    if limit == 0 || limit > LIST_LIMIT_MAX {
        return Err(XrpcError::invalid_request(format!(
            "limit must be between 1 and {LIST_LIMIT_MAX}"
        )));
    }
    let reverse = params.reverse.unwrap_or(false);
    let cursor = params.cursor.clone();
    let (records, next) = pds
        .with_repo(|r| r.list_records(&collection, limit, cursor.as_deref(), reverse))
        .await
        .map_err(|e| map_repo_error(e, false))?;
    let records: Vec<JsonValue> = records.iter().map(record_json).collect();
    let mut out = json!({ "records": records });
    if let Some(next) = next {
        out["cursor"] = json!(next);
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateRecordInput {
    repo: String,
    collection: String,
    rkey: Option<String>,
    record: JsonValue,
    swap_commit: Option<String>,
    swap_record: Option<String>,
}

/// `com.atproto.repo.createRecord`
///
/// A `repo` other than the local one is a federated record arriving from a
/// remote author; it goes to the dispatcher, not the repository.
pub(crate) async fn create_record<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    headers: HeaderMap,
    Json(input): Json<CreateRecordInput>,
) -> Result<Json<JsonValue>, XrpcError> {
    check_auth(&pds, &headers)?;
    let collection = parse_collection(&input.collection)?;
    let record = parse_record(&input.record)?;

    if !is_local_repo(&pds, &input.repo).await {
        return dispatch_incoming(&pds, &input.repo, &collection, input.rkey.as_deref(), &record)
            .await;
    }

    if input.swap_record.is_some() {
        // a create asserts there is no previous record; any record-level
        // swap expectation is unsatisfiable
        return Err(XrpcError::new(
            ErrorCode::InvalidSwap,
            "swapRecord is not applicable to createRecord",
        ));
    }
    let rkey = input.rkey.as_deref().map(parse_rkey).transpose()?;
    let swap_commit = parse_cid_param(&input.swap_commit)?;
    let (entry, result) = pds
        .create_record(collection, record, rkey, swap_commit)
        .await
        .map_err(|e| map_repo_error(e, true))?;
    Ok(Json(json!({
        "uri": entry.uri.to_string(),
        "cid": entry.cid.to_string(),
        "commit": { "cid": result.commit_cid.to_string(), "rev": result.rev.to_string() },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PutRecordInput {
    repo: String,
    collection: String,
    rkey: String,
    record: JsonValue,
    swap_commit: Option<String>,
    swap_record: Option<String>,
}

/// `com.atproto.repo.putRecord`
pub(crate) async fn put_record<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    headers: HeaderMap,
    Json(input): Json<PutRecordInput>,
) -> Result<Json<JsonValue>, XrpcError> {
    check_auth(&pds, &headers)?;
    if !is_local_repo(&pds, &input.repo).await {
        // deliberately indistinguishable from an unknown repo
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", input.repo),
        ));
    }
    let collection = parse_collection(&input.collection)?;
    let rkey = parse_rkey(&input.rkey)?;
    let record = parse_record(&input.record)?;
    let swap_record = parse_cid_param(&input.swap_record)?;
    let swap_commit = parse_cid_param(&input.swap_commit)?;
    let (entry, result) = pds
        .put_record(collection, rkey, record, swap_record, swap_commit)
        .await
        .map_err(|e| map_repo_error(e, true))?;
    Ok(Json(json!({
        "uri": entry.uri.to_string(),
        "cid": entry.cid.to_string(),
        "commit": { "cid": result.commit_cid.to_string(), "rev": result.rev.to_string() },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeleteRecordInput {
    repo: String,
    collection: String,
    rkey: String,
    swap_commit: Option<String>,
    swap_record: Option<String>,
}

/// `com.atproto.repo.deleteRecord`
pub(crate) async fn delete_record<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    headers: HeaderMap,
    Json(input): Json<DeleteRecordInput>,
) -> Result<Json<JsonValue>, XrpcError> {
    check_auth(&pds, &headers)?;
    if !is_local_repo(&pds, &input.repo).await {
        return Err(XrpcError::new(
            ErrorCode::RepoNotFound,
            format!("repo not found: {}", input.repo),
        ));
    }
    let collection = parse_collection(&input.collection)?;
    let rkey = parse_rkey(&input.rkey)?;
    let swap_record = parse_cid_param(&input.swap_record)?;
    let swap_commit = parse_cid_param(&input.swap_commit)?;
    let result = pds
        .delete_record(collection, rkey, swap_record, swap_commit)
        .await
        .map_err(|e| map_repo_error(e, true))?;
    Ok(Json(json!({
        "commit": { "cid": result.commit_cid.to_string(), "rev": result.rev.to_string() },
    })))
}

/// `com.atproto.repo.uploadBlob`
pub(crate) async fn upload_blob<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, XrpcError> {
    check_auth(&pds, &headers)?;
    let mime = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_owned();
    let info = pds.upload_blob(body, &mime).await.map_err(|e| {
        if e.kind() == weft_repo::RepoErrorKind::TooLarge {
            XrpcError::new(ErrorCode::BlobTooLarge, e.to_string())
        } else {
            XrpcError::new(ErrorCode::UploadFailed, e.to_string())
        }
    })?;
    Ok(Json(json!({
        "blob": {
            "$type": "blob",
            "ref": { "$link": info.cid.to_string() },
            "mimeType": info.mime,
            "size": info.size,
        }
    })))
}

/// Routes a non-local create to the dispatcher and synthesizes the record's
/// identity for the response.
async fn dispatch_incoming<S: StateStore + Send + Sync + 'static>(
    pds: &Pds<S>,
    repo: &str,
    collection: &Nsid,
    rkey: Option<&str>,
    record: &Value,
) -> Result<Json<JsonValue>, XrpcError> {
    let author_did = Did::new(repo).map_err(|_| {
        XrpcError::new(ErrorCode::RepoNotFound, format!("repo not found: {repo}"))
    })?;
    let author_handle = author_did
        .web_host()
        .and_then(|host| Handle::new(host).ok())
        .unwrap_or_else(|| Handle::new("unknown.invalid").expect("static handle"));

    let outcome = pds.dispatcher.dispatch(record, &author_did, &author_handle);
    tracing::info!(
        author = %author_did,
        collection = %collection,
        outcome = ?outcome,
        "incoming federated record"
    );
    if matches!(outcome, Dispatch::Ignored) {
        tracing::debug!("incoming record had no local effect");
    }

    let cid = codec::cid_for_value(record);
    let rkey = match rkey {
        Some(rkey) => parse_rkey(rkey)?,
        // remote writer supplied no key; the content hash stands in
        None => parse_rkey(&cid.to_string()[1..14])?,
    };
    Ok(Json(json!({
        "uri": format!("at://{author_did}/{collection}/{rkey}"),
        "cid": cid.to_string(),
    })))
}
