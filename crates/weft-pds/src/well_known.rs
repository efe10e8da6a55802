//! did:web identity surface.
//!
//! A did:web identity resolves over HTTPS: the DID document lives at
//! `/.well-known/did.json` and the bare DID at `/.well-known/atproto-did`
//! (the latter doubles as handle verification).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use weft_repo::StateStore;

use crate::pds::Pds;

/// A DID document, in the shape relays and clients expect from an atproto
/// PDS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// JSON-LD contexts.
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    /// The DID itself.
    pub id: String,
    /// Aliases; carries the `at://` handle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<String>,
    /// Signing keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_method: Vec<VerificationMethod>,
    /// Service endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,
}

/// One verification method entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// Method id (`<did>#atproto`).
    pub id: String,
    /// Always `Multikey` here.
    #[serde(rename = "type")]
    pub method_type: String,
    /// Controlling DID.
    pub controller: String,
    /// `z…` multibase public key.
    pub public_key_multibase: String,
}

/// One service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Service id (`#atproto_pds`).
    pub id: String,
    /// Service type.
    #[serde(rename = "type")]
    pub service_type: String,
    /// HTTPS origin.
    pub service_endpoint: String,
}

impl DidDocument {
    /// The PDS endpoint this document advertises, if any.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.service_type == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.as_str())
    }

    /// The `at://` handle alias, if any.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }
}

/// Builds the node's own DID document.
pub async fn build_did_document<S: StateStore + Send + Sync + 'static>(
    pds: &Pds<S>,
) -> DidDocument {
    let did = pds.did.as_str().to_owned();
    let handle = pds.handle().await;
    let public_key_multibase = pds.with_repo(|r| r.public_multibase()).await;
    let mut origin = pds.config.origin.to_string();
    if origin.ends_with('/') {
        origin.pop();
    }
    DidDocument {
        context: vec![
            "https://www.w3.org/ns/did/v1".to_owned(),
            "https://w3id.org/security/multikey/v1".to_owned(),
        ],
        id: did.clone(),
        also_known_as: vec![format!("at://{handle}")],
        verification_method: vec![VerificationMethod {
            id: format!("{did}#atproto"),
            method_type: "Multikey".to_owned(),
            controller: did,
            public_key_multibase,
        }],
        service: vec![Service {
            id: "#atproto_pds".to_owned(),
            service_type: "AtprotoPersonalDataServer".to_owned(),
            service_endpoint: origin,
        }],
    }
}

/// Routes for the well-known surface.
pub fn router<S: StateStore + Send + Sync + 'static>() -> Router<Arc<Pds<S>>> {
    Router::new()
        .route("/.well-known/did.json", get(did_json::<S>))
        .route("/.well-known/atproto-did", get(atproto_did::<S>))
}

async fn did_json<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
) -> impl IntoResponse {
    let doc = build_did_document(&pds).await;
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/did+json"),
        )],
        axum::Json(json!(doc)),
    )
}

async fn atproto_did<S: StateStore + Send + Sync + 'static>(
    State(pds): State<Arc<Pds<S>>>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        )],
        pds.did.as_str().to_owned(),
    )
}
