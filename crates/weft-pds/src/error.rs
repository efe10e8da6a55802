//! XRPC error surface.
//!
//! Every failure leaving the server is one of a fixed set of wire codes in
//! the uniform envelope `{"error": <code>, "message": <human>}`, with the
//! HTTP status derived from the code. Codes are stable identifiers; clients
//! match on them, not on messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use weft_repo::{RepoError, RepoErrorKind};

/// Stable wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// Request failed validation.
    InvalidRequest,
    /// Handle failed syntax checks.
    InvalidHandle,
    /// Handle does not resolve here.
    HandleNotFound,
    /// Repo parameter does not name the local repository.
    RepoNotFound,
    /// No record at the given key (or the expected CID did not match).
    RecordNotFound,
    /// Collection not served here.
    UnsupportedCollection,
    /// A compare-and-swap precondition failed; re-read and retry.
    InvalidSwap,
    /// Blob payload over the configured cap.
    BlobTooLarge,
    /// No blob with that CID.
    BlobNotFound,
    /// Input bytes were not canonical.
    MalformedEncoding,
    /// Record creation failed.
    CreateFailed,
    /// Mutation failed after validation (signing, persistence).
    WriteFailed,
    /// Blob upload failed.
    UploadFailed,
    /// Missing credentials on a write procedure.
    AuthenticationRequired,
    /// Credentials present but rejected.
    InvalidToken,
    /// Method exists but this deployment cannot serve it.
    MethodNotImplemented,
}

impl ErrorCode {
    /// HTTP status for this code.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::InvalidHandle
            | ErrorCode::RepoNotFound
            | ErrorCode::UnsupportedCollection
            | ErrorCode::InvalidSwap
            | ErrorCode::MalformedEncoding => StatusCode::BAD_REQUEST,
            ErrorCode::HandleNotFound | ErrorCode::RecordNotFound | ErrorCode::BlobNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorCode::BlobTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::AuthenticationRequired | ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::MethodNotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::CreateFailed | ErrorCode::WriteFailed | ErrorCode::UploadFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The identifier as sent over the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::InvalidHandle => "InvalidHandle",
            ErrorCode::HandleNotFound => "HandleNotFound",
            ErrorCode::RepoNotFound => "RepoNotFound",
            ErrorCode::RecordNotFound => "RecordNotFound",
            ErrorCode::UnsupportedCollection => "UnsupportedCollection",
            ErrorCode::InvalidSwap => "InvalidSwap",
            ErrorCode::BlobTooLarge => "BlobTooLarge",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::MalformedEncoding => "MalformedEncoding",
            ErrorCode::CreateFailed => "CreateFailed",
            ErrorCode::WriteFailed => "WriteFailed",
            ErrorCode::UploadFailed => "UploadFailed",
            ErrorCode::AuthenticationRequired => "AuthenticationRequired",
            ErrorCode::InvalidToken => "InvalidToken",
            ErrorCode::MethodNotImplemented => "MethodNotImplemented",
        }
    }
}

/// An error ready to cross the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct XrpcError {
    /// Wire code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl XrpcError {
    /// Builds an error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        XrpcError {
            code,
            message: message.into(),
        }
    }

    /// `InvalidRequest` with a message.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl IntoResponse for XrpcError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code.as_str(),
            "message": self.message,
        }));
        (self.code.status(), body).into_response()
    }
}

/// Maps engine errors onto wire codes. `write` selects the 500-class code
/// used when an already-validated mutation fails.
pub fn map_repo_error(err: RepoError, write: bool) -> XrpcError {
    let code = match err.kind() {
        RepoErrorKind::NotFound => ErrorCode::RecordNotFound,
        RepoErrorKind::AlreadyExists => ErrorCode::InvalidSwap,
        RepoErrorKind::SwapMismatch => ErrorCode::InvalidSwap,
        RepoErrorKind::InvalidKey | RepoErrorKind::InvalidRecord => ErrorCode::InvalidRequest,
        RepoErrorKind::Encoding | RepoErrorKind::Car => ErrorCode::MalformedEncoding,
        RepoErrorKind::TooLarge => ErrorCode::BlobTooLarge,
        RepoErrorKind::Crypto | RepoErrorKind::Storage | RepoErrorKind::InvalidState => {
            if write {
                ErrorCode::WriteFailed
            } else {
                ErrorCode::InvalidRequest
            }
        }
    };
    XrpcError::new(code, err.to_string())
}
