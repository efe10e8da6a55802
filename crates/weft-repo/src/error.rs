//! Error types for the repository engine.

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    context: Option<String>,
}

/// Error categories; the service layer maps these to wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// State store operation failed.
    Storage,
    /// Key failed MST validation.
    InvalidKey,
    /// Record payload rejected.
    InvalidRecord,
    /// Requested resource does not exist.
    NotFound,
    /// Create collided with an existing record.
    AlreadyExists,
    /// A swap precondition did not hold.
    SwapMismatch,
    /// Signing or verification failed.
    Crypto,
    /// Canonical encode/decode failed.
    Encoding,
    /// CAR archive malformed.
    Car,
    /// Payload over a configured limit.
    TooLarge,
    /// Persisted state inconsistent with itself.
    InvalidState,
}

impl RepoError {
    /// Creates an error with the given kind and optional source.
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            context: None,
        }
    }

    /// Attaches human-readable context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// The error category.
    pub fn kind(&self) -> RepoErrorKind {
        self.kind
    }

    /// Storage-layer failure.
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Invalid MST key.
    pub fn invalid_key(key: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None).with_context(format!("key: {key}"))
    }

    /// Rejected record payload.
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidRecord, None).with_context(msg)
    }

    /// Missing resource.
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{resource} not found: {id}"))
    }

    /// Create collision.
    pub fn already_exists(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::AlreadyExists, None)
            .with_context(format!("{resource} already exists: {id}"))
    }

    /// Failed swap precondition.
    pub fn swap_mismatch(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::SwapMismatch, None).with_context(msg)
    }

    /// Crypto failure.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Crypto, None).with_context(msg)
    }

    /// Encoding failure.
    pub fn encoding(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Encoding, Some(Box::new(source)))
    }

    /// CAR failure.
    pub fn car(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::Car, None).with_context(msg)
    }

    /// Over-limit payload.
    pub fn too_large(what: &str, size: usize, max: usize) -> Self {
        Self::new(RepoErrorKind::TooLarge, None)
            .with_context(format!("{what} is {size} bytes, max {max}"))
    }

    /// Inconsistent persisted state.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidState, None).with_context(msg)
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(src) = &self.source {
            write!(f, ": {src}")?;
        }
        Ok(())
    }
}

impl From<weft_common::CodecError> for RepoError {
    fn from(e: weft_common::CodecError) -> Self {
        RepoError::new(RepoErrorKind::Encoding, Some(Box::new(e)))
    }
}

impl From<weft_common::cid::CidError> for RepoError {
    fn from(e: weft_common::cid::CidError) -> Self {
        RepoError::new(RepoErrorKind::Encoding, Some(Box::new(e)))
    }
}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::new(RepoErrorKind::Storage, Some(Box::new(e)))
    }
}
