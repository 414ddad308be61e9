use thiserror::Error;

use crate::Digest;

/// Errors occurring while building a tree or pulling blobs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown reference name: {0:?}")]
    UnknownReference(String),

    #[error("unsupported layer media type: {0}")]
    UnsupportedMediaType(String),

    #[error("disallowed path element: {0:?}")]
    DisallowedPathSegment(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] crate::digests::Error),

    #[error("failed to decode json: {0}")]
    DecodeJson(#[from] serde_json::Error),

    #[error("failed to decode protobuf: {0}")]
    DecodeProtobuf(#[from] prost::DecodeError),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means something doesn't exist, as opposed to being
    /// broken.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::UnknownReference(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            e @ Error::UnknownReference(_) => Self::new(std::io::ErrorKind::NotFound, e),
            e @ Error::DigestMismatch { .. } => Self::new(std::io::ErrorKind::InvalidData, e),
            e => Self::new(std::io::ErrorKind::Other, e),
        }
    }
}
