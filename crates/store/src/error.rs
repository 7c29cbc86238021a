//! The error taxonomy of the store. Every error carries a stable code
//! which the boundary serializes next to the human message.

use serde::ser::SerializeStruct;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MalformedId,
    IdNotAllowed,
    NotFound,
    DuplicateUpload,
    InvalidEntity,
    HashMismatch,
    SizeMismatch,
    NoChannels,
    MigrationFailed,
    UnknownMigration,
    TooManySessions,
    Timeout,
    Closed,
    /// Infrastructure failures with no finer classification.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedId => "malformed id",
            ErrorCode::IdNotAllowed => "id not allowed",
            ErrorCode::NotFound => "not found",
            ErrorCode::DuplicateUpload => "duplicate upload",
            ErrorCode::InvalidEntity => "invalid charm or bundle",
            ErrorCode::HashMismatch => "hash mismatch",
            ErrorCode::SizeMismatch => "size mismatch",
            ErrorCode::NoChannels => "no channels provided",
            ErrorCode::MigrationFailed => "migration failed",
            ErrorCode::UnknownMigration => "unknown migration",
            ErrorCode::TooManySessions => "too many sessions",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Closed => "closed",
            ErrorCode::Internal => "internal error",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    MalformedId(#[from] charmurl::ParseError),
    #[error("{0}")]
    IdNotAllowed(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    DuplicateUpload(String),
    #[error("{0}")]
    InvalidEntity(String),
    #[error(transparent)]
    InvalidArchive(#[from] archive::Error),
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },
    #[error("size mismatch: declared {declared}, got {got}")]
    SizeMismatch { declared: u64, got: u64 },
    #[error("cannot update base entity: no channels provided")]
    NoChannels,
    #[error("migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },
    #[error("database contains unknown migration {0:?}; database is newer than this version")]
    UnknownMigration(String),
    #[error("too many database sessions in use")]
    TooManySessions,
    #[error("operation deadline exceeded")]
    Timeout,
    #[error("store is closed")]
    Closed,
    #[error("database error")]
    Db(#[from] rusqlite::Error),
    #[error("blob store error")]
    Blob(#[source] blobstore::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encoding error")]
    Encoding(#[from] serde_json::Error),
    #[error("search index error")]
    Search(#[from] search::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::MalformedId(_) => ErrorCode::MalformedId,
            Error::IdNotAllowed(_) => ErrorCode::IdNotAllowed,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::DuplicateUpload(_) => ErrorCode::DuplicateUpload,
            Error::InvalidEntity(_) | Error::InvalidArchive(_) => ErrorCode::InvalidEntity,
            Error::HashMismatch { .. } => ErrorCode::HashMismatch,
            Error::SizeMismatch { .. } => ErrorCode::SizeMismatch,
            Error::NoChannels => ErrorCode::NoChannels,
            Error::MigrationFailed { .. } => ErrorCode::MigrationFailed,
            Error::UnknownMigration(_) => ErrorCode::UnknownMigration,
            Error::TooManySessions => ErrorCode::TooManySessions,
            Error::Timeout => ErrorCode::Timeout,
            Error::Closed => ErrorCode::Closed,
            Error::Db(_)
            | Error::Blob(_)
            | Error::Io(_)
            | Error::Encoding(_)
            | Error::Search(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Error {
        Error::NotFound(what.to_string())
    }
}

impl From<blobstore::Error> for Error {
    fn from(err: blobstore::Error) -> Error {
        match err {
            blobstore::Error::HashMismatch { declared, computed } => {
                Error::HashMismatch { declared, computed }
            }
            blobstore::Error::SizeMismatch { declared, got } => {
                Error::SizeMismatch { declared, got }
            }
            other => Error::Blob(other),
        }
    }
}

// The boundary wire form: `{"code": ..., "message": ...}`.
impl Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Error", 2)?;
        s.serialize_field("code", self.code().as_str())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}
