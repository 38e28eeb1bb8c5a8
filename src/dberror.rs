//! Custom Error for the geotuco storage engine.
//! Every module returns `Result<_, DbError>`, so a failure in the
//! codec, in the heap or in the row index reaches the caller with
//! one of the kinds below and nothing else.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// Read, write, seek, truncate or rename failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A length, header or stream on disk is inconsistent.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Null in a non-nullable field, wrong value kind, object id supplied...
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A quantized coordinate (or its delta) does not fit the varint stream.
    #[error("Encoding range error: {0}")]
    EncodingRange(String),

    /// Record too long for the length prefix, or file too long for the index offsets.
    #[error("Record too large: {0}")]
    RecordTooLarge(String),

    #[error("Unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    /// The two commit renames of a repack did not both happen.
    /// The table must be recovered by hand.
    #[error("Fatal inconsistency: {0}")]
    FatalInconsistency(String),

    #[error("Row {0} not found")]
    RowNotFound(u32),

    #[error("Row {0} already exists")]
    RowExists(u32),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DbError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        DbError::CorruptData(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        DbError::ConstraintViolation(msg.into())
    }
}
