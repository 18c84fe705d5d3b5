//! Errors surfaced by the transfer engine and manager

use crate::s3::S3Error;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object needs {parts} parts, more than the limit of {max_parts}")]
    PlanTooLarge { parts: u64, max_parts: u32 },

    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("{} failed after {attempts} attempt(s): {source}", failed_step(.part_number))]
    TransferFailed {
        /// `None` when initiate or complete failed
        part_number: Option<u32>,
        attempts: u32,
        #[source]
        source: S3Error,
    },

    #[error("credentials expired at {0}")]
    CredentialExpired(DateTime<Utc>),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("no such task: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    S3(S3Error),
}

impl From<S3Error> for TransferError {
    fn from(err: S3Error) -> Self {
        match err {
            S3Error::Cancelled => TransferError::Cancelled,
            S3Error::CredentialExpired { expiry } => TransferError::CredentialExpired(expiry),
            S3Error::Io(e) => TransferError::Io(e),
            other => TransferError::S3(other),
        }
    }
}

fn failed_step(part_number: &Option<u32>) -> String {
    match part_number {
        Some(n) => format!("part {}", n),
        None => "request".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
