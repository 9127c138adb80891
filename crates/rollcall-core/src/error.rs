//! Infrastructure errors.
//!
//! Resolution failures (no face, no match, multiple faces) and policy
//! rejections (day completed, too soon) are outcomes, not errors. Only the
//! record store, the descriptor oracle and the blocking image workers can
//! fail, and those failures reach callers as a [`Fault`].

use crate::types::IdentityId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("external user id already enrolled: {0}")]
    DuplicateUser(String),
    #[error("no reference image stored for identity {0}")]
    ReferenceImageMissing(IdentityId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(tokio_rusqlite::Error::Rusqlite(e))
    }
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("no descriptor oracle configured")]
    NotConfigured,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("oracle exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed oracle response: {0}")]
    Malformed(String),
    #[error("failed to encode image for oracle: {0}")]
    Encode(#[from] image::ImageError),
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// Transient infrastructure failure, surfaced with the name of the failing
/// operation so callers can apply their own retry policy.
#[derive(Error, Debug, Clone)]
pub enum Fault {
    #[error("record store failed during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: Arc<StoreError>,
    },
    #[error("descriptor oracle failed during {operation}: {source}")]
    Oracle {
        operation: &'static str,
        #[source]
        source: Arc<OracleError>,
    },
    #[error("blocking worker failed during {operation}: {message}")]
    Worker {
        operation: &'static str,
        message: String,
    },
}

impl Fault {
    pub fn store(operation: &'static str, source: StoreError) -> Self {
        Self::Store {
            operation,
            source: Arc::new(source),
        }
    }

    pub fn oracle(operation: &'static str, source: OracleError) -> Self {
        Self::Oracle {
            operation,
            source: Arc::new(source),
        }
    }

    pub fn worker(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Worker {
            operation,
            message: message.into(),
        }
    }

    /// Name of the collaborator call that failed (e.g. `list_identities`).
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Store { operation, .. }
            | Self::Oracle { operation, .. }
            | Self::Worker { operation, .. } => operation,
        }
    }
}
