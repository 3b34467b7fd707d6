use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::model::BfsCode;

/// Failure classes of the reconciliation core.
///
/// Field-level mismatches and proposal alignment problems are not errors:
/// they are reported inside the verdict.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The merger graph revisits a code (cycle or malformed chain).
    #[error("merger graph integrity violated: code {code} reached again via {via}")]
    GraphIntegrity { code: BfsCode, via: BfsCode },

    #[error("no dataset for voting date {date} (expected {})", .path.display())]
    DatasetNotFound { date: NaiveDate, path: PathBuf },

    #[error("cannot parse dataset {}: {message}", .path.display())]
    DatasetParse { path: PathBuf, message: String },

    #[error("dataset {} records voting date {found}, expected {expected}", .path.display())]
    DatasetDateMismatch {
        path: PathBuf,
        expected: NaiveDate,
        found: String,
    },

    #[error("unknown municipality code {0}")]
    UnknownMunicipality(BfsCode),

    #[error("invalid date '{0}' (expected YYYYMMDD or YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A database row (change table or aggregate view) breaks its contract.
    #[error("malformed database row: {0}")]
    CorruptView(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot write report: {0}")]
    Export(#[from] csv::Error),
}

impl ReconcileError {
    /// Errors the caller can recover from by asking for something else.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReconcileError::DatasetNotFound { .. } | ReconcileError::UnknownMunicipality(_)
        )
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, ReconcileError::InvalidDate(_))
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
