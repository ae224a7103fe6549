//! Error taxonomy for a single ingest run.
//!
//! Every stage of the pipeline fails with one of these variants; the orchestrator
//! pairs it with the stage that produced it and stops the run.

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::model::NaturalKey;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Discovery found nothing matching the extension filter.
    #[error("no '*{extension}' file found in remote directory '{dir}'")]
    NotFound { dir: String, extension: String },

    /// Remote I/O failed (connect, list, get, mkdir, copy, delete).
    #[error("remote {op} failed for '{path}': {source}")]
    Transfer {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A column the transformer needs is not present in the file header.
    #[error("line {line}: required column '{column}' is missing")]
    Schema { line: u64, column: String },

    /// A value could not be parsed, or a natural-key component is empty.
    #[error("line {line}: invalid value {value:?} for '{field}': {reason}")]
    Validation {
        line: u64,
        field: String,
        value: String,
        reason: String,
    },

    #[error("line {line}: record with natural key {key} has an empty '{component}'")]
    EmptyKey {
        line: u64,
        key: NaturalKey,
        component: &'static str,
    },

    /// The header line names the same column more than once.
    #[error("column '{column}' appears more than once in the header of '{}'", path.display())]
    DuplicateColumn { path: PathBuf, column: String },

    /// CSV decode failure on the staged file.
    #[error("malformed CSV in '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// Transaction, statement or commit failure.
    #[error("store {context} failed: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Local staging directory I/O.
    #[error("staging I/O failed for '{}': {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run deadline of {limit:?} expired")]
    Deadline { limit: Duration },
}

impl IngestError {
    pub fn transfer(op: &'static str, path: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Transfer {
            op,
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn store(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Store { context, source }
    }

    pub fn staging(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Staging { path, source }
    }

    /// Short, stable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Transfer { .. } => "transfer",
            Self::Schema { .. } | Self::DuplicateColumn { .. } => "schema",
            Self::Validation { .. } | Self::EmptyKey { .. } | Self::Decode { .. } => "validation",
            Self::Store { .. } => "store",
            Self::Staging { .. } => "staging",
            Self::Deadline { .. } => "deadline",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
