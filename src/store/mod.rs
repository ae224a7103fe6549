//! Batch upsert of canonical records into the `CDR` table.

use crate::error::{IngestError, Result};
use crate::model::CanonicalRecord;

pub mod sqlite;

pub use sqlite::SqliteCdrStore;

/// Outcome of one committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertResult {
    /// Records staged, duplicates included.
    pub staged: usize,
    /// Distinct natural keys inserted or updated.
    pub applied: u64,
}

/// A relational store that merges a whole batch atomically: either every
/// record is reflected after the call, or none is.
#[allow(async_fn_in_trait)]
pub trait CdrStore {
    async fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertResult>;
}

/// Reject records whose natural key has an empty component.
pub fn validate_keys(records: &[CanonicalRecord]) -> Result<()> {
    for rec in records {
        let component = if rec.did.is_empty() {
            "did"
        } else if rec.phone.is_empty() {
            "phone"
        } else {
            continue;
        };
        return Err(IngestError::EmptyKey {
            line: rec.line,
            key: rec.natural_key(),
            component,
        });
    }
    Ok(())
}
