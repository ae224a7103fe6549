use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

/// Text layout of timestamps in the `CDR` table (SQLite stores them as TEXT, so
/// natural-key equality depends on every writer producing this exact form).
pub const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// One call detail record in the fixed column layout of the `CDR` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalRecord {
    pub trunk: String,
    pub country: String,
    pub did: String,
    pub phone: String,
    pub duration_seconds: u32,
    pub connect_time: NaiveDateTime,
    pub disconnect_time: NaiveDateTime,
    /// The original CSV row as a JSON object.
    pub raw_payload: String,
    /// Line in the staged file this record came from.
    #[serde(skip)]
    pub line: u64,
}

impl CanonicalRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            did: self.did.clone(),
            phone: self.phone.clone(),
            connect_time: self.connect_time,
        }
    }
}

/// (`DID`, `Phone`, `ConnectTime`): identity of a persisted CDR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub did: String,
    pub phone: String,
    pub connect_time: NaiveDateTime,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(did={:?}, phone={:?}, connect_time={})",
            self.did,
            self.phone,
            self.connect_time.format(DB_TIMESTAMP_FORMAT)
        )
    }
}
