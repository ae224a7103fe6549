use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{date_parser, utils::clean_str, RawRow};
use crate::error::{IngestError, Result};
use crate::model::CanonicalRecord;

/// Source header names feeding each canonical field.
///
/// `cld`/`cli` are the two swap columns; which one lands in `did` depends on
/// whether `discriminator` equals `sentinel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub trunk: String,
    pub country: String,
    pub cli: String,
    pub cld: String,
    pub discriminator: String,
    pub sentinel: String,
    pub duration: String,
    pub connect_time: String,
    pub disconnect_time: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        ColumnMap {
            trunk: "Caller".into(),
            country: "Country".into(),
            cli: "CLI".into(),
            cld: "CLD".into(),
            discriminator: "Billing Prefix".into(),
            sentinel: "onnet_in".into(),
            duration: "Duration, sec".into(),
            connect_time: "Connect Time".into(),
            disconnect_time: "Disconnect Time".into(),
        }
    }
}

impl ColumnMap {
    /// Every header a row must carry.
    pub fn required(&self) -> [&str; 8] {
        [
            self.trunk.as_str(),
            self.country.as_str(),
            self.cli.as_str(),
            self.cld.as_str(),
            self.discriminator.as_str(),
            self.duration.as_str(),
            self.connect_time.as_str(),
            self.disconnect_time.as_str(),
        ]
    }
}

/// Converts raw CSV rows into [`CanonicalRecord`]s.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    columns: ColumnMap,
    timestamp_formats: Vec<String>,
}

impl Default for RowTransformer {
    fn default() -> Self {
        RowTransformer::new(
            ColumnMap::default(),
            date_parser::DEFAULT_TIMESTAMP_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl RowTransformer {
    pub fn new(columns: ColumnMap, timestamp_formats: Vec<String>) -> Self {
        RowTransformer {
            columns,
            timestamp_formats,
        }
    }

    pub fn transform(&self, row: &RawRow) -> Result<CanonicalRecord> {
        let c = &self.columns;

        // all headers first, so a short row never yields a half-built record
        for name in c.required() {
            if row.get(name).is_none() {
                return Err(IngestError::Schema {
                    line: row.line(),
                    column: name.to_string(),
                });
            }
        }
        let field = |name: &str| row.get(name).unwrap_or_default();

        let cli = clean_str(field(&c.cli));
        let cld = clean_str(field(&c.cld));
        let on_net = field(&c.discriminator) == c.sentinel;
        let (did, phone) = if on_net { (cld, cli) } else { (cli, cld) };
        trace!(line = row.line(), on_net, "mapped swap columns");

        Ok(CanonicalRecord {
            trunk: clean_str(field(&c.trunk)),
            country: clean_str(field(&c.country)),
            did,
            phone,
            duration_seconds: parse_duration(row.line(), &c.duration, field(&c.duration))?,
            connect_time: self.parse_time(row.line(), &c.connect_time, field(&c.connect_time))?,
            disconnect_time: self.parse_time(
                row.line(),
                &c.disconnect_time,
                field(&c.disconnect_time),
            )?,
            raw_payload: row.to_json(),
            line: row.line(),
        })
    }

    fn parse_time(&self, line: u64, name: &str, value: &str) -> Result<chrono::NaiveDateTime> {
        date_parser::parse_timestamp(value, &self.timestamp_formats).ok_or_else(|| {
            IngestError::Validation {
                line,
                field: name.to_string(),
                value: value.to_string(),
                reason: format!("expected one of {:?} or RFC 3339", self.timestamp_formats),
            }
        })
    }
}

/// Whole seconds only; no rounding of `"12.5"`, no sign.
fn parse_duration(line: u64, name: &str, value: &str) -> Result<u32> {
    let cleaned = clean_str(value);
    let invalid = |reason: &str| IngestError::Validation {
        line,
        field: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if cleaned.is_empty() || !cleaned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected a non-negative whole number of seconds"));
    }
    cleaned.parse().map_err(|_| invalid("out of range"))
}
