// src/process/mod.rs
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

use crate::error::{IngestError, Result};

pub mod date_parser;
pub mod transform;
pub mod utils;

pub use transform::{ColumnMap, RowTransformer};

/// One CSV line, keyed by header name, in file column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    line: u64,
    headers: Arc<[String]>,
    values: Vec<String>,
}

impl RawRow {
    pub fn new(line: u64, headers: Arc<[String]>, values: Vec<String>) -> Self {
        RawRow {
            line,
            headers,
            values,
        }
    }

    /// Build a row from `(header, value)` pairs.
    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        line: u64,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let (headers, values): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        RawRow::new(line, headers.into(), values)
    }

    /// 1-based line number in the source file.
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == header)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }

    /// Every field of the row as a JSON object.
    pub fn to_json(&self) -> String {
        let map: Map<String, Value> = self
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        Value::Object(map).to_string()
    }
}

/// Lazy, single-pass iterator over the rows of a CSV file with a header line.
pub struct CsvRows<R: Read> {
    reader: csv::Reader<R>,
    headers: Arc<[String]>,
    record: StringRecord,
    source: PathBuf,
    failed: bool,
}

/// Open `path` and read its header line. Rows are decoded on demand.
pub fn open_rows(path: &Path) -> Result<CsvRows<File>> {
    let file = File::open(path).map_err(IngestError::staging(path))?;
    rows_from_reader(file, path)
}

pub fn rows_from_reader<R: Read>(rdr: R, source: impl Into<PathBuf>) -> Result<CsvRows<R>> {
    let source = source.into();
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(rdr);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::Decode {
            path: source.clone(),
            source: e,
        })?
        .iter()
        .map(utils::clean_header)
        .collect();
    // names must be unique for `RawRow::get` and `RawRow::to_json`
    for (i, name) in headers.iter().enumerate() {
        if headers[..i].contains(name) {
            return Err(IngestError::DuplicateColumn {
                path: source,
                column: name.clone(),
            });
        }
    }
    debug!(file = %source.display(), columns = headers.len(), "read CSV header");

    Ok(CsvRows {
        reader,
        headers: headers.into(),
        record: StringRecord::new(),
        source,
        failed: false,
    })
}

impl<R: Read> CsvRows<R> {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl<R: Read> Iterator for CsvRows<R> {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                let values = self.record.iter().map(str::to_string).collect();
                Some(Ok(RawRow::new(line, Arc::clone(&self.headers), values)))
            }
            Err(e) => {
                // the reader cannot be trusted past a malformed record
                self.failed = true;
                Some(Err(IngestError::Decode {
                    path: self.source.clone(),
                    source: e,
                }))
            }
        }
    }
}
