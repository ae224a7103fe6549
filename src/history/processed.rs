use anyhow::Result;
use arrow::{
    array::{ArrayRef, StringArray, TimestampMicrosecondArray, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
};
use chrono::{DateTime, NaiveDate, Utc};
use std::{path::PathBuf, sync::Arc};

use crate::history::table_history::{HistoryRow, TableHistory};

/// One completed run: the file that was ingested and what it produced.
#[derive(Debug, Clone)]
pub struct ProcessedRow {
    pub filename: String,
    pub remote_path: String,
    pub rows_read: u64,
    pub rows_applied: u64,
    pub size_bytes: u64,
    pub processing_start: DateTime<Utc>,
    pub processing_end: DateTime<Utc>,
}

impl HistoryRow for ProcessedRow {
    fn partition_date(&self) -> NaiveDate {
        self.processing_end.date_naive()
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("filename", ArrowDataType::Utf8, false),
            Field::new("remote_path", ArrowDataType::Utf8, false),
            Field::new("rows_read", ArrowDataType::UInt64, false),
            Field::new("rows_applied", ArrowDataType::UInt64, false),
            Field::new("size_bytes", ArrowDataType::UInt64, false),
            Field::new(
                "processing_start",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
            Field::new(
                "processing_end",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ])
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        vec![
            Arc::new(StringArray::from(vec![self.filename.clone()])),
            Arc::new(StringArray::from(vec![self.remote_path.clone()])),
            Arc::new(UInt64Array::from(vec![self.rows_read])),
            Arc::new(UInt64Array::from(vec![self.rows_applied])),
            Arc::new(UInt64Array::from(vec![self.size_bytes])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .processing_start
                .timestamp_micros()])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .processing_end
                .timestamp_micros()])),
        ]
    }

    fn file_key(&self) -> String {
        format!("{}--{}", self.filename, self.processing_end.timestamp_micros())
    }
}

impl TableHistory<ProcessedRow> {
    pub fn new_processed(base: impl Into<PathBuf>) -> Result<Self> {
        TableHistory::new(base, "processed")
    }
}
