//! file_state.rs: print the cdrsync run history.
//!
//! - Reads every `processed` row under the configured history dir (or the
//!   directory given as the first argument).
//! - Prints one line per ingested file, oldest partition first, then totals.
//! - `--vacuum` consolidates each day partition into a single file first.

use anyhow::{Context, Result};
use arrow::array::{Array, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::record_batch::RecordBatch;
use cdrsync::{config, history::RunHistory};
use chrono::DateTime;
use std::path::PathBuf;

/// Convert a byte count into a human-readable string (B, K, M, G, T).
fn human_readable(bytes: u64) -> String {
    let units = ["B", "K", "M", "G", "T"];
    let mut i = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && i < units.len() - 1 {
        value /= 1024.0;
        i += 1;
    }
    if i == 0 {
        format!("{}{}", bytes, units[i])
    } else {
        format!("{:.1}{}", value, units[i])
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .with_context(|| format!("history column `{}` missing or mistyped", name))
}

fn format_micros(us: i64) -> String {
    DateTime::from_timestamp_micros(us)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| us.to_string())
}

fn main() -> Result<()> {
    let mut vacuum = false;
    let mut dir: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--vacuum" => vacuum = true,
            other => dir = Some(PathBuf::from(other)),
        }
    }
    let dir = match dir {
        Some(d) => d,
        None => config::load()?.history.dir,
    };

    let history = RunHistory::new_processed(&dir)
        .with_context(|| format!("opening history at {}", dir.display()))?;
    if vacuum {
        history.vacuum().context("vacuuming history")?;
    }

    println!("=== cdrsync run history ({}) ===", dir.display());
    let (mut files, mut rows, mut applied, mut bytes) = (0u64, 0u64, 0u64, 0u64);
    for batch in history.read_all()? {
        let names = column::<StringArray>(&batch, "filename")?;
        let read = column::<UInt64Array>(&batch, "rows_read")?;
        let app = column::<UInt64Array>(&batch, "rows_applied")?;
        let size = column::<UInt64Array>(&batch, "size_bytes")?;
        let end = column::<TimestampMicrosecondArray>(&batch, "processing_end")?;

        for i in 0..names.len() {
            println!(
                "{}  {:<40} {:>8} rows {:>8} applied {:>8}",
                format_micros(end.value(i)),
                names.value(i),
                read.value(i),
                app.value(i),
                human_readable(size.value(i)),
            );
            files += 1;
            rows += read.value(i);
            applied += app.value(i);
            bytes += size.value(i);
        }
    }

    println!();
    println!("Files:   {}", files);
    println!("Rows:    {}", rows);
    println!("Applied: {}", applied);
    println!("Bytes:   {}", human_readable(bytes));
    Ok(())
}
