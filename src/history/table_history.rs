use anyhow::{Context, Result};
use arrow::{datatypes::Schema as ArrowSchema, record_batch::RecordBatch};
use chrono::{NaiveDate, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::{
    fs::{self, File},
    io::BufWriter,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

const CONSOLIDATED: &str = "consolidated.parquet";

/// Trait representing a row in the history table.
pub trait HistoryRow {
    /// Partition date (UTC naive) for hive partitioning
    fn partition_date(&self) -> NaiveDate;
    /// Arrow schema for this row type
    fn schema() -> ArrowSchema;
    /// Convert this row into column arrays matching the schema
    fn to_arrays(&self) -> Vec<arrow::array::ArrayRef>;
    /// Readable prefix of the file this row is written to
    fn file_key(&self) -> String;
}

/// Generic hive-partitioned history table: `<base>/<table>/date=YYYYMMDD/*.parquet`.
/// Append-only; every `add` writes one single-row file.
pub struct TableHistory<R: HistoryRow> {
    base_dir: PathBuf,
    table: String,
    schema: Arc<ArrowSchema>,
    _marker: PhantomData<R>,
}

impl<R: HistoryRow> TableHistory<R> {
    /// Create the table directory if it is missing.
    pub fn new(base_dir: impl Into<PathBuf>, table: &str) -> Result<Self> {
        let base_dir = base_dir.into();
        let table_dir = base_dir.join(table);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("could not create `{}`", table_dir.display()))?;

        Ok(Self {
            base_dir,
            table: table.to_string(),
            schema: Arc::new(R::schema()),
            _marker: PhantomData,
        })
    }

    fn table_dir(&self) -> PathBuf {
        self.base_dir.join(&self.table)
    }

    /// Append one row as `<partition>/<file_key>---<now_us>.parquet` via tmp + rename.
    pub fn add(&self, row: &R) -> Result<()> {
        let date = row.partition_date();
        let partition = format!("date={}", date.format("%Y%m%d"));
        let dir = self.table_dir().join(partition);
        fs::create_dir_all(&dir)?;

        let ts = Utc::now().timestamp_micros();
        let safe_key: String = row
            .file_key()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        let fname = format!("{}---{}.parquet", safe_key, ts);
        let tmp = dir.join(format!("{}.tmp", fname));
        let final_path = dir.join(&fname);

        let file = File::create(&tmp)
            .with_context(|| format!("could not create `{}`", tmp.display()))?;
        let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
        let batch = RecordBatch::try_new(self.schema.clone(), row.to_arrays())
            .context("building history record batch")?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&tmp, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }

    /// Every stored batch, partitions in date order.
    pub fn read_all(&self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for path in parquet_files(&self.table_dir())? {
            out.extend(read_batches(&path)?);
        }
        Ok(out)
    }

    /// Vacuum each partition into one consolidated file
    pub fn vacuum(&self) -> Result<()> {
        for part in fs::read_dir(self.table_dir())? {
            let part = part?;
            if !part.file_type()?.is_dir() {
                continue;
            }
            let dir = part.path();

            let files = glob(&format!("{}/*.parquet", dir.display()))?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            let only_consolidated = files.len() == 1
                && files[0].file_name().and_then(|n| n.to_str()) == Some(CONSOLIDATED);
            if files.is_empty() || only_consolidated {
                continue;
            }

            let tmp = dir.join(format!("{}.tmp", CONSOLIDATED));
            let file = File::create(&tmp)?;
            let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
            for p in &files {
                for batch in read_batches(p)? {
                    writer.write(&batch)?;
                }
            }
            writer.close()?;
            fs::rename(&tmp, dir.join(CONSOLIDATED))?;

            for p in files {
                if p.file_name().and_then(|n| n.to_str()) != Some(CONSOLIDATED) {
                    fs::remove_file(p)?;
                }
            }
        }
        Ok(())
    }
}

/// All `*.parquet` files one partition level below `table_dir`, sorted.
fn parquet_files(table_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(&format!("{}/*/*.parquet", table_dir.display()))?
        .filter_map(Result::ok)
        .collect();
    files.sort();
    Ok(files)
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(1024)
        .build()?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("error reading `{}`", path.display()))
}
