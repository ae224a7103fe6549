use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{validate_keys, CdrStore, UpsertResult};
use crate::error::{IngestError, Result};
use crate::model::{CanonicalRecord, DB_TIMESTAMP_FORMAT};

const CREATE_CDR: &str = r#"
CREATE TABLE IF NOT EXISTS CDR (
    Trunk          TEXT    NOT NULL,
    Country        TEXT    NOT NULL,
    DID            TEXT    NOT NULL,
    Phone          TEXT    NOT NULL,
    Duration       INTEGER NOT NULL,
    ConnectTime    TEXT    NOT NULL,
    DisconnectTime TEXT    NOT NULL,
    Data           TEXT    NOT NULL,
    UNIQUE (DID, Phone, ConnectTime)
)"#;

const DROP_STAGING: &str = "DROP TABLE IF EXISTS temp.cdr_staging";

const CREATE_STAGING: &str = r#"
CREATE TEMP TABLE cdr_staging (
    seq            INTEGER PRIMARY KEY,
    Trunk          TEXT    NOT NULL,
    Country        TEXT    NOT NULL,
    DID            TEXT    NOT NULL,
    Phone          TEXT    NOT NULL,
    Duration       INTEGER NOT NULL,
    ConnectTime    TEXT    NOT NULL,
    DisconnectTime TEXT    NOT NULL,
    Data           TEXT    NOT NULL
)"#;

const INDEX_STAGING: &str =
    "CREATE INDEX temp.cdr_staging_key ON cdr_staging (DID, Phone, ConnectTime, seq)";

const INSERT_STAGING: &str = r#"
INSERT INTO cdr_staging (seq, Trunk, Country, DID, Phone, Duration, ConnectTime, DisconnectTime, Data)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#;

// Last staged row per natural key wins. The WHERE clause also keeps SQLite's
// parser from reading ON CONFLICT as a join constraint.
const MERGE: &str = r#"
INSERT INTO CDR (Trunk, Country, DID, Phone, Duration, ConnectTime, DisconnectTime, Data)
SELECT s.Trunk, s.Country, s.DID, s.Phone, s.Duration, s.ConnectTime, s.DisconnectTime, s.Data
FROM cdr_staging AS s
WHERE s.seq = (
    SELECT MAX(l.seq) FROM cdr_staging AS l
    WHERE l.DID = s.DID AND l.Phone = s.Phone AND l.ConnectTime = s.ConnectTime
)
ON CONFLICT (DID, Phone, ConnectTime) DO UPDATE SET
    Trunk          = excluded.Trunk,
    Country        = excluded.Country,
    Duration       = excluded.Duration,
    DisconnectTime = excluded.DisconnectTime,
    Data           = excluded.Data"#;

/// SQLite-backed [`CdrStore`]. Holds a single-connection pool so every
/// statement of a run goes through the same connection.
#[derive(Debug, Clone)]
pub struct SqliteCdrStore {
    pool: SqlitePool,
}

impl SqliteCdrStore {
    /// Connect to `url` (e.g. `sqlite://cdr.db` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(IngestError::store("connect"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(IngestError::store("connect"))?;
        debug!(url, "connected to CDR store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `CDR` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_CDR)
            .execute(&self.pool)
            .await
            .map_err(IngestError::store("create table"))?;
        Ok(())
    }

    async fn stage_and_merge(
        tx: &mut Transaction<'_, Sqlite>,
        records: &[CanonicalRecord],
    ) -> Result<u64> {
        sqlx::query(DROP_STAGING)
            .execute(&mut **tx)
            .await
            .map_err(IngestError::store("create staging table"))?;
        sqlx::query(CREATE_STAGING)
            .execute(&mut **tx)
            .await
            .map_err(IngestError::store("create staging table"))?;
        sqlx::query(INDEX_STAGING)
            .execute(&mut **tx)
            .await
            .map_err(IngestError::store("create staging table"))?;

        for (seq, rec) in records.iter().enumerate() {
            sqlx::query(INSERT_STAGING)
                .bind(seq as i64)
                .bind(&rec.trunk)
                .bind(&rec.country)
                .bind(&rec.did)
                .bind(&rec.phone)
                .bind(i64::from(rec.duration_seconds))
                .bind(rec.connect_time.format(DB_TIMESTAMP_FORMAT).to_string())
                .bind(rec.disconnect_time.format(DB_TIMESTAMP_FORMAT).to_string())
                .bind(&rec.raw_payload)
                .execute(&mut **tx)
                .await
                .map_err(IngestError::store("stage record"))?;
        }

        let merged = sqlx::query(MERGE)
            .execute(&mut **tx)
            .await
            .map_err(IngestError::store("merge"))?;

        sqlx::query(DROP_STAGING)
            .execute(&mut **tx)
            .await
            .map_err(IngestError::store("drop staging table"))?;

        Ok(merged.rows_affected())
    }
}

impl CdrStore for SqliteCdrStore {
    #[instrument(level = "info", skip_all, fields(records = records.len()))]
    async fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertResult> {
        validate_keys(records)?;

        let start = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(IngestError::store("begin transaction"))?;

        match Self::stage_and_merge(&mut tx, records).await {
            Ok(applied) => {
                tx.commit().await.map_err(IngestError::store("commit"))?;
                info!(staged = records.len(), applied, elapsed = ?start.elapsed(), "batch committed");
                Ok(UpsertResult {
                    staged: records.len(),
                    applied,
                })
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "rollback after failed merge also failed");
                }
                Err(e)
            }
        }
    }
}
