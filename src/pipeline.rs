// src/pipeline.rs
//! One ingest run: discover a remote export, stage it locally, transform its
//! rows, merge them into the store and archive the remote file.

use chrono::Utc;
use std::{
    cell::{Cell, RefCell},
    ffi::OsString,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{fs, task};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::fetch::{join_remote, RemoteStore};
use crate::history::{ProcessedRow, RunHistory};
use crate::model::CanonicalRecord;
use crate::process::{self, RowTransformer};
use crate::store::CdrStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Discovering,
    Downloading,
    Transforming,
    Upserting,
    Archiving,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Discovering => "discovering",
            Stage::Downloading => "downloading",
            Stage::Transforming => "transforming",
            Stage::Upserting => "upserting",
            Stage::Archiving => "archiving",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The file picked at discovery and every path derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub remote_name: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub processed_dir: String,
    pub processed_path: String,
}

impl PendingFile {
    /// In-flight download target next to `local_path`.
    pub fn partial_path(&self) -> PathBuf {
        let mut os: OsString = self.local_path.clone().into_os_string();
        os.push(".part");
        PathBuf::from(os)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub remote_name: String,
    pub remote_path: String,
    pub rows_read: u64,
    pub rows_applied: u64,
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
#[error("run failed while {stage}: {error}")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    pub error: IngestError,
}

/// Paths and switches a run needs, lifted out of [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub remote_dir: String,
    pub processed_dir: String,
    pub extension: String,
    pub staging_dir: PathBuf,
    pub keep_staged: bool,
    pub timeout: Option<Duration>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            remote_dir: config.remote.dir.clone(),
            processed_dir: config.remote.processed_dir(),
            extension: config.remote.extension.clone(),
            staging_dir: config.staging.dir.clone(),
            keep_staged: config.staging.keep_files,
            timeout: config.run.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Mutable bits of a run shared between `run` and the stage driver.
struct RunState {
    stage: Cell<Stage>,
    pending: RefCell<Option<PendingFile>>,
    expired: Cell<Option<Duration>>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            stage: Cell::new(Stage::Idle),
            pending: RefCell::new(None),
            expired: Cell::new(None),
        }
    }

    /// Move to `next`, unless the deadline passed while the previous stage ran.
    fn enter(&self, next: Stage, remote: &str) -> Result<()> {
        if let Some(limit) = self.expired.get() {
            return Err(IngestError::Deadline { limit });
        }
        let prev = self.stage.replace(next);
        info!(from = %prev, to = %next, remote, "stage transition");
        Ok(())
    }
}

pub struct Pipeline<R, S> {
    remote: R,
    store: S,
    transformer: RowTransformer,
    settings: PipelineSettings,
    history: Option<RunHistory>,
}

impl<R: RemoteStore, S: CdrStore> Pipeline<R, S> {
    pub fn new(remote: R, store: S, transformer: RowTransformer, settings: PipelineSettings) -> Self {
        Pipeline {
            remote,
            store,
            transformer,
            settings,
            history: None,
        }
    }

    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn history(&self) -> Option<&RunHistory> {
        self.history.as_ref()
    }

    /// Drive one file from discovery to archive. Every failure ends the run.
    pub async fn run(&self) -> std::result::Result<RunSummary, RunFailure> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let state = RunState::new();

        let stages = self.run_stages(&state, clock);
        tokio::pin!(stages);
        let outcome = match self.settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, stages.as_mut()).await {
                Ok(res) => res,
                Err(_) => {
                    // blocking transfers cannot be aborted: let the running stage
                    // settle, then stop at the next transition
                    warn!(
                        stage = %state.stage.get(),
                        ?limit,
                        "run deadline expired, waiting for stage to settle"
                    );
                    state.expired.set(Some(limit));
                    stages.await
                }
            },
            None => stages.await,
        };

        let pending = state.pending.borrow_mut().take();
        if let Some(pending) = pending {
            self.cleanup(&pending).await;
        }

        match outcome {
            Ok(summary) => {
                self.record_history(&summary, started_at);
                Ok(summary)
            }
            Err(error) => {
                let stage = state.stage.replace(Stage::Failed);
                error!(%stage, kind = error.kind(), error = %error, "run failed");
                Err(RunFailure { stage, error })
            }
        }
    }

    async fn run_stages(&self, state: &RunState, clock: Instant) -> Result<RunSummary> {
        state.enter(Stage::Discovering, &self.settings.remote_dir)?;
        let pending = self.discover().await?;
        *state.pending.borrow_mut() = Some(pending.clone());

        state.enter(Stage::Downloading, &pending.remote_path)?;
        let bytes = self.download(&pending).await?;

        state.enter(Stage::Transforming, &pending.remote_path)?;
        let (records, rows_read) = self.transform(&pending).await?;

        state.enter(Stage::Upserting, &pending.remote_path)?;
        let result = self.store.upsert(&records).await?;

        state.enter(Stage::Archiving, &pending.remote_path)?;
        self.remote
            .archive(
                &pending.remote_path,
                &pending.processed_dir,
                &pending.processed_path,
            )
            .await?;

        // the archive has already moved the file, so a late deadline no longer fails the run
        let prev = state.stage.replace(Stage::Done);
        info!(from = %prev, to = %Stage::Done, remote = %pending.processed_path, "stage transition");
        let summary = RunSummary {
            remote_name: pending.remote_name.clone(),
            remote_path: pending.remote_path.clone(),
            rows_read,
            rows_applied: result.applied,
            bytes_downloaded: bytes,
            elapsed: clock.elapsed(),
        };
        info!(
            file = %summary.remote_name,
            rows_read,
            staged = result.staged,
            applied = result.applied,
            bytes,
            elapsed = ?summary.elapsed,
            "run complete"
        );
        Ok(summary)
    }

    /// First non-directory entry whose name ends in the extension.
    #[instrument(level = "debug", skip(self), fields(dir = %self.settings.remote_dir))]
    async fn discover(&self) -> Result<PendingFile> {
        let s = &self.settings;
        let entries = self.remote.list(&s.remote_dir).await?;
        debug!(entries = entries.len(), "listed remote directory");

        let entry = entries
            .into_iter()
            .find(|e| !e.is_dir && e.name.ends_with(&s.extension))
            .ok_or_else(|| IngestError::NotFound {
                dir: s.remote_dir.clone(),
                extension: s.extension.clone(),
            })?;

        Ok(PendingFile {
            remote_path: join_remote(&s.remote_dir, &entry.name),
            local_path: s.staging_dir.join(&entry.name),
            processed_dir: s.processed_dir.clone(),
            processed_path: join_remote(&s.processed_dir, &entry.name),
            remote_name: entry.name,
        })
    }

    /// Fetch into `<name>.part`, then rename into place.
    #[instrument(level = "debug", skip_all, fields(remote = %pending.remote_path))]
    async fn download(&self, pending: &PendingFile) -> Result<u64> {
        fs::create_dir_all(&self.settings.staging_dir)
            .await
            .map_err(IngestError::staging(&self.settings.staging_dir))?;

        let part = pending.partial_path();
        let bytes = match self.remote.download(&pending.remote_path, &part).await {
            Ok(n) => n,
            Err(e) => {
                remove_if_exists(&part).await;
                return Err(e);
            }
        };
        fs::rename(&part, &pending.local_path)
            .await
            .map_err(IngestError::staging(&pending.local_path))?;
        debug!(bytes, local = %pending.local_path.display(), "staged");
        Ok(bytes)
    }

    #[instrument(level = "debug", skip_all, fields(local = %pending.local_path.display()))]
    async fn transform(&self, pending: &PendingFile) -> Result<(Vec<CanonicalRecord>, u64)> {
        let path = pending.local_path.clone();
        let transformer = self.transformer.clone();
        let joined = task::spawn_blocking(move || -> Result<(Vec<CanonicalRecord>, u64)> {
            let mut records = Vec::new();
            let mut rows = 0u64;
            for row in process::open_rows(&path)? {
                let row = row?;
                rows += 1;
                records.push(transformer.transform(&row)?);
            }
            Ok((records, rows))
        })
        .await;

        match joined {
            Ok(res) => res,
            Err(e) => Err(IngestError::Staging {
                path: pending.local_path.clone(),
                source: std::io::Error::other(e),
            }),
        }
    }

    async fn cleanup(&self, pending: &PendingFile) {
        remove_if_exists(&pending.partial_path()).await;
        if !self.settings.keep_staged {
            remove_if_exists(&pending.local_path).await;
        }
    }

    fn record_history(&self, summary: &RunSummary, started_at: chrono::DateTime<Utc>) {
        let Some(history) = &self.history else {
            return;
        };
        let row = ProcessedRow {
            filename: summary.remote_name.clone(),
            remote_path: summary.remote_path.clone(),
            rows_read: summary.rows_read,
            rows_applied: summary.rows_applied,
            size_bytes: summary.bytes_downloaded,
            processing_start: started_at,
            processing_end: Utc::now(),
        };
        if let Err(e) = history.add(&row) {
            warn!(file = %row.filename, error = %e, "could not record run history");
        }
    }
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed staged file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove staged file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{LocalDirStore, RemoteEntry};
    use crate::store::{SqliteCdrStore, UpsertResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    const CSV: &str = "Caller,Country,CLI,CLD,Billing Prefix,\"Duration, sec\",Connect Time,Disconnect Time\n\
trunk1,AR,1111,2222,onnet_in,120,2023-04-01 10:00:00,2023-04-01 10:02:00\n\
trunk2,UY,3333,4444,offnet,45,2023-04-01 11:00:00,2023-04-01 11:00:45\n";

    /// Local store that counts calls and can be told to fail or stall.
    struct RecordingRemote {
        inner: LocalDirStore,
        fail_download: bool,
        fail_delete: bool,
        list_delay: Option<Duration>,
        /// Blocking-pool stall before the download writes, like an SFTP transfer.
        download_delay: Option<Duration>,
        delete_delay: Option<Duration>,
        downloads: AtomicUsize,
        ensure_dirs: AtomicUsize,
        copies: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl RecordingRemote {
        fn new(root: &Path) -> Self {
            RecordingRemote {
                inner: LocalDirStore::new(root),
                fail_download: false,
                fail_delete: false,
                list_delay: None,
                download_delay: None,
                delete_delay: None,
                downloads: AtomicUsize::new(0),
                ensure_dirs: AtomicUsize::new(0),
                copies: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }

        fn archive_calls(&self) -> usize {
            self.ensure_dirs.load(Ordering::SeqCst)
                + self.copies.load(Ordering::SeqCst)
                + self.deletes.load(Ordering::SeqCst)
        }
    }

    impl RemoteStore for RecordingRemote {
        async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
            if let Some(d) = self.list_delay {
                tokio::time::sleep(d).await;
            }
            self.inner.list(dir).await
        }

        async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_download {
                std::fs::write(local, b"Caller,Cou").unwrap();
                return Err(IngestError::transfer(
                    "download",
                    remote,
                    std::io::Error::new(ErrorKind::ConnectionReset, "connection reset"),
                ));
            }
            if let Some(d) = self.download_delay {
                let src = self.inner.resolve(remote).unwrap();
                let dst = local.to_path_buf();
                return task::spawn_blocking(move || {
                    std::thread::sleep(d);
                    std::fs::copy(src, dst)
                })
                .await
                .unwrap()
                .map_err(|e| IngestError::transfer("download", remote, e));
            }
            self.inner.download(remote, local).await
        }

        async fn ensure_dir(&self, dir: &str) -> Result<()> {
            self.ensure_dirs.fetch_add(1, Ordering::SeqCst);
            self.inner.ensure_dir(dir).await
        }

        async fn copy(&self, src: &str, dst: &str) -> Result<()> {
            self.copies.fetch_add(1, Ordering::SeqCst);
            self.inner.copy(src, dst).await
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                return Err(IngestError::transfer(
                    "delete",
                    path,
                    std::io::Error::new(ErrorKind::PermissionDenied, "permission denied"),
                ));
            }
            if let Some(d) = self.delete_delay {
                let target = self.inner.resolve(path).unwrap();
                return task::spawn_blocking(move || {
                    std::thread::sleep(d);
                    std::fs::remove_file(target)
                })
                .await
                .unwrap()
                .map_err(|e| IngestError::transfer("delete", path, e));
            }
            self.inner.delete(path).await
        }
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    impl CdrStore for FailingStore {
        async fn upsert(&self, _records: &[CanonicalRecord]) -> Result<UpsertResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Store {
                context: "commit",
                source: sqlx::Error::PoolClosed,
            })
        }
    }

    struct Fixture {
        _tmp: TempDir,
        remote_root: PathBuf,
        staging: PathBuf,
        history: PathBuf,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let tmp = tempdir().unwrap();
        let remote_root = tmp.path().join("remote");
        std::fs::create_dir_all(remote_root.join("Data")).unwrap();
        for (name, body) in files {
            std::fs::write(remote_root.join("Data").join(name), body).unwrap();
        }
        Fixture {
            remote_root,
            staging: tmp.path().join("staging"),
            history: tmp.path().join("history"),
            _tmp: tmp,
        }
    }

    fn settings(f: &Fixture) -> PipelineSettings {
        PipelineSettings {
            remote_dir: "/Data/".into(),
            processed_dir: "/Data/processed".into(),
            extension: ".csv".into(),
            staging_dir: f.staging.clone(),
            keep_staged: false,
            timeout: None,
        }
    }

    async fn memory_store() -> SqliteCdrStore {
        let store = SqliteCdrStore::connect("sqlite::memory:").await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn staged_files(f: &Fixture) -> Vec<String> {
        match std::fs::read_dir(&f.staging) {
            Ok(rd) => rd
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn end_to_end_two_rows() {
        let f = fixture(&[("cdr_0401.csv", CSV), ("notes.txt", "skip me")]);
        let pipeline = Pipeline::new(
            RecordingRemote::new(&f.remote_root),
            memory_store().await,
            RowTransformer::default(),
            settings(&f),
        )
        .with_history(RunHistory::new_processed(&f.history).unwrap());

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.remote_name, "cdr_0401.csv");
        assert_eq!(summary.remote_path, "/Data/cdr_0401.csv");
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.rows_applied, 2);
        assert_eq!(summary.bytes_downloaded, CSV.len() as u64);

        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT Trunk, DID, Phone, Duration FROM CDR ORDER BY Duration DESC",
        )
        .fetch_all(pipeline.store().pool())
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![
                ("trunk1".into(), "2222".into(), "1111".into(), 120),
                ("trunk2".into(), "3333".into(), "4444".into(), 45),
            ]
        );

        // archived, not duplicated
        assert!(!f.remote_root.join("Data/cdr_0401.csv").exists());
        assert!(f.remote_root.join("Data/processed/cdr_0401.csv").exists());
        assert!(f.remote_root.join("Data/notes.txt").exists());

        // staged copy removed
        assert!(staged_files(&f).is_empty());

        let recorded: usize = pipeline
            .history()
            .unwrap()
            .read_all()
            .unwrap()
            .iter()
            .map(|b| b.num_rows())
            .sum();
        assert_eq!(recorded, 1);
    }

    #[tokio::test]
    async fn no_matching_file_is_not_found() {
        let f = fixture(&[("notes.txt", "nothing to see")]);
        std::fs::create_dir_all(f.remote_root.join("Data/archive.csv")).unwrap();
        let pipeline = Pipeline::new(
            RecordingRemote::new(&f.remote_root),
            FailingStore {
                calls: AtomicUsize::new(0),
            },
            RowTransformer::default(),
            settings(&f),
        );

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Discovering);
        assert!(matches!(failure.error, IngestError::NotFound { .. }));
        assert_eq!(pipeline.remote().downloads.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.store().calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.remote().archive_calls(), 0);
    }

    #[tokio::test]
    async fn store_failure_never_archives() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let pipeline = Pipeline::new(
            RecordingRemote::new(&f.remote_root),
            FailingStore {
                calls: AtomicUsize::new(0),
            },
            RowTransformer::default(),
            settings(&f),
        );

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Upserting);
        assert_eq!(failure.error.kind(), "store");
        assert_eq!(pipeline.store().calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.remote().archive_calls(), 0);
        assert!(f.remote_root.join("Data/cdr.csv").exists());
        assert!(staged_files(&f).is_empty());
    }

    #[tokio::test]
    async fn download_failure_leaves_no_partial_file() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut remote = RecordingRemote::new(&f.remote_root);
        remote.fail_download = true;
        let pipeline = Pipeline::new(
            remote,
            memory_store().await,
            RowTransformer::default(),
            settings(&f),
        );

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Downloading);
        assert!(matches!(
            failure.error,
            IngestError::Transfer { op: "download", .. }
        ));
        assert!(staged_files(&f).is_empty());
        assert!(f.remote_root.join("Data/cdr.csv").exists());
    }

    #[tokio::test]
    async fn bad_row_fails_transform_and_keeps_remote_file() {
        let bad = "Caller,Country,CLI,CLD,Billing Prefix,\"Duration, sec\",Connect Time,Disconnect Time\n\
trunk1,AR,1111,2222,onnet_in,-3,2023-04-01 10:00:00,2023-04-01 10:02:00\n";
        let f = fixture(&[("cdr.csv", bad)]);
        let pipeline = Pipeline::new(
            RecordingRemote::new(&f.remote_root),
            memory_store().await,
            RowTransformer::default(),
            settings(&f),
        );

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Transforming);
        assert_eq!(failure.error.kind(), "validation");
        assert_eq!(pipeline.remote().archive_calls(), 0);
        assert!(f.remote_root.join("Data/cdr.csv").exists());
    }

    #[tokio::test]
    async fn keep_staged_leaves_local_copy() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut s = settings(&f);
        s.keep_staged = true;
        let pipeline = Pipeline::new(
            RecordingRemote::new(&f.remote_root),
            memory_store().await,
            RowTransformer::default(),
            s,
        );

        pipeline.run().await.unwrap();
        assert_eq!(staged_files(&f), vec!["cdr.csv".to_string()]);
    }

    #[tokio::test]
    async fn deadline_is_attributed_to_running_stage() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut remote = RecordingRemote::new(&f.remote_root);
        remote.list_delay = Some(Duration::from_millis(300));
        let mut s = settings(&f);
        s.timeout = Some(Duration::from_millis(50));
        let pipeline = Pipeline::new(remote, memory_store().await, RowTransformer::default(), s);

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Discovering);
        assert!(matches!(
            failure.error,
            IngestError::Deadline { limit } if limit == Duration::from_millis(50)
        ));
        assert!(failure.to_string().contains("50ms"), "{failure}");
        assert_eq!(pipeline.remote().downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deadline_during_download_waits_and_leaves_no_staged_files() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut remote = RecordingRemote::new(&f.remote_root);
        remote.download_delay = Some(Duration::from_millis(300));
        let mut s = settings(&f);
        s.timeout = Some(Duration::from_millis(100));
        let pipeline = Pipeline::new(remote, memory_store().await, RowTransformer::default(), s);

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Downloading);
        assert!(matches!(failure.error, IngestError::Deadline { .. }));

        // the blocking copy has finished by now; nothing may appear afterwards
        assert!(staged_files(&f).is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(staged_files(&f).is_empty());

        assert!(f.remote_root.join("Data/cdr.csv").exists());
        assert_eq!(pipeline.remote().archive_calls(), 0);
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM CDR")
            .fetch_one(pipeline.store().pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn deadline_during_archive_reports_the_finished_move() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut remote = RecordingRemote::new(&f.remote_root);
        remote.delete_delay = Some(Duration::from_millis(800));
        let mut s = settings(&f);
        s.timeout = Some(Duration::from_millis(300));
        let pipeline = Pipeline::new(remote, memory_store().await, RowTransformer::default(), s);

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.rows_applied, 2);
        assert!(summary.elapsed >= Duration::from_millis(300));
        assert!(!f.remote_root.join("Data/cdr.csv").exists());
        assert!(f.remote_root.join("Data/processed/cdr.csv").exists());
        assert!(staged_files(&f).is_empty());
    }

    #[tokio::test]
    async fn failed_delete_leaves_file_in_both_places() {
        let f = fixture(&[("cdr.csv", CSV)]);
        let mut remote = RecordingRemote::new(&f.remote_root);
        remote.fail_delete = true;
        let pipeline = Pipeline::new(
            remote,
            memory_store().await,
            RowTransformer::default(),
            settings(&f),
        );

        let failure = pipeline.run().await.unwrap_err();
        assert_eq!(failure.stage, Stage::Archiving);
        assert!(matches!(
            failure.error,
            IngestError::Transfer { op: "delete", .. }
        ));

        // copy is not rolled back
        assert!(f.remote_root.join("Data/cdr.csv").exists());
        assert!(f.remote_root.join("Data/processed/cdr.csv").exists());
        assert_eq!(pipeline.remote().copies.load(Ordering::SeqCst), 1);

        // the upsert committed before archiving began
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM CDR")
            .fetch_one(pipeline.store().pool())
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn partial_path_appends_suffix() {
        let p = PendingFile {
            remote_name: "a.csv".into(),
            remote_path: "/Data/a.csv".into(),
            local_path: PathBuf::from("temp/Data/a.csv"),
            processed_dir: "/Data/processed".into(),
            processed_path: "/Data/processed/a.csv".into(),
        };
        assert_eq!(p.partial_path(), PathBuf::from("temp/Data/a.csv.part"));
    }
}
