// src/fetch/mod.rs
//! Remote file store: the endpoint the CDR export is picked up from and
//! archived on.

use std::path::Path;

use crate::error::Result;

pub mod local;
pub mod sftp;

pub use local::LocalDirStore;
pub use sftp::SftpStore;

/// One directory entry as reported by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// Operations the pipeline needs from a remote filesystem. Paths are
/// `/`-separated remote paths. Every failure is an `IngestError::Transfer`.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Entries of `dir`, in whatever order the endpoint returns them.
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Copy `remote` to the local file `local`, returning the byte count.
    async fn download(&self, remote: &str, local: &Path) -> Result<u64>;

    /// Create `dir` and any missing parents; no-op if it exists.
    async fn ensure_dir(&self, dir: &str) -> Result<()>;

    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Move `src` to `dst` inside `dst_dir`: ensure the directory, copy, then
    /// delete the source. A failed delete leaves the copy in place.
    async fn archive(&self, src: &str, dst_dir: &str, dst: &str) -> Result<()> {
        self.ensure_dir(dst_dir).await?;
        self.copy(src, dst).await?;
        self.delete(src).await
    }
}

/// Join a remote directory and a file name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    match (dir.is_empty(), dir.ends_with('/')) {
        (true, _) => name.to_string(),
        (false, true) => format!("{}{}", dir, name.trim_start_matches('/')),
        (false, false) => format!("{}/{}", dir, name.trim_start_matches('/')),
    }
}
