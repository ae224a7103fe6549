use std::path::{Component, Path, PathBuf};
use tokio::fs;

use super::{RemoteEntry, RemoteStore};
use crate::error::{IngestError, Result};

/// [`RemoteStore`] over a local directory tree. Remote paths are resolved
/// under `root`, so `/Data/x.csv` maps to `<root>/Data/x.csv`.
///
/// Listings are sorted by name, which makes discovery deterministic here even
/// though the trait does not promise any order.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirStore { root: root.into() }
    }

    /// Map a remote path under `root`, refusing `..` escapes.
    pub fn resolve(&self, remote: &str) -> std::io::Result<PathBuf> {
        let mut out = self.root.clone();
        for comp in Path::new(remote).components() {
            match comp {
                Component::Normal(p) => out.push(p),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("'{remote}' escapes the store root"),
                    ))
                }
            }
        }
        Ok(out)
    }

    fn resolve_for(&self, op: &'static str, remote: &str) -> Result<PathBuf> {
        self.resolve(remote)
            .map_err(|e| IngestError::transfer(op, remote, e))
    }
}

impl RemoteStore for LocalDirStore {
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let path = self.resolve_for("list", dir)?;
        let err = |e: std::io::Error| IngestError::transfer("list", dir, e);

        let mut rd = fs::read_dir(&path).await.map_err(err)?;
        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(err)? {
            let meta = entry.metadata().await.map_err(err)?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                size: meta.is_file().then(|| meta.len()),
                is_dir: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let src = self.resolve_for("download", remote)?;
        fs::copy(&src, local)
            .await
            .map_err(|e| IngestError::transfer("download", remote, e))
    }

    async fn ensure_dir(&self, dir: &str) -> Result<()> {
        let path = self.resolve_for("mkdir", dir)?;
        fs::create_dir_all(&path)
            .await
            .map_err(|e| IngestError::transfer("mkdir", dir, e))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let from = self.resolve_for("copy", src)?;
        let to = self.resolve_for("copy", dst)?;
        fs::copy(&from, &to)
            .await
            .map(|_| ())
            .map_err(|e| IngestError::transfer("copy", src, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let p = self.resolve_for("delete", path)?;
        fs::remove_file(&p)
            .await
            .map_err(|e| IngestError::transfer("delete", path, e))
    }
}
