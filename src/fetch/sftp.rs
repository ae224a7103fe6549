use ssh2::{Session, Sftp};
use std::{
    fs::File,
    io::{self, ErrorKind},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
};
use tokio::task;
use tracing::{debug, instrument};

use super::{RemoteEntry, RemoteStore};
use crate::config::SftpConfig;
use crate::error::{IngestError, Result};

/// SFTP-backed [`RemoteStore`]. Each call opens its own SSH session and
/// closes it before returning; nothing is held between pipeline stages.
#[derive(Debug, Clone)]
pub struct SftpStore {
    config: SftpConfig,
}

impl SftpStore {
    pub fn new(config: SftpConfig) -> Self {
        SftpStore { config }
    }

    /// Run `f` against a fresh SFTP session on the blocking pool.
    async fn with_session<T, F>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> io::Result<T> + Send + 'static,
    {
        let config = self.config.clone();
        let joined = task::spawn_blocking(move || {
            let (session, sftp) = open_session(&config)?;
            let out = f(&sftp);
            drop(sftp);
            let _ = session.disconnect(None, "done", None);
            out
        })
        .await;

        match joined {
            Ok(out) => out.map_err(|e| IngestError::transfer(op, path, e)),
            Err(e) => Err(IngestError::transfer(op, path, io::Error::other(e))),
        }
    }
}

fn open_session(cfg: &SftpConfig) -> io::Result<(Session, Sftp)> {
    let addr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("cannot resolve {}", cfg.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, cfg.timeout())?;

    let mut session = Session::new()?;
    session.set_timeout(cfg.timeout().as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake()?;

    match (&cfg.private_key, &cfg.password) {
        (Some(key), _) => {
            session.userauth_pubkey_file(&cfg.username, None, key, cfg.passphrase.as_deref())?
        }
        (None, Some(password)) => session.userauth_password(&cfg.username, password)?,
        (None, None) => session.userauth_agent(&cfg.username)?,
    }
    if !session.authenticated() {
        return Err(io::Error::new(
            ErrorKind::PermissionDenied,
            format!("authentication rejected for user {}", cfg.username),
        ));
    }

    let sftp = session.sftp()?;
    debug!(host = %cfg.host, port = cfg.port, "sftp session opened");
    Ok((session, sftp))
}

fn mkdir_all(sftp: &Sftp, dir: &str) -> io::Result<()> {
    let mut current = if dir.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        current.push(part);
        match sftp.stat(&current) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", current.display()),
                ))
            }
            Err(_) => sftp.mkdir(&current, 0o755)?,
        }
    }
    Ok(())
}

fn copy_file(sftp: &Sftp, src: &str, dst: &str) -> io::Result<u64> {
    let mut reader = sftp.open(Path::new(src))?;
    let mut writer = sftp.create(Path::new(dst))?;
    io::copy(&mut reader, &mut writer)
}

impl RemoteStore for SftpStore {
    #[instrument(level = "debug", skip(self))]
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let d = dir.to_string();
        self.with_session("list", dir, move |sftp| {
            let entries = sftp
                .readdir(Path::new(&d))?
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().to_string();
                    Some(RemoteEntry {
                        name,
                        size: stat.size,
                        is_dir: stat.is_dir(),
                    })
                })
                .collect();
            Ok(entries)
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let (r, l) = (remote.to_string(), local.to_path_buf());
        self.with_session("download", remote, move |sftp| {
            let mut reader = sftp.open(Path::new(&r))?;
            let mut file = File::create(&l)?;
            let n = io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            Ok(n)
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn ensure_dir(&self, dir: &str) -> Result<()> {
        let d = dir.to_string();
        self.with_session("mkdir", dir, move |sftp| mkdir_all(sftp, &d))
            .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let (s, d) = (src.to_string(), dst.to_string());
        self.with_session("copy", src, move |sftp| copy_file(sftp, &s, &d).map(|_| ()))
            .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.with_session("delete", path, move |sftp| sftp.unlink(Path::new(&p)).map_err(Into::into))
            .await
    }

    /// One session for the whole move.
    #[instrument(level = "debug", skip(self))]
    async fn archive(&self, src: &str, dst_dir: &str, dst: &str) -> Result<()> {
        let (s, dd, d) = (src.to_string(), dst_dir.to_string(), dst.to_string());
        self.with_session("archive", src, move |sftp| {
            mkdir_all(sftp, &dd)?;
            copy_file(sftp, &s, &d)?;
            sftp.unlink(Path::new(&s))?;
            Ok(())
        })
        .await
    }
}
