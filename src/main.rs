use anyhow::{Context, Result};
use cdrsync::{
    config::{self, Config, RemoteKind},
    fetch::{LocalDirStore, RemoteStore, SftpStore},
    history::RunHistory,
    pipeline::{Pipeline, PipelineSettings},
    process::RowTransformer,
    store::SqliteCdrStore,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) load config ──────────────────────────────────────────────
    let config = config::load().context("loading configuration")?;

    // ─── 2) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!(remote_dir = %config.remote.dir, kind = ?config.remote.kind, "startup");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 3) pick the remote and run ──────────────────────────────────
    let ok = match config.remote.kind {
        RemoteKind::Sftp => run_with(SftpStore::new(config.remote.sftp.clone()), &config).await?,
        RemoteKind::Local => {
            let root = config
                .remote
                .local_root
                .clone()
                .context("remote.local_root is required for kind: local")?;
            run_with(LocalDirStore::new(root), &config).await?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    info!("all done");
    Ok(())
}

/// Open the store and history, then drive one run. `Ok(false)` means the
/// run itself failed and has already been logged.
async fn run_with<R: RemoteStore>(remote: R, config: &Config) -> Result<bool> {
    let store = SqliteCdrStore::connect(&config.database.url)
        .await
        .with_context(|| format!("connecting to {}", config.database.url))?;
    if config.database.create_table {
        store.ensure_schema().await.context("creating CDR table")?;
    }

    let transformer = RowTransformer::new(config.columns.clone(), config.timestamp_formats.clone());
    let mut pipeline = Pipeline::new(
        remote,
        store,
        transformer,
        PipelineSettings::from_config(config),
    );

    if config.history.enabled {
        match RunHistory::new_processed(&config.history.dir) {
            Ok(history) => pipeline = pipeline.with_history(history),
            Err(e) => warn!(dir = %config.history.dir.display(), error = %e, "run history disabled"),
        }
    }

    match pipeline.run().await {
        Ok(summary) => {
            info!(
                file = %summary.remote_name,
                rows = summary.rows_read,
                applied = summary.rows_applied,
                elapsed = ?summary.elapsed,
                "ingested"
            );
            Ok(true)
        }
        Err(failure) => {
            error!(stage = %failure.stage, error = %failure.error, "ingest failed");
            Ok(false)
        }
    }
}
