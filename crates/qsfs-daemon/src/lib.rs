//! Supervisory daemon for a quantum storage filesystem node.
//!
//! Sits between a running zdb and the zstor uploader: listens for zdb
//! lifecycle hooks on a unix socket, uploads rotated data and index
//! files through the uploader binary, retrieves files zdb finds
//! missing, and re-uploads anything the remote store does not know
//! about yet. All state lives in a single reconciliation loop fed by
//! bounded channels.

pub mod event;
pub mod health;
pub mod hook;
pub mod metrics;
pub mod reconciler;
pub mod restore;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use prometheus::Registry;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use qsfs_config::Config;
use qsfs_zstor::{correlate_metadata, Client, Metadata, MetricsScraper, ZstorError};

use crate::event::{Event, EVENT_QUEUE_DEPTH};
use crate::metrics::DaemonMetrics;
use crate::reconciler::Reconciler;

pub use crate::hook::HOOK_SOCKET_PATH;
pub use crate::restore::{restore_namespaces, DEFAULT_NAMESPACES};

const SCRAPE_INTERVAL: Duration = Duration::from_secs(30);
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Enumerate eligible files and correlate them against everything the
/// uploader knows, yielding a fresh metadata store snapshot.
pub async fn refresh_metadata(
    client: &Client,
    root: &Path,
) -> Result<HashMap<PathBuf, Metadata>, ZstorError> {
    let eligible = qsfs_zdb::eligible_files(root)?;
    let remote = client.get_all_metadata().await?;
    Ok(correlate_metadata(&eligible, remote))
}

/// Run the daemon until ctrl-c, listening on the fixed hook socket path.
pub async fn run_daemon(config: Config) -> Result<()> {
    run_daemon_on_socket(config, PathBuf::from(HOOK_SOCKET_PATH)).await
}

pub async fn run_daemon_on_socket(config: Config, socket_path: PathBuf) -> Result<()> {
    info!(root = %config.zdb_root_path.display(), "Starting qsfs daemon");

    let client = Arc::new(
        Client::new(
            config.zstor_binary_path.clone(),
            config.zstor_config_path.clone(),
            config.zstor_decoder_path.clone(),
        )
        .context("uploader client setup failed")?,
    );

    let registry = Registry::new();
    let daemon_metrics =
        DaemonMetrics::register(&registry).context("gauge registration failed")?;
    let scraper = MetricsScraper::new(config.zstor_config_path.clone(), &registry)
        .context("scraper setup failed")?;

    // The loop must never start on an empty view of the remote store, or
    // the first retry cycle would re-upload every file on disk.
    let initial = refresh_metadata(&client, &config.zdb_root_path)
        .await
        .context("metadata bootstrap failed")?;
    info!(files = initial.len(), "Metadata bootstrap complete");

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let listener = hook::bind_socket(&socket_path)
        .with_context(|| format!("could not bind hook socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "Listening for zdb hooks");
    let listener_handle = tokio::spawn(hook::run_listener(listener, events_tx.clone()));

    let retry_tx = events_tx.clone();
    let retry_interval = config.retry_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(retry_interval);
        loop {
            ticker.tick().await;
            if retry_tx.send(Event::RetryTick).await.is_err() {
                return;
            }
        }
    });

    let scrape_tx = events_tx.clone();
    tokio::spawn(async move {
        let mut scraper = scraper;
        let mut ticker = tokio::time::interval(SCRAPE_INTERVAL);
        loop {
            ticker.tick().await;
            match scraper.scrape().await {
                Ok(()) => {
                    if scrape_tx
                        .send(Event::BackendSnapshot(scraper.snapshot()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Backend metrics scrape failed"),
            }
        }
    });

    let refresh_tx = events_tx.clone();
    let refresh_client = client.clone();
    let refresh_root = config.zdb_root_path.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REFRESH_INTERVAL).await;
            match refresh_metadata(&refresh_client, &refresh_root).await {
                Ok(store) => {
                    if refresh_tx.send(Event::MetadataRefresh(store)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Metadata refresh failed, keeping previous snapshot")
                }
            }
        }
    });

    tokio::spawn(metrics::serve_metrics(
        registry.clone(),
        config.prometheus_port,
    ));

    let reconciler = Reconciler::new(
        config.zdb_root_path.clone(),
        client,
        events_tx.clone(),
        initial,
        daemon_metrics,
    );
    let mut loop_handle = tokio::spawn(reconciler.run(events_rx));

    tokio::select! {
        _ = &mut loop_handle => {
            bail!("reconciliation loop exited unexpectedly");
        }
        _ = listener_handle => {
            bail!("hook listener exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = events_tx.send(Event::Shutdown).await;
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut loop_handle)
        .await
        .is_err()
    {
        error!("Reconciliation loop did not stop in time");
    }
    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use qsfs_zstor::hash::path_hash;

    #[tokio::test]
    async fn test_refresh_metadata_correlates_by_path_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("zdb");
        let data_dir = root.join("data/zdbfs-data");
        let index_dir = root.join("index/zdbfs-data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(&index_dir).unwrap();
        fs::write(data_dir.join("d0"), b"old").unwrap();
        fs::write(data_dir.join("d1"), b"active").unwrap();

        let stored = data_dir.join("d0");
        let key = path_hash(&stored.display().to_string());

        let binary = dir.path().join("zstor");
        fs::write(&binary, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        let config = dir.path().join("zstor.toml");
        fs::write(&config, "").unwrap();
        let decoder = dir.path().join("decoder");
        fs::write(
            &decoder,
            format!("#!/bin/sh\necho '{{\"{}\": {{\"data_shards\": 2}}}}'\n", key),
        )
        .unwrap();
        fs::set_permissions(&decoder, fs::Permissions::from_mode(0o755)).unwrap();

        let client = Client::new(binary, config, decoder).unwrap();
        let store = refresh_metadata(&client, &root).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&stored).unwrap().data_shards, 2);
    }
}
