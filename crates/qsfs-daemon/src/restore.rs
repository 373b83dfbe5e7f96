//! Disaster recovery: rebuild the local zdb tree from the remote store.

use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use qsfs_zstor::Client;

/// Namespaces zdbfs provisions on a fresh filesystem.
pub const DEFAULT_NAMESPACES: [&str; 2] = ["zdbfs-meta", "zdbfs-data"];

/// Retrieve the namespace descriptor, every index file and the active
/// data file of each namespace. Older data files are left remote; zdb
/// requests those on demand through the missing-data hook.
pub async fn restore_namespaces(
    client: &Client,
    root: &Path,
    namespaces: &[String],
) -> anyhow::Result<()> {
    for namespace in namespaces {
        restore_namespace(client, root, namespace)
            .await
            .with_context(|| format!("restore of namespace {} failed", namespace))?;
    }
    Ok(())
}

async fn restore_namespace(client: &Client, root: &Path, namespace: &str) -> anyhow::Result<()> {
    let index_dir = root.join("index").join(namespace);
    let data_dir = root.join("data").join(namespace);
    tokio::fs::create_dir_all(&index_dir).await?;
    tokio::fs::create_dir_all(&data_dir).await?;

    let descriptor = index_dir.join(qsfs_zdb::NAMESPACE_DESCRIPTOR);
    match client.retrieve(&descriptor).await {
        Ok(()) => info!(namespace, "Recovered namespace descriptor"),
        Err(e) if e.is_not_found() => {
            info!(namespace, "No namespace descriptor stored, continuing")
        }
        Err(e) => return Err(e).context("namespace descriptor retrieve failed"),
    }

    for num in 0u64.. {
        let file = index_dir.join(format!("i{}", num));
        match client.retrieve(&file).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(namespace, recovered = num, "Finished recovering index files");
                break;
            }
            Err(e) => return Err(e).with_context(|| format!("index retrieve failed at i{}", num)),
        }
    }

    match qsfs_zdb::last_active_index(&index_dir)? {
        Some(num) => {
            let data_file = data_dir.join(format!("d{}", num));
            match client.retrieve(&data_file).await {
                Ok(()) => info!(namespace, path = %data_file.display(), "Recovered active data file"),
                Err(e) if e.is_not_found() => {
                    warn!(namespace, "Active data file is not stored remotely")
                }
                Err(e) => return Err(e).context("active data file retrieve failed"),
            }
        }
        None => info!(namespace, "No index files recovered, skipping data file"),
    }

    Ok(())
}
