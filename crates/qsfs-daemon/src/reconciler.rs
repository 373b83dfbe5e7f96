//! Single-writer reconciliation loop.
//!
//! One task owns the pending-upload set, the metadata store and the
//! backend liveness view. Everything else in the daemon talks to it
//! through the event channel, so no state here is ever locked or torn.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use qsfs_zdb::FileKind;
use qsfs_zstor::{BackendStatus, Client, Metadata, ZstorError};

use crate::event::Event;
use crate::health;
use crate::hook::{self, HookEnvelope, HookRequest};
use crate::metrics::DaemonMetrics;

pub struct Reconciler {
    root: PathBuf,
    client: Arc<Client>,
    events_tx: mpsc::Sender<Event>,
    pending: HashSet<PathBuf>,
    store: HashMap<PathBuf, Metadata>,
    backends: HashMap<String, BackendStatus>,
    metrics: DaemonMetrics,
}

impl Reconciler {
    pub fn new(
        root: PathBuf,
        client: Arc<Client>,
        events_tx: mpsc::Sender<Event>,
        initial_store: HashMap<PathBuf, Metadata>,
        metrics: DaemonMetrics,
    ) -> Self {
        let reconciler = Reconciler {
            root,
            client,
            events_tx,
            pending: HashSet::new(),
            store: initial_store,
            backends: HashMap::new(),
            metrics,
        };
        reconciler.recompute_health();
        reconciler
    }

    /// Process events until shutdown. State mutation happens only here,
    /// synchronously, between dequeues.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!(files = self.store.len(), "Reconciliation loop started");
        while let Some(event) = events.recv().await {
            match event {
                Event::Hook(envelope) => self.handle_hook(envelope),
                Event::RetryTick => self.handle_retry(),
                Event::UploadResult { path, result } => self.handle_upload_result(path, result),
                Event::MetadataRefresh(store) => {
                    debug!(files = store.len(), "Applying metadata refresh");
                    self.store = store;
                    self.recompute_health();
                }
                Event::BackendSnapshot(backends) => {
                    self.backends = backends;
                    self.recompute_health();
                }
                Event::Shutdown => break,
            }
        }
        info!("Reconciliation loop stopped");
    }

    fn handle_hook(&mut self, envelope: HookEnvelope) {
        let HookEnvelope { request, reply } = envelope;
        match request {
            HookRequest::Ready => self.spawn_ready_probe(reply),
            HookRequest::MissingData { data_path } => self.spawn_retrieve(data_path, reply),
            HookRequest::Close => self.handle_close(),
            HookRequest::NamespaceUpdated { namespace } => {
                self.handle_namespace_updated(&namespace)
            }
            HookRequest::JumpIndex { index_path, dirty } => {
                self.handle_jump_index(&index_path, &dirty)
            }
            HookRequest::JumpData { data_path } => self.handle_jump_data(data_path),
            HookRequest::Unknown { action } => {
                warn!(action = %action, "Ignoring unknown hook action")
            }
        }
    }

    /// One uploader liveness probe per ready hook; zdb retries the hook
    /// itself until it gets a success reply.
    fn spawn_ready_probe(&self, reply: Option<oneshot::Sender<Result<(), String>>>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client.test().await.map_err(|e| e.to_string());
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }

    /// Fetch a data file zdb found missing on disk. Bypasses the pending
    /// set: retrieves never race uploads for the same path, zdb only asks
    /// for files it is not writing.
    fn spawn_retrieve(&self, path: PathBuf, reply: Option<oneshot::Sender<Result<(), String>>>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            info!(path = %path.display(), "Retrieving missing data file");
            let result = client.retrieve(&path).await.map_err(|e| e.to_string());
            if let Err(reason) = &result {
                warn!(path = %path.display(), error = %reason, "Retrieve failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
    }

    /// zdb is closing: flush the active data and index file of every
    /// namespace so the remote store catches up before the process exits.
    fn handle_close(&mut self) {
        let data_root = self.root.join("data");
        let entries = match std::fs::read_dir(&data_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %data_root.display(), error = %e, "Could not list namespaces");
                return;
            }
        };
        for entry in entries.flatten() {
            if !entry.file_type().map_or(false, |t| t.is_dir()) {
                continue;
            }
            let namespace = entry.file_name();
            let namespace = match namespace.to_str() {
                Some(namespace) => namespace,
                None => continue,
            };
            if namespace == qsfs_zdb::TEMP_NAMESPACE {
                continue;
            }
            let index_dir = self.root.join("index").join(namespace);
            match qsfs_zdb::last_active_index(&index_dir) {
                Ok(Some(num)) => {
                    let data_file = data_root.join(namespace).join(format!("d{}", num));
                    let index_file = index_dir.join(format!("i{}", num));
                    self.admit_upload(data_file, false);
                    self.admit_upload(index_file, true);
                }
                Ok(None) => {
                    debug!(namespace, "No index files yet, nothing to flush")
                }
                Err(e) => {
                    warn!(namespace, error = %e, "Could not find active files")
                }
            }
        }
    }

    fn handle_namespace_updated(&mut self, namespace: &str) {
        if namespace == qsfs_zdb::TEMP_NAMESPACE {
            debug!(namespace, "Skipping temp namespace descriptor");
            return;
        }
        let descriptor = self
            .root
            .join("index")
            .join(namespace)
            .join(qsfs_zdb::NAMESPACE_DESCRIPTOR);
        self.admit_upload(descriptor, true);
    }

    fn handle_jump_index(&mut self, index_path: &Path, dirty: &[u64]) {
        if qsfs_zdb::is_temp(index_path) {
            debug!(path = %index_path.display(), "Skipping temp namespace index");
            return;
        }
        for file in hook::jump_index_files(index_path, dirty) {
            self.admit_upload(file, true);
        }
    }

    fn handle_jump_data(&mut self, data_path: PathBuf) {
        if qsfs_zdb::is_temp(&data_path) {
            debug!(path = %data_path.display(), "Skipping temp namespace data");
            return;
        }
        self.admit_upload(data_path, false);
    }

    /// Admit one upload, deduplicated against uploads already in flight.
    /// The worker stores the file, fetches its fresh metadata and posts
    /// an [`Event::UploadResult`] back to the loop.
    fn admit_upload(&mut self, path: PathBuf, is_index: bool) {
        if self.pending.contains(&path) {
            debug!(path = %path.display(), "Upload already pending, skipping");
            return;
        }
        self.pending.insert(path.clone());
        debug!(path = %path.display(), is_index, "Queueing upload");

        let client = self.client.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let stored = if is_index {
                client.store_index(&path).await
            } else {
                client.store(&path).await
            };
            let result = match stored {
                Ok(()) => client.get_metadata(&path).await,
                Err(e) => Err(e),
            };
            if events.send(Event::UploadResult { path, result }).await.is_err() {
                debug!("Loop closed before upload result delivery");
            }
        });
    }

    fn handle_upload_result(
        &mut self,
        path: PathBuf,
        result: Result<Option<Metadata>, ZstorError>,
    ) {
        self.pending.remove(&path);
        match result {
            Ok(Some(metadata)) => {
                info!(path = %path.display(), "Upload complete");
                self.store.insert(path, metadata);
            }
            Ok(None) => {
                debug!(path = %path.display(), "Upload complete, no metadata recorded")
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Upload failed")
            }
        }
        self.recompute_health();
    }

    /// Sweep eligible files and re-queue any that exist locally but have
    /// no remote metadata. Files already in flight are left alone.
    fn handle_retry(&mut self) {
        debug!("Running retry cycle");
        let eligible = match qsfs_zdb::eligible_files(&self.root) {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(error = %e, "Could not enumerate eligible files");
                return;
            }
        };
        for path in eligible {
            if self.pending.contains(&path) {
                continue;
            }
            if !path.exists() {
                continue;
            }
            if !self.store.contains_key(&path) {
                info!(path = %path.display(), "File has no remote metadata, re-queueing");
                let is_index = matches!(
                    qsfs_zdb::classify(&path).map(|c| c.kind),
                    Some(FileKind::Index(_)) | Some(FileKind::NamespaceDescriptor)
                );
                self.admit_upload(path, is_index);
            }
        }
        self.metrics.last_retry_run_time.set(unix_now());
    }

    fn recompute_health(&self) {
        let tally = health::tally(&self.store, &self.backends);
        self.metrics.healthy_file_configs.set(tally.healthy as f64);
        self.metrics.unhealthy_file_configs.set(tally.unhealthy as f64);
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use prometheus::Registry;
    use tempfile::TempDir;

    use qsfs_zstor::{ConnectionInfo, Shard};

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        log: PathBuf,
        reconciler: Reconciler,
        events_rx: mpsc::Receiver<Event>,
    }

    /// Build a reconciler over a scratch root, with an uploader stub that
    /// appends its argument vector to a log file.
    fn fixture(script_body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("zdb");
        fs::create_dir_all(root.join("index")).unwrap();
        fs::create_dir_all(root.join("data")).unwrap();

        let log = dir.path().join("invocations.log");
        let binary = dir.path().join("zstor");
        let body = format!("#!/bin/sh\necho \"$@\" >> {}\n{}", log.display(), script_body);
        fs::write(&binary, body).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        let config = dir.path().join("zstor.toml");
        fs::write(&config, "").unwrap();
        let decoder = dir.path().join("decoder");
        fs::write(&decoder, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&decoder, fs::Permissions::from_mode(0o755)).unwrap();

        let client = Arc::new(Client::new(binary, config, decoder).unwrap());
        let registry = Registry::new();
        let metrics = DaemonMetrics::register(&registry).unwrap();
        let (events_tx, events_rx) = mpsc::channel(16);
        let reconciler = Reconciler::new(root.clone(), client, events_tx, HashMap::new(), metrics);
        Fixture {
            _dir: dir,
            root,
            log,
            reconciler,
            events_rx,
        }
    }

    fn invocations(log: &Path) -> Vec<String> {
        match fs::read_to_string(log) {
            Ok(content) => content.lines().map(|l| l.to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn seed_namespace(root: &Path, namespace: &str, indexes: &[u64], datas: &[u64]) {
        let index_dir = root.join("index").join(namespace);
        let data_dir = root.join("data").join(namespace);
        fs::create_dir_all(&index_dir).unwrap();
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(index_dir.join("zdb-namespace"), b"ns").unwrap();
        for num in indexes {
            fs::write(index_dir.join(format!("i{}", num)), b"index").unwrap();
        }
        for num in datas {
            fs::write(data_dir.join(format!("d{}", num)), b"data").unwrap();
        }
    }

    #[tokio::test]
    async fn test_admit_upload_dedups_in_flight() {
        let mut f = fixture("sleep 0.3\nexit 0");
        let path = f.root.join("data/zdbfs-data/d7");
        seed_namespace(&f.root, "zdbfs-data", &[7], &[7]);

        f.reconciler.admit_upload(path.clone(), false);
        f.reconciler.admit_upload(path.clone(), false);
        assert_eq!(f.reconciler.pending.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(invocations(&f.log).len(), 1);
    }

    #[tokio::test]
    async fn test_upload_result_clears_pending_and_updates_store() {
        let mut f = fixture("exit 0");
        let path = f.root.join("data/zdbfs-data/d0");
        f.reconciler.pending.insert(path.clone());

        let metadata = Metadata {
            data_shards: 1,
            shards: vec![Shard {
                ci: ConnectionInfo {
                    address: "[::1]:9901".to_string(),
                    namespace: "ns".to_string(),
                    password: String::new(),
                },
                ..Shard::default()
            }],
            ..Metadata::default()
        };
        f.reconciler
            .handle_upload_result(path.clone(), Ok(Some(metadata)));

        assert!(f.reconciler.pending.is_empty());
        assert!(f.reconciler.store.contains_key(&path));
        // No backend is alive, so the sole stored file reads unhealthy.
        assert_eq!(f.reconciler.metrics.unhealthy_file_configs.get(), 1.0);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_store_untouched() {
        let mut f = fixture("exit 0");
        let path = f.root.join("data/zdbfs-data/d0");
        f.reconciler.pending.insert(path.clone());

        f.reconciler.handle_upload_result(
            path.clone(),
            Err(ZstorError::StoreFailed {
                path: path.clone(),
                detail: "exit status 1".to_string(),
            }),
        );

        assert!(f.reconciler.pending.is_empty());
        assert!(f.reconciler.store.is_empty());
    }

    #[tokio::test]
    async fn test_retry_requeues_only_unstored_files() {
        let mut f = fixture("sleep 0.3\nexit 0");
        seed_namespace(&f.root, "zdbfs-data", &[0, 1], &[0, 1]);
        // d1 is the active data file and never eligible; i0, i1, d0 and
        // the descriptor are. Mark i0 stored and i1 already in flight.
        let index_dir = f.root.join("index/zdbfs-data");
        f.reconciler
            .store
            .insert(index_dir.join("i0"), Metadata::default());
        f.reconciler.pending.insert(index_dir.join("i1"));

        f.reconciler.handle_retry();

        assert!(f.reconciler.pending.contains(&f.root.join("data/zdbfs-data/d0")));
        assert!(f
            .reconciler
            .pending
            .contains(&index_dir.join("zdb-namespace")));
        assert!(!f.reconciler.pending.contains(&f.root.join("data/zdbfs-data/d1")));
        assert_eq!(f.reconciler.pending.len(), 3);
        assert!(f.reconciler.metrics.last_retry_run_time.get() > 0.0);
    }

    #[tokio::test]
    async fn test_second_retry_enqueues_nothing_while_pending() {
        let mut f = fixture("sleep 0.5\nexit 0");
        seed_namespace(&f.root, "zdbfs-data", &[0], &[0, 1]);

        f.reconciler.handle_retry();
        let after_first = f.reconciler.pending.clone();
        f.reconciler.handle_retry();
        assert_eq!(f.reconciler.pending, after_first);

        tokio::time::sleep(Duration::from_millis(100)).await;
        // One store invocation per admitted file, none duplicated.
        assert_eq!(invocations(&f.log).len(), after_first.len());
    }

    #[tokio::test]
    async fn test_close_flushes_active_pair_per_namespace() {
        let mut f = fixture("exit 0");
        seed_namespace(&f.root, "zdbfs-data", &[0, 1, 2], &[0, 1, 2]);
        seed_namespace(&f.root, "zdbfs-temp", &[0], &[0]);

        f.reconciler.handle_hook(HookEnvelope {
            request: HookRequest::Close,
            reply: None,
        });

        assert!(f.reconciler.pending.contains(&f.root.join("data/zdbfs-data/d2")));
        assert!(f.reconciler.pending.contains(&f.root.join("index/zdbfs-data/i2")));
        assert_eq!(f.reconciler.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_close_skips_stray_files_in_data_root() {
        let mut f = fixture("exit 0");
        seed_namespace(&f.root, "zdbfs-data", &[0], &[0]);
        // A stray regular file next to the namespace directories, with an
        // index directory of the same name. Only real namespace
        // directories get flushed.
        fs::write(f.root.join("data/journal"), b"x").unwrap();
        fs::create_dir_all(f.root.join("index/journal")).unwrap();
        fs::write(f.root.join("index/journal/i0"), b"x").unwrap();

        f.reconciler.handle_hook(HookEnvelope {
            request: HookRequest::Close,
            reply: None,
        });

        assert!(f.reconciler.pending.contains(&f.root.join("data/zdbfs-data/d0")));
        assert!(f.reconciler.pending.contains(&f.root.join("index/zdbfs-data/i0")));
        assert_eq!(f.reconciler.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_jump_data_skips_temp_namespace() {
        let mut f = fixture("exit 0");
        f.reconciler.handle_hook(HookEnvelope {
            request: HookRequest::JumpData {
                data_path: f.root.join("data/zdbfs-temp/d0"),
            },
            reply: None,
        });
        assert!(f.reconciler.pending.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(invocations(&f.log).is_empty());
    }

    #[tokio::test]
    async fn test_namespace_updated_uploads_descriptor() {
        let mut f = fixture("exit 0");
        f.reconciler.handle_hook(HookEnvelope {
            request: HookRequest::NamespaceUpdated {
                namespace: "zdbfs-meta".to_string(),
            },
            reply: None,
        });
        assert!(f
            .reconciler
            .pending
            .contains(&f.root.join("index/zdbfs-meta/zdb-namespace")));
    }

    #[tokio::test]
    async fn test_missing_data_replies_on_oneshot() {
        let f = fixture("exit 0");
        let (reply_tx, reply_rx) = oneshot::channel();
        f.reconciler
            .spawn_retrieve(f.root.join("data/zdbfs-data/d2"), Some(reply_tx));
        assert_eq!(reply_rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_failed_retrieve_reports_reason() {
        let f = fixture("echo boom\nexit 1");
        let (reply_tx, reply_rx) = oneshot::channel();
        f.reconciler
            .spawn_retrieve(f.root.join("data/zdbfs-data/d2"), Some(reply_tx));
        let reason = reply_rx.await.unwrap().unwrap_err();
        assert!(reason.contains("boom"));
    }

    #[tokio::test]
    async fn test_ready_probe_reports_uploader_state() {
        let f = fixture("exit 0");
        let (reply_tx, reply_rx) = oneshot::channel();
        f.reconciler.spawn_ready_probe(Some(reply_tx));
        assert_eq!(reply_rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_upload_worker_posts_result_event() {
        let mut f = fixture("exit 0");
        seed_namespace(&f.root, "zdbfs-data", &[0], &[0]);
        let path = f.root.join("data/zdbfs-data/d0");

        f.reconciler.admit_upload(path.clone(), false);
        match f.events_rx.recv().await.unwrap() {
            Event::UploadResult { path: done, result } => {
                assert_eq!(done, path);
                // Decoder stub exits non-zero, so no metadata came back.
                assert!(result.is_err());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
