//! Events consumed by the reconciliation loop.
//!
//! Every task in the daemon funnels its observations into a single
//! [`Event`] channel. The loop is the only writer of the pending-upload
//! set, the metadata store and the backend view, so none of that state
//! needs locking.

use std::collections::HashMap;
use std::path::PathBuf;

use qsfs_zstor::{BackendStatus, Metadata, ZstorError};

use crate::hook::HookEnvelope;

/// Depth of the daemon event queue.
pub const EVENT_QUEUE_DEPTH: usize = 100;

/// A single unit of work for the reconciliation loop.
#[derive(Debug)]
pub enum Event {
    /// A hook message accepted on the unix socket.
    Hook(HookEnvelope),
    /// Periodic sweep over eligible files that are not yet stored remotely.
    RetryTick,
    /// Outcome of a finished upload worker.
    UploadResult {
        path: PathBuf,
        result: Result<Option<Metadata>, ZstorError>,
    },
    /// Replacement snapshot of the remote metadata store.
    MetadataRefresh(HashMap<PathBuf, Metadata>),
    /// Replacement snapshot of backend liveness.
    BackendSnapshot(HashMap<String, BackendStatus>),
    /// Drain and stop the loop.
    Shutdown,
}
