//! Unix socket listener for zdb lifecycle hooks.
//!
//! zdb invokes its hook binary once per event; the binary connects, writes
//! a single line of whitespace-separated tokens and waits for one reply
//! line. Most actions are acknowledged immediately and handled in the
//! background; `ready` and `missing-data` hold the connection open until
//! the work finished, because zdb itself is waiting on the outcome.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::event::Event;

/// Socket path hardcoded in zdbfs hook scripts.
pub const HOOK_SOCKET_PATH: &str = "/tmp/zdb-hook.sock";

/// Longest hook line we are willing to buffer. Dirty-index lists are the
/// only unbounded part and stay far below this in practice.
const MAX_HOOK_LINE: u64 = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookParseError {
    #[error("empty hook message")]
    Empty,
    #[error("{action} hook is missing arguments")]
    MissingArgs { action: String },
}

/// A parsed hook line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookRequest {
    Ready,
    Close,
    NamespaceUpdated { namespace: String },
    JumpIndex { index_path: PathBuf, dirty: Vec<u64> },
    JumpData { data_path: PathBuf },
    MissingData { data_path: PathBuf },
    Unknown { action: String },
}

impl HookRequest {
    /// Parse one hook line. Token 0 is the action, token 1 the zdb
    /// instance name (unused), the rest are action-specific.
    pub fn parse(line: &str) -> Result<Self, HookParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let action = *tokens.first().ok_or(HookParseError::Empty)?;
        let missing = || HookParseError::MissingArgs {
            action: action.to_string(),
        };

        match action {
            "ready" => Ok(HookRequest::Ready),
            "close" => Ok(HookRequest::Close),
            "namespace-created" | "namespace-updated" => {
                let namespace = tokens.get(2).ok_or_else(missing)?;
                Ok(HookRequest::NamespaceUpdated {
                    namespace: namespace.to_string(),
                })
            }
            "jump-index" => {
                let index_path = tokens.get(2).ok_or_else(missing)?;
                // Token 3 is the rotated-away dirfd marker; tokens after it
                // are dirty index numbers, sometimes quoted as one group.
                let mut dirty = Vec::new();
                for token in tokens.iter().skip(4) {
                    let token = token.trim_matches('"');
                    if token.is_empty() {
                        continue;
                    }
                    match token.parse::<u64>() {
                        Ok(num) => dirty.push(num),
                        Err(_) => {
                            warn!(token, "Skipping non-numeric dirty index entry")
                        }
                    }
                }
                Ok(HookRequest::JumpIndex {
                    index_path: PathBuf::from(index_path),
                    dirty,
                })
            }
            "jump-data" => {
                let data_path = tokens.get(2).ok_or_else(missing)?;
                Ok(HookRequest::JumpData {
                    data_path: PathBuf::from(data_path),
                })
            }
            "missing-data" => {
                let data_path = tokens.get(2).ok_or_else(missing)?;
                Ok(HookRequest::MissingData {
                    data_path: PathBuf::from(data_path),
                })
            }
            other => Ok(HookRequest::Unknown {
                action: other.to_string(),
            }),
        }
    }

    /// Whether the connection must stay open until the work finished.
    pub fn is_blocking(&self) -> bool {
        matches!(self, HookRequest::Ready | HookRequest::MissingData { .. })
    }

    pub fn action(&self) -> &str {
        match self {
            HookRequest::Ready => "ready",
            HookRequest::Close => "close",
            HookRequest::NamespaceUpdated { .. } => "namespace-updated",
            HookRequest::JumpIndex { .. } => "jump-index",
            HookRequest::JumpData { .. } => "jump-data",
            HookRequest::MissingData { .. } => "missing-data",
            HookRequest::Unknown { action } => action,
        }
    }
}

/// A hook request on its way to the reconciliation loop, with the reply
/// slot for blocking actions.
#[derive(Debug)]
pub struct HookEnvelope {
    pub request: HookRequest,
    pub reply: Option<oneshot::Sender<Result<(), String>>>,
}

/// Remove a stale socket from an earlier run and bind a fresh listener.
/// A bind failure here is fatal for the daemon.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Accept hook connections until the daemon shuts down.
pub async fn run_listener(listener: UnixListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, events).await {
                        warn!(error = %e, "Hook connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept hook connection");
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    events: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut line = String::new();
    BufReader::new(reader.take(MAX_HOOK_LINE))
        .read_line(&mut line)
        .await?;
    // A read that fills the cap without reaching a newline was truncated;
    // parsing the prefix could mangle the final dirty-list index.
    if line.len() as u64 == MAX_HOOK_LINE && !line.ends_with('\n') {
        warn!(bytes = line.len(), "Rejecting oversized hook message");
        writer.write_all(b"ERROR: hook message too long\n").await?;
        return Ok(());
    }

    let request = match HookRequest::parse(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected hook message");
            writer.write_all(b"ERROR: empty hook message\n").await?;
            return Ok(());
        }
    };
    debug!(action = request.action(), "Received hook");

    if request.is_blocking() {
        let action = request.action().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        events
            .send(Event::Hook(HookEnvelope {
                request,
                reply: Some(reply_tx),
            }))
            .await?;
        let response = match reply_rx.await {
            Ok(Ok(())) => format!("SUCCESS: {} completed\n", action),
            Ok(Err(reason)) => format!("ERROR: {}\n", reason),
            Err(_) => "ERROR: daemon is shutting down\n".to_string(),
        };
        writer.write_all(response.as_bytes()).await?;
    } else {
        // Acknowledge before dispatch so a full event queue never makes
        // zdb wait on a fire-and-forget hook.
        writer.write_all(b"SUCCESS: queued\n").await?;
        events
            .send(Event::Hook(HookEnvelope {
                request,
                reply: None,
            }))
            .await?;
    }

    Ok(())
}

/// Resolve a jump-index hook to the files it uploads: every dirty index
/// in the same directory, then the jump target itself.
pub fn jump_index_files(index_path: &Path, dirty: &[u64]) -> Vec<PathBuf> {
    let dir = match index_path.parent() {
        Some(dir) => dir,
        None => return vec![index_path.to_path_buf()],
    };
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for num in dirty {
        let file = dir.join(format!("i{}", num));
        if seen.insert(file.clone()) {
            files.push(file);
        }
    }
    if seen.insert(index_path.to_path_buf()) {
        files.push(index_path.to_path_buf());
    }
    files
}
