//! # qsfs-zstor
//!
//! Everything the daemon knows about the `zstor` uploader lives here:
//!
//! - [`Client`]: subprocess wrapper around the `zstor` binary and its
//!   metadata decoder. Exit codes are authoritative; output is captured for
//!   diagnostics only.
//! - [`meta`]: the decoder's JSON metadata model and the correlation of
//!   remote keys back to local paths.
//! - [`hash`]: the BLAKE2b-128 digests shared with the uploader (file
//!   content for integrity, path strings for remote keys).
//! - [`scraper`]: poller for the uploader's Prometheus endpoint, tracking
//!   per-backend liveness.

pub mod client;
pub mod error;
pub mod hash;
pub mod meta;
pub mod scraper;

pub use client::Client;
pub use error::ZstorError;
pub use meta::{correlate_metadata, Checksum, ConnectionInfo, Metadata, Shard};
pub use scraper::{backend_key, BackendStatus, MetricsScraper};
