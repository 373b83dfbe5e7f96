//! BLAKE2b-128 digests, matching `b2sum -l 128` and the uploader's own
//! hashing. Content hashes verify integrity; path hashes reproduce the
//! remote keys the uploader derives from local paths.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use std::io;
use std::path::Path;

type Blake2b128 = Blake2b<U16>;

/// Streamed BLAKE2b-128 over the file's content, as lowercase hex.
pub fn local_hash(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Blake2b128::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// BLAKE2b-128 over the path string itself. The uploader stores metadata
/// under this key, not under the path.
pub fn path_hash(path: &str) -> String {
    let mut hasher = Blake2b128::new();
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}
