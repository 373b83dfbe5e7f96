//! Metadata records as emitted by the zstor metadata decoder.
//!
//! The decoder prints JSON; checksums arrive as hex strings. Fields the
//! daemon does not consume are still parsed so a record survives a
//! serialize round trip, but every field tolerates absence: the decoder's
//! output schema is owned by zstor, not by us.

use crate::hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Digest bytes, hex-encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksum(pub Vec<u8>);

impl Checksum {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map(Checksum).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Encryption {
    #[serde(rename = "Aes")]
    pub aes: String,
}

/// Where one shard lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub address: String,
    pub namespace: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Key {
    #[serde(rename = "V2")]
    pub v2: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Shard {
    pub checksum: Checksum,
    pub ci: ConnectionInfo,
    pub keys: Vec<Key>,
    pub shard_idx: usize,
}

/// Full remote record for one uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub checksum: Checksum,
    pub compression: String,
    pub data_shards: usize,
    pub disposable_shards: usize,
    pub encryption: Encryption,
    pub shards: Vec<Shard>,
}

/// Resolve the decoder's remote keys back to local paths.
///
/// A key that names an existing local file is taken literally; otherwise it
/// is matched against the path hash of each eligible file. Keys resolving to
/// neither belong to files no longer present and are dropped.
pub fn correlate_metadata(
    eligible: &[PathBuf],
    all: HashMap<String, Metadata>,
) -> HashMap<PathBuf, Metadata> {
    let by_hash: HashMap<String, &PathBuf> = eligible
        .iter()
        .filter_map(|p| p.to_str().map(|s| (hash::path_hash(s), p)))
        .collect();

    let mut resolved = HashMap::new();
    for (key, metadata) in all {
        let literal = Path::new(&key);
        if literal.is_file() {
            resolved.insert(literal.to_path_buf(), metadata);
        } else if let Some(path) = by_hash.get(&key) {
            resolved.insert((*path).clone(), metadata);
        } else {
            debug!(key = %key, "Dropping metadata entry with no local file");
        }
    }
    resolved
}
