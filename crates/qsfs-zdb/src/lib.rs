//! # qsfs-zdb
//!
//! Read-only model of the zdb persistence tree:
//!
//! ```text
//! <root>/index/<namespace>/{zdb-namespace, i0, i1, ...}
//! <root>/data/<namespace>/{d0, d1, ...}
//! ```
//!
//! The daemon never writes this tree; it only decides which of its files are
//! worth pushing to the backends. The highest-numbered data file per
//! namespace is still being appended to by zdb and is left alone until a
//! `jump-data` or `close` hook finalises it.

use std::io;
use std::path::{Path, PathBuf};

/// Scratch namespace used by zdbfs; its files never leave the machine.
pub const TEMP_NAMESPACE: &str = "zdbfs-temp";

/// Per-namespace descriptor file kept next to the index files.
pub const NAMESPACE_DESCRIPTOR: &str = "zdb-namespace";

/// Kind of a recognised file inside the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Index(u64),
    Data(u64),
    NamespaceDescriptor,
}

/// A path that matched the persistence-tree shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFile {
    pub namespace: String,
    pub kind: FileKind,
}

/// Classify a path against the tree shape. Anything else returns `None` and
/// is skipped by callers.
pub fn classify(path: &Path) -> Option<ClassifiedFile> {
    let name = path.file_name()?.to_str()?;
    let namespace = path.parent()?.file_name()?.to_str()?.to_string();
    let side = path.parent()?.parent()?.file_name()?.to_str()?;

    let kind = if name == NAMESPACE_DESCRIPTOR {
        if side != "index" {
            return None;
        }
        FileKind::NamespaceDescriptor
    } else {
        match (side, parse_numbered(name)?) {
            ("index", ('i', n)) => FileKind::Index(n),
            ("data", ('d', n)) => FileKind::Data(n),
            _ => return None,
        }
    };

    Some(ClassifiedFile { namespace, kind })
}

fn namespace_of(path: &Path) -> Option<&str> {
    path.parent()?.file_name()?.to_str()
}

/// True for any path under the scratch namespace.
pub fn is_temp(path: &Path) -> bool {
    namespace_of(path) == Some(TEMP_NAMESPACE)
}

/// Split a `d7`/`i12` style name into its prefix letter and number.
fn parse_numbered(name: &str) -> Option<(char, u64)> {
    let mut chars = name.chars();
    let prefix = chars.next()?;
    if prefix != 'd' && prefix != 'i' {
        return None;
    }
    let rest = chars.as_str();
    if rest.is_empty() {
        return None;
    }
    Some((prefix, rest.parse().ok()?))
}

/// Every file under `root` that is eligible for upload: all index files, the
/// namespace descriptors, and all data files except the highest-numbered one
/// in each namespace. `zdbfs-temp` is skipped entirely. Missing `index/` or
/// `data/` directories are treated as empty.
pub fn eligible_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    collect_side(&root.join("data"), 'd', false, &mut result)?;
    collect_side(&root.join("index"), 'i', true, &mut result)?;
    Ok(result)
}

fn collect_side(
    side: &Path,
    prefix: char,
    include_highest: bool,
    out: &mut Vec<PathBuf>,
) -> io::Result<()> {
    let entries = match std::fs::read_dir(side) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let ns_name = entry.file_name();
        if ns_name == TEMP_NAMESPACE {
            continue;
        }
        collect_namespace(&entry.path(), prefix, include_highest, out)?;
    }
    Ok(())
}

fn collect_namespace(
    ns_dir: &Path,
    prefix: char,
    include_highest: bool,
    out: &mut Vec<PathBuf>,
) -> io::Result<()> {
    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(ns_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name == NAMESPACE_DESCRIPTOR {
            // Descriptors live in the index dir; one in a data dir is noise.
            if prefix == 'i' {
                out.push(entry.path());
            }
        } else if let Some((p, n)) = name.to_str().and_then(parse_numbered) {
            if p == prefix {
                numbered.push((n, entry.path()));
            }
        }
    }

    numbered.sort_by_key(|(n, _)| *n);
    if !include_highest {
        numbered.pop();
    }
    out.extend(numbered.into_iter().map(|(_, p)| p));
    Ok(())
}

/// Highest index-file number in a namespace's index directory, or `None`
/// when the namespace has no index files yet.
pub fn last_active_index(index_dir: &Path) -> io::Result<Option<u64>> {
    let mut last = None;
    for entry in std::fs::read_dir(index_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(rest) = name.to_str().and_then(|n| n.strip_prefix('i')) {
            if let Ok(n) = rest.parse::<u64>() {
                if last.map_or(true, |l| n > l) {
                    last = Some(n);
                }
            }
        }
    }
    Ok(last)
}
