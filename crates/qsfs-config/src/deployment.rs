//! Naming scheme for the zdb deployments a QSFS node stores into.
//!
//! Backend namespaces are provisioned under names of the form
//! `{deployment}_{twin}_{kind}_{node}`. The daemon only ever reads these
//! names back (when correlating backends to a deployment), so the parser
//! must invert the formatter exactly.

use std::fmt;
use std::str::FromStr;

/// Role of a backend zdb within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZdbKind {
    Meta,
    Data,
}

impl fmt::Display for ZdbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZdbKind::Meta => write!(f, "meta"),
            ZdbKind::Data => write!(f, "data"),
        }
    }
}

impl FromStr for ZdbKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta" => Ok(ZdbKind::Meta),
            "data" => Ok(ZdbKind::Data),
            _ => Err(()),
        }
    }
}

pub fn make_zdb_name(deployment: &str, twin: u32, kind: ZdbKind, node: u32) -> String {
    format!("{}_{}_{}_{}", deployment, twin, kind, node)
}

/// Inverse of [`make_zdb_name`]. Splits from the right so deployment names
/// containing underscores survive the round trip.
pub fn parse_zdb_name(name: &str) -> Option<(String, u32, ZdbKind, u32)> {
    let mut parts = name.rsplitn(4, '_');
    let node = parts.next()?.parse().ok()?;
    let kind = parts.next()?.parse().ok()?;
    let twin = parts.next()?.parse().ok()?;
    let deployment = parts.next()?;
    if deployment.is_empty() {
        return None;
    }
    Some((deployment.to_string(), twin, kind, node))
}
