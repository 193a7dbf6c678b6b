//! Payloads exchanged during a secondary join

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filename to content digest (hex)
pub type FileDigests = BTreeMap<String, String>;

/// Body of a `NEW_SEC` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Host the secondary listens on
    pub host: String,
    /// Port the secondary listens on
    pub port: u16,
    /// The secondary's current file digests
    #[serde(default)]
    pub files: FileDigests,
}

impl JoinRequest {
    /// Address the primary should forward decisions to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Files on `ours` that are missing from `theirs` or differ in digest
pub fn diff_files(ours: &FileDigests, theirs: &FileDigests) -> Vec<String> {
    ours.iter()
        .filter(|(name, digest)| theirs.get(*name) != Some(*digest))
        .map(|(name, _)| name.clone())
        .collect()
}
